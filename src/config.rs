//! # Process Configuration
//!
//! Command-line flags plus the tunables of the caches and the dispatch
//! engine, with the reference defaults: 60 s definition-cache TTL,
//! 128 MiB cache budget, 15 s transport timeout, 4 MiB body buffer.

use crate::cache::CacheConfig;
use crate::dispatch::DispatchConfig;
use crate::transport::TransportConfig;
use clap::Parser;

/// Inbound body bytes buffered for replay across the fan-out.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 << 20;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "fanoutd", version, about = "HTTP fan-out proxy")]
pub struct Args {
    /// Address to listen on; $PORT overrides the port
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Comma-separated peer URLs (http://host:port), including this node
    #[arg(long, default_value = "")]
    pub peers: String,

    /// Postgres connection string for the definition store
    #[arg(
        long = "postgres-connection",
        env = "POSTGRES_CONNECTION",
        default_value = "postgres://postgres:@localhost:5432/fanout"
    )]
    pub postgres_connection: String,
}

/// Resolved process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub listen: String,

    /// Static peer set
    pub peers: Vec<String>,

    /// Definition store DSN
    pub postgres_connection: String,

    /// Definition cache tunables
    pub cache: CacheConfig,

    /// Transport cache tunables
    pub transport: TransportConfig,

    /// Dispatch engine tunables
    pub dispatch: DispatchConfig,

    /// Inbound body buffer cap
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            peers: Vec::new(),
            postgres_connection: "postgres://postgres:@localhost:5432/fanout".to_string(),
            cache: CacheConfig::default(),
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Config {
    /// Fold parsed arguments and the environment into a configuration.
    pub fn from_args(args: Args) -> Self {
        let mut listen = args.listen;
        if let Ok(port) = std::env::var("PORT") {
            if !port.is_empty() {
                listen = format!("0.0.0.0:{}", port);
            }
        }

        let peers: Vec<String> = args
            .peers
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();

        Self {
            listen,
            peers,
            postgres_connection: args.postgres_connection,
            ..Self::default()
        }
    }

    /// This node's peer identity on the cache ring.
    pub fn self_url(&self) -> String {
        format!("http://{}", self.listen)
    }
}
