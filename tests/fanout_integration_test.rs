// Integration tests for the fan-out proxy: real sockets end to end,
// mock upstreams behind the dispatch engine, MemoryStore as the
// definition store.

#[cfg(test)]
mod fanout_integration_tests {
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::any;
    use axum::Router;
    use fanout::cache::CacheConfig;
    use fanout::config::DEFAULT_MAX_BODY_BYTES;
    use fanout::model::{Destination, Endpoint, HeaderPair, HttpEndpoint};
    use fanout::server::{self, AppState};
    use fanout::store::{FanoutStore, MemoryStore};
    use fanout::{DispatchConfig, Dispatcher, FanoutCache, TransportCache, TransportConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// One request as a mock upstream observed it.
    #[derive(Clone)]
    struct SeenRequest {
        headers: HeaderMap,
        body: bytes::Bytes,
    }

    /// Everything one mock upstream records and serves.
    struct Upstream {
        status: StatusCode,
        body: &'static str,
        delay: Duration,
        seen: Mutex<Vec<SeenRequest>>,
    }

    impl Upstream {
        fn requests(&self) -> Vec<SeenRequest> {
            self.seen.lock().clone()
        }
    }

    async fn upstream_handler(
        State(upstream): State<Arc<Upstream>>,
        headers: HeaderMap,
        body: bytes::Bytes,
    ) -> impl IntoResponse {
        upstream.seen.lock().push(SeenRequest { headers, body });
        tokio::time::sleep(upstream.delay).await;
        (upstream.status, upstream.body)
    }

    /// Start a mock upstream; returns its base URL and the recorder.
    async fn start_upstream(
        status: StatusCode,
        body: &'static str,
        delay: Duration,
    ) -> (String, Arc<Upstream>) {
        let upstream = Arc::new(Upstream {
            status,
            body,
            delay,
            seen: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/*path", any(upstream_handler))
            .with_state(upstream.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), upstream)
    }

    /// Start the proxy as a single-node cluster over the given store.
    async fn start_proxy(store: Arc<MemoryStore>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let self_url = format!("http://{}", addr);

        let store: Arc<dyn FanoutStore> = store;
        let transports = Arc::new(TransportCache::new(TransportConfig::default()));
        let fanouts = Arc::new(FanoutCache::new(
            &self_url,
            &[],
            store.clone(),
            transports.clone(),
            CacheConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            fanouts.clone(),
            transports,
            DispatchConfig::default(),
        ));

        let app = server::router(
            AppState {
                dispatcher,
                fanouts,
                store,
            },
            DEFAULT_MAX_BODY_BYTES,
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        self_url
    }

    fn http_endpoint(
        name: &str,
        primary: bool,
        url: String,
        headers: Vec<HeaderPair>,
        timeout_ms: u64,
    ) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            primary,
            destination: Destination::Http(HttpEndpoint {
                url,
                method: "GET".to_string(),
                headers,
                timeout_ms,
                tls: None,
            }),
        }
    }

    fn extra_header(value: &str) -> Vec<HeaderPair> {
        vec![HeaderPair {
            key: "X-Extra".to_string(),
            values: vec![value.to_string()],
        }]
    }

    #[tokio::test]
    async fn test_dual_read_primary_succeeds() {
        let (a_url, _a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;
        let (b_url, b) = start_upstream(StatusCode::OK, "OK-B", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[
                    http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0),
                    http_endpoint("v2", false, format!("{}/test2", b_url), extra_header("v2"), 0),
                ],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let response = reqwest::get(format!("{}/fanout/read_likes", proxy))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK-A");

        // The shadow endpoint was called with its configured header and
        // the cycle breadcrumb.
        let seen = b.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].headers.get("x-extra").unwrap(), "v2");
        assert_eq!(seen[0].headers.get("dfanout-fanout").unwrap(), "read_likes");
    }

    #[tokio::test]
    async fn test_primary_failure_is_request_failure() {
        let (a_url, _a) =
            start_upstream(StatusCode::INTERNAL_SERVER_ERROR, "boom", Duration::ZERO).await;
        let (b_url, b) = start_upstream(StatusCode::OK, "OK-B", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[
                    http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0),
                    http_endpoint("v2", false, format!("{}/test2", b_url), Vec::new(), 0),
                ],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let response = reqwest::get(format!("{}/fanout/read_likes", proxy))
            .await
            .unwrap();
        // Shadow success never substitutes for the primary.
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text().await.unwrap(), "timed out with no response\n");
        assert_eq!(b.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_circular_call_rejected_before_dispatch() {
        let (a_url, a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0)],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}/fanout/read_likes", proxy))
            .header("DFanout-Fanout", "read_likes")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text().await.unwrap(), "rejected circular call\n");
        assert!(a.requests().is_empty());
    }

    #[tokio::test]
    async fn test_breadcrumb_for_other_fanout_passes() {
        let (a_url, _a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0)],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}/fanout/read_likes", proxy))
            .header("DFanout-Fanout", "write_likes")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_slow_primary_times_out() {
        let (a_url, _a) =
            start_upstream(StatusCode::OK, "OK-A", Duration::from_millis(200)).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 50)],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let response = reqwest::get(format!("{}/fanout/read_likes", proxy))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text().await.unwrap(), "timed out with no response\n");
    }

    #[tokio::test]
    async fn test_cold_fanout_coalesces_store_reads() {
        let (a_url, _a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0)],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store.clone()).await;

        let client = reqwest::Client::new();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let client = client.clone();
            let url = format!("{}/fanout/read_likes", proxy);
            handles.push(tokio::spawn(async move {
                let response = client.get(url).send().await.unwrap();
                (response.status(), response.text().await.unwrap())
            }));
        }
        for handle in handles {
            let (status, body) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "OK-A");
        }
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_missing_fanout_is_load_failure() {
        let proxy = start_proxy(Arc::new(MemoryStore::new())).await;

        let response = reqwest::get(format!("{}/fanout/unknown", proxy))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.text().await.unwrap(),
            "cannot retrieve the fanout: no endpoints found"
        );
    }

    #[tokio::test]
    async fn test_debug_view_renders_without_dispatch() {
        let (a_url, a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0)],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let response = reqwest::get(format!("{}/fanout/read_likes?debug", proxy))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = response.text().await.unwrap();
        assert!(page.contains("legacy"));
        assert!(page.contains("primary"));
        assert!(a.requests().is_empty());
    }

    #[tokio::test]
    async fn test_peer_protocol_serves_endpoint_list() {
        let (a_url, _a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "read_likes",
                &[
                    http_endpoint("legacy", true, format!("{}/test", a_url), Vec::new(), 0),
                    http_endpoint("v2", false, format!("{}/test2", a_url), Vec::new(), 0),
                ],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let response = reqwest::get(format!("{}/_groupcache/fanout/read_likes", proxy))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let endpoints: Vec<Endpoint> = response.json().await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints[0].primary);
    }

    #[tokio::test]
    async fn test_admin_create_and_read_back() {
        let proxy = start_proxy(Arc::new(MemoryStore::new())).await;
        let client = reqwest::Client::new();

        let endpoints = vec![http_endpoint(
            "legacy",
            true,
            "http://upstream/test".to_string(),
            Vec::new(),
            0,
        )];
        let created = client
            .post(format!("{}/admin/fanouts/read_likes", proxy))
            .json(&endpoints)
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let fetched: Vec<Endpoint> = client
            .get(format!("{}/admin/fanouts/read_likes", proxy))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(fetched, endpoints);
    }

    #[tokio::test]
    async fn test_admin_rejects_invariant_violations() {
        let proxy = start_proxy(Arc::new(MemoryStore::new())).await;
        let client = reqwest::Client::new();

        // Eleven endpoints exceed the cap.
        let eleven: Vec<Endpoint> = (0..11)
            .map(|i| {
                http_endpoint(
                    &format!("e{}", i),
                    i == 0,
                    "http://upstream/test".to_string(),
                    Vec::new(),
                    0,
                )
            })
            .collect();
        let response = client
            .post(format!("{}/admin/fanouts/big", proxy))
            .json(&eleven)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Two primaries violate the invariant.
        let two_primaries = vec![
            http_endpoint("a", true, "http://upstream/a".to_string(), Vec::new(), 0),
            http_endpoint("b", true, "http://upstream/b".to_string(), Vec::new(), 0),
        ];
        let response = client
            .post(format!("{}/admin/fanouts/double", proxy))
            .json(&two_primaries)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inbound_body_replayed_to_endpoints() {
        let (a_url, a) = start_upstream(StatusCode::OK, "OK-A", Duration::ZERO).await;
        let (b_url, b) = start_upstream(StatusCode::OK, "OK-B", Duration::ZERO).await;

        let store = Arc::new(MemoryStore::new());
        store
            .create_fanout(
                "write_likes",
                &[
                    Endpoint {
                        name: "legacy".to_string(),
                        primary: true,
                        destination: Destination::Http(HttpEndpoint {
                            url: format!("{}/write", a_url),
                            method: "POST".to_string(),
                            headers: Vec::new(),
                            timeout_ms: 0,
                            tls: None,
                        }),
                    },
                    Endpoint {
                        name: "v2".to_string(),
                        primary: false,
                        destination: Destination::Http(HttpEndpoint {
                            url: format!("{}/write", b_url),
                            method: "POST".to_string(),
                            headers: Vec::new(),
                            timeout_ms: 0,
                            tls: None,
                        }),
                    },
                ],
            )
            .await
            .unwrap();
        let proxy = start_proxy(store).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/fanout/write_likes", proxy))
            .body("liked!")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The buffered inbound body was replayed to both endpoints.
        let seen_a = a.requests();
        let seen_b = b.requests();
        assert_eq!(seen_a.len(), 1);
        assert_eq!(seen_b.len(), 1);
        assert_eq!(seen_a[0].body.as_ref(), b"liked!");
        assert_eq!(seen_b[0].body.as_ref(), b"liked!");
    }
}
