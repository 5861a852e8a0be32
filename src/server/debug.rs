//! Debug view: a small HTML page listing a fanout's endpoints, served
//! when the dispatch path is called with `?debug`.

use crate::model::Endpoint;
use axum::response::Html;

const STYLE: &str = "\
body { font-family: sans-serif; background-color: #fbfbfb; padding: 30px 20px; }\n\
h1 { font-size: 18px; color: #393c44; }\n\
h1 a { color: #4284ca; font-weight: normal; font-size: 14px; margin-left: 8px; }\n\
.endpoint { display: inline-block; vertical-align: top; background-color: #fff; \
border: solid 1px #e9e9ef; border-radius: 5px; margin-right: 20px; padding: 16px 20px; }\n\
.endpoint.primary { border-color: #91c6ff; }\n\
.badge { font-size: 11px; padding: 0 4px; background-color: #4284ca; \
border-radius: 3px; color: #fff; }\n\
dt { color: #808292; font-size: 13px; margin-top: 8px; }\n\
dd { color: #253134; font-size: 14px; margin: 2px 0 0 0; }\n";

/// Render the debug page for a resolved fanout.
pub fn render(fanout: &str, endpoints: &[Endpoint]) -> Html<String> {
    let mut page = String::with_capacity(1024);
    page.push_str("<!DOCTYPE html>\n<html>\n<head>\n<title>fanout: ");
    page.push_str(&escape(fanout));
    page.push_str("</title>\n<style>\n");
    page.push_str(STYLE);
    page.push_str("</style>\n</head>\n<body>\n<h1>");
    page.push_str(&escape(fanout));
    page.push_str(&format!(
        "<a href=\"/fanout/{0}\">/fanout/{0}</a>",
        escape(fanout)
    ));
    page.push_str("</h1>\n");

    for endpoint in endpoints {
        let http = endpoint.http();
        let class = if endpoint.primary {
            "endpoint primary"
        } else {
            "endpoint"
        };
        page.push_str(&format!("<div class=\"{}\">\n<strong>{}</strong>", class, escape(&endpoint.name)));
        if endpoint.primary {
            page.push_str(" <span class=\"badge\">primary</span>");
        }
        page.push_str("\n<dl>\n");
        page.push_str(&format!("<dt>URL</dt><dd>{}</dd>\n", escape(&http.url)));
        page.push_str(&format!("<dt>Method</dt><dd>{}</dd>\n", escape(&http.method)));
        if http.timeout_ms > 0 {
            page.push_str(&format!("<dt>Timeout</dt><dd>{}ms</dd>\n", http.timeout_ms));
        } else {
            page.push_str("<dt>Timeout</dt><dd>default</dd>\n");
        }
        page.push_str("</dl>\n</div>\n");
    }

    page.push_str("</body>\n</html>\n");
    Html(page)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Destination, HttpEndpoint};

    fn endpoint(name: &str, primary: bool, timeout_ms: u64) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            primary,
            destination: Destination::Http(HttpEndpoint {
                url: format!("http://upstream/{}", name),
                method: "GET".to_string(),
                headers: Vec::new(),
                timeout_ms,
                tls: None,
            }),
        }
    }

    #[test]
    fn test_render_lists_endpoints() {
        let Html(page) = render(
            "read_likes",
            &[endpoint("legacy", true, 0), endpoint("v2", false, 50)],
        );

        assert!(page.contains("read_likes"));
        assert!(page.contains("legacy"));
        assert!(page.contains("v2"));
        assert!(page.contains("primary"));
        assert!(page.contains("<dt>Timeout</dt><dd>default</dd>"));
        assert!(page.contains("<dt>Timeout</dt><dd>50ms</dd>"));
    }

    #[test]
    fn test_render_escapes_markup() {
        let Html(page) = render("x<script>", &[]);
        assert!(!page.contains("<script>"));
        assert!(page.contains("x&lt;script&gt;"));
    }
}
