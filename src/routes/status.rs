//! Status view of the registry: HTML page and JSON listing.

use std::fmt::Write as _;

use axum::{extract::State, response::Html, Json};
use serde_json::{json, Value};

use crate::state::RelayState;
use crate::tunnel::registry::TunnelInfo;

/// Placeholder replaced by the tunnel table.
pub const TUNNELS_PLACEHOLDER: &str = "{{tunnels}}";
/// Placeholder replaced by the relay's base domain.
pub const DOMAIN_PLACEHOLDER: &str = "{{domain}}";

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{{domain}}</title></head>
<body>
<h1>{{domain}}</h1>
<p>Run <code>merf agent --remote {{domain}}:1337 --local http://localhost:8000</code> to get a subdomain.</p>
{{tunnels}}
</body>
</html>
"#;

/// Renders the status page from a template.
#[derive(Debug, Clone)]
pub struct StatusPage {
    template: String,
}

impl StatusPage {
    /// Use `template`, or the built-in page when `None`.
    pub fn new(template: Option<String>) -> Self {
        Self {
            template: template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        }
    }

    /// Whether the template will show the tunnel table at all.
    pub fn shows_tunnels(&self) -> bool {
        self.template.contains(TUNNELS_PLACEHOLDER)
    }

    pub fn render(&self, domain: &str, tunnels: &[TunnelInfo]) -> String {
        self.template
            .replace(DOMAIN_PLACEHOLDER, &escape(domain))
            .replace(TUNNELS_PLACEHOLDER, &tunnel_table(tunnels))
    }
}

impl Default for StatusPage {
    fn default() -> Self {
        Self::new(None)
    }
}

fn tunnel_table(tunnels: &[TunnelInfo]) -> String {
    if tunnels.is_empty() {
        return "<p>No tunnels connected.</p>".to_string();
    }
    let mut out = String::from(
        "<table>\n<tr><th>Host</th><th>Agent</th><th>Connected (s)</th><th>Requests</th></tr>\n",
    );
    for t in tunnels {
        let host = escape(&t.hostname);
        let _ = writeln!(
            out,
            "<tr><td><a href=\"http://{host}/\">{host}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&t.peer),
            t.connected_secs,
            t.requests_served,
        );
    }
    out.push_str("</table>");
    out
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Any path on the base domain other than `/api/*` — HTML status page.
pub async fn status_page(State(state): State<RelayState>) -> Html<String> {
    let tunnels = state.registry.snapshot().await;
    Html(state.status_page.render(state.registry.domain(), &tunnels))
}

/// `GET /api/tunnels` on the base domain — connected tunnels as JSON.
pub async fn list_tunnels(State(state): State<RelayState>) -> Json<Value> {
    let tunnels = state.registry.snapshot().await;
    Json(json!({
        "domain": state.registry.domain(),
        "count": tunnels.len(),
        "tunnels": tunnels,
    }))
}
