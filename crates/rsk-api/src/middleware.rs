//! Request-metrics layer.
//!
//! Records a duration histogram and a request counter per
//! (method, endpoint, status). Path segments that look like identifiers
//! (UUID-shaped, or `user-` prefixed) are normalized to `{id}` so metric
//! cardinality stays bounded. The `/metrics` endpoint itself is exempt.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

pub async fn track_http_metrics(
    State(st): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if path == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let endpoint = normalize_path(&path);
    let status = response.status().as_u16().to_string();
    let elapsed = start.elapsed().as_secs_f64();

    st.metrics
        .http_request_duration
        .with_label_values(&[&method, &endpoint, &status])
        .observe(elapsed);
    st.metrics
        .http_requests_total
        .with_label_values(&[&method, &endpoint, &status])
        .inc();

    response
}

pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    if parts.iter().all(|p| p.is_empty()) {
        return "/".to_string();
    }
    let normalized: Vec<&str> = parts
        .into_iter()
        .map(|part| if looks_like_id(part) { "{id}" } else { part })
        .collect();
    format!("/{}", normalized.join("/"))
}

fn looks_like_id(part: &str) -> bool {
    (part.len() == 36 && part.matches('-').count() == 4) || part.starts_with("user-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_segments_become_id() {
        assert_eq!(
            normalize_path("/score/12345678-1234-5678-1234-567812345678"),
            "/score/{id}"
        );
        assert_eq!(
            normalize_path("/score/12345678-1234-5678-1234-567812345678/history"),
            "/score/{id}/history"
        );
    }

    #[test]
    fn user_prefixed_segments_become_id() {
        assert_eq!(normalize_path("/score/user-42"), "/score/{id}");
    }

    #[test]
    fn ordinary_paths_pass_through() {
        assert_eq!(normalize_path("/events"), "/events");
        assert_eq!(normalize_path("/dlq"), "/dlq");
        assert_eq!(normalize_path("/"), "/");
        // Short numeric ids are left as-is; only UUID-shaped and
        // user-prefixed segments are collapsed.
        assert_eq!(normalize_path("/dlq/17"), "/dlq/17");
    }
}
