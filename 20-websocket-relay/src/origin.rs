//! Cross-origin check applied before a WebSocket upgrade.
//!
//! Browsers attach an `Origin` header to WebSocket handshakes but do not
//! enforce the same-origin policy on them, so the server has to. Requests
//! without an `Origin` header come from non-browser clients and are let
//! through.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        HeaderMap, StatusCode,
        header::{HOST, ORIGIN},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Accept an origin only when its authority matches the `Host` header.
    #[default]
    SameHost,
    /// Same-host origins plus the listed ones.
    AllowList(Vec<String>),
    /// Accept every origin.
    Any,
}

impl OriginPolicy {
    pub fn allows(&self, headers: &HeaderMap) -> bool {
        if *self == OriginPolicy::Any {
            return true;
        }
        let Some(origin) = headers.get(ORIGIN) else {
            return true;
        };
        let Ok(origin) = origin.to_str() else {
            return false;
        };

        match self {
            OriginPolicy::Any => true,
            OriginPolicy::SameHost => same_host(origin, headers),
            OriginPolicy::AllowList(allowed) => {
                same_host(origin, headers)
                    || allowed.iter().any(|candidate| {
                        candidate
                            .trim_end_matches('/')
                            .eq_ignore_ascii_case(origin)
                    })
            }
        }
    }
}

fn same_host(origin: &str, headers: &HeaderMap) -> bool {
    let Some(host) = headers.get(HOST).and_then(|value| value.to_str().ok()) else {
        return false;
    };
    let Some((_scheme, authority)) = origin.split_once("://") else {
        return false;
    };
    authority.eq_ignore_ascii_case(host)
}

/// Middleware rejecting handshakes the policy does not allow.
pub async fn enforce(
    State(policy): State<Arc<OriginPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    if policy.allows(request.headers()) {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("<invalid>");
    warn!(origin, "rejecting cross-origin websocket request");
    (StatusCode::FORBIDDEN, "cross-origin request denied").into_response()
}
