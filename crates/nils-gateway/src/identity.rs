// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Identity-header middleware.
//!
//! The gateway trusts the reverse proxy (tailscaled) to stamp
//! `Tailscale-User-Login` / `Tailscale-User-Name` on each request. When an
//! allowlist is configured, non-loopback clients must present a listed
//! login; loopback always bypasses the check so local tooling keeps
//! working.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::supervisor::Supervisor;

pub const LOGIN_HEADER: &str = "Tailscale-User-Login";
pub const NAME_HEADER: &str = "Tailscale-User-Name";

pub async fn identity_mw(
    State(supervisor): State<Arc<Supervisor>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let allowed = supervisor.config().security.allowed_users.clone();
    if allowed.is_empty() || is_loopback(addr.ip()) {
        return next.run(req).await;
    }

    let login = req
        .headers()
        .get(LOGIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let name = req
        .headers()
        .get(NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if allowed.iter().any(|u| u == login) {
        debug!(login, name, "identity accepted");
        next.run(req).await
    } else {
        warn!(%addr, login, "request refused by user allowlist");
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}

pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("127.8.8.8".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(!is_loopback("100.64.1.2".parse().unwrap()));
        assert!(!is_loopback("192.168.1.10".parse().unwrap()));
    }
}
