//! Operator surface: session listing and forced disconnects.
//!
//! `AdminHandle` is the in-process API. `router` exposes the same operations
//! over HTTP behind a shared admin token.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use phaze_common::helpers::constant_time_eq;
use phaze_crypto::identity_tag;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::session::{SessionState, SessionTable, SessionView};

/// Shortest admin token accepted; anything shorter disables the HTTP API.
pub const MIN_ADMIN_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub id: u32,
    pub addr: SocketAddr,
    pub tunnel_ip: Option<Ipv4Addr>,
    pub state: SessionState,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub bytes_since_rekey: u64,
    pub key_epoch: u32,
    pub idle_secs: u64,
}

impl From<SessionView> for SessionStats {
    fn from(view: SessionView) -> Self {
        Self {
            id: view.id,
            addr: view.addr,
            tunnel_ip: view.tunnel_ip,
            state: view.state,
            rx_bytes: view.rx_bytes,
            tx_bytes: view.tx_bytes,
            bytes_since_rekey: view.bytes_since_rekey,
            key_epoch: view.key_epoch,
            idle_secs: view.idle_secs,
        }
    }
}

#[derive(Clone)]
pub struct AdminHandle {
    table: Arc<SessionTable>,
}

impl AdminHandle {
    pub fn new(table: Arc<SessionTable>) -> Self {
        Self { table }
    }

    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    pub fn sessions(&self) -> Vec<SessionStats> {
        self.table
            .snapshot(Instant::now())
            .into_iter()
            .map(SessionStats::from)
            .collect()
    }

    /// Evict one session. Returns false if it did not exist.
    pub fn disconnect_session(&self, id: u32) -> bool {
        let evicted = self.table.evict(id, Instant::now()).is_some();
        if evicted {
            info!("session {} disconnected by operator", id);
        }
        evicted
    }

    /// Evict every session authenticated as `identity`.
    pub fn disconnect_identity(&self, identity: &str) -> usize {
        let tag = identity_tag(identity);
        self.table
            .ids_for_identity(&tag)
            .into_iter()
            .filter(|id| self.disconnect_session(*id))
            .count()
    }
}

#[derive(Serialize)]
struct AdminError {
    error: String,
}

#[derive(Serialize)]
struct CountResponse {
    count: usize,
}

#[derive(Serialize)]
struct DisconnectResponse {
    disconnected: usize,
}

#[derive(Clone)]
struct AdminState {
    handle: AdminHandle,
    token: Option<Arc<str>>,
}

fn error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(AdminError {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn extract_admin_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        return Some(token);
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.token.as_deref() else {
        return Err(error(
            StatusCode::UNAUTHORIZED,
            "admin api disabled: set PHAZE_ADMIN_TOKEN",
        ));
    };
    match extract_admin_token(headers) {
        Some(got) if constant_time_eq(got, expected) => Ok(()),
        _ => Err(error(StatusCode::UNAUTHORIZED, "invalid admin token")),
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(state.handle.sessions()).into_response()
}

async fn session_count(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(CountResponse {
        count: state.handle.session_count(),
    })
    .into_response()
}

async fn disconnect_session(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(id): Path<u32>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    if state.handle.disconnect_session(id) {
        Json(DisconnectResponse { disconnected: 1 }).into_response()
    } else {
        error(StatusCode::NOT_FOUND, "no such session")
    }
}

async fn disconnect_identity(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    Json(DisconnectResponse {
        disconnected: state.handle.disconnect_identity(&name),
    })
    .into_response()
}

/// HTTP routes for `handle`. A token shorter than [`MIN_ADMIN_TOKEN_LEN`]
/// leaves every route except `/health` refusing requests.
pub fn router(handle: AdminHandle, token: Option<String>) -> Router {
    let token = token.and_then(|t| {
        if t.len() >= MIN_ADMIN_TOKEN_LEN {
            Some(Arc::<str>::from(t))
        } else {
            warn!(
                "admin token shorter than {} characters; admin api disabled",
                MIN_ADMIN_TOKEN_LEN
            );
            None
        }
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/count", get(session_count))
        .route("/api/sessions/:id", delete(disconnect_session))
        .route("/api/identities/:name", delete(disconnect_identity))
        .with_state(AdminState { handle, token })
}

/// Serve the admin API on `addr` until `shutdown` flips.
pub async fn serve(
    addr: SocketAddr,
    handle: AdminHandle,
    token: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !addr.ip().is_loopback() {
        warn!("admin api listening on non-loopback address {}", addr);
    }
    let listener = TcpListener::bind(addr).await?;
    info!("admin api listening on {}", listener.local_addr()?);

    axum::serve(listener, router(handle, token))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::IpPool;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use phaze_crypto::{
        derive_session_key, derive_shared_secret, generate_ephemeral_keypair, Role, SessionCipher,
    };
    use tower::ServiceExt;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    fn cipher(now: Instant) -> SessionCipher {
        let (a, _) = generate_ephemeral_keypair();
        let (_, b) = generate_ephemeral_keypair();
        let shared = derive_shared_secret(a, &b).unwrap();
        let (key, _) = derive_session_key(&shared, None, 0).unwrap();
        SessionCipher::new(key, Role::Server, 64, now)
    }

    fn handle_with(identities: &[&str]) -> (AdminHandle, Vec<u32>) {
        let now = Instant::now();
        let table = Arc::new(SessionTable::new(
            IpPool::new("10.9.0.0/24".parse().unwrap()),
            16,
        ));
        let ids = identities
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let addr = SocketAddr::from(([192, 0, 2, 1], 4000 + i as u16));
                let id = table.create(addr, name, [i as u8; 32], cipher(now), now).unwrap();
                table.complete(id, now).unwrap();
                id
            })
            .collect();
        (AdminHandle::new(table), ids)
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_handle_operations() {
        let (handle, ids) = handle_with(&["alice", "alice", "bob"]);
        assert_eq!(handle.session_count(), 3);

        let stats = handle.sessions();
        assert_eq!(stats.len(), 3);
        assert!(stats.iter().all(|s| s.state == SessionState::Connected));

        assert_eq!(handle.disconnect_identity("alice"), 2);
        assert_eq!(handle.session_count(), 1);
        assert!(handle.disconnect_session(ids[2]));
        assert!(!handle.disconnect_session(ids[2]));
        assert_eq!(handle.disconnect_identity("nobody"), 0);
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let (handle, _) = handle_with(&[]);
        let response = router(handle, None)
            .oneshot(request("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_required() {
        let (handle, _) = handle_with(&["alice"]);
        let app = router(handle, Some(TOKEN.to_string()));

        let response = app
            .clone()
            .oneshot(request("GET", "/api/sessions", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/sessions", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bearer = Request::builder()
            .uri("/api/sessions/count")
            .header("authorization", format!("Bearer {}", TOKEN))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(bearer).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["count"], 1);
    }

    #[tokio::test]
    async fn test_short_token_disables_api() {
        let (handle, _) = handle_with(&["alice"]);
        let response = router(handle, Some("short".to_string()))
            .oneshot(request("GET", "/api/sessions", Some("short")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_and_disconnect_over_http() {
        let (handle, ids) = handle_with(&["alice", "bob"]);
        let app = router(handle.clone(), Some(TOKEN.to_string()));

        let response = app
            .clone()
            .oneshot(request("GET", "/api/sessions", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["state"], "connected");
        assert!(json[0].get("identity_tag").is_none());

        let uri = format!("/api/sessions/{}", ids[0]);
        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("DELETE", "/api/identities/bob", Some(TOKEN)))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["disconnected"], 1);
        assert_eq!(handle.session_count(), 0);
    }
}
