//! Control HTTP surface
//!
//! Three plaintext routes over the peer manager: add a peer (returning
//! its client config), remove a peer, and re-emit an existing peer's
//! config. Public keys arrive as wildcard path captures because base64
//! contains `/`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::TetherError;
use crate::tether::endpoints::EndpointKind;
use crate::tether::engine::Key;
use crate::tether::peers::PeerManager;

/// How long shutdown lets in-flight requests drain before forcing close
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state behind the control routes
#[derive(Debug)]
pub struct ControlState {
    /// The peer manager all routes operate through
    pub manager: Arc<PeerManager>,
    /// Name of the device the surface controls
    pub device: String,
}

/// Build the control router
pub fn control_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/peer/add/{kind}/{*pubkey}", post(add_peer))
        .route("/peer/remove/{*pubkey}", delete(remove_peer))
        .route("/peer/config/{kind}/{*pubkey}", get(peer_config))
        .with_state(state)
}

/// Serve the control surface until the token is canceled
///
/// Cancellation starts a graceful drain; connections still open after
/// [`SHUTDOWN_GRACE`] are force-closed.
pub async fn serve_control(
    listener: TcpListener,
    state: Arc<ControlState>,
    cancel: CancellationToken,
) -> Result<(), TetherError> {
    let router = control_router(state);
    let shutdown = cancel.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    tokio::select! {
        result = server => result.map_err(TetherError::Io),
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            info!("control surface drain window elapsed, closing");
            Ok(())
        }
    }
}

/// Handle POST /peer/add/{kind}/{*pubkey}
async fn add_peer(
    State(state): State<Arc<ControlState>>,
    Path((kind, pubkey)): Path<(String, String)>,
) -> Response {
    let (kind, key) = match parse_captures(&kind, &pubkey) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };

    match state
        .manager
        .add_peer_and_get_config(&state.device, &key, kind)
        .await
    {
        Ok(config) => (StatusCode::OK, config).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Handle DELETE /peer/remove/{*pubkey}
async fn remove_peer(
    State(state): State<Arc<ControlState>>,
    Path(pubkey): Path<String>,
) -> Response {
    let key = match parse_pubkey(&pubkey) {
        Ok(key) => key,
        Err(e) => return error_response(&e),
    };

    match state.manager.remove_peer(&state.device, &key).await {
        Ok(()) => (StatusCode::OK, "removed\n".to_string()).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Handle GET /peer/config/{kind}/{*pubkey}
async fn peer_config(
    State(state): State<Arc<ControlState>>,
    Path((kind, pubkey)): Path<(String, String)>,
) -> Response {
    let (kind, key) = match parse_captures(&kind, &pubkey) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };

    match state
        .manager
        .get_peer_config(&state.device, &key, kind)
        .await
    {
        Ok(config) => (StatusCode::OK, config).into_response(),
        Err(e) => error_response(&e),
    }
}

fn parse_captures(kind: &str, pubkey: &str) -> Result<(EndpointKind, Key), TetherError> {
    let kind: EndpointKind = kind.parse()?;
    let key = parse_pubkey(pubkey)?;
    Ok((kind, key))
}

fn parse_pubkey(capture: &str) -> Result<Key, TetherError> {
    // The wildcard capture may carry one leading separator slash, but a
    // base64 key can itself start with slashes, so only retry with the
    // separator stripped when the verbatim capture does not parse.
    if let Ok(key) = capture.parse() {
        return Ok(key);
    }
    capture.strip_prefix('/').unwrap_or(capture).parse()
}

fn error_response(err: &TetherError) -> Response {
    (status_for(err), format!("{}\n", err)).into_response()
}

/// Map error kinds onto status codes: client-shaped errors are 400,
/// missing resources 404, everything else 500.
fn status_for(err: &TetherError) -> StatusCode {
    match err {
        TetherError::InvalidEndpointType(_)
        | TetherError::InvalidKey(_)
        | TetherError::PeerExists(_)
        | TetherError::EndpointAddAny
        | TetherError::InvalidAddress(_)
        | TetherError::NotNetworkAddress(_) => StatusCode::BAD_REQUEST,
        TetherError::PeerNotFound(_)
        | TetherError::DeviceNotFound(_)
        | TetherError::EndpointNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tether::endpoints::EndpointDirectory;
    use crate::tether::engine::mock::MockEngine;
    use crate::tether::registry::DeviceRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use http_body_util::BodyExt;
    use ipnet::IpNet;
    use tokio::sync::Mutex;
    use tower::util::ServiceExt;

    fn key(byte: u8) -> Key {
        Key::from_bytes([byte; 32])
    }

    fn state_with_device() -> (Arc<ControlState>, Arc<Mutex<DeviceRegistry>>) {
        let engine = MockEngine::new()
            .with_keys(key(100), key(101))
            .with_listen_port(51820);

        let mut registry = DeviceRegistry::new();
        registry
            .add("wg0", Box::new(engine), &["10.0.0.0/24".to_string()])
            .unwrap();
        let registry = Arc::new(Mutex::new(registry));

        let mut endpoints = EndpointDirectory::new();
        endpoints.set(EndpointKind::Ipv4, "203.0.113.5").unwrap();

        let manager = Arc::new(PeerManager::new(registry.clone(), endpoints));
        (
            Arc::new(ControlState {
                manager,
                device: "wg0".to_string(),
            }),
            registry,
        )
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_add_peer_returns_config() {
        let (state, registry) = state_with_device();
        let router = control_router(state);

        let pubkey = key(1).to_string();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/peer/add/ipv4/{}", pubkey))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert_eq!(body.matches("[Interface]").count(), 1);
        assert_eq!(body.matches("[Peer]").count(), 1);
        assert!(body.contains("Endpoint = 203.0.113.5:51820"));

        // The device now lists the key with one allowed IP from the pool.
        let registry = registry.lock().await;
        let view = registry.get("wg0").unwrap();
        assert_eq!(view.peers.len(), 1);
        assert_eq!(view.peers[0].public_key, key(1));
        assert_eq!(
            view.peers[0].allowed_ips,
            vec!["10.0.0.1/32".parse::<IpNet>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_add_peer_key_with_slashes() {
        // 0xff bytes base64-encode to slashes, spanning path segments.
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let pubkey = key(0xff).to_string();
        assert!(pubkey.contains('/'));

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/peer/add/ipv4/{}", pubkey))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_add_peer_invalid_kind() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/peer/add/smoke-signal/{}", key(1)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_add_peer_invalid_key() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/peer/add/ipv4/not-a-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_add_peer_twice_conflicts() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let uri = format!("/peer/add/ipv4/{}", key(1));
        let first = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_remove_peer_idempotent() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let uri = format!("/peer/remove/{}", key(1));
        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method("DELETE")
                        .uri(&uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_get_config_unknown_peer() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/peer/config/ipv4/{}", key(9)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_config_after_add() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let add = Request::builder()
            .method("POST")
            .uri(format!("/peer/add/ipv4/{}", key(1)))
            .body(Body::empty())
            .unwrap();
        router.clone().oneshot(add).await.unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/peer/config/any/{}", key(1)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("Address = 10.0.0.1/32"));
    }

    #[tokio::test]
    async fn test_responses_are_plaintext() {
        let (state, _registry) = state_with_device();
        let router = control_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/peer/add/ipv4/{}", key(1)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_serve_control_shutdown() {
        let (state, _registry) = state_with_device();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let handle =
            tokio::spawn(async move { serve_control(listener, state, serve_cancel).await });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_base64_key_shape_assumption() {
        // Standard base64 of 32 bytes is 44 chars ending in '='.
        let text = BASE64.encode([1u8; 32]);
        assert_eq!(text.len(), 44);
        assert!(text.ends_with('='));
    }
}
