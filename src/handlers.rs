use std::net::{IpAddr, SocketAddr as StdSocketAddr};

use futures_util::{SinkExt, StreamExt};
use salvo::http::StatusCode;
use salvo::prelude::*;
use salvo::websocket::{Message, WebSocket, WebSocketUpgrade};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::RelayError;
use crate::models::{ClientMessage, ServerEvent};
use crate::relay::{validate_message, ChannelSink};
use crate::state::app_state;
use crate::utils::now_timestamp_string;

pub fn router() -> Router {
    Router::new()
        .get(root)
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("upstream-health").get(upstream_health))
        .push(Router::with_path("ws").get(chat_socket))
}

#[handler]
pub async fn chat_socket(req: &mut Request, res: &mut Response) -> Result<(), StatusError> {
    let client_ip = resolve_client_ip(req)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    WebSocketUpgrade::new()
        .upgrade(req, res, move |ws| serve_connection(ws, client_ip))
        .await
}

/// Owns one client connection: registers it, pumps outbound events from the
/// per-connection channel, and dispatches inbound messages. Disconnecting
/// cancels every in-flight turn of this connection.
async fn serve_connection(ws: WebSocket, client_ip: String) {
    let state = app_state();
    let connection_id = state.connections.register(&client_ip).await;
    let identity_key = identity_key(&client_ip);
    let cancel = CancellationToken::new();

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            if ws_tx.send(Message::text(payload)).await.is_err() {
                break;
            }
        }
    });

    let active = state.connections.active_count().await;
    info!(
        phase = "client_connected",
        connection_id = %connection_id,
        ip = %client_ip,
        active = active,
        "Client connected"
    );

    while let Some(message) = ws_rx.next().await {
        let Ok(message) = message else {
            break;
        };
        if message.is_close() {
            break;
        }
        let Some(text) = message_text(&message) else {
            continue;
        };
        handle_client_message(&text, &event_tx, &cancel, &identity_key).await;
    }

    cancel.cancel();
    let session = state.connections.deregister(&connection_id).await;
    forwarder.abort();

    let active = state.connections.active_count().await;
    info!(
        phase = "client_disconnected",
        connection_id = %connection_id,
        session_secs = session.map(|duration| duration.as_secs()).unwrap_or(0),
        active = active,
        "Client disconnected"
    );
}

async fn handle_client_message(
    raw: &str,
    events: &mpsc::UnboundedSender<ServerEvent>,
    cancel: &CancellationToken,
    identity_key: &str,
) {
    let state = app_state();

    let Ok(inbound) = serde_json::from_str::<ClientMessage>(raw) else {
        debug!(
            phase = "client_message_unparseable",
            "Ignoring malformed inbound event"
        );
        send_error(events, "Expected a JSON object with a \"message\" field.");
        return;
    };

    if let Err(validation) = validate_message(&inbound.message, state.config.max_message_len) {
        send_error(events, &validation.to_string());
        return;
    }

    if !state.rate_limiter.check(identity_key).await {
        warn!(phase = "rate_limited", "Client exceeded the message rate limit");
        send_error(
            events,
            "Too many messages. Please wait a moment before sending more.",
        );
        return;
    }

    let relay = state.relay.clone();
    let sink = ChannelSink::new(events.clone());
    let turn_cancel = cancel.child_token();
    let message = inbound.message;

    tokio::spawn(async move {
        match relay.relay(&message, &sink, &turn_cancel).await {
            Ok(_) => {}
            Err(RelayError::Cancelled) => {
                debug!(
                    phase = "turn_cancelled",
                    "Relay aborted after client disconnect"
                );
            }
            Err(validation) => {
                // Already validated above; the relay re-checks as part of
                // its own contract.
                debug!(
                    phase = "relay_validation_rejected",
                    "Relay rejected a pre-validated message: {validation}"
                );
            }
        }
    });
}

fn send_error(events: &mpsc::UnboundedSender<ServerEvent>, message: &str) {
    let _ = events.send(ServerEvent::Error {
        message: message.to_string(),
    });
}

fn message_text(message: &Message) -> Option<String> {
    if !message.is_text() {
        return None;
    }
    Some(String::from_utf8_lossy(message.as_bytes()).into_owned())
}

fn identity_key(client_ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_ip.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[handler]
pub async fn root(res: &mut Response) {
    let state = app_state();
    res.render(Json(RootResponse {
        message: "LLM Chat Gateway (Rust/Salvo)".to_string(),
        status: "running".to_string(),
        config: RootConfig {
            upstream_base_url: state.config.upstream_base_url.clone(),
            decode_mode: state.config.decode_mode_name().to_string(),
            model: state.config.model.clone(),
            api_key_configured: state.config.upstream_api_key.is_some(),
        },
        endpoints: RootEndpoints {
            ws: "/ws".to_string(),
            health: "/health".to_string(),
            upstream_health: "/upstream-health".to_string(),
        },
    }));
}

#[handler]
pub async fn health_check(res: &mut Response) {
    let state = app_state();
    res.render(Json(HealthCheckResponse {
        status: "healthy".to_string(),
        timestamp: now_timestamp_string(),
        decode_mode: state.config.decode_mode_name().to_string(),
        model: state.config.model.clone(),
        active_connections: state.connections.active_count().await,
    }));
}

#[handler]
pub async fn upstream_health(res: &mut Response) {
    let state = app_state();

    match state.upstream.probe().await {
        Ok(models) => res.render(Json(UpstreamHealthSuccessResponse {
            status: "success".to_string(),
            message: "Successfully connected to the inference backend".to_string(),
            models,
            timestamp: now_timestamp_string(),
        })),
        Err(probe_error) => {
            error!("Upstream health probe failed: {}", probe_error.message);
            res.status_code(StatusCode::SERVICE_UNAVAILABLE);
            res.render(Json(UpstreamHealthFailureResponse {
                status: "failed".to_string(),
                error_type: "API Error".to_string(),
                message: probe_error.message,
                timestamp: now_timestamp_string(),
                suggestions: vec![
                    "Check UPSTREAM_BASE_URL".to_string(),
                    "Verify the model server is running".to_string(),
                    "Check MODEL against the backend's installed models".to_string(),
                ],
            }));
        }
    }
}

fn resolve_client_ip(req: &Request) -> Option<IpAddr> {
    forwarded_ip(req).or_else(|| remote_peer_ip(req))
}

fn forwarded_ip(req: &Request) -> Option<IpAddr> {
    for header_name in ["x-forwarded-for", "x-real-ip"] {
        let Some(raw_value) = req
            .headers()
            .get(header_name)
            .and_then(|value| value.to_str().ok())
        else {
            continue;
        };

        if let Some(ip) = parse_ip_from_header(raw_value) {
            return Some(ip);
        }
    }

    None
}

fn parse_ip_from_header(raw_value: &str) -> Option<IpAddr> {
    raw_value.split(',').find_map(|segment| {
        let candidate = segment.trim().trim_matches('"');
        parse_ip_candidate(candidate)
    })
}

fn parse_ip_candidate(candidate: &str) -> Option<IpAddr> {
    if candidate.is_empty() || candidate.eq_ignore_ascii_case("unknown") {
        return None;
    }

    if let Ok(ip) = candidate.parse::<IpAddr>() {
        return Some(ip);
    }

    if let Ok(addr) = candidate.parse::<StdSocketAddr>() {
        return Some(addr.ip());
    }

    None
}

fn remote_peer_ip(req: &Request) -> Option<IpAddr> {
    if let Some(addr) = req.remote_addr().as_ipv4() {
        return Some(IpAddr::V4(*addr.ip()));
    }
    if let Some(addr) = req.remote_addr().as_ipv6() {
        return Some(IpAddr::V6(*addr.ip()));
    }
    None
}

#[derive(Debug, Serialize)]
struct RootResponse {
    message: String,
    status: String,
    config: RootConfig,
    endpoints: RootEndpoints,
}

#[derive(Debug, Serialize)]
struct RootConfig {
    upstream_base_url: String,
    decode_mode: String,
    model: String,
    api_key_configured: bool,
}

#[derive(Debug, Serialize)]
struct RootEndpoints {
    ws: String,
    health: String,
    upstream_health: String,
}

#[derive(Debug, Serialize)]
struct HealthCheckResponse {
    status: String,
    timestamp: String,
    decode_mode: String,
    model: String,
    active_connections: usize,
}

#[derive(Debug, Serialize)]
struct UpstreamHealthSuccessResponse {
    status: String,
    message: String,
    models: Vec<String>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct UpstreamHealthFailureResponse {
    status: String,
    error_type: String,
    message: String,
    timestamp: String,
    suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{identity_key, message_text, parse_ip_candidate, parse_ip_from_header};
    use salvo::websocket::Message;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn parses_first_valid_ip_from_forwarded_header() {
        let ip = parse_ip_from_header("unknown, 203.0.113.7, 198.51.100.9").expect("ip");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn parses_ip_candidates() {
        let ipv4 = parse_ip_candidate("192.168.1.9").expect("ipv4");
        assert_eq!(ipv4, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)));

        let socket_ipv4 = parse_ip_candidate("10.0.0.5:8080").expect("socket ipv4");
        assert_eq!(socket_ipv4, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn rejects_empty_and_unknown_candidates() {
        assert!(parse_ip_candidate("").is_none());
        assert!(parse_ip_candidate("unknown").is_none());
        assert!(parse_ip_candidate("UNKNOWN").is_none());
    }

    #[test]
    fn identity_key_is_a_stable_sha256_hex() {
        let first = identity_key("203.0.113.7");
        let second = identity_key("203.0.113.7");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, identity_key("203.0.113.8"));
    }

    #[test]
    fn message_text_extracts_text_frames_only() {
        let text = message_text(&Message::text("{\"message\":\"hi\"}")).expect("text frame");
        assert_eq!(text, "{\"message\":\"hi\"}");

        assert!(message_text(&Message::binary(vec![1u8, 2, 3])).is_none());
        assert!(message_text(&Message::ping(Vec::new())).is_none());
    }
}
