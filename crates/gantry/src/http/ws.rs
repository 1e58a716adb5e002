//! WebSocket carrier: each connection is a persistent JSON-RPC stream
//! backed by a [`RemoteConnection`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use tracing::{debug, info};

use crate::http::AppState;
use crate::server::Server;
use crate::transport::{ApiTransport, ConnectionKind, RemoteConnection};

pub async fn websocket_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state.server, socket, addr))
}

async fn handle_socket(server: Arc<Server>, mut socket: WebSocket, addr: SocketAddr) {
    let (conn, mut outbound) = RemoteConnection::new(ConnectionKind::WebSocket {
        ip: Some(addr.ip()),
    });
    server.connections.add_client(conn.clone());
    info!(uid = conn.uid(), %addr, "websocket opened");

    loop {
        tokio::select! {
            payload = outbound.recv() => {
                let Some(payload) = payload else { break };
                let Ok(text) = String::from_utf8(payload) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&server, &conn, text.as_bytes().to_vec());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        dispatch(&server, &conn, data.to_vec());
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    server.on_connection_closed(&conn);
    info!(uid = conn.uid(), "websocket closed");
}

/// Messages dispatch concurrently so a slow backend call cannot block
/// the connection; responses stay ordered per call through the
/// outbound queue and correlate by id.
fn dispatch(server: &Arc<Server>, conn: &Arc<RemoteConnection>, frame: Vec<u8>) {
    let server = server.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let transport: Arc<dyn ApiTransport> = conn.clone();
        if let Some(response) = server.rpc.dispatch(&frame, transport).await {
            conn.queue_raw(response);
        } else {
            debug!(uid = conn.uid(), "websocket notification produced no response");
        }
    });
}
