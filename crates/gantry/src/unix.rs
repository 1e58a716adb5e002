//! Unix-domain socket transport for local agent processes.
//!
//! Framing matches the backend link: JSON messages delimited by a
//! single 0x03 byte. Peer credentials are captured from the kernel at
//! accept time; connection semantics otherwise mirror the WebSocket
//! carrier.

use std::path::PathBuf;
use std::sync::Arc;

use gantry_wire::{DEFAULT_MAX_FRAME_BYTES, FrameCodec, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::error::{Result, ServerError};
use crate::server::Server;
use crate::transport::{ApiTransport, ConnectionKind, PeerCreds, RemoteConnection};

/// Read peer credentials for a connected Unix socket.
#[cfg(target_os = "linux")]
pub(crate) fn unix_peer_credentials(fd: std::os::fd::RawFd) -> Option<PeerCreds> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    Some(PeerCreds {
        process_id: ucred.pid as i64,
        user_id: ucred.uid as i64,
        group_id: ucred.gid as i64,
    })
}

pub async fn bind(path: &PathBuf) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ServerError::internal(format!("create socket dir: {e}")))?;
    }
    if path.exists() {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| ServerError::internal(format!("remove stale socket: {e}")))?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| ServerError::internal(format!("bind unix socket {}: {e}", path.display())))?;
    info!(path = %path.display(), "unix socket listener ready");
    Ok(listener)
}

pub async fn run_acceptor(listener: UnixListener, server: Arc<Server>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let server = server.clone();
                tokio::spawn(async move {
                    handle_conn(stream, server).await;
                });
            }
            Err(error) => error!(%error, "unix socket accept failed"),
        }
    }
}

async fn handle_conn(stream: UnixStream, server: Arc<Server>) {
    #[cfg(target_os = "linux")]
    let peer = {
        use std::os::fd::AsRawFd;
        unix_peer_credentials(stream.as_raw_fd())
    };
    #[cfg(not(target_os = "linux"))]
    let peer: Option<PeerCreds> = None;

    let (conn, mut outbound) = RemoteConnection::new(ConnectionKind::Unix { peer });
    server.connections.add_client(conn.clone());
    info!(uid = conn.uid(), ?peer, "unix socket client connected");

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if write_half.write_all(&encode_frame(payload)).await.is_err() {
                break;
            }
        }
    });

    let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_BYTES);
    let mut buf = [0u8; 8192];
    'read: loop {
        let read = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        codec.push(&buf[..read]);
        loop {
            match codec.next_frame() {
                Ok(Some(frame)) => dispatch(&server, &conn, frame),
                Ok(None) => break,
                Err(error) => {
                    error!(uid = conn.uid(), %error, "unix socket framing error");
                    break 'read;
                }
            }
        }
    }

    server.on_connection_closed(&conn);
    writer.abort();
    info!(uid = conn.uid(), "unix socket client disconnected");
}

fn dispatch(server: &Arc<Server>, conn: &Arc<RemoteConnection>, frame: Vec<u8>) {
    let server = server.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let transport: Arc<dyn ApiTransport> = conn.clone();
        if let Some(response) = server.rpc.dispatch(&frame, transport).await {
            conn.queue_raw(response);
        } else {
            debug!(uid = conn.uid(), "unix notification produced no response");
        }
    });
}
