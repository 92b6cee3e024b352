use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use protocol::GatewayMessageCodec;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::{mpsc, watch},
};
use tokio_util::codec::FramedRead;
use tracing::{error, info, warn};

use crate::{
    connections::{next_conn_id, ConnId},
    dispatch::DispatchCore,
    node_manager::GatewayNodeManager,
};

/// Gateway-side handle on one engine control connection.
///
/// Shared between the dispatch core's `engine_connections` table (which
/// keeps it alive) and the node manager (which sends through it). Frames
/// are handed to the connection's writer task through a bounded queue;
/// `try_send` never blocks.
pub struct EngineConnectionHandle {
    id: ConnId,
    pub node_id: u16,
    pub conn_id: u16,
    outbound: mpsc::Sender<Bytes>,
}

impl EngineConnectionHandle {
    pub fn new(node_id: u16, conn_id: u16, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: next_conn_id(),
            node_id,
            conn_id,
            outbound,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue an encoded frame for the writer task. Returns false when the
    /// queue is full or the connection is gone; the caller treats either as
    /// "the node did not receive the call".
    pub fn try_send(&self, frame: Bytes) -> bool {
        self.outbound.try_send(frame).is_ok()
    }
}

/// Bind the engine listener with the configured backlog.
pub fn bind_engine_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    socket.bind(&addr.into()).context("bind()")?;
    socket.listen(backlog as i32).context("listen()")?;
    TcpListener::from_std(socket.into()).context("tokio listener")
}

/// Accept engine control connections until shutdown.
pub async fn run_engine_listener(
    listener: TcpListener,
    core: Arc<DispatchCore>,
    node_manager: Arc<GatewayNodeManager>,
    queue_depth: usize,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let core = core.clone();
                        let node_manager = node_manager.clone();
                        tokio::spawn(async move {
                            handle_engine_connection(stream, peer, core, node_manager, queue_depth)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!("failed to accept engine connection: {e}");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("engine listener shutting down");
                return;
            }
        }
    }
}

/// Drive one engine connection: handshake first, then frames until EOF or a
/// framing error. A malformed or wrong-type first frame closes the socket.
pub async fn handle_engine_connection<S>(
    stream: S,
    peer: SocketAddr,
    core: Arc<DispatchCore>,
    node_manager: Arc<GatewayNodeManager>,
    queue_depth: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, GatewayMessageCodec);

    let handshake = match frames.next().await {
        Some(Ok(frame)) if frame.message.is_engine_handshake() => frame.message,
        Some(Ok(frame)) => {
            error!(
                %peer,
                message_type = frame.message.message_type,
                "unexpected engine handshake message"
            );
            return;
        }
        Some(Err(e)) => {
            error!(%peer, "failed to read handshake message from engine: {e}");
            return;
        }
        None => {
            error!(%peer, "engine closed connection before handshake");
            return;
        }
    };

    let node_id = handshake.node_id;
    let conn_id = handshake.conn_id;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(queue_depth);
    let handle = Arc::new(EngineConnectionHandle::new(node_id, conn_id, outbound_tx));
    info!(node_id, conn_id, %peer, "new engine connection");

    node_manager.register_connection(handle.clone());
    core.on_new_engine_connection(handle.clone());

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                warn!(node_id, conn_id, "engine write failed: {e}");
                break;
            }
        }
    });

    while let Some(result) = frames.next().await {
        match result {
            Ok(frame) => core.on_engine_message(node_id, frame.message, frame.payload),
            Err(e) => {
                error!(node_id, conn_id, "engine framing error: {e}");
                break;
            }
        }
    }

    writer.abort();
    node_manager.deregister_connection(&handle);
    core.on_engine_connection_closed(handle.id());
}
