use std::sync::{
    atomic::{AtomicI32, Ordering},
    Mutex,
};

use data_model::FuncCallContext;
use tokio::sync::oneshot;
use tracing::warn;

/// Per-process connection identifier, shared by client and engine
/// connections.
pub type ConnId = i32;

static NEXT_CONNECTION_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A live client connection as the dispatch core sees it.
///
/// The core reaches the adapter only through this trait, and only while the
/// connection is still registered in its `connections` table; completion
/// hands the finished context back through `on_call_finished`.
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> ConnId;
    fn on_call_finished(&self, ctx: FuncCallContext);
}

/// One in-flight HTTP (or gRPC-flavored) request wired to a waiting handler
/// through a oneshot channel.
pub struct HttpCallConnection {
    id: ConnId,
    finished_tx: Mutex<Option<oneshot::Sender<FuncCallContext>>>,
}

impl HttpCallConnection {
    pub fn new(id: ConnId, finished_tx: oneshot::Sender<FuncCallContext>) -> Self {
        Self {
            id,
            finished_tx: Mutex::new(Some(finished_tx)),
        }
    }

    /// True once the finished context has been delivered (or the delivery
    /// slot consumed); a dropped handler checks this to decide whether the
    /// call must be cancelled.
    pub fn finished(&self) -> bool {
        self.finished_tx.lock().expect("finished_tx lock").is_none()
    }
}

impl ClientConnection for HttpCallConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn on_call_finished(&self, ctx: FuncCallContext) {
        let tx = self.finished_tx.lock().expect("finished_tx lock").take();
        match tx {
            Some(tx) => {
                if tx.send(ctx).is_err() {
                    warn!(connection_id = self.id, "client handler gone before delivery");
                }
            }
            None => {
                warn!(connection_id = self.id, "duplicate call completion dropped");
            }
        }
    }
}
