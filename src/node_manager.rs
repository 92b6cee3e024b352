use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use data_model::FuncCall;
use protocol::{encode_frame, GatewayMessage};
use tracing::{error, info, warn};

use crate::engine::EngineConnectionHandle;

/// Placement oracle and capacity accountant for engine nodes.
///
/// Callable from any thread; must not block on I/O. `send` returning false
/// means the node did not receive the call.
pub trait NodeManager: Send + Sync {
    fn pick_node(&self, func_call: &FuncCall) -> Option<u16>;
    fn call_finished(&self, func_call: &FuncCall, node_id: u16);
    fn send(&self, node_id: u16, message: GatewayMessage, payload: Bytes) -> bool;
}

#[derive(Default)]
struct NodeState {
    inflight: HashSet<FuncCall>,
    connections: Vec<Arc<EngineConnectionHandle>>,
    next_conn: usize,
}

/// Production node manager: per-node inflight accounting with a
/// least-loaded pick, frames sent round-robin over the node's control
/// connections.
pub struct GatewayNodeManager {
    max_inflight_per_node: usize,
    nodes: Mutex<HashMap<u16, NodeState>>,
}

impl GatewayNodeManager {
    pub fn new(max_inflight_per_node: usize) -> Self {
        Self {
            max_inflight_per_node,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_connection(&self, handle: Arc<EngineConnectionHandle>) {
        let mut nodes = self.nodes.lock().expect("nodes lock");
        let node = nodes.entry(handle.node_id).or_default();
        if node.connections.is_empty() {
            info!(node_id = handle.node_id, "node connected");
        }
        node.connections.push(handle);
    }

    pub fn deregister_connection(&self, handle: &Arc<EngineConnectionHandle>) {
        let mut nodes = self.nodes.lock().expect("nodes lock");
        if let Some(node) = nodes.get_mut(&handle.node_id) {
            node.connections.retain(|c| c.id() != handle.id());
            if node.connections.is_empty() {
                warn!(
                    node_id = handle.node_id,
                    outstanding = node.inflight.len(),
                    "node lost its last connection"
                );
                nodes.remove(&handle.node_id);
            }
        }
    }

    pub fn connected_nodes(&self) -> usize {
        self.nodes.lock().expect("nodes lock").len()
    }
}

impl NodeManager for GatewayNodeManager {
    fn pick_node(&self, func_call: &FuncCall) -> Option<u16> {
        let mut nodes = self.nodes.lock().expect("nodes lock");
        let picked = nodes
            .iter()
            .filter(|(_, node)| {
                !node.connections.is_empty() && node.inflight.len() < self.max_inflight_per_node
            })
            .min_by_key(|(node_id, node)| (node.inflight.len(), **node_id))
            .map(|(node_id, _)| *node_id)?;
        if let Some(node) = nodes.get_mut(&picked) {
            node.inflight.insert(*func_call);
        }
        Some(picked)
    }

    fn call_finished(&self, func_call: &FuncCall, node_id: u16) {
        let mut nodes = self.nodes.lock().expect("nodes lock");
        if let Some(node) = nodes.get_mut(&node_id) {
            node.inflight.remove(func_call);
        }
    }

    fn send(&self, node_id: u16, message: GatewayMessage, payload: Bytes) -> bool {
        let frame = match encode_frame(message, payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(node_id, "failed to encode dispatch frame: {e}");
                return false;
            }
        };
        let connections: Vec<Arc<EngineConnectionHandle>> = {
            let mut nodes = self.nodes.lock().expect("nodes lock");
            let Some(node) = nodes.get_mut(&node_id) else {
                return false;
            };
            let start = node.next_conn;
            node.next_conn = node.next_conn.wrapping_add(1);
            let n = node.connections.len();
            (0..n)
                .map(|i| node.connections[(start + i) % n].clone())
                .collect()
        };
        connections.iter().any(|conn| conn.try_send(frame.clone()))
    }
}
