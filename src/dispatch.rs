use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use bytes::Bytes;
use data_model::{CallStatus, FuncCall, FuncCallContext, FunctionEntry, FunctionRegistry};
use metrics::{gateway_stats, per_func_stats};
use opentelemetry::KeyValue;
use protocol::GatewayMessage;
use tracing::{debug, error, info, warn};

use crate::{
    connections::{ClientConnection, ConnId},
    engine::EngineConnectionHandle,
    node_manager::NodeManager,
};

const NO_TIMESTAMP: i64 = -1;

/// Microseconds since process start, monotonic.
pub(crate) fn monotonic_micros() -> i64 {
    static ANCHOR: OnceLock<tokio::time::Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(tokio::time::Instant::now);
    tokio::time::Instant::now().duration_since(anchor).as_micros() as i64
}

fn micros_to_secs(micros: i64) -> f64 {
    micros.max(0) as f64 / 1e6
}

/// The gateway's record for a call between receipt and completion.
struct FuncCallState {
    func_call: FuncCall,
    /// Id of the originating client connection; none for async calls.
    connection_id: Option<ConnId>,
    /// The client context, owned here for sync calls until completion.
    context: Option<FuncCallContext>,
    recv_timestamp: i64,
    dispatch_timestamp: i64,
    /// Queued async calls keep their own handle on the input; the client
    /// context is acked and dropped before dispatch happens.
    input: Option<Bytes>,
}

struct PerFuncStat {
    last_request_timestamp: i64,
    attrs: Vec<KeyValue>,
}

struct CoreState {
    connections: HashMap<ConnId, Arc<dyn ClientConnection>>,
    engine_connections: HashMap<ConnId, Arc<EngineConnectionHandle>>,
    running_func_calls: HashMap<FuncCall, FuncCallState>,
    pending_func_calls: VecDeque<FuncCallState>,
    discarded_func_calls: HashSet<FuncCall>,
    per_func_stats: HashMap<u16, PerFuncStat>,
    last_request_timestamp: i64,
}

/// The call dispatch core.
///
/// Owns the cross-referenced call tables under a single mutex. The lock is
/// never held across node-manager calls or adapter callbacks; every entry
/// point prepares outside the lock, mutates in a short critical section,
/// and acts outside it again.
pub struct DispatchCore {
    registry: Arc<FunctionRegistry>,
    node_manager: Arc<dyn NodeManager>,
    next_call_id: AtomicU32,
    stats: Arc<gateway_stats::Metrics>,
    func_stats: per_func_stats::Metrics,
    state: Mutex<CoreState>,
}

impl DispatchCore {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        node_manager: Arc<dyn NodeManager>,
        stats: Arc<gateway_stats::Metrics>,
    ) -> Self {
        Self {
            registry,
            node_manager,
            next_call_id: AtomicU32::new(1),
            stats,
            func_stats: per_func_stats::Metrics::new(),
            state: Mutex::new(CoreState {
                connections: HashMap::new(),
                engine_connections: HashMap::new(),
                running_func_calls: HashMap::new(),
                pending_func_calls: VecDeque::new(),
                discarded_func_calls: HashSet::new(),
                per_func_stats: HashMap::new(),
                last_request_timestamp: NO_TIMESTAMP,
            }),
        }
    }

    pub fn register_client_connection(&self, conn: Arc<dyn ClientConnection>) {
        let mut core = self.state.lock().expect("core lock");
        core.connections.insert(conn.id(), conn);
    }

    pub fn on_client_connection_closed(&self, connection_id: ConnId) {
        let mut core = self.state.lock().expect("core lock");
        core.connections.remove(&connection_id);
        debug!(connection_id, "client connection closed");
    }

    pub fn on_new_engine_connection(&self, handle: Arc<EngineConnectionHandle>) {
        {
            let mut core = self.state.lock().expect("core lock");
            core.engine_connections.insert(handle.id(), handle.clone());
        }
        info!(
            node_id = handle.node_id,
            conn_id = handle.conn_id,
            "engine connection registered"
        );
        self.try_drain_pending();
    }

    pub fn on_engine_connection_closed(&self, id: ConnId) {
        let mut core = self.state.lock().expect("core lock");
        if let Some(handle) = core.engine_connections.remove(&id) {
            warn!(
                node_id = handle.node_id,
                conn_id = handle.conn_id,
                "engine connection disconnected"
            );
        }
    }

    /// Record a cancellation tombstone. The running and pending tables are
    /// not scanned here; the tombstone is consumed when the call is next
    /// observed by a completion or a queue drain.
    pub fn on_call_cancelled(&self, func_call: FuncCall) {
        let mut core = self.state.lock().expect("core lock");
        core.discarded_func_calls.insert(func_call);
    }

    /// Accept one parsed client request.
    ///
    /// Resolves the function (and gRPC method when one is named), allocates
    /// the call id, and either dispatches immediately or queues. Returns the
    /// assigned identity, or `None` when the request was rejected before a
    /// call id was allocated.
    pub fn on_new_call(
        &self,
        conn: Arc<dyn ClientConnection>,
        mut ctx: FuncCallContext,
    ) -> Option<FuncCall> {
        let Some(entry) = self.registry.find_by_name(&ctx.func_name) else {
            return self.reject(&conn, ctx);
        };
        let method_id = match &ctx.method_name {
            Some(method_name) => {
                if !entry.is_grpc_service {
                    return self.reject(&conn, ctx);
                }
                match entry.method_id(method_name) {
                    Some(method_id) => method_id,
                    None => return self.reject(&conn, ctx),
                }
            }
            None => 0,
        };
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let func_call = FuncCall::with_method(entry.func_id, method_id, 0, call_id);
        ctx.func_call = Some(func_call);
        debug!(%func_call, func = %entry.func_name, is_async = ctx.is_async, "new func call");

        let picked = self.node_manager.pick_node(&func_call);

        let is_async = ctx.is_async;
        let mut state = FuncCallState {
            func_call,
            connection_id: if is_async { None } else { Some(conn.id()) },
            context: None,
            recv_timestamp: 0,
            dispatch_timestamp: 0,
            input: None,
        };

        let Some(node_id) = picked else {
            // No capacity: queue. Async callers are acknowledged right away;
            // sync callers stay parked on their connection.
            let ack = {
                let mut core = self.state.lock().expect("core lock");
                self.record_arrival(&mut core, entry, &mut state);
                if is_async {
                    state.input = Some(ctx.input.clone());
                    core.pending_func_calls.push_back(state);
                    Some(ctx)
                } else {
                    state.context = Some(ctx);
                    core.pending_func_calls.push_back(state);
                    None
                }
            };
            if let Some(mut ctx) = ack {
                ctx.status = CallStatus::Success;
                conn.on_call_finished(ctx);
            }
            return Some(func_call);
        };

        {
            let mut core = self.state.lock().expect("core lock");
            self.record_arrival(&mut core, entry, &mut state);
        }

        let dispatched = if is_async {
            let ok = self.dispatch_async_func_call(&func_call, ctx.input.clone(), node_id);
            ctx.status = if ok {
                CallStatus::Success
            } else {
                CallStatus::NotFound
            };
            conn.on_call_finished(ctx);
            ok
        } else {
            match self.dispatch_func_call(&conn, ctx, func_call, node_id) {
                Some(ctx) => {
                    state.context = Some(ctx);
                    true
                }
                None => false,
            }
        };

        if dispatched {
            let mut core = self.state.lock().expect("core lock");
            state.dispatch_timestamp = state.recv_timestamp;
            core.running_func_calls.insert(func_call, state);
            self.stats
                .running_requests
                .record(core.running_func_calls.len() as u64, &[]);
        }
        Some(func_call)
    }

    /// Drain the pending queue in FIFO order until it is empty or placement
    /// fails for the head. Cancelled entries and sync entries whose client
    /// connection is gone are skipped.
    pub fn try_drain_pending(&self) {
        loop {
            let (mut state, parent) = {
                let mut core = self.state.lock().expect("core lock");
                let Some(state) = core.pending_func_calls.pop_front() else {
                    return;
                };
                if core.discarded_func_calls.remove(&state.func_call) {
                    debug!(func_call = %state.func_call, "skipping cancelled pending call");
                    continue;
                }
                let parent = match state.connection_id {
                    Some(connection_id) => match core.connections.get(&connection_id) {
                        Some(conn) => Some(conn.clone()),
                        None => {
                            debug!(
                                func_call = %state.func_call,
                                "dropping pending call from closed connection"
                            );
                            continue;
                        }
                    },
                    None => None,
                };
                (state, parent)
            };

            let func_call = state.func_call;
            let Some(node_id) = self.node_manager.pick_node(&func_call) else {
                // The head keeps its place until capacity shows up for it.
                let mut core = self.state.lock().expect("core lock");
                core.pending_func_calls.push_front(state);
                return;
            };

            let dispatched = match parent {
                None => {
                    let input = state.input.clone().unwrap_or_default();
                    self.dispatch_async_func_call(&func_call, input, node_id)
                }
                Some(parent) => match state.context.take() {
                    Some(ctx) => match self.dispatch_func_call(&parent, ctx, func_call, node_id) {
                        Some(ctx) => {
                            state.context = Some(ctx);
                            true
                        }
                        None => false,
                    },
                    None => {
                        error!(%func_call, "pending sync call lost its context");
                        false
                    }
                },
            };

            let mut core = self.state.lock().expect("core lock");
            state.dispatch_timestamp = monotonic_micros();
            self.stats.queueing_delay.record(
                micros_to_secs(state.dispatch_timestamp - state.recv_timestamp),
                &[],
            );
            if dispatched {
                core.running_func_calls.insert(func_call, state);
                self.stats
                    .running_requests
                    .record(core.running_func_calls.len() as u64, &[]);
            }
        }
    }

    /// Resolve a completion or failure frame against the running table and
    /// deliver to the originating client connection if it is still around.
    pub fn on_engine_message(&self, node_id: u16, message: GatewayMessage, payload: Bytes) {
        let is_complete = message.is_func_call_complete();
        if !is_complete && !message.is_func_call_failed() {
            error!(
                message_type = message.message_type,
                node_id, "unknown engine message type"
            );
            return;
        }
        let func_call = message.func_call();
        self.node_manager.call_finished(&func_call, node_id);

        let async_call;
        let mut delivery: Option<(Arc<dyn ClientConnection>, FuncCallContext)> = None;
        {
            let mut core = self.state.lock().expect("core lock");
            let Some(mut state) = core.running_func_calls.remove(&func_call) else {
                error!(%func_call, "cannot find running func call");
                return;
            };
            async_call = state.connection_id.is_none();
            let discarded = core.discarded_func_calls.remove(&func_call);
            if let Some(connection_id) = state.connection_id {
                if !discarded {
                    if let Some(conn) = core.connections.get(&connection_id) {
                        if let Some(ctx) = state.context.take() {
                            delivery = Some((conn.clone(), ctx));
                        }
                    }
                }
            }
            let current_timestamp = monotonic_micros();
            self.stats.dispatch_overhead.record(
                micros_to_secs(
                    current_timestamp
                        - state.dispatch_timestamp
                        - i64::from(message.processing_time),
                ),
                &[],
            );
            if async_call && is_complete {
                if let Some(per_func) = core.per_func_stats.get(&func_call.func_id) {
                    self.func_stats.end2end_delay.record(
                        micros_to_secs(current_timestamp - state.recv_timestamp),
                        &per_func.attrs,
                    );
                }
            }
        }

        if async_call {
            if !is_complete {
                let func_name = self
                    .registry
                    .find_by_id(func_call.func_id)
                    .map(|entry| entry.func_name.as_str())
                    .unwrap_or("<unknown>");
                warn!(func = func_name, %func_call, "async call failed");
            }
        } else if let Some((parent, mut ctx)) = delivery {
            if is_complete {
                ctx.status = CallStatus::Success;
                ctx.append_output(&payload);
            } else {
                ctx.status = CallStatus::Failed;
            }
            parent.on_call_finished(ctx);
        } else {
            debug!(%func_call, "no live client for finished call");
        }

        // Freed capacity may unblock the head of the pending queue.
        self.try_drain_pending();
    }

    fn reject(&self, conn: &Arc<dyn ClientConnection>, mut ctx: FuncCallContext) -> Option<FuncCall> {
        debug!(func = %ctx.func_name, method = ?ctx.method_name, "function not found");
        ctx.status = CallStatus::NotFound;
        conn.on_call_finished(ctx);
        None
    }

    /// Stamp receipt and update the arrival-rate stats. Colliding
    /// timestamps are advanced by 1µs so recorded intervals stay strictly
    /// positive.
    fn record_arrival(&self, core: &mut CoreState, entry: &FunctionEntry, state: &mut FuncCallState) {
        let recv_timestamp = monotonic_micros();
        state.recv_timestamp = recv_timestamp;
        self.stats.incoming_requests.add(1, &[]);
        let mut current = recv_timestamp;
        if current <= core.last_request_timestamp {
            current = core.last_request_timestamp + 1;
        }
        if core.last_request_timestamp != NO_TIMESTAMP {
            let interval = current - core.last_request_timestamp;
            self.stats
                .requests_instant_rps
                .record(1e6 / interval as f64, &[]);
            self.stats.request_interval.record(micros_to_secs(interval), &[]);
        }
        core.last_request_timestamp = current;
        self.tick_new_func_call(core, entry, current);
    }

    fn tick_new_func_call(&self, core: &mut CoreState, entry: &FunctionEntry, current_timestamp: i64) {
        let per_func = core
            .per_func_stats
            .entry(entry.func_id)
            .or_insert_with(|| PerFuncStat {
                last_request_timestamp: NO_TIMESTAMP,
                attrs: vec![KeyValue::new("func", entry.func_name.clone())],
            });
        self.func_stats.incoming_requests.add(1, &per_func.attrs);
        let mut current = current_timestamp;
        if current <= per_func.last_request_timestamp {
            current = per_func.last_request_timestamp + 1;
        }
        if per_func.last_request_timestamp != NO_TIMESTAMP {
            self.func_stats.request_interval.record(
                micros_to_secs(current - per_func.last_request_timestamp),
                &per_func.attrs,
            );
        }
        per_func.last_request_timestamp = current;
    }

    /// Send a sync call to the chosen node. Hands the context back on
    /// success; on failure releases the node's accounting, finishes the
    /// client side with `not_found` and returns `None`.
    fn dispatch_func_call(
        &self,
        parent: &Arc<dyn ClientConnection>,
        mut ctx: FuncCallContext,
        func_call: FuncCall,
        node_id: u16,
    ) -> Option<FuncCallContext> {
        let mut message = GatewayMessage::new_dispatch_func_call(func_call);
        message.payload_size = ctx.input.len() as u32;
        if self.node_manager.send(node_id, message, ctx.input.clone()) {
            Some(ctx)
        } else {
            self.node_manager.call_finished(&func_call, node_id);
            ctx.status = CallStatus::NotFound;
            parent.on_call_finished(ctx);
            None
        }
    }

    fn dispatch_async_func_call(&self, func_call: &FuncCall, input: Bytes, node_id: u16) -> bool {
        let mut message = GatewayMessage::new_dispatch_func_call(*func_call);
        message.payload_size = input.len() as u32;
        let sent = self.node_manager.send(node_id, message, input);
        if !sent {
            self.node_manager.call_finished(func_call, node_id);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::mpsc;

    use super::*;

    struct MockNodeManager {
        picks: Mutex<VecDeque<Option<u16>>>,
        send_ok: AtomicBool,
        sent: Mutex<Vec<(u16, GatewayMessage, Bytes)>>,
        finished: Mutex<Vec<(FuncCall, u16)>>,
    }

    impl MockNodeManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                picks: Mutex::new(VecDeque::new()),
                send_ok: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
                finished: Mutex::new(Vec::new()),
            })
        }

        fn script_picks(&self, picks: &[Option<u16>]) {
            self.picks.lock().unwrap().extend(picks.iter().copied());
        }

        fn set_send_ok(&self, ok: bool) {
            self.send_ok.store(ok, Ordering::SeqCst);
        }

        fn sent(&self) -> Vec<(u16, GatewayMessage, Bytes)> {
            self.sent.lock().unwrap().clone()
        }

        fn finished(&self) -> Vec<(FuncCall, u16)> {
            self.finished.lock().unwrap().clone()
        }
    }

    impl NodeManager for MockNodeManager {
        fn pick_node(&self, _func_call: &FuncCall) -> Option<u16> {
            self.picks.lock().unwrap().pop_front().flatten()
        }

        fn call_finished(&self, func_call: &FuncCall, node_id: u16) {
            self.finished.lock().unwrap().push((*func_call, node_id));
        }

        fn send(&self, node_id: u16, message: GatewayMessage, payload: Bytes) -> bool {
            if !self.send_ok.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().unwrap().push((node_id, message, payload));
            true
        }
    }

    struct RecordingConnection {
        id: ConnId,
        finished: Mutex<Vec<FuncCallContext>>,
    }

    impl RecordingConnection {
        fn new(id: ConnId) -> Arc<Self> {
            Arc::new(Self {
                id,
                finished: Mutex::new(Vec::new()),
            })
        }

        fn finished_count(&self) -> usize {
            self.finished.lock().unwrap().len()
        }

        fn last_status(&self) -> CallStatus {
            self.finished.lock().unwrap().last().expect("finished ctx").status
        }

        fn last_output(&self) -> Vec<u8> {
            self.finished
                .lock()
                .unwrap()
                .last()
                .expect("finished ctx")
                .output()
                .to_vec()
        }
    }

    impl ClientConnection for RecordingConnection {
        fn id(&self) -> ConnId {
            self.id
        }

        fn on_call_finished(&self, ctx: FuncCallContext) {
            self.finished.lock().unwrap().push(ctx);
        }
    }

    const REGISTRY_JSON: &str = r#"[
        {"funcName": "echo", "funcId": 7},
        {"funcName": "Greeter", "funcId": 9, "grpcMethods": ["SayHello"]}
    ]"#;

    fn test_core() -> (Arc<DispatchCore>, Arc<MockNodeManager>) {
        let registry = Arc::new(FunctionRegistry::load(REGISTRY_JSON).unwrap());
        let node_manager = MockNodeManager::new();
        let core = Arc::new(DispatchCore::new(
            registry,
            node_manager.clone(),
            Arc::new(gateway_stats::Metrics::new()),
        ));
        (core, node_manager)
    }

    fn engine_handle(node_id: u16, conn_id: u16) -> (Arc<EngineConnectionHandle>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(EngineConnectionHandle::new(node_id, conn_id, tx)), rx)
    }

    fn sync_ctx(func_name: &str, input: &'static [u8]) -> FuncCallContext {
        FuncCallContext::new(func_name, false, Bytes::from_static(input))
    }

    fn async_ctx(func_name: &str, input: &'static [u8]) -> FuncCallContext {
        FuncCallContext::new(func_name, true, Bytes::from_static(input))
    }

    fn running_len(core: &DispatchCore) -> usize {
        core.state.lock().unwrap().running_func_calls.len()
    }

    fn pending_len(core: &DispatchCore) -> usize {
        core.state.lock().unwrap().pending_func_calls.len()
    }

    fn discarded_len(core: &DispatchCore) -> usize {
        core.state.lock().unwrap().discarded_func_calls.len()
    }

    #[tokio::test]
    async fn happy_sync_call_round_trips() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core
            .on_new_call(conn.clone(), sync_ctx("echo", b"hi"))
            .unwrap();
        assert_eq!(func_call, FuncCall::new(7, 0, 1));
        assert_eq!(running_len(&core), 1);
        assert_eq!(conn.finished_count(), 0);

        let sent = nm.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert_eq!(sent[0].1.payload_size, 2);
        assert_eq!(sent[0].1.func_call(), func_call);
        assert_eq!(sent[0].2, Bytes::from_static(b"hi"));

        core.on_engine_message(
            1,
            GatewayMessage::new_func_call_complete(func_call, 500),
            Bytes::from_static(b"HI"),
        );
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(conn.last_status(), CallStatus::Success);
        assert_eq!(conn.last_output(), b"HI");
        assert_eq!(running_len(&core), 0);
        assert_eq!(nm.finished(), vec![(func_call, 1)]);
    }

    #[tokio::test]
    async fn queued_call_drains_when_engine_connects() {
        let (core, nm) = test_core();
        nm.script_picks(&[None]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core
            .on_new_call(conn.clone(), sync_ctx("echo", b"hi"))
            .unwrap();
        assert_eq!(pending_len(&core), 1);
        assert_eq!(running_len(&core), 0);
        assert!(nm.sent().is_empty());

        nm.script_picks(&[Some(1)]);
        let (handle, _rx) = engine_handle(1, 0);
        core.on_new_engine_connection(handle);

        assert_eq!(pending_len(&core), 0);
        assert_eq!(running_len(&core), 1);
        assert_eq!(nm.sent().len(), 1);
        {
            let state = core.state.lock().unwrap();
            let running = state.running_func_calls.get(&func_call).unwrap();
            assert!(running.dispatch_timestamp >= running.recv_timestamp);
        }
    }

    #[tokio::test]
    async fn client_disconnect_mid_call_orphans_completion() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core
            .on_new_call(conn.clone(), sync_ctx("echo", b"hi"))
            .unwrap();
        core.on_client_connection_closed(100);

        core.on_engine_message(
            1,
            GatewayMessage::new_func_call_complete(func_call, 100),
            Bytes::from_static(b"HI"),
        );
        assert_eq!(conn.finished_count(), 0);
        assert_eq!(running_len(&core), 0);
        assert_eq!(nm.finished(), vec![(func_call, 1)]);
    }

    #[tokio::test]
    async fn cancelled_pending_call_is_skipped_by_drain() {
        let (core, nm) = test_core();
        nm.script_picks(&[None]);
        let conn = RecordingConnection::new(100);

        let func_call = core
            .on_new_call(conn.clone(), async_ctx("echo", b"payload"))
            .unwrap();
        // Async acceptance is acknowledged even though nothing dispatched.
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(conn.last_status(), CallStatus::Success);
        assert_eq!(pending_len(&core), 1);

        core.on_call_cancelled(func_call);
        assert_eq!(discarded_len(&core), 1);

        nm.script_picks(&[Some(1)]);
        let (handle, _rx) = engine_handle(1, 0);
        core.on_new_engine_connection(handle);

        assert_eq!(pending_len(&core), 0);
        assert_eq!(discarded_len(&core), 0);
        assert!(nm.sent().is_empty());
    }

    #[tokio::test]
    async fn unknown_function_rejected_without_call_id() {
        let (core, _nm) = test_core();
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        assert!(core.on_new_call(conn.clone(), sync_ctx("nope", b"x")).is_none());
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(conn.last_status(), CallStatus::NotFound);
        assert_eq!(running_len(&core), 0);
        assert_eq!(pending_len(&core), 0);
        // The rejection happened before call-id allocation.
        assert_eq!(core.next_call_id.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn async_ack_is_independent_of_execution_outcome() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);

        let func_call = core
            .on_new_call(conn.clone(), async_ctx("echo", b"in"))
            .unwrap();
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(conn.last_status(), CallStatus::Success);
        assert_eq!(running_len(&core), 1);

        core.on_engine_message(
            1,
            GatewayMessage::new_func_call_failed(func_call),
            Bytes::new(),
        );
        // Engine failure after the ack produces no further client event.
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(running_len(&core), 0);
    }

    #[tokio::test]
    async fn call_ids_strictly_increase() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1), Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let first = core.on_new_call(conn.clone(), sync_ctx("echo", b"a")).unwrap();
        let second = core.on_new_call(conn.clone(), sync_ctx("echo", b"b")).unwrap();
        assert_eq!(first.call_id, 1);
        assert_eq!(second.call_id, 2);
    }

    #[tokio::test]
    async fn completion_for_unknown_call_mutates_nothing() {
        let (core, nm) = test_core();
        let ghost = FuncCall::new(7, 0, 99);
        core.on_engine_message(
            1,
            GatewayMessage::new_func_call_complete(ghost, 10),
            Bytes::new(),
        );
        assert_eq!(running_len(&core), 0);
        assert_eq!(pending_len(&core), 0);
        // Capacity accounting is still released for the reported call.
        assert_eq!(nm.finished(), vec![(ghost, 1)]);
    }

    #[tokio::test]
    async fn duplicate_completion_delivers_at_most_once() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core
            .on_new_call(conn.clone(), sync_ctx("echo", b"hi"))
            .unwrap();
        let complete = GatewayMessage::new_func_call_complete(func_call, 10);
        core.on_engine_message(1, complete, Bytes::from_static(b"X"));
        core.on_engine_message(1, complete, Bytes::from_static(b"X"));
        assert_eq!(conn.finished_count(), 1);
    }

    #[tokio::test]
    async fn pending_queue_drains_fifo() {
        let (core, nm) = test_core();
        nm.script_picks(&[None, None]);
        let conn = RecordingConnection::new(100);

        let first = core
            .on_new_call(conn.clone(), async_ctx("echo", b"a"))
            .unwrap();
        let second = core
            .on_new_call(conn.clone(), async_ctx("echo", b"b"))
            .unwrap();
        assert_eq!(pending_len(&core), 2);

        // Capacity for exactly one call: the older entry must win, the head
        // of the queue stays blocked afterwards.
        nm.script_picks(&[Some(1), None]);
        core.try_drain_pending();
        let sent = nm.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.func_call(), first);
        assert_eq!(pending_len(&core), 1);

        nm.script_picks(&[Some(1)]);
        core.try_drain_pending();
        let sent = nm.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1.func_call(), second);
        assert_eq!(pending_len(&core), 0);
    }

    #[tokio::test]
    async fn tombstone_insert_is_idempotent() {
        let (core, nm) = test_core();
        nm.script_picks(&[None]);
        let conn = RecordingConnection::new(100);

        let func_call = core
            .on_new_call(conn.clone(), async_ctx("echo", b"a"))
            .unwrap();
        core.on_call_cancelled(func_call);
        core.on_call_cancelled(func_call);
        assert_eq!(discarded_len(&core), 1);

        nm.script_picks(&[Some(1)]);
        core.try_drain_pending();
        assert_eq!(discarded_len(&core), 0);
        assert!(nm.sent().is_empty());

        // A second drain pass finds a clean queue and no stale tombstone.
        nm.script_picks(&[Some(1)]);
        core.try_drain_pending();
        assert!(nm.sent().is_empty());
    }

    #[tokio::test]
    async fn drain_skips_sync_call_whose_connection_closed() {
        let (core, nm) = test_core();
        nm.script_picks(&[None]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        core.on_new_call(conn.clone(), sync_ctx("echo", b"hi")).unwrap();
        assert_eq!(pending_len(&core), 1);

        core.on_client_connection_closed(100);
        nm.script_picks(&[Some(1)]);
        core.try_drain_pending();
        assert_eq!(pending_len(&core), 0);
        assert!(nm.sent().is_empty());
        assert_eq!(conn.finished_count(), 0);
    }

    #[tokio::test]
    async fn sync_send_failure_finishes_with_not_found() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        nm.set_send_ok(false);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core
            .on_new_call(conn.clone(), sync_ctx("echo", b"hi"))
            .unwrap();
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(conn.last_status(), CallStatus::NotFound);
        assert_eq!(running_len(&core), 0);
        // The failed dispatch released the node's accounting.
        assert_eq!(nm.finished(), vec![(func_call, 1)]);
    }

    #[tokio::test]
    async fn async_send_failure_acks_not_found() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        nm.set_send_ok(false);
        let conn = RecordingConnection::new(100);

        core.on_new_call(conn.clone(), async_ctx("echo", b"hi")).unwrap();
        assert_eq!(conn.finished_count(), 1);
        assert_eq!(conn.last_status(), CallStatus::NotFound);
        assert_eq!(running_len(&core), 0);
    }

    #[tokio::test]
    async fn zero_length_input_dispatches_empty_frame() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core.on_new_call(conn.clone(), sync_ctx("echo", b"")).unwrap();
        let sent = nm.sent();
        assert_eq!(sent[0].1.payload_size, 0);
        assert!(sent[0].2.is_empty());

        core.on_engine_message(
            1,
            GatewayMessage::new_func_call_complete(func_call, 1),
            Bytes::new(),
        );
        assert_eq!(conn.last_status(), CallStatus::Success);
        assert!(conn.last_output().is_empty());
    }

    #[tokio::test]
    async fn grpc_method_resolution_sets_method_id() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let ctx = FuncCallContext::with_method("Greeter", "SayHello", false, Bytes::from_static(b"x"));
        let func_call = core.on_new_call(conn.clone(), ctx).unwrap();
        assert_eq!(func_call.func_id, 9);
        assert_eq!(func_call.method_id, 0);

        // Unknown method and non-gRPC target are both rejected.
        let ctx = FuncCallContext::with_method("Greeter", "Missing", false, Bytes::new());
        assert!(core.on_new_call(conn.clone(), ctx).is_none());
        let ctx = FuncCallContext::with_method("echo", "SayHello", false, Bytes::new());
        assert!(core.on_new_call(conn.clone(), ctx).is_none());
        assert_eq!(conn.finished_count(), 2);
        assert_eq!(conn.last_status(), CallStatus::NotFound);
    }

    #[tokio::test]
    async fn engine_connection_table_tracks_lifecycle() {
        let (core, _nm) = test_core();
        let (first, _rx1) = engine_handle(1, 0);
        let (second, _rx2) = engine_handle(1, 1);
        let first_id = first.id();
        core.on_new_engine_connection(first);
        core.on_new_engine_connection(second);
        assert_eq!(core.state.lock().unwrap().engine_connections.len(), 2);

        core.on_engine_connection_closed(first_id);
        assert_eq!(core.state.lock().unwrap().engine_connections.len(), 1);
        // Closing an already-removed connection is a no-op.
        core.on_engine_connection_closed(first_id);
        assert_eq!(core.state.lock().unwrap().engine_connections.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_func_timestamps_strictly_increase_under_collisions() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1), Some(1), Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        // With the clock paused all three arrivals observe the same
        // microsecond; the collision rule must still advance every stamp.
        let mut stamps = Vec::new();
        for input in [b"a", b"b", b"c"] {
            core.on_new_call(conn.clone(), sync_ctx("echo", input)).unwrap();
            stamps.push(
                core.state
                    .lock()
                    .unwrap()
                    .per_func_stats
                    .get(&7)
                    .unwrap()
                    .last_request_timestamp,
            );
        }
        assert!(stamps[0] < stamps[1]);
        assert!(stamps[1] < stamps[2]);

        let global = core.state.lock().unwrap().last_request_timestamp;
        assert_eq!(global, stamps[2]);
    }

    #[tokio::test]
    async fn queued_async_input_survives_context_drop() {
        let (core, nm) = test_core();
        nm.script_picks(&[None]);
        let conn = RecordingConnection::new(100);

        core.on_new_call(conn.clone(), async_ctx("echo", b"keepme")).unwrap();
        // The ack consumed the context; the queued state must still carry
        // the input bytes for the eventual dispatch.
        nm.script_picks(&[Some(1)]);
        core.try_drain_pending();
        let sent = nm.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, Bytes::from_static(b"keepme"));
        assert_eq!(sent[0].1.payload_size, 6);
    }

    #[tokio::test]
    async fn cancelled_running_sync_call_not_delivered() {
        let (core, nm) = test_core();
        nm.script_picks(&[Some(1)]);
        let conn = RecordingConnection::new(100);
        core.register_client_connection(conn.clone());

        let func_call = core
            .on_new_call(conn.clone(), sync_ctx("echo", b"hi"))
            .unwrap();
        core.on_call_cancelled(func_call);

        core.on_engine_message(
            1,
            GatewayMessage::new_func_call_complete(func_call, 5),
            Bytes::from_static(b"HI"),
        );
        assert_eq!(conn.finished_count(), 0);
        assert_eq!(running_len(&core), 0);
        // The tombstone was consumed by its first observation.
        assert_eq!(discarded_len(&core), 0);
    }

    #[tokio::test]
    async fn unknown_frame_type_logged_and_dropped() {
        let (core, nm) = test_core();
        let mut message = GatewayMessage::new_engine_handshake(1, 0);
        message.message_type = 700;
        core.on_engine_message(1, message, Bytes::new());
        assert!(nm.finished().is_empty());
        assert_eq!(running_len(&core), 0);
    }
}
