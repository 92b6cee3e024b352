use std::{
    collections::HashMap,
    fmt::{self, Display},
    fs,
    path::Path,
};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;

/// Identity of one function invocation.
///
/// `method_id` is meaningful only for gRPC-style functions; `client_id` is 0
/// for calls originated at the gateway. The whole tuple is the primary key
/// for the gateway's call tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncCall {
    pub func_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub call_id: u32,
}

impl FuncCall {
    pub fn new(func_id: u16, client_id: u16, call_id: u32) -> Self {
        Self {
            func_id,
            method_id: 0,
            client_id,
            call_id,
        }
    }

    pub fn with_method(func_id: u16, method_id: u16, client_id: u16, call_id: u32) -> Self {
        Self {
            func_id,
            method_id,
            client_id,
            call_id,
        }
    }
}

impl Display for FuncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "func_id={}, method_id={}, client_id={}, call_id={}",
            self.func_id, self.method_id, self.client_id, self.call_id
        )
    }
}

/// Outcome of a call as surfaced to the originating client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    /// Not yet resolved.
    #[default]
    Pending,
    /// Normal completion (sync) or acceptance (async).
    Success,
    /// Unknown function, unknown gRPC method, or no reachable node.
    NotFound,
    /// The engine executed the call and reported failure.
    Failed,
}

/// A client's in-progress request as seen by the dispatch core.
///
/// Built by a connection adapter from a parsed request; mutated only by the
/// core's completion path; handed back to the adapter through
/// `ClientConnection::on_call_finished`.
#[derive(Debug)]
pub struct FuncCallContext {
    pub func_name: String,
    pub method_name: Option<String>,
    pub is_async: bool,
    pub input: Bytes,
    pub func_call: Option<FuncCall>,
    pub status: CallStatus,
    output: BytesMut,
}

impl FuncCallContext {
    pub fn new(func_name: impl Into<String>, is_async: bool, input: Bytes) -> Self {
        Self {
            func_name: func_name.into(),
            method_name: None,
            is_async,
            input,
            func_call: None,
            status: CallStatus::Pending,
            output: BytesMut::new(),
        }
    }

    pub fn with_method(
        func_name: impl Into<String>,
        method_name: impl Into<String>,
        is_async: bool,
        input: Bytes,
    ) -> Self {
        Self {
            method_name: Some(method_name.into()),
            ..Self::new(func_name, is_async, input)
        }
    }

    pub fn append_output(&mut self, payload: &[u8]) {
        self.output.extend_from_slice(payload);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Bytes {
        std::mem::take(&mut self.output).freeze()
    }
}

/// One function known to the gateway.
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub func_id: u16,
    pub func_name: String,
    pub is_grpc_service: bool,
    /// gRPC method name to method id, assigned by position in the config.
    pub grpc_method_ids: HashMap<String, u16>,
}

impl FunctionEntry {
    pub fn method_id(&self, method_name: &str) -> Option<u16> {
        self.grpc_method_ids.get(method_name).copied()
    }
}

// The config document is shared with the engines; keys the gateway does
// not use (worker pool sizing and the like) are ignored on load.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "funcName")]
    func_name: String,
    #[serde(rename = "funcId")]
    func_id: u16,
    #[serde(rename = "grpcMethods", default)]
    grpc_methods: Option<Vec<String>>,
}

/// Read-only function lookup, built once at startup from the function
/// config document (a JSON array of entries).
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    entries: Vec<FunctionEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
}

impl FunctionRegistry {
    pub fn load(config_json: &str) -> Result<Self> {
        let raw: Vec<RawEntry> = serde_json::from_str(config_json)?;
        let mut registry = FunctionRegistry::default();
        for entry in raw {
            if entry.func_id == 0 {
                return Err(anyhow!("function {} has reserved func_id 0", entry.func_name));
            }
            let grpc_method_ids: HashMap<String, u16> = entry
                .grpc_methods
                .as_deref()
                .unwrap_or_default()
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i as u16))
                .collect();
            let idx = registry.entries.len();
            if registry
                .by_name
                .insert(entry.func_name.clone(), idx)
                .is_some()
            {
                return Err(anyhow!("duplicate function name: {}", entry.func_name));
            }
            if registry.by_id.insert(entry.func_id, idx).is_some() {
                return Err(anyhow!("duplicate func_id: {}", entry.func_id));
            }
            registry.entries.push(FunctionEntry {
                func_id: entry.func_id,
                func_name: entry.func_name,
                is_grpc_service: entry.grpc_methods.is_some(),
                grpc_method_ids,
            });
        }
        Ok(registry)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow!(
                "failed to read function config {}: {e}",
                path.as_ref().display()
            )
        })?;
        Self::load(&contents)
    }

    pub fn find_by_name(&self, func_name: &str) -> Option<&FunctionEntry> {
        self.by_name.get(func_name).map(|idx| &self.entries[*idx])
    }

    pub fn find_by_id(&self, func_id: u16) -> Option<&FunctionEntry> {
        self.by_id.get(&func_id).map(|idx| &self.entries[*idx])
    }

    pub fn entries(&self) -> &[FunctionEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"[
        {"funcName": "echo", "funcId": 7},
        {"funcName": "Greeter", "funcId": 9, "grpcMethods": ["SayHello", "SayGoodbye"]}
    ]"#;

    #[test]
    fn registry_lookup_by_name_and_id() {
        let registry = FunctionRegistry::load(CONFIG).unwrap();
        let echo = registry.find_by_name("echo").unwrap();
        assert_eq!(echo.func_id, 7);
        assert!(!echo.is_grpc_service);
        assert!(echo.grpc_method_ids.is_empty());

        let greeter = registry.find_by_id(9).unwrap();
        assert_eq!(greeter.func_name, "Greeter");
        assert!(greeter.is_grpc_service);

        assert!(registry.find_by_name("nope").is_none());
        assert!(registry.find_by_id(42).is_none());
    }

    #[test]
    fn grpc_method_ids_assigned_by_position() {
        let registry = FunctionRegistry::load(CONFIG).unwrap();
        let greeter = registry.find_by_name("Greeter").unwrap();
        assert_eq!(greeter.method_id("SayHello"), Some(0));
        assert_eq!(greeter.method_id("SayGoodbye"), Some(1));
        assert_eq!(greeter.method_id("Missing"), None);
    }

    #[test]
    fn engine_side_keys_are_ignored() {
        let shared = r#"[
            {"funcName": "echo", "funcId": 7, "minWorkers": 1, "maxWorkers": 8},
            {"funcName": "resize", "funcId": 8, "concurrencyHint": 4}
        ]"#;
        let registry = FunctionRegistry::load(shared).unwrap();
        assert_eq!(registry.find_by_name("echo").unwrap().func_id, 7);
        assert_eq!(registry.find_by_name("resize").unwrap().func_id, 8);
    }

    #[test]
    fn duplicate_names_and_ids_rejected() {
        let dup_name = r#"[
            {"funcName": "echo", "funcId": 1},
            {"funcName": "echo", "funcId": 2}
        ]"#;
        assert!(FunctionRegistry::load(dup_name).is_err());

        let dup_id = r#"[
            {"funcName": "a", "funcId": 1},
            {"funcName": "b", "funcId": 1}
        ]"#;
        assert!(FunctionRegistry::load(dup_id).is_err());
    }

    #[test]
    fn func_id_zero_rejected() {
        let zero = r#"[{"funcName": "bad", "funcId": 0}]"#;
        assert!(FunctionRegistry::load(zero).is_err());
    }

    #[test]
    fn func_call_display_names_all_fields() {
        let call = FuncCall::with_method(7, 2, 0, 15);
        let rendered = call.to_string();
        assert!(rendered.contains("func_id=7"));
        assert!(rendered.contains("method_id=2"));
        assert!(rendered.contains("call_id=15"));
    }

    #[test]
    fn context_output_accumulates() {
        let mut ctx = FuncCallContext::new("echo", false, Bytes::from_static(b"hi"));
        assert_eq!(ctx.status, CallStatus::Pending);
        ctx.append_output(b"HI");
        ctx.append_output(b"!");
        assert_eq!(ctx.output(), b"HI!");
        assert_eq!(ctx.take_output(), Bytes::from_static(b"HI!"));
    }
}
