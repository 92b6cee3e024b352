//! Engine control frames.
//!
//! Every message between the gateway and an engine node is a fixed 24-byte
//! little-endian header optionally followed by `payload_size` payload bytes.
//! The header layout is part of the wire format; changing offsets here is a
//! breaking change for every deployed engine.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use data_model::FuncCall;
use tokio_util::codec::{Decoder, Encoder};

const OFF_PAYLOAD_SIZE: usize = 20;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 24;

/// Upper bound on a single frame payload. A peer announcing more than this
/// is treated as a framing error and its connection is closed.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    EngineHandshake = 1,
    DispatchFuncCall = 2,
    FuncCallComplete = 3,
    FuncCallFailed = 4,
}

impl MessageType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(MessageType::EngineHandshake),
            2 => Some(MessageType::DispatchFuncCall),
            3 => Some(MessageType::FuncCallComplete),
            4 => Some(MessageType::FuncCallFailed),
            _ => None,
        }
    }
}

/// One decoded frame header.
///
/// `message_type` stays a raw u16 so frames from newer engines decode
/// cleanly; the gateway logs and drops the ones it does not recognize
/// instead of tearing the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayMessage {
    pub message_type: u16,
    pub node_id: u16,
    pub conn_id: u16,
    pub func_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub call_id: u32,
    /// Engine-reported execution time in microseconds, set on completion
    /// and failure frames.
    pub processing_time: u32,
    pub payload_size: u32,
}

impl GatewayMessage {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type: message_type as u16,
            node_id: 0,
            conn_id: 0,
            func_id: 0,
            method_id: 0,
            client_id: 0,
            call_id: 0,
            processing_time: 0,
            payload_size: 0,
        }
    }

    pub fn new_engine_handshake(node_id: u16, conn_id: u16) -> Self {
        Self {
            node_id,
            conn_id,
            ..Self::empty(MessageType::EngineHandshake)
        }
    }

    pub fn new_dispatch_func_call(func_call: FuncCall) -> Self {
        Self::empty(MessageType::DispatchFuncCall).with_func_call(func_call)
    }

    pub fn new_func_call_complete(func_call: FuncCall, processing_time: u32) -> Self {
        Self {
            processing_time,
            ..Self::empty(MessageType::FuncCallComplete).with_func_call(func_call)
        }
    }

    pub fn new_func_call_failed(func_call: FuncCall) -> Self {
        Self::empty(MessageType::FuncCallFailed).with_func_call(func_call)
    }

    fn with_func_call(mut self, func_call: FuncCall) -> Self {
        self.func_id = func_call.func_id;
        self.method_id = func_call.method_id;
        self.client_id = func_call.client_id;
        self.call_id = func_call.call_id;
        self
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.message_type)
    }

    pub fn is_engine_handshake(&self) -> bool {
        self.message_type() == Some(MessageType::EngineHandshake)
    }

    pub fn is_func_call_complete(&self) -> bool {
        self.message_type() == Some(MessageType::FuncCallComplete)
    }

    pub fn is_func_call_failed(&self) -> bool {
        self.message_type() == Some(MessageType::FuncCallFailed)
    }

    pub fn func_call(&self) -> FuncCall {
        FuncCall {
            func_id: self.func_id,
            method_id: self.method_id,
            client_id: self.client_id,
            call_id: self.call_id,
        }
    }
}

/// A frame as read from or written to an engine socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFrame {
    pub message: GatewayMessage,
    pub payload: Bytes,
}

impl GatewayFrame {
    pub fn new(message: GatewayMessage, payload: Bytes) -> Self {
        Self { message, payload }
    }

    pub fn header_only(message: GatewayMessage) -> Self {
        Self {
            message,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame payload of {0} bytes exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Frame codec for engine control connections.
#[derive(Debug, Default)]
pub struct GatewayMessageCodec;

impl Decoder for GatewayMessageCodec {
    type Item = GatewayFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GatewayFrame>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let payload_size = u32::from_le_bytes(
            src[OFF_PAYLOAD_SIZE..OFF_PAYLOAD_SIZE + 4]
                .try_into()
                .expect("payload size slice"),
        ) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(payload_size));
        }
        if src.len() < HEADER_SIZE + payload_size {
            src.reserve(HEADER_SIZE + payload_size - src.len());
            return Ok(None);
        }
        let mut header = src.split_to(HEADER_SIZE);
        let message = GatewayMessage {
            message_type: header.get_u16_le(),
            node_id: header.get_u16_le(),
            conn_id: header.get_u16_le(),
            func_id: header.get_u16_le(),
            method_id: header.get_u16_le(),
            client_id: header.get_u16_le(),
            call_id: header.get_u32_le(),
            processing_time: header.get_u32_le(),
            payload_size: payload_size as u32,
        };
        let payload = src.split_to(payload_size).freeze();
        Ok(Some(GatewayFrame { message, payload }))
    }
}

impl Encoder<GatewayFrame> for GatewayMessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: GatewayFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(frame.payload.len()));
        }
        let message = frame.message;
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u16_le(message.message_type);
        dst.put_u16_le(message.node_id);
        dst.put_u16_le(message.conn_id);
        dst.put_u16_le(message.func_id);
        dst.put_u16_le(message.method_id);
        dst.put_u16_le(message.client_id);
        dst.put_u32_le(message.call_id);
        dst.put_u32_le(message.processing_time);
        // The header is authoritative about payload length; whatever the
        // caller stored in payload_size is overwritten here.
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Encode a frame into a standalone buffer, for send paths that hand bytes
/// to a connection's outbound queue rather than a `Framed` sink.
pub fn encode_frame(message: GatewayMessage, payload: Bytes) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    GatewayMessageCodec.encode(GatewayFrame::new(message, payload), &mut buf)?;
    Ok(buf.freeze())
}
