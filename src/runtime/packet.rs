//! Typed packets and their binary framing.
//!
//! This module is the one place the wire format exists; everything else in
//! the fabric handles decoded [`Packet`] records. Layout (integers
//! little-endian):
//!
//! ```text
//! u8  kind            (1..=7)
//! u8  has_instruction (0|1)
//! u8  instruction     (1..=4, present iff has_instruction)
//! u8  has_status      (0|1)
//! u8  status          (0|1, present iff has_status)
//! u8  has_sequence    (0|1)
//! u32 sequence        (present iff has_sequence)
//! u64 headers_len, encoded headers value
//! u64 body_len,    encoded body value
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::value::{binary, Value};

/// Protocol version sent in the connect header.
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Connect = 1,
    Disconnect = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Execute = 5,
    Respond = 6,
    RespondExecute = 7,
}

impl PacketKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(PacketKind::Connect),
            2 => Some(PacketKind::Disconnect),
            3 => Some(PacketKind::Subscribe),
            4 => Some(PacketKind::Unsubscribe),
            5 => Some(PacketKind::Execute),
            6 => Some(PacketKind::Respond),
            7 => Some(PacketKind::RespondExecute),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Connect => "connect",
            PacketKind::Disconnect => "disconnect",
            PacketKind::Subscribe => "subscribe",
            PacketKind::Unsubscribe => "unsubscribe",
            PacketKind::Execute => "execute",
            PacketKind::Respond => "respond",
            PacketKind::RespondExecute => "respond_execute",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    CallFunction = 1,
    DefineComponent = 2,
    DeleteComponent = 3,
    CallMethod = 4,
}

impl InstructionKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(InstructionKind::CallFunction),
            2 => Some(InstructionKind::DefineComponent),
            3 => Some(InstructionKind::DeleteComponent),
            4 => Some(InstructionKind::CallMethod),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::CallFunction => "call_function",
            InstructionKind::DefineComponent => "define_component",
            InstructionKind::DeleteComponent => "delete_component",
            InstructionKind::CallMethod => "call_method",
        }
    }
}

/// Routing key for the broker's subscription table.
///
/// `call_function` keys on the function name, `define_component` on the
/// component-type name, `delete_component` on the instance name, and
/// `call_method` on the `(instance, method)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub instruction: InstructionKind,
    pub name: String,
    pub method: Option<String>,
}

impl TargetKey {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            instruction: InstructionKind::CallFunction,
            name: name.into(),
            method: None,
        }
    }

    pub fn define(type_name: impl Into<String>) -> Self {
        Self {
            instruction: InstructionKind::DefineComponent,
            name: type_name.into(),
            method: None,
        }
    }

    pub fn delete(instance: impl Into<String>) -> Self {
        Self {
            instruction: InstructionKind::DeleteComponent,
            name: instance.into(),
            method: None,
        }
    }

    pub fn method(instance: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            instruction: InstructionKind::CallMethod,
            name: instance.into(),
            method: Some(method.into()),
        }
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{}:{}.{}", self.instruction.as_str(), self.name, method),
            None => write!(f, "{}:{}", self.instruction.as_str(), self.name),
        }
    }
}

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum PacketError {
    #[error("malformed packet: truncated frame")]
    Truncated,
    #[error("malformed packet: unknown kind {0}")]
    BadKind(u8),
    #[error("malformed packet: unknown instruction {0}")]
    BadInstruction(u8),
    #[error("malformed packet: flag byte {field} is {value}")]
    BadFlag { field: &'static str, value: u8 },
    #[error("malformed packet: section length {got} exceeds remaining {remaining}")]
    BadLength { got: u64, remaining: usize },
    #[error("malformed packet: {0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("malformed packet: frame larger than {0} bytes")]
    TooLarge(usize),
    #[error("malformed packet: headers missing field `{0}`")]
    MissingHeader(&'static str),
    #[error("malformed packet: {0}")]
    Value(String),
}

impl From<binary::DecodeError> for PacketError {
    fn from(err: binary::DecodeError) -> Self {
        PacketError::Value(err.to_string())
    }
}

impl From<binary::EncodeError> for PacketError {
    fn from(err: binary::EncodeError) -> Self {
        PacketError::Value(err.to_string())
    }
}

/// A decoded protocol packet.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub instruction: Option<InstructionKind>,
    pub status: Option<bool>,
    pub sequence: Option<u32>,
    /// Positional header fields: `[txid]`, `[txid, names…]`, or
    /// `[txid, done]` for `respond_execute`.
    pub headers: Value,
    /// Named payload fields (`in`, `out`, `name`, `reason`).
    pub body: Value,
}

impl Packet {
    fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            instruction: None,
            status: None,
            sequence: None,
            headers: Value::Array(Vec::new()),
            body: Value::empty_map(),
        }
    }

    fn push_header(&mut self, value: impl Into<Value>) {
        if let Some(arr) = self.headers.as_array_mut() {
            arr.push(value.into());
        }
    }

    fn body_insert(&mut self, key: &str, value: impl Into<Value>) {
        if let Some(map) = self.body.as_map_mut() {
            map.insert(key, value);
        }
    }

    pub fn connect(tx_id: &str) -> Self {
        let mut pkt = Packet::new(PacketKind::Connect);
        pkt.push_header(tx_id);
        pkt.push_header(PROTOCOL_VERSION);
        pkt
    }

    pub fn disconnect(tx_id: &str) -> Self {
        let mut pkt = Packet::new(PacketKind::Disconnect);
        pkt.push_header(tx_id);
        pkt
    }

    pub fn subscribe(tx_id: &str, target: &TargetKey) -> Self {
        Self::subscription(PacketKind::Subscribe, tx_id, target)
    }

    pub fn unsubscribe(tx_id: &str, target: &TargetKey) -> Self {
        Self::subscription(PacketKind::Unsubscribe, tx_id, target)
    }

    fn subscription(kind: PacketKind, tx_id: &str, target: &TargetKey) -> Self {
        let mut pkt = Packet::new(kind);
        pkt.instruction = Some(target.instruction);
        pkt.push_header(tx_id);
        pkt.push_header(target.name.as_str());
        if let Some(method) = &target.method {
            pkt.push_header(method.as_str());
        }
        pkt
    }

    pub fn execute_function(tx_id: &str, name: &str, input: Value) -> Self {
        let mut pkt = Packet::new(PacketKind::Execute);
        pkt.instruction = Some(InstructionKind::CallFunction);
        pkt.push_header(tx_id);
        pkt.push_header(name);
        pkt.body_insert("in", input);
        pkt
    }

    pub fn execute_define(tx_id: &str, type_name: &str, instance: &str, attrs: Value) -> Self {
        let mut pkt = Packet::new(PacketKind::Execute);
        pkt.instruction = Some(InstructionKind::DefineComponent);
        pkt.push_header(tx_id);
        pkt.push_header(type_name);
        pkt.body_insert("name", instance);
        pkt.body_insert("in", attrs);
        pkt
    }

    pub fn execute_delete(tx_id: &str, instance: &str) -> Self {
        let mut pkt = Packet::new(PacketKind::Execute);
        pkt.instruction = Some(InstructionKind::DeleteComponent);
        pkt.push_header(tx_id);
        pkt.push_header(instance);
        pkt
    }

    pub fn execute_method(tx_id: &str, instance: &str, method: &str, input: Value) -> Self {
        let mut pkt = Packet::new(PacketKind::Execute);
        pkt.instruction = Some(InstructionKind::CallMethod);
        pkt.push_header(tx_id);
        pkt.push_header(instance);
        pkt.push_header(method);
        pkt.body_insert("in", input);
        pkt
    }

    /// Routing ack from the broker.
    pub fn respond_ok(tx_id: &str) -> Self {
        let mut pkt = Packet::new(PacketKind::Respond);
        pkt.status = Some(true);
        pkt.push_header(tx_id);
        pkt
    }

    /// Routing nak from the broker, with a reason.
    pub fn respond_err(tx_id: &str, reason: &str) -> Self {
        let mut pkt = Packet::new(PacketKind::Respond);
        pkt.status = Some(false);
        pkt.push_header(tx_id);
        pkt.body_insert("reason", reason);
        pkt
    }

    /// One streamed result. `done=true` closes the transaction.
    pub fn respond_execute(tx_id: &str, sequence: u32, done: bool, out: Value) -> Self {
        let mut pkt = Packet::new(PacketKind::RespondExecute);
        pkt.status = Some(true);
        pkt.sequence = Some(sequence);
        pkt.push_header(tx_id);
        pkt.push_header(done);
        pkt.body_insert("out", out);
        pkt
    }

    /// Terminal failure for a transaction. Always `done=true`.
    pub fn respond_execute_err(tx_id: &str, sequence: u32, reason: &str) -> Self {
        let mut pkt = Packet::new(PacketKind::RespondExecute);
        pkt.status = Some(false);
        pkt.sequence = Some(sequence);
        pkt.push_header(tx_id);
        pkt.push_header(true);
        pkt.body_insert("reason", reason);
        pkt
    }

    pub fn tx_id(&self) -> Result<&str, PacketError> {
        self.headers
            .at(0)
            .and_then(Value::as_str)
            .ok_or(PacketError::MissingHeader("tx_id"))
    }

    fn header_str(&self, index: usize, field: &'static str) -> Result<&str, PacketError> {
        self.headers
            .at(index)
            .and_then(Value::as_str)
            .ok_or(PacketError::MissingHeader(field))
    }

    /// The subscription key this packet routes on. Only meaningful for
    /// subscribe/unsubscribe/execute.
    pub fn target_key(&self) -> Result<TargetKey, PacketError> {
        let instruction = self
            .instruction
            .ok_or(PacketError::MissingHeader("instruction"))?;
        let name = self.header_str(1, "target")?.to_string();
        let method = match instruction {
            InstructionKind::CallMethod => Some(self.header_str(2, "method")?.to_string()),
            _ => None,
        };
        Ok(TargetKey {
            instruction,
            name,
            method,
        })
    }

    /// The `done` header of a `respond_execute`. Errors are always done.
    pub fn done(&self) -> bool {
        if self.status == Some(false) {
            return true;
        }
        self.headers.at(1).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn input(&self) -> Value {
        self.body.get("in").cloned().unwrap_or(Value::Null)
    }

    pub fn out(&self) -> Option<&Value> {
        self.body.get("out")
    }

    pub fn reason(&self) -> Option<&str> {
        self.body.get("reason").and_then(Value::as_str)
    }

    /// Instance name carried in a `define_component` execute body.
    pub fn component_name(&self) -> Result<&str, PacketError> {
        self.body
            .get("name")
            .and_then(Value::as_str)
            .ok_or(PacketError::MissingHeader("name"))
    }

    pub fn encode(&self) -> Result<Bytes, PacketError> {
        let headers = self.headers.encode_binary()?;
        let body = self.body.encode_binary()?;
        let mut buf = BytesMut::with_capacity(16 + headers.len() + body.len());
        buf.put_u8(self.kind as u8);
        match self.instruction {
            Some(instruction) => {
                buf.put_u8(1);
                buf.put_u8(instruction as u8);
            }
            None => buf.put_u8(0),
        }
        match self.status {
            Some(status) => {
                buf.put_u8(1);
                buf.put_u8(status as u8);
            }
            None => buf.put_u8(0),
        }
        match self.sequence {
            Some(sequence) => {
                buf.put_u8(1);
                buf.put_u32_le(sequence);
            }
            None => buf.put_u8(0),
        }
        buf.put_u64_le(headers.len() as u64);
        buf.put_slice(&headers);
        buf.put_u64_le(body.len() as u64);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Frames exactly one packet from `input`; context-free.
    pub fn decode(input: &[u8]) -> Result<Packet, PacketError> {
        let mut buf = input;
        let kind_raw = take_u8(&mut buf)?;
        let kind = PacketKind::from_u8(kind_raw).ok_or(PacketError::BadKind(kind_raw))?;

        let instruction = match take_flag(&mut buf, "has_instruction")? {
            false => None,
            true => {
                let raw = take_u8(&mut buf)?;
                Some(InstructionKind::from_u8(raw).ok_or(PacketError::BadInstruction(raw))?)
            }
        };
        let status = match take_flag(&mut buf, "has_status")? {
            false => None,
            true => match take_u8(&mut buf)? {
                0 => Some(false),
                1 => Some(true),
                value => return Err(PacketError::BadFlag {
                    field: "status",
                    value,
                }),
            },
        };
        let sequence = match take_flag(&mut buf, "has_sequence")? {
            false => None,
            true => {
                if buf.remaining() < 4 {
                    return Err(PacketError::Truncated);
                }
                Some(buf.get_u32_le())
            }
        };

        let headers = take_value(&mut buf)?;
        let body = take_value(&mut buf)?;
        if !buf.is_empty() {
            return Err(PacketError::TrailingBytes(buf.len()));
        }
        Ok(Packet {
            kind,
            instruction,
            status,
            sequence,
            headers,
            body,
        })
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, PacketError> {
    if buf.remaining() < 1 {
        return Err(PacketError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_flag(buf: &mut &[u8], field: &'static str) -> Result<bool, PacketError> {
    match take_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        value => Err(PacketError::BadFlag { field, value }),
    }
}

fn take_value<'a>(buf: &mut &'a [u8]) -> Result<Value, PacketError> {
    if buf.remaining() < 8 {
        return Err(PacketError::Truncated);
    }
    let len = buf.get_u64_le();
    if len > buf.remaining() as u64 {
        return Err(PacketError::BadLength {
            got: len,
            remaining: buf.remaining(),
        });
    }
    let current: &'a [u8] = buf;
    let (section, rest) = current.split_at(len as usize);
    let value = Value::decode_binary(section)?;
    *buf = rest;
    Ok(value)
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(instruction) = self.instruction {
            write!(f, "/{}", instruction.as_str())?;
        }
        if let Ok(tx) = self.tx_id() {
            write!(f, " tx={tx}")?;
        }
        if let Some(seq) = self.sequence {
            write!(f, " seq={seq}")?;
        }
        if let Some(status) = self.status {
            write!(f, " status={status}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    fn tx() -> String {
        crate::generate_uuid()
    }

    #[test]
    fn every_constructor_round_trips() {
        let input = Value::Map(ValueMap::new().with("x", Value::Uint(1)));
        let packets = vec![
            Packet::connect(&tx()),
            Packet::disconnect(&tx()),
            Packet::subscribe(&tx(), &TargetKey::function("echo")),
            Packet::unsubscribe(&tx(), &TargetKey::method("m", "infer")),
            Packet::execute_function(&tx(), "echo", input.clone()),
            Packet::execute_define(&tx(), "accumulator", "acc0", input.clone()),
            Packet::execute_delete(&tx(), "acc0"),
            Packet::execute_method(&tx(), "m", "infer", input.clone()),
            Packet::respond_ok(&tx()),
            Packet::respond_err(&tx(), "NoSubscriber"),
            Packet::respond_execute(&tx(), 3, false, input),
            Packet::respond_execute_err(&tx(), 0, "NoSuchFunction: nope"),
        ];
        for packet in packets {
            let bytes = packet.encode().expect("encode");
            let back = Packet::decode(&bytes).expect("decode");
            assert_eq!(packet, back, "{packet}");
        }
    }

    #[test]
    fn error_packets_are_terminal() {
        let packet = Packet::respond_execute_err(&tx(), 2, "boom");
        assert!(packet.done());
        assert_eq!(packet.status, Some(false));
        assert_eq!(packet.sequence, Some(2));
    }

    #[test]
    fn target_keys_cover_all_instructions() {
        let id = tx();
        let pkt = Packet::execute_method(&id, "comp", "run", Value::Null);
        let key = pkt.target_key().expect("key");
        assert_eq!(key, TargetKey::method("comp", "run"));

        let pkt = Packet::execute_define(&id, "model", "m0", Value::Null);
        assert_eq!(pkt.target_key().expect("key"), TargetKey::define("model"));
        assert_eq!(pkt.component_name().expect("name"), "m0");
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        assert!(matches!(
            Packet::decode(b"\xff\x00\x00"),
            Err(PacketError::BadKind(0xff))
        ));
        assert!(matches!(Packet::decode(b""), Err(PacketError::Truncated)));
    }

    #[test]
    fn bad_flag_and_instruction_are_rejected() {
        let good = Packet::execute_function(&tx(), "echo", Value::Null)
            .encode()
            .expect("encode");
        let mut bytes = good.to_vec();
        bytes[2] = 99; // instruction code
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::BadInstruction(99))
        ));
        let mut bytes = good.to_vec();
        bytes[1] = 7; // has_instruction flag
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::BadFlag { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Packet::respond_ok(&tx()).encode().expect("encode").to_vec();
        bytes.push(0);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::TrailingBytes(1))
        ));
    }

    #[test]
    fn oversized_section_length_is_rejected() {
        let mut bytes = Packet::respond_ok(&tx()).encode().expect("encode").to_vec();
        // kind, has_instruction, has_status, status, has_sequence = 5 bytes,
        // then the headers length field.
        let offset = 5;
        bytes[offset] = 0xff;
        bytes[offset + 1] = 0xff;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::BadLength { .. })
        ));
    }
}
