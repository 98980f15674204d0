//! Packet encoding and dispatch-side decoding.
//!
//! A frame travels in one of two encodings:
//!
//! - **text**: a JSON array - `[methodIndex, ...args]` for calls (with the
//!   correlation id spliced in as the first argument when the method returns
//!   a promise), `[255, hash]` for the version handshake and
//!   `[254|253, methodIndex, correlationId, payload]` for settlements;
//! - **binary**: for methods declaring a fixed schema, a byte buffer laid
//!   out as `[method][correlationId?][arg per declared kind]` written with
//!   the primitive packet writers, no per-value tags.
//!
//! The keep-alive frame is the empty message - a sentinel distinct from any
//! array encoding. Control frames always use the text encoding.

use std::sync::Arc;

use serde_json::json;

use crate::codec::{read_value, write_value, PacketReader, PacketWriter, Value};
use crate::error::{Result, SockwireError};
use crate::method::{Bin, MethodTable};
use crate::transport::WireMessage;

use super::{REJECTED_CODE, RESOLVED_CODE, VERSION_CODE};

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Empty-payload liveness probe.
    KeepAlive,
    /// Version handshake announcing the peer's configured hash.
    Version(u64),
    /// Method invocation addressed to the local table.
    Call {
        /// Index into the receiver's method table.
        method: usize,
        /// Correlation id, present when the method returns a promise.
        correlation: Option<u32>,
        /// Decoded arguments.
        args: Vec<Value>,
    },
    /// Successful settlement of a promise call.
    Resolved {
        /// Method index the call was made on.
        method: usize,
        /// Correlation id of the pending call.
        id: u32,
        /// Resolution payload.
        value: Value,
    },
    /// Failed settlement of a promise call.
    Rejected {
        /// Method index the call was made on.
        method: usize,
        /// Correlation id of the pending call.
        id: u32,
        /// Rejection message.
        error: String,
    },
}

/// Encodes outbound frames against the remote table and decodes inbound
/// frames against the local table.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    /// Methods callable on the peer (encode side).
    remote: Arc<MethodTable>,
    /// Methods the peer may call here (decode side).
    local: Arc<MethodTable>,
}

impl PacketCodec {
    /// Create a codec for one direction pair.
    pub fn new(remote: Arc<MethodTable>, local: Arc<MethodTable>) -> Self {
        Self { remote, local }
    }

    /// The table of methods callable on the peer.
    pub fn remote_table(&self) -> &MethodTable {
        &self.remote
    }

    /// The table of methods the peer may call here.
    pub fn local_table(&self) -> &MethodTable {
        &self.local
    }

    /// The keep-alive sentinel.
    pub fn keep_alive() -> WireMessage {
        WireMessage::Text(String::new())
    }

    /// Version handshake frame.
    pub fn encode_version(hash: u64) -> WireMessage {
        WireMessage::Text(format!("[{VERSION_CODE},{hash}]"))
    }

    /// Resolution frame for a promise call received on `method`.
    pub fn encode_resolved(method: usize, id: u32, value: &Value) -> Result<WireMessage> {
        let frame = json!([RESOLVED_CODE, method, id, value.to_json()]);
        Ok(WireMessage::Text(serde_json::to_string(&frame)?))
    }

    /// Rejection frame for a promise call received on `method`.
    pub fn encode_rejected(method: usize, id: u32, error: &str) -> Result<WireMessage> {
        let frame = json!([REJECTED_CODE, method, id, error]);
        Ok(WireMessage::Text(serde_json::to_string(&frame)?))
    }

    /// Encode a call frame for the method at `index` of the remote table.
    ///
    /// `binary` selects the fixed-schema fast path; it only applies when the
    /// method declares a schema, otherwise the generic text encoding is
    /// used regardless.
    pub fn encode_call(
        &self,
        index: usize,
        correlation: Option<u32>,
        args: &[Value],
        binary: bool,
    ) -> Result<WireMessage> {
        let desc = self
            .remote
            .get(index)
            .ok_or_else(|| SockwireError::Protocol(format!("unknown method index: {index}")))?;

        if binary {
            if let Some(schema) = &desc.options.binary {
                let mut writer = PacketWriter::new();
                writer.write_u8(index as u8);
                if let Some(id) = correlation {
                    writer.write_length(u64::from(id));
                }
                for (kind, value) in schema.iter().zip(args) {
                    write_binary_arg(&mut writer, *kind, value)?;
                }
                return Ok(WireMessage::Binary(writer.into_bytes()));
            }
        }

        let mut elements = Vec::with_capacity(args.len() + 2);
        elements.push(serde_json::Value::from(index));
        if let Some(id) = correlation {
            elements.push(serde_json::Value::from(id));
        }
        elements.extend(args.iter().map(Value::to_json));
        Ok(WireMessage::Text(serde_json::to_string(
            &serde_json::Value::Array(elements),
        )?))
    }

    /// Decode an inbound frame.
    ///
    /// Unknown method indices fail with an `invalid message` protocol error;
    /// the caller reports them without tearing the connection down.
    pub fn decode(&self, message: &WireMessage) -> Result<Packet> {
        if message.is_empty() {
            return Ok(Packet::KeepAlive);
        }
        match message {
            WireMessage::Text(text) => self.decode_text(text),
            WireMessage::Binary(bytes) => self.decode_binary(bytes),
        }
    }

    fn decode_text(&self, text: &str) -> Result<Packet> {
        let parsed: serde_json::Value = serde_json::from_str(text)?;
        let elements = parsed
            .as_array()
            .ok_or_else(|| SockwireError::Protocol(format!("invalid message: {text}")))?;
        let first = elements
            .first()
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| SockwireError::Protocol(format!("invalid message: {text}")))?;

        match first {
            VERSION_CODE => {
                let hash = elements
                    .get(1)
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| {
                        SockwireError::Protocol(format!("invalid version frame: {text}"))
                    })?;
                Ok(Packet::Version(hash))
            }
            RESOLVED_CODE | REJECTED_CODE => {
                let method = elements.get(1).and_then(serde_json::Value::as_u64);
                let id = elements.get(2).and_then(serde_json::Value::as_u64);
                let (Some(method), Some(id)) = (method, id) else {
                    return Err(SockwireError::Protocol(format!(
                        "invalid settlement frame: {text}"
                    )));
                };
                let payload = elements.get(3).cloned().unwrap_or(serde_json::Value::Null);
                if first == RESOLVED_CODE {
                    Ok(Packet::Resolved {
                        method: method as usize,
                        id: id as u32,
                        value: Value::from_json(&payload),
                    })
                } else {
                    let error = match payload {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    Ok(Packet::Rejected {
                        method: method as usize,
                        id: id as u32,
                        error,
                    })
                }
            }
            index => {
                let index = index as usize;
                let desc = self.local.get(index).ok_or_else(|| {
                    SockwireError::Protocol(format!("invalid message: {index}"))
                })?;
                let mut rest = elements[1..].iter();
                let correlation = if desc.options.promise {
                    let id = rest.next().and_then(serde_json::Value::as_u64).ok_or_else(
                        || SockwireError::Protocol(format!("missing correlation id: {text}")),
                    )?;
                    Some(id as u32)
                } else {
                    None
                };
                Ok(Packet::Call {
                    method: index,
                    correlation,
                    args: rest.map(Value::from_json).collect(),
                })
            }
        }
    }

    fn decode_binary(&self, bytes: &[u8]) -> Result<Packet> {
        let mut reader = PacketReader::new(bytes);
        let index = reader.read_u8().map_err(SockwireError::Codec)? as usize;
        let desc = self
            .local
            .get(index)
            .ok_or_else(|| SockwireError::Protocol(format!("invalid message: {index}")))?;
        let schema = desc.options.binary.as_ref().ok_or_else(|| {
            SockwireError::Protocol(format!(
                "binary frame for method without schema: {}",
                desc.name
            ))
        })?;

        let correlation = if desc.options.promise {
            Some(reader.read_length().map_err(SockwireError::Codec)? as u32)
        } else {
            None
        };

        let mut args = Vec::with_capacity(schema.len());
        for kind in schema {
            args.push(read_binary_arg(&mut reader, *kind)?);
        }
        Ok(Packet::Call {
            method: index,
            correlation,
            args,
        })
    }
}

fn expect_number(value: &Value, kind: Bin) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| SockwireError::Protocol(format!("expected number for {kind:?} argument")))
}

fn write_binary_arg(writer: &mut PacketWriter, kind: Bin, value: &Value) -> Result<()> {
    match kind {
        Bin::U8 => writer.write_u8(expect_number(value, kind)? as u8),
        Bin::I8 => writer.write_i8(expect_number(value, kind)? as i8),
        Bin::U16 => writer.write_u16(expect_number(value, kind)? as u16),
        Bin::I16 => writer.write_i16(expect_number(value, kind)? as i16),
        Bin::U32 => writer.write_u32(expect_number(value, kind)? as u32),
        Bin::I32 => writer.write_i32(expect_number(value, kind)? as i32),
        Bin::F32 => writer.write_f32(expect_number(value, kind)? as f32),
        Bin::F64 => writer.write_f64(expect_number(value, kind)?),
        Bin::Bool => writer.write_bool(matches!(value, Value::Bool(true))),
        Bin::Str => writer.write_string(value.as_str()),
        Bin::Obj => write_value(writer, value),
    }
    Ok(())
}

fn read_binary_arg(reader: &mut PacketReader<'_>, kind: Bin) -> Result<Value> {
    let value = match kind {
        Bin::U8 => Value::Number(f64::from(reader.read_u8().map_err(SockwireError::Codec)?)),
        Bin::I8 => Value::Number(f64::from(reader.read_i8().map_err(SockwireError::Codec)?)),
        Bin::U16 => Value::Number(f64::from(reader.read_u16().map_err(SockwireError::Codec)?)),
        Bin::I16 => Value::Number(f64::from(reader.read_i16().map_err(SockwireError::Codec)?)),
        Bin::U32 => Value::Number(f64::from(reader.read_u32().map_err(SockwireError::Codec)?)),
        Bin::I32 => Value::Number(f64::from(reader.read_i32().map_err(SockwireError::Codec)?)),
        Bin::F32 => Value::Number(f64::from(reader.read_f32().map_err(SockwireError::Codec)?)),
        Bin::F64 => Value::Number(reader.read_f64().map_err(SockwireError::Codec)?),
        Bin::Bool => Value::Bool(reader.read_bool().map_err(SockwireError::Codec)?),
        Bin::Str => match reader.read_string().map_err(SockwireError::Codec)? {
            Some(s) => Value::String(s),
            None => Value::Null,
        },
        Bin::Obj => read_value(reader).map_err(SockwireError::Codec)?,
    };
    Ok(value)
}
