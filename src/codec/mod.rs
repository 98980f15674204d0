//! Codec module - packet primitives and the generic value encoding.
//!
//! This module provides the two layers frames are built from:
//!
//! - [`PacketWriter`] / [`PacketReader`] - primitive operations (fixed-width
//!   integers, floats, booleans, raw byte ranges, variable-length unsigned
//!   "lengths", nullable strings) over a growable buffer with an explicit
//!   offset.
//! - [`Value`] with [`encode_value`] / [`decode_value`] - a compact,
//!   self-describing tagged encoding for arbitrary values, with bounded
//!   string deduplication within each top-level pass.
//!
//! # Example
//!
//! ```
//! use sockwire::codec::{decode_value, encode_value, Value};
//!
//! let value = Value::object(vec![("foo", Value::from("bar"))]);
//! let bytes = encode_value(&value);
//! assert_eq!(decode_value(&bytes).unwrap(), value);
//! ```

mod reader;
mod value;
mod writer;

pub use reader::PacketReader;
pub use value::{decode_value, encode_value, read_value, write_value, Value, STRING_TABLE_CAPACITY};
pub use writer::PacketWriter;
