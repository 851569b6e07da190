//! RESP protocol implementation
//!
//! This module implements the client side of the Redis Serialization
//! Protocol (RESP2): commands are encoded as arrays of bulk strings and
//! replies are decoded into [`Value`]s.

mod resp;
mod value;

pub use resp::{decode_value, encode_command, encode_pipeline, encode_value};
pub use value::{format_score, parse_score, Command, ToArg, Value};
