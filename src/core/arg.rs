//! Typed job arguments.
//!
//! An [`Arg`] is a tagged union that crosses process boundaries inside a
//! [`WorkItem`](super::WorkItem). On the wire every argument is an object
//! `{"type": <kind>, "value": <payload>}` and the whole list is stamped with
//! [`ARGS_FORMAT_VERSION`] so a worker can refuse payloads it does not
//! understand instead of guessing.
//!
//! ```rust
//! use taskq::Arg;
//!
//! let args = vec![Arg::from("a@b.com"), Arg::from(3_i64)];
//! let encoded = taskq::core::encode_args(&args).unwrap();
//! assert_eq!(encoded[0]["type"], "string");
//!
//! let decoded = taskq::core::decode_args(taskq::core::ARGS_FORMAT_VERSION, &encoded).unwrap();
//! assert_eq!(decoded, args);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TaskqError};

/// Version of the argument encoding written by this crate.
pub const ARGS_FORMAT_VERSION: u32 = 1;

/// A typed value passed to a job at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Arg {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Arg>),
    /// Arbitrary structured payload
    Json(Value),
}

impl Arg {
    /// The wire tag of this argument.
    pub fn kind(&self) -> &'static str {
        match self {
            Arg::Bool(_) => "bool",
            Arg::Int(_) => "int",
            Arg::Uint(_) => "uint",
            Arg::Float(_) => "float",
            Arg::String(_) => "string",
            Arg::Bytes(_) => "bytes",
            Arg::List(_) => "list",
            Arg::Json(_) => "json",
        }
    }

    pub fn json(value: Value) -> Self {
        Arg::Json(value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(s) => Some(s),
            _ => None,
        }
    }

    /// Signed view; unsigned values that fit are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(*v),
            Arg::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned view; non-negative signed values are accepted.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Arg::Uint(v) => Some(*v),
            Arg::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Arg]> {
        match self {
            Arg::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Arg::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v.into())
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Uint(v.into())
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Uint(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::String(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::String(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Bytes(v)
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(v: Vec<Arg>) -> Self {
        Arg::List(v)
    }
}

fn is_non_finite(arg: &Arg) -> bool {
    match arg {
        Arg::Float(f) => !f.is_finite(),
        Arg::List(items) => items.iter().any(is_non_finite),
        _ => false,
    }
}

/// Encode an argument list into its wire form.
///
/// NaN and infinite floats have no JSON form and are rejected rather than
/// written as `null`.
pub fn encode_args(args: &[Arg]) -> Result<Value> {
    if let Some(position) = args.iter().position(is_non_finite) {
        return Err(TaskqError::Serialization {
            message: format!("argument {} holds a non-finite float", position),
        });
    }
    Ok(serde_json::to_value(args)?)
}

/// Decode a wire argument list written with format `version`.
///
/// Fails with [`TaskqError::ArgDecode`] on an unknown version, an unknown
/// type tag or a payload that does not match its tag.
pub fn decode_args(version: u32, raw: &Value) -> Result<Vec<Arg>> {
    if version != ARGS_FORMAT_VERSION {
        return Err(TaskqError::ArgDecode {
            message: format!(
                "unsupported argument format version {} (expected {})",
                version, ARGS_FORMAT_VERSION
            ),
        });
    }

    serde_json::from_value(raw.clone()).map_err(|e| TaskqError::ArgDecode {
        message: e.to_string(),
    })
}
