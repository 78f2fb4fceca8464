//! Client wire protocol shapes and the internal command representation.
//!
//! The client boundary speaks single MessagePack string-keyed maps; nodes
//! exchange the fixed-field `Command` record. Everything in between uses
//! the `Request` sum type.

use serde::{Deserialize, Serialize};

use crate::binlog::LoggedRequest;
use crate::utils::GeomysError;

/// Maximum size of one client request/response frame. Larger requests are
/// truncated by the read and fail decoding.
pub const MAX_FRAME_BYTES: usize = 1024;

/// Response status for a successful command.
pub const STATUS_OK: &str = "OK";

/// Response status for any failed command (not-found included).
pub const STATUS_ERROR: &str = "ERROR";

/// A client request as it appears on the wire: a string-keyed map with a
/// `command` field plus command-specific fields. `exp` accepts any integer
/// width and is normalized to 64-bit milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireRequest {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// INCR delta as an ASCII decimal string (the persisted format only
    /// carries strings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

/// A response as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl WireResponse {
    pub fn ok() -> Self {
        WireResponse {
            status: STATUS_OK.into(),
            message: None,
            value: None,
        }
    }

    pub fn error(message: impl ToString) -> Self {
        WireResponse {
            status: STATUS_ERROR.into(),
            message: Some(message.to_string()),
            value: None,
        }
    }
}

/// A decoded, validated client command. The free-form map representation
/// exists only at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Echo { message: String },
    Set { key: String, value: String, ttl_ms: i64 },
    Get { key: String },
    Incr { key: String, delta: i64 },
    Push { key: String, value: String },
    LPop { key: String },
    RPop { key: String },
    FlushDb,
}

impl Request {
    /// Validates a wire map into a `Request`. Command names are matched
    /// case-insensitively.
    pub fn from_wire(wire: &WireRequest) -> Result<Request, GeomysError> {
        let invalid =
            |m: &str| Err(GeomysError::InvalidArgument(m.to_string()));

        match wire.command.to_uppercase().as_str() {
            "PING" => Ok(Request::Ping),

            "ECHO" => match &wire.message {
                Some(message) => Ok(Request::Echo {
                    message: message.clone(),
                }),
                None => invalid("ECHO requires a 'message' field"),
            },

            "SET" => match (&wire.key, &wire.value) {
                (Some(key), Some(value)) => Ok(Request::Set {
                    key: key.clone(),
                    value: value.clone(),
                    ttl_ms: wire.exp.unwrap_or(0),
                }),
                _ => invalid("SET requires 'key', 'value' fields"),
            },

            "GET" => match &wire.key {
                Some(key) => Ok(Request::Get { key: key.clone() }),
                None => invalid("GET requires a 'key' field"),
            },

            "INCR" => match (&wire.key, &wire.offset) {
                (Some(key), Some(offset)) => {
                    let delta: i64 = offset.parse().map_err(|_| {
                        GeomysError::InvalidArgument(format!(
                            "invalid INCR offset '{}'",
                            offset
                        ))
                    })?;
                    Ok(Request::Incr {
                        key: key.clone(),
                        delta,
                    })
                }
                (None, _) => invalid("INCR requires a 'key' field"),
                (_, None) => invalid("INCR requires an 'offset' field"),
            },

            "PUSH" => match (&wire.key, &wire.value) {
                (Some(key), Some(value)) => Ok(Request::Push {
                    key: key.clone(),
                    value: value.clone(),
                }),
                _ => invalid("PUSH requires 'key', 'value' fields"),
            },

            "LPOP" => match &wire.key {
                Some(key) => Ok(Request::LPop { key: key.clone() }),
                None => invalid("LPOP requires a 'key' field"),
            },

            "RPOP" => match &wire.key {
                Some(key) => Ok(Request::RPop { key: key.clone() }),
                None => invalid("RPOP requires a 'key' field"),
            },

            "FLUSHDB" => Ok(Request::FlushDb),

            _ => invalid("unknown command"),
        }
    }

    /// The canonical uppercase command name.
    pub fn command_name(&self) -> &'static str {
        match self {
            Request::Ping => "PING",
            Request::Echo { .. } => "ECHO",
            Request::Set { .. } => "SET",
            Request::Get { .. } => "GET",
            Request::Incr { .. } => "INCR",
            Request::Push { .. } => "PUSH",
            Request::LPop { .. } => "LPOP",
            Request::RPop { .. } => "RPOP",
            Request::FlushDb => "FLUSHDB",
        }
    }

    /// True iff this command mutates state. Pops count: they must be
    /// replicated for convergence even though they return a value.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::Set { .. }
                | Request::Incr { .. }
                | Request::Push { .. }
                | Request::LPop { .. }
                | Request::RPop { .. }
        )
    }

    /// The write-log record for this command, `None` for the non-mutating
    /// ones. TTLs are not part of the record format.
    pub fn to_logged(&self) -> Option<LoggedRequest> {
        let record = |key: &str, value: Option<&str>, offset: Option<String>| {
            LoggedRequest {
                command: self.command_name().into(),
                key: key.into(),
                value: value.map(str::to_string),
                offset,
            }
        };

        match self {
            Request::Set { key, value, .. } => {
                Some(record(key, Some(value.as_str()), None))
            }
            Request::Incr { key, delta } => {
                Some(record(key, None, Some(delta.to_string())))
            }
            Request::Push { key, value } => {
                Some(record(key, Some(value.as_str()), None))
            }
            Request::LPop { key } => Some(record(key, None, None)),
            Request::RPop { key } => Some(record(key, None, None)),
            _ => None,
        }
    }

    /// Reconstructs a command from a write-log record. Keys restored this
    /// way carry no expiry.
    pub fn from_logged(rec: &LoggedRequest) -> Result<Request, GeomysError> {
        let wire = WireRequest {
            command: rec.command.clone(),
            message: None,
            key: Some(rec.key.clone()),
            value: rec.value.clone(),
            exp: None,
            offset: rec.offset.clone(),
        };
        Request::from_wire(&wire)
    }
}

/// The fixed-field command record exchanged between nodes (forwarding,
/// replication, resync). Empty string / zero marks an absent field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Command {
    pub command: String,
    pub key: String,
    pub value: String,
    pub exp: i32,
    pub offset: String,
}

impl Command {
    pub fn from_request(req: &Request) -> Command {
        let mut cmd = Command {
            command: req.command_name().into(),
            ..Command::default()
        };
        match req {
            Request::Set { key, value, ttl_ms } => {
                cmd.key = key.clone();
                cmd.value = value.clone();
                cmd.exp = (*ttl_ms).clamp(0, i32::MAX as i64) as i32;
            }
            Request::Get { key }
            | Request::LPop { key }
            | Request::RPop { key } => cmd.key = key.clone(),
            Request::Incr { key, delta } => {
                cmd.key = key.clone();
                cmd.offset = delta.to_string();
            }
            Request::Push { key, value } => {
                cmd.key = key.clone();
                cmd.value = value.clone();
            }
            Request::Ping | Request::Echo { .. } | Request::FlushDb => {}
        }
        cmd
    }

    pub fn to_request(&self) -> Result<Request, GeomysError> {
        let opt = |s: &String| {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        };
        let wire = WireRequest {
            command: self.command.clone(),
            message: None,
            key: opt(&self.key),
            value: opt(&self.value),
            exp: if self.exp != 0 {
                Some(self.exp as i64)
            } else {
                None
            },
            offset: opt(&self.offset),
        };
        Request::from_wire(&wire)
    }

    pub fn from_logged(rec: &LoggedRequest) -> Command {
        Command {
            command: rec.command.clone(),
            key: rec.key.clone(),
            value: rec.value.clone().unwrap_or_default(),
            exp: 0,
            offset: rec.offset.clone().unwrap_or_default(),
        }
    }
}

/// A successful command result, before wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Message(String),
    Value(String),
}

impl Response {
    pub fn to_wire(&self) -> WireResponse {
        match self {
            Response::Ok => WireResponse::ok(),
            Response::Message(message) => WireResponse {
                status: STATUS_OK.into(),
                message: Some(message.clone()),
                value: None,
            },
            Response::Value(value) => WireResponse {
                status: STATUS_OK.into(),
                message: None,
                value: Some(value.clone()),
            },
        }
    }
}
