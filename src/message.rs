//! Wire messages exchanged over the daemon's FIFO.
//!
//! One UTF-8 JSON object per line, newline-terminated. The `type` field
//! selects the message kind; `version` is a monotonic protocol counter that
//! senders set to [`API_VERSION`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version written into every outgoing message.
pub const API_VERSION: u32 = 2;

/// Largest write the kernel guarantees to be atomic on a pipe. Longer lines
/// still parse, but interleaving with other writers becomes possible.
pub const FIFO_ATOMIC_WRITE_B: usize = 4096;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("could not decode message: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("expiry timestamp {0} is outside the representable range")]
    ExpiryOutOfRange(f64),
}

/// A message received over the FIFO, dispatched on its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    BindMessage(BindMessage),
    InhibitMessage(InhibitMessage),
}

impl Message {
    pub fn version(&self) -> u32 {
        match self {
            Message::BindMessage(m) => m.version,
            Message::InhibitMessage(m) => m.version,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Message::BindMessage(m) => m.pid,
            Message::InhibitMessage(m) => m.pid,
        }
    }
}

/// Announces a client to the daemon. Must precede any [`InhibitMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindMessage {
    pub version: u32,
    pub pid: u32,
    pub uid: u32,
}

impl BindMessage {
    pub fn new(pid: u32, uid: u32) -> BindMessage {
        BindMessage {
            version: API_VERSION,
            pid,
            uid,
        }
    }
}

/// Asks the daemon to keep the host awake until `expiry_timestamp`,
/// expressed as POSIX epoch seconds (fractional part allowed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InhibitMessage {
    pub version: u32,
    pub pid: u32,
    pub uid: u32,
    pub expiry_timestamp: f64,
}

impl InhibitMessage {
    pub fn new(pid: u32, uid: u32, expiry: DateTime<Utc>) -> InhibitMessage {
        InhibitMessage {
            version: API_VERSION,
            pid,
            uid,
            expiry_timestamp: epoch_secs(&expiry),
        }
    }

    /// The expiry as a timestamp, at microsecond precision.
    pub fn expiry(&self) -> Result<DateTime<Utc>, DecodeError> {
        let micros = self.expiry_timestamp * 1_000_000.0;
        if !micros.is_finite() || micros >= i64::MAX as f64 || micros <= i64::MIN as f64 {
            return Err(DecodeError::ExpiryOutOfRange(self.expiry_timestamp));
        }
        DateTime::from_timestamp_micros(micros as i64)
            .ok_or(DecodeError::ExpiryOutOfRange(self.expiry_timestamp))
    }
}

/// Converts a timestamp to POSIX epoch seconds with microsecond precision.
pub fn epoch_secs(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) * 1e-6
}

/// Serializes a message as one newline-terminated JSON line.
pub fn encode_line(message: &Message) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line (with or without its trailing newline) into a message.
pub fn decode_line(line: &str) -> Result<Message, DecodeError> {
    Ok(serde_json::from_str(line.trim_end_matches('\n'))?)
}
