//! PR1 binary protocol: constants, event codes and message framing.
//!
//! Every frame is a little-endian header followed by typed fields:
//!
//! ```text
//! u32 message_size | u16 field_count | u16 reserved
//! field*: u16 field_id | u16 data_type | u32 data_size | payload
//! ```

mod message;

pub use message::{read_message, write_message, Field, Message, MAX_MESSAGE_SIZE};

use std::fmt;

use crate::error::{ClientError, Result};

/// Line the client sends to switch a fresh connection to PR1.
pub const HANDSHAKE_REQUEST: &[u8] = b"protocol binary\r\n";
/// Prefix the server's handshake answer must start with.
pub const HANDSHAKE_ANSWER: &str = "going binary";

/// Field data types.
pub mod data_type {
    pub const NONE: u16 = 0x1;
    pub const STRING: u16 = 0x2;
    pub const INT: u16 = 0x3;
    pub const DOUBLE: u16 = 0x4;
}

/// Field identifiers.
pub mod field {
    pub const COMMAND: u16 = 0x1;
    pub const HANDLE: u16 = 0x2;
    pub const KEY: u16 = 0x3;
    pub const VALUE: u16 = 0x4;
    pub const METADATA: u16 = 0x5;
    pub const NAME: u16 = 0x6;
    pub const TYPE: u16 = 0x7;
    pub const ERROR_CODE: u16 = 0x8;
    pub const ERROR_DESC: u16 = 0x9;
    pub const EVENT: u16 = 0xA;
    pub const START_RECORD: u16 = 0xB;
    pub const END: u16 = 0xC;
    pub const QUERY_ID: u16 = 0xD;
    pub const QUERY_EXPRESSION: u16 = 0x11;
}

/// Values of the COMMAND field.
///
/// Server-originated kinds are below 0x10; requests reuse the [`EventCode`]
/// numbering plus the two property commands.
pub mod command {
    pub const ANSWER: i64 = 0x1;
    pub const EVENT: i64 = 0x2;
    pub const QUERY_ITEM: i64 = 0x3;

    pub const PROPGET: i64 = 0x23;
    pub const PROPSET: i64 = 0x24;
}

/// Status codes carried in ERROR_CODE. Anything negative is a failure.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC: i32 = -1;
    pub const NETWORK: i32 = -2;
    pub const PROTOCOL: i32 = -3;
    pub const MISSING_PARAMETER: i32 = -4;
    pub const NO_SUCH_OBJECT: i32 = -5;
}

/// Kind of operation a request performs or a subscription event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventCode {
    Ping = 0x10,
    Open = 0x11,
    Create = 0x12,
    Close = 0x13,
    Set = 0x14,
    Insert = 0x15,
    Delete = 0x16,
    PushBack = 0x17,
    PushFront = 0x18,
    PopBack = 0x19,
    PopFront = 0x1a,
    Clear = 0x1b,
    Count = 0x1c,
    Get = 0x1d,
    Subscribe = 0x1e,
    Unsubscribe = 0x1f,
    Query = 0x20,
    WaitAndPopNext = 0x21,
    WaitAndPopKey = 0x22,
}

impl EventCode {
    pub const ALL: [EventCode; 19] = [
        EventCode::Ping,
        EventCode::Open,
        EventCode::Create,
        EventCode::Close,
        EventCode::Set,
        EventCode::Insert,
        EventCode::Delete,
        EventCode::PushBack,
        EventCode::PushFront,
        EventCode::PopBack,
        EventCode::PopFront,
        EventCode::Clear,
        EventCode::Count,
        EventCode::Get,
        EventCode::Subscribe,
        EventCode::Unsubscribe,
        EventCode::Query,
        EventCode::WaitAndPopNext,
        EventCode::WaitAndPopKey,
    ];

    /// Numeric value as sent in COMMAND / EVENT fields.
    pub fn code(self) -> i64 {
        self as u16 as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventCode::Ping => "ping",
            EventCode::Open => "open",
            EventCode::Create => "create",
            EventCode::Close => "close",
            EventCode::Set => "set",
            EventCode::Insert => "insert",
            EventCode::Delete => "delete",
            EventCode::PushBack => "push_back",
            EventCode::PushFront => "push_front",
            EventCode::PopBack => "pop_back",
            EventCode::PopFront => "pop_front",
            EventCode::Clear => "clear",
            EventCode::Count => "count",
            EventCode::Get => "get",
            EventCode::Subscribe => "subscribe",
            EventCode::Unsubscribe => "unsubscribe",
            EventCode::Query => "query",
            EventCode::WaitAndPopNext => "wait_and_pop_next",
            EventCode::WaitAndPopKey => "wait_and_pop_key",
        }
    }
}

impl TryFrom<i64> for EventCode {
    type Error = ClientError;

    fn try_from(value: i64) -> Result<Self> {
        EventCode::ALL
            .iter()
            .copied()
            .find(|c| c.code() == value)
            .ok_or_else(|| ClientError::protocol(format!("unknown event code 0x{:x}", value)))
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
