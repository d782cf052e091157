use crate::service::Reply;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error message sent for an envelope the endpoint does not understand.
pub const UNKNOWN_REQUEST: &str = "unknown_request";

/// Message kinds accepted on the endpoint, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// A batch to execute. `reference` is echoed back with the reply.
    Call {
        reference: Value,
        payload: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Fire-and-forget message. `check` touches the health file.
    Cast { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub reference: Value,
    pub reply: Reply,
}

/// What a line from the wire turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Message(Inbound),
    /// Not understood, but carries a reference that can be answered.
    Unknown { reference: Value },
    /// Not understood and unanswerable.
    Garbage(String),
}

pub fn parse_line(line: &str) -> Parsed {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => return Parsed::Garbage(err.to_string()),
    };
    let reference = value.get("reference").cloned();

    match serde_json::from_value::<Inbound>(value) {
        Ok(message) => Parsed::Message(message),
        Err(err) => match reference {
            Some(reference) => Parsed::Unknown { reference },
            None => Parsed::Garbage(err.to_string()),
        },
    }
}
