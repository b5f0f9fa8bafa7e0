//! Line grammar of the streaming platform protocol.
//!
//! Client -> server:
//! - `subscribe|<instrument>`
//! - `unsubscribe|<instrument>`
//! - `list`
//! - `quit`
//!
//! Server -> client:
//! - `Subscribed to <instrument>`
//! - `Unsubscribed from <instrument>`
//! - `ERROR|<message>`
//! - `Goodbye!`
//! - `<instrument>|22:number:<bid>|25:number:<ask>|5:timestamp:<ISO-8601>`
//!
//! Anything else (e.g. the body of a `list` reply) is passed through
//! as `Response::Info`.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::util;

const BID_TAG: &str = "22";
const ASK_TAG: &str = "25";
const TIMESTAMP_TAG: &str = "5";

/// Errors raised while parsing a data record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Empty instrument name")]
    EmptyName,

    #[error("Malformed field '{0}', expected tag:type:value")]
    MalformedField(String),

    #[error("Missing field with tag {0}")]
    MissingField(&'static str),

    #[error("Invalid number '{value}' for tag {tag}")]
    InvalidNumber { tag: &'static str, value: String },
}

/// Outbound command, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Subscribe(name) => write!(f, "subscribe|{}", name),
            Command::Unsubscribe(name) => write!(f, "unsubscribe|{}", name),
            Command::Quit => write!(f, "quit"),
        }
    }
}

/// One parsed quote observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RateRecord {
    pub instrument: String,
    pub bid: f64,
    pub ask: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Subscribed(String),
    Unsubscribed(String),
    Error(String),
    Goodbye,
    Record(RateRecord),
    Info(String),
}

/// Classifies one server line.
///
/// Only data records can fail; an unparseable timestamp inside a record
/// falls back to the current time instead of failing the record.
pub fn parse_line(line: &str) -> Result<Response, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(name) = line.strip_prefix("Subscribed to ") {
        return Ok(Response::Subscribed(name.trim().to_string()));
    }
    if let Some(name) = line.strip_prefix("Unsubscribed from ") {
        return Ok(Response::Unsubscribed(name.trim().to_string()));
    }
    if let Some(message) = line.strip_prefix("ERROR|") {
        return Ok(Response::Error(message.to_string()));
    }
    if line.starts_with("Goodbye") {
        return Ok(Response::Goodbye);
    }
    if !line.contains('|') {
        return Ok(Response::Info(line.to_string()));
    }

    parse_record(line).map(Response::Record)
}

fn parse_record(line: &str) -> Result<RateRecord, ProtocolError> {
    let mut parts = line.split('|');

    let instrument = parts.next().unwrap_or_default().trim();
    if instrument.is_empty() {
        return Err(ProtocolError::EmptyName);
    }

    let mut bid = None;
    let mut ask = None;
    let mut timestamp = None;

    for field in parts {
        // value may itself contain ':' (timestamps)
        let mut pieces = field.splitn(3, ':');
        let (Some(tag), Some(_kind), Some(value)) = (pieces.next(), pieces.next(), pieces.next())
        else {
            return Err(ProtocolError::MalformedField(field.to_string()));
        };

        match tag {
            BID_TAG => bid = Some(number(BID_TAG, value)?),
            ASK_TAG => ask = Some(number(ASK_TAG, value)?),
            TIMESTAMP_TAG => timestamp = Some(value),
            _ => {}
        }
    }

    let bid = bid.ok_or(ProtocolError::MissingField(BID_TAG))?;
    let ask = ask.ok_or(ProtocolError::MissingField(ASK_TAG))?;
    let observed_at = match timestamp {
        Some(raw) => util::parse_timestamp_or_now(raw, instrument),
        None => util::now(),
    };

    Ok(RateRecord {
        instrument: instrument.to_string(),
        bid,
        ask,
        observed_at,
    })
}

fn number(tag: &'static str, value: &str) -> Result<f64, ProtocolError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            tag,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_data_record() {
        let line = "PF1_USDTRY|22:number:34.401355|25:number:35.401355|5:timestamp:2024-12-15T11:31:34.509";

        let Response::Record(record) = parse_line(line).unwrap() else {
            panic!("expected record");
        };

        assert_eq!(record.instrument, "PF1_USDTRY");
        assert_eq!(record.bid, 34.401355);
        assert_eq!(record.ask, 35.401355);
        assert_eq!(record.observed_at.minute(), 31);
        assert_eq!(record.observed_at.timestamp_subsec_millis(), 509);
    }

    #[test]
    fn bad_timestamp_falls_back_to_now() {
        let before = util::now();
        let line = "PF1_USDTRY|22:number:34.4|25:number:35.4|5:timestamp:not-a-time";

        let Response::Record(record) = parse_line(line).unwrap() else {
            panic!("expected record");
        };

        assert!(record.observed_at >= before);
    }

    #[test]
    fn rejects_malformed_records() {
        assert_eq!(
            parse_line("PF1_USDTRY|22:number:abc|25:number:35.4"),
            Err(ProtocolError::InvalidNumber { tag: "22", value: "abc".into() })
        );
        assert_eq!(
            parse_line("PF1_USDTRY|22:number:34.4"),
            Err(ProtocolError::MissingField("25"))
        );
        assert_eq!(
            parse_line("PF1_USDTRY|garbage"),
            Err(ProtocolError::MalformedField("garbage".into()))
        );
        assert_eq!(parse_line("|22:number:1|25:number:2"), Err(ProtocolError::EmptyName));
    }

    #[test]
    fn classifies_control_lines() {
        assert_eq!(
            parse_line("Subscribed to PF1_USDTRY\r\n").unwrap(),
            Response::Subscribed("PF1_USDTRY".into())
        );
        assert_eq!(
            parse_line("Unsubscribed from PF1_USDTRY").unwrap(),
            Response::Unsubscribed("PF1_USDTRY".into())
        );
        assert_eq!(
            parse_line("ERROR|Invalid rate name").unwrap(),
            Response::Error("Invalid rate name".into())
        );
        assert_eq!(parse_line("Goodbye!").unwrap(), Response::Goodbye);
        assert_eq!(
            parse_line("Available rates:").unwrap(),
            Response::Info("Available rates:".into())
        );
    }

    #[test]
    fn encodes_commands() {
        assert_eq!(Command::Subscribe("PF1_USDTRY".into()).encode(), "subscribe|PF1_USDTRY");
        assert_eq!(Command::Unsubscribe("PF1_USDTRY".into()).encode(), "unsubscribe|PF1_USDTRY");
        assert_eq!(Command::Quit.encode(), "quit");
    }
}
