//! Envelope - a message as it travels through the container.
//!
//! A [`Message`] is an opaque JSON body plus a [`Headers`] map. Headers are
//! mutable while interceptors run and are treated as frozen once the message
//! is handed to a transport.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod headers;

pub use headers::{names, Headers};

/// Communicative act carried in the `performative` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Performative {
    Request,
    InformResult,
    Failure,
}

impl Performative {
    pub fn as_str(self) -> &'static str {
        match self {
            Performative::Request => "request",
            Performative::InformResult => "inform_result",
            Performative::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Performative::Request),
            "inform_result" => Some(Performative::InformResult),
            "failure" => Some(Performative::Failure),
            _ => None,
        }
    }
}

/// Message body plus headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    pub headers: Headers,
}

impl Message {
    pub fn new(body: Value, headers: Headers) -> Self {
        Self { body, headers }
    }

    pub fn performative(&self) -> Option<Performative> {
        self.headers.performative().and_then(Performative::parse)
    }
}

/// Current wall clock in epoch milliseconds, the unit of `ts` and `reply-by`.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_performative_round_trip() {
        for p in [
            Performative::Request,
            Performative::InformResult,
            Performative::Failure,
        ] {
            assert_eq!(Performative::parse(p.as_str()), Some(p));
        }
        assert_eq!(Performative::parse("shout"), None);
    }

    #[test]
    fn test_message_performative_from_headers() {
        let msg = Message::new(
            json!({}),
            Headers::new().with(names::PERFORMATIVE, "request"),
        );
        assert_eq!(msg.performative(), Some(Performative::Request));
    }
}
