//! Client↔relay wire frames.
//!
//! Framing is a newline-delimited sequence of JSON arrays:
//!
//! ```json
//! ["REQ", "sub1", {"kinds":[1],"#h":["grp"]}]
//! ["CLOSE", "sub1"]
//! ["EVENT", {…signed event…}]                  // client→relay publish
//! ["EVENT", "sub1", {…signed event…}]          // relay→client match
//! ["EOSE", "sub1"]
//! ["NOTICE", "text"]
//! ["OK", "<event id>", true, ""]
//! ["AUTH", {…challenge object…}]
//! ```
//!
//! Close code 4403 from the relay signals authentication failure; the
//! client must not auto-reconnect on it.

use serde_json::{json, Value};

use crate::error::Error;
use crate::event::Event;
use crate::filter::Filter;
use crate::Result;

/// WebSocket close code a relay uses to reject authentication.
pub const CLOSE_AUTH_FAILED: u16 = 4403;

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Open a subscription with one or more filters (match disjunction).
    Req { sub_id: String, filters: Vec<Filter> },
    /// Terminate a subscription.
    Close { sub_id: String },
    /// Publish a signed event.
    Event { event: Event },
    /// Answer a relay AUTH challenge. `payload` is the encrypted envelope
    /// plus the client pubkey, shaped by the gateway handshake.
    Auth { payload: Value },
}

/// Frames sent by a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// An event matching the subscription's filters.
    Event { sub_id: String, event: Event },
    /// End of stored events; the subscription stays live for new events.
    Eose { sub_id: String },
    /// Informational message.
    Notice { text: String },
    /// Publish acknowledgment.
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },
    /// Challenge for an authenticated reply.
    Auth { challenge: Value },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        match self {
            ClientFrame::Req { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                arr.extend(filters.iter().map(|f| json!(f)));
                Value::Array(arr).to_string()
            }
            ClientFrame::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
            ClientFrame::Event { event } => json!(["EVENT", event]).to_string(),
            ClientFrame::Auth { payload } => json!(["AUTH", payload]).to_string(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let arr = parse_array(text)?;
        let verb = frame_verb(&arr)?;
        match verb {
            "REQ" => {
                if arr.len() < 3 {
                    return Err(Error::BadFrame("REQ needs a sub id and filters".into()));
                }
                let sub_id = frame_str(&arr, 1)?;
                let filters = arr[2..]
                    .iter()
                    .map(|v| serde_json::from_value(v.clone()).map_err(Error::from))
                    .collect::<Result<Vec<Filter>>>()?;
                Ok(ClientFrame::Req { sub_id, filters })
            }
            "CLOSE" => Ok(ClientFrame::Close {
                sub_id: frame_str(&arr, 1)?,
            }),
            "EVENT" => {
                if arr.len() != 2 {
                    return Err(Error::BadFrame("client EVENT carries one event".into()));
                }
                let event: Event = serde_json::from_value(arr[1].clone())?;
                Ok(ClientFrame::Event { event })
            }
            "AUTH" => Ok(ClientFrame::Auth {
                payload: arr
                    .get(1)
                    .cloned()
                    .ok_or_else(|| Error::BadFrame("AUTH needs a payload".into()))?,
            }),
            other => Err(Error::BadFrame(format!("unknown client verb {other}"))),
        }
    }
}

impl RelayFrame {
    pub fn to_json(&self) -> String {
        match self {
            RelayFrame::Event { sub_id, event } => json!(["EVENT", sub_id, event]).to_string(),
            RelayFrame::Eose { sub_id } => json!(["EOSE", sub_id]).to_string(),
            RelayFrame::Notice { text } => json!(["NOTICE", text]).to_string(),
            RelayFrame::Ok {
                event_id,
                success,
                message,
            } => json!(["OK", event_id, success, message]).to_string(),
            RelayFrame::Auth { challenge } => json!(["AUTH", challenge]).to_string(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let arr = parse_array(text)?;
        let verb = frame_verb(&arr)?;
        match verb {
            "EVENT" => {
                if arr.len() != 3 {
                    return Err(Error::BadFrame("relay EVENT is [EVENT, subId, event]".into()));
                }
                let sub_id = frame_str(&arr, 1)?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayFrame::Event { sub_id, event })
            }
            "EOSE" => Ok(RelayFrame::Eose {
                sub_id: frame_str(&arr, 1)?,
            }),
            "NOTICE" => Ok(RelayFrame::Notice {
                text: frame_str(&arr, 1)?,
            }),
            "OK" => {
                let event_id = frame_str(&arr, 1)?;
                let success = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::BadFrame("OK success must be a bool".into()))?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayFrame::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "AUTH" => Ok(RelayFrame::Auth {
                challenge: arr
                    .get(1)
                    .cloned()
                    .ok_or_else(|| Error::BadFrame("AUTH needs a challenge".into()))?,
            }),
            other => Err(Error::BadFrame(format!("unknown relay verb {other}"))),
        }
    }
}

fn parse_array(text: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(arr)) if !arr.is_empty() => Ok(arr),
        Ok(_) => Err(Error::BadFrame("frame is not a non-empty array".into())),
        Err(e) => Err(Error::BadFrame(format!("not JSON: {e}"))),
    }
}

fn frame_verb(arr: &[Value]) -> Result<&str> {
    arr[0]
        .as_str()
        .ok_or_else(|| Error::BadFrame("frame verb is not a string".into()))
}

fn frame_str(arr: &[Value], idx: usize) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::BadFrame(format!("frame element {idx} is not a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;
    use crate::keys::Keys;

    fn event() -> Event {
        EventBuilder::group_message("grp", "hi")
            .unwrap()
            .sign(&Keys::generate())
            .unwrap()
    }

    #[test]
    fn req_roundtrip() {
        let frame = ClientFrame::Req {
            sub_id: "sub1".into(),
            filters: vec![Filter::new().kinds([1]).tag("h", ["grp"])],
        };
        let json = frame.to_json();
        assert!(json.starts_with("[\"REQ\",\"sub1\","));
        assert_eq!(ClientFrame::parse(&json).unwrap(), frame);
    }

    #[test]
    fn publish_and_delivery_shapes_differ() {
        let ev = event();
        let publish = ClientFrame::Event { event: ev.clone() }.to_json();
        let delivery = RelayFrame::Event {
            sub_id: "sub1".into(),
            event: ev.clone(),
        }
        .to_json();
        assert!(matches!(
            ClientFrame::parse(&publish).unwrap(),
            ClientFrame::Event { .. }
        ));
        match RelayFrame::parse(&delivery).unwrap() {
            RelayFrame::Event { sub_id, event } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(event, ev);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        // The three-element shape must not parse as a client publish.
        assert!(ClientFrame::parse(&delivery).is_err());
    }

    #[test]
    fn ok_frame_roundtrip() {
        let json = RelayFrame::Ok {
            event_id: "abc".into(),
            success: false,
            message: "blocked: not a member".into(),
        }
        .to_json();
        match RelayFrame::parse(&json).unwrap() {
            RelayFrame::Ok {
                success, message, ..
            } => {
                assert!(!success);
                assert_eq!(message, "blocked: not a member");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn junk_rejected() {
        assert!(RelayFrame::parse("not json").is_err());
        assert!(RelayFrame::parse("{}").is_err());
        assert!(RelayFrame::parse("[]").is_err());
        assert!(RelayFrame::parse("[\"WAT\",1]").is_err());
    }
}
