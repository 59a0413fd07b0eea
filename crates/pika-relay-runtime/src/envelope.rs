//! NIP-01 frame codec
//!
//! Frames are JSON arrays whose first element names the message. The same
//! [`Envelope`] type covers both directions; `EVENT` and `COUNT` are told
//! apart by arity and payload.

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::{Filter, Filters};

/// Payload of an `AUTH` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPayload {
    /// Relay → client challenge
    Challenge(String),
    /// Client → relay signed kind-22242 event
    Event(Box<Event>),
}

/// Payload of a `COUNT` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountPayload {
    /// Client → relay
    Query(Filters),
    /// Relay → client
    Result(u64),
}

/// One frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// `["EVENT", <sub_id>, <event>]` from a relay, `["EVENT", <event>]` from a client
    Event {
        sub_id: Option<String>,
        event: Box<Event>,
    },
    Req {
        sub_id: String,
        filters: Filters,
    },
    Close {
        sub_id: String,
    },
    Eose {
        sub_id: String,
    },
    Closed {
        sub_id: String,
        reason: String,
    },
    Notice {
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    Auth(AuthPayload),
    Count {
        sub_id: String,
        payload: CountPayload,
    },
}

impl Envelope {
    /// Label of the frame, e.g. `"EOSE"`
    pub fn label(&self) -> &'static str {
        match self {
            Self::Event { .. } => "EVENT",
            Self::Req { .. } => "REQ",
            Self::Close { .. } => "CLOSE",
            Self::Eose { .. } => "EOSE",
            Self::Closed { .. } => "CLOSED",
            Self::Notice { .. } => "NOTICE",
            Self::Ok { .. } => "OK",
            Self::Auth(_) => "AUTH",
            Self::Count { .. } => "COUNT",
        }
    }

    /// Subscription this frame belongs to, if any
    pub fn sub_id(&self) -> Option<&str> {
        match self {
            Self::Event { sub_id, .. } => sub_id.as_deref(),
            Self::Req { sub_id, .. }
            | Self::Close { sub_id }
            | Self::Eose { sub_id }
            | Self::Closed { sub_id, .. }
            | Self::Count { sub_id, .. } => Some(sub_id),
            Self::Notice { .. } | Self::Ok { .. } | Self::Auth(_) => None,
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Event {
                sub_id: Some(sub_id),
                event,
            } => json!(["EVENT", sub_id, event]),
            Self::Event {
                sub_id: None,
                event,
            } => json!(["EVENT", event]),
            Self::Req { sub_id, filters } => {
                let mut frame = vec![json!("REQ"), json!(sub_id)];
                frame.extend(filters.iter().map(|f| json!(f)));
                Value::Array(frame)
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]),
            Self::Eose { sub_id } => json!(["EOSE", sub_id]),
            Self::Closed { sub_id, reason } => json!(["CLOSED", sub_id, reason]),
            Self::Notice { message } => json!(["NOTICE", message]),
            Self::Ok {
                event_id,
                accepted,
                reason,
            } => json!(["OK", event_id, accepted, reason]),
            Self::Auth(AuthPayload::Challenge(challenge)) => json!(["AUTH", challenge]),
            Self::Auth(AuthPayload::Event(event)) => json!(["AUTH", event]),
            Self::Count {
                sub_id,
                payload: CountPayload::Query(filters),
            } => {
                let mut frame = vec![json!("COUNT"), json!(sub_id)];
                frame.extend(filters.iter().map(|f| json!(f)));
                Value::Array(frame)
            }
            Self::Count {
                sub_id,
                payload: CountPayload::Result(count),
            } => json!(["COUNT", sub_id, { "count": count }]),
        }
    }

    pub fn parse(frame: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(frame)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(mut items) = value else {
            return Err(invalid("frame is not an array"));
        };
        if items.is_empty() {
            return Err(invalid("empty frame"));
        }
        let label = match items.remove(0) {
            Value::String(s) => s,
            _ => return Err(invalid("frame label is not a string")),
        };

        match label.as_str() {
            "EVENT" => match items.len() {
                1 => Ok(Self::Event {
                    sub_id: None,
                    event: Box::new(event_at(&mut items, 0)?),
                }),
                2 => Ok(Self::Event {
                    sub_id: Some(string_at(&items, 0, "subscription id")?),
                    event: Box::new(event_at(&mut items, 1)?),
                }),
                n => Err(invalid(format!("EVENT with {n} elements"))),
            },
            "REQ" => {
                expect_min(&items, 2, "REQ")?;
                let sub_id = string_at(&items, 0, "subscription id")?;
                let filters = filters_from(items.drain(1..))?;
                Ok(Self::Req { sub_id, filters })
            }
            "CLOSE" => {
                expect_exact(&items, 1, "CLOSE")?;
                Ok(Self::Close {
                    sub_id: string_at(&items, 0, "subscription id")?,
                })
            }
            "EOSE" => {
                expect_exact(&items, 1, "EOSE")?;
                Ok(Self::Eose {
                    sub_id: string_at(&items, 0, "subscription id")?,
                })
            }
            "CLOSED" => {
                expect_min(&items, 1, "CLOSED")?;
                Ok(Self::Closed {
                    sub_id: string_at(&items, 0, "subscription id")?,
                    reason: optional_string_at(&items, 1),
                })
            }
            "NOTICE" => {
                expect_exact(&items, 1, "NOTICE")?;
                Ok(Self::Notice {
                    message: string_at(&items, 0, "message")?,
                })
            }
            "OK" => {
                expect_min(&items, 2, "OK")?;
                let accepted = items[1]
                    .as_bool()
                    .ok_or_else(|| invalid("OK accepted flag is not a bool"))?;
                Ok(Self::Ok {
                    event_id: string_at(&items, 0, "event id")?,
                    accepted,
                    reason: optional_string_at(&items, 2),
                })
            }
            "AUTH" => {
                expect_exact(&items, 1, "AUTH")?;
                match items.remove(0) {
                    Value::String(challenge) => Ok(Self::Auth(AuthPayload::Challenge(challenge))),
                    obj @ Value::Object(_) => Ok(Self::Auth(AuthPayload::Event(Box::new(
                        serde_json::from_value(obj)
                            .map_err(|e| Error::InvalidEvent(e.to_string()))?,
                    )))),
                    _ => Err(invalid("AUTH payload is neither challenge nor event")),
                }
            }
            "COUNT" => {
                expect_min(&items, 2, "COUNT")?;
                let sub_id = string_at(&items, 0, "subscription id")?;
                let count = items
                    .get(1)
                    .and_then(|v| v.get("count"))
                    .and_then(Value::as_u64);
                let payload = match count {
                    Some(n) if items.len() == 2 => CountPayload::Result(n),
                    _ => CountPayload::Query(filters_from(items.drain(1..))?),
                };
                Ok(Self::Count { sub_id, payload })
            }
            other => Err(invalid(format!("unknown frame label {other}"))),
        }
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidEnvelope(msg.into())
}

fn expect_exact(items: &[Value], n: usize, label: &str) -> Result<()> {
    if items.len() != n {
        return Err(invalid(format!(
            "{label} expects {n} elements, got {}",
            items.len()
        )));
    }
    Ok(())
}

fn expect_min(items: &[Value], n: usize, label: &str) -> Result<()> {
    if items.len() < n {
        return Err(invalid(format!(
            "{label} expects at least {n} elements, got {}",
            items.len()
        )));
    }
    Ok(())
}

fn string_at(items: &[Value], idx: usize, what: &str) -> Result<String> {
    items
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("{what} is not a string")))
}

fn optional_string_at(items: &[Value], idx: usize) -> String {
    items
        .get(idx)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn event_at(items: &mut [Value], idx: usize) -> Result<Event> {
    let value = items.get_mut(idx).map(Value::take).unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| Error::InvalidEvent(e.to_string()))
}

fn filters_from(values: impl Iterator<Item = Value>) -> Result<Filters> {
    let filters = values
        .map(|v| {
            let filter: Filter =
                serde_json::from_value(v).map_err(|e| Error::InvalidFilter(e.to_string()))?;
            filter.validate()?;
            Ok(filter)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Filters(filters))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "1".repeat(64),
            pubkey: "2".repeat(64),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![vec!["e".into(), "3".repeat(64)]],
            content: "hi \"there\"".into(),
            sig: "4".repeat(128),
        }
    }

    #[test]
    fn every_variant_survives_format_then_parse() {
        let filters = Filters::new(vec![
            Filter::new().kind(1).limit(10),
            Filter::new().tag('p', ["abc"]),
        ]);
        let envelopes = vec![
            Envelope::Event {
                sub_id: Some("s1".into()),
                event: Box::new(sample_event()),
            },
            Envelope::Event {
                sub_id: None,
                event: Box::new(sample_event()),
            },
            Envelope::Req {
                sub_id: "s1".into(),
                filters: filters.clone(),
            },
            Envelope::Close { sub_id: "s1".into() },
            Envelope::Eose { sub_id: "s1".into() },
            Envelope::Closed {
                sub_id: "s1".into(),
                reason: "rate-limited: slow down".into(),
            },
            Envelope::Notice {
                message: "hello".into(),
            },
            Envelope::Ok {
                event_id: "1".repeat(64),
                accepted: false,
                reason: "blocked: no".into(),
            },
            Envelope::Auth(AuthPayload::Challenge("chal".into())),
            Envelope::Auth(AuthPayload::Event(Box::new(sample_event()))),
            Envelope::Count {
                sub_id: "c1".into(),
                payload: CountPayload::Query(filters),
            },
            Envelope::Count {
                sub_id: "c1".into(),
                payload: CountPayload::Result(42),
            },
        ];
        for env in envelopes {
            let parsed = Envelope::parse(&env.to_json()).unwrap();
            assert_eq!(parsed, env, "{}", env.label());
        }
    }

    #[test]
    fn relay_frames_parse_from_wire_text() {
        let env = Envelope::parse(r#"["OK","abc",true,""]"#).unwrap();
        assert_eq!(
            env,
            Envelope::Ok {
                event_id: "abc".into(),
                accepted: true,
                reason: String::new()
            }
        );
        let env = Envelope::parse(r#"["CLOSED","sub"]"#).unwrap();
        assert_eq!(env.sub_id(), Some("sub"));
        let env = Envelope::parse(r#"["COUNT","c",{"count":7}]"#).unwrap();
        assert_eq!(
            env,
            Envelope::Count {
                sub_id: "c".into(),
                payload: CountPayload::Result(7)
            }
        );
    }

    #[test]
    fn malformed_frames_are_invalid_envelopes() {
        for frame in [
            "",
            "{}",
            "[]",
            "[1]",
            r#"["WHAT"]"#,
            r#"["EOSE"]"#,
            r#"["EOSE",1]"#,
            r#"["OK","id","yes"]"#,
            r#"["EVENT","a","b","c"]"#,
            r#"["AUTH",5]"#,
        ] {
            assert!(
                matches!(Envelope::parse(frame), Err(Error::InvalidEnvelope(_))),
                "{frame:?} should be rejected"
            );
        }
    }

    #[test]
    fn bad_payloads_map_to_specific_errors() {
        assert!(matches!(
            Envelope::parse(r#"["EVENT","s",{"id":1}]"#),
            Err(Error::InvalidEvent(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"["REQ","s",{"kinds":"x"}]"#),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn req_frame_lists_filters_inline() {
        let env = Envelope::Req {
            sub_id: "sub_1".into(),
            filters: Filter::new().kind(1).into(),
        };
        assert_eq!(env.to_json(), r#"["REQ","sub_1",{"kinds":[1]}]"#);
    }
}
