//! RTA wire protocol messages.
//!
//! Every frame is a JSON array whose first element is the message type:
//!
//! | message               | frame                                          |
//! |-----------------------|------------------------------------------------|
//! | subscribe request     | `[1, client_id, resource_uri]`                 |
//! | subscribe response    | `[1, client_id, error_code, service_id, data]` |
//! | unsubscribe request   | `[2, client_id, service_id]`                   |
//! | unsubscribe response  | `[2, client_id, error_code]`                   |
//! | event                 | `[3, service_id, data]`                        |
//! | resync                | `[4]`                                          |

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Message type discriminant carried in the first element of every frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageType {
    Subscribe = 1,
    Unsubscribe = 2,
    Event = 3,
    Resync = 4,
}

impl MessageType {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Subscribe),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::Event),
            4 => Some(Self::Resync),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Result code returned by the service in handshake responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    Success,
    UnknownResource,
    SubscriptionLimitReached,
    NoResourceData,
    Throttled,
    ServiceUnavailable,
    /// Code not known to this client.
    Unrecognized(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UnknownResource,
            2 => Self::SubscriptionLimitReached,
            3 => Self::NoResourceData,
            1001 => Self::Throttled,
            1002 => Self::ServiceUnavailable,
            other => Self::Unrecognized(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::UnknownResource => 1,
            Self::SubscriptionLimitReached => 2,
            Self::NoResourceData => 3,
            Self::Throttled => 1001,
            Self::ServiceUnavailable => 1002,
            Self::Unrecognized(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Throttling and unavailability are transient and worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Throttled | Self::ServiceUnavailable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::UnknownResource => "unknown resource",
            Self::SubscriptionLimitReached => "subscription limit reached",
            Self::NoResourceData => "no resource data",
            Self::Throttled => "throttled",
            Self::ServiceUnavailable => "service unavailable",
            Self::Unrecognized(_) => "unrecognized",
        };
        write!(f, "{name} ({})", self.as_u32())
    }
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe { client_id: u32, resource_uri: String },
    Unsubscribe { client_id: u32, service_id: u32 },
}

/// Frames sent by the service.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    SubscribeResponse {
        client_id: u32,
        code: ErrorCode,
        /// Present only when `code` is success.
        service_id: Option<u32>,
        data: Value,
    },
    UnsubscribeResponse {
        client_id: u32,
        code: ErrorCode,
    },
    Event {
        service_id: u32,
        data: Value,
    },
    Resync,
}

/// Errors produced while decoding wire frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a non-empty json array")]
    NotAnArray,

    #[error("unrecognized message type {0}")]
    UnknownMessageType(u64),

    #[error("malformed {frame} frame: {detail}")]
    Malformed {
        frame: &'static str,
        detail: String,
    },
}

#[derive(Serialize)]
struct SubscribeFrame<'a>(u32, u32, &'a str);

#[derive(Serialize)]
struct UnsubscribeFrame(u32, u32, u32);

impl ClientMessage {
    pub fn client_id(&self) -> u32 {
        match self {
            Self::Subscribe { client_id, .. } | Self::Unsubscribe { client_id, .. } => *client_id,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        let frame = parse_frame(text)?;
        match message_type(&frame)? {
            MessageType::Subscribe => Ok(Self::Subscribe {
                client_id: field_u32(&frame, 1, "subscribe")?,
                resource_uri: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("subscribe", "missing resource uri"))?
                    .to_string(),
            }),
            MessageType::Unsubscribe => Ok(Self::Unsubscribe {
                client_id: field_u32(&frame, 1, "unsubscribe")?,
                service_id: field_u32(&frame, 2, "unsubscribe")?,
            }),
            other => Err(malformed(
                "client",
                format!("message type {} is server-only", other.as_u32()),
            )),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        let text = match self {
            Self::Subscribe {
                client_id,
                resource_uri,
            } => serde_json::to_string(&SubscribeFrame(
                MessageType::Subscribe.as_u32(),
                *client_id,
                resource_uri,
            ))?,
            Self::Unsubscribe {
                client_id,
                service_id,
            } => serde_json::to_string(&UnsubscribeFrame(
                MessageType::Unsubscribe.as_u32(),
                *client_id,
                *service_id,
            ))?,
        };
        Ok(text)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        let mut frame = parse_frame(text)?;
        match message_type(&frame)? {
            MessageType::Subscribe => {
                let client_id = field_u32(&frame, 1, "subscribe response")?;
                let code = ErrorCode::from_u32(field_u32(&frame, 2, "subscribe response")?);
                let service_id = if code.is_success() {
                    Some(field_u32(&frame, 3, "subscribe response")?)
                } else {
                    None
                };
                let data = take_field(&mut frame, 4);
                Ok(Self::SubscribeResponse {
                    client_id,
                    code,
                    service_id,
                    data,
                })
            }
            MessageType::Unsubscribe => Ok(Self::UnsubscribeResponse {
                client_id: field_u32(&frame, 1, "unsubscribe response")?,
                code: ErrorCode::from_u32(field_u32(&frame, 2, "unsubscribe response")?),
            }),
            MessageType::Event => {
                let service_id = field_u32(&frame, 1, "event")?;
                let data = take_field(&mut frame, 2);
                Ok(Self::Event { service_id, data })
            }
            MessageType::Resync => Ok(Self::Resync),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        let frame = match self {
            Self::SubscribeResponse {
                client_id,
                code,
                service_id,
                data,
            } => match service_id {
                Some(service_id) => serde_json::json!([
                    MessageType::Subscribe.as_u32(),
                    client_id,
                    code.as_u32(),
                    service_id,
                    data
                ]),
                None => serde_json::json!([
                    MessageType::Subscribe.as_u32(),
                    client_id,
                    code.as_u32()
                ]),
            },
            Self::UnsubscribeResponse { client_id, code } => serde_json::json!([
                MessageType::Unsubscribe.as_u32(),
                client_id,
                code.as_u32()
            ]),
            Self::Event { service_id, data } => {
                serde_json::json!([MessageType::Event.as_u32(), service_id, data])
            }
            Self::Resync => serde_json::json!([MessageType::Resync.as_u32()]),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

fn parse_frame(text: &str) -> Result<Vec<Value>, ProtoError> {
    match serde_json::from_str(text)? {
        Value::Array(frame) if !frame.is_empty() => Ok(frame),
        _ => Err(ProtoError::NotAnArray),
    }
}

fn message_type(frame: &[Value]) -> Result<MessageType, ProtoError> {
    let raw = frame
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("message", "message type is not an unsigned integer"))?;
    MessageType::from_u64(raw).ok_or(ProtoError::UnknownMessageType(raw))
}

fn field_u32(frame: &[Value], index: usize, kind: &'static str) -> Result<u32, ProtoError> {
    frame
        .get(index)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| malformed(kind, format!("element {index} is not a u32")))
}

fn take_field(frame: &mut [Value], index: usize) -> Value {
    frame.get_mut(index).map(Value::take).unwrap_or(Value::Null)
}

fn malformed(frame: &'static str, detail: impl Into<String>) -> ProtoError {
    ProtoError::Malformed {
        frame,
        detail: detail.into(),
    }
}
