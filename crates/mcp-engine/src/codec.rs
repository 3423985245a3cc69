//! Wire codec for inbound transmissions.
//!
//! A transmission is either a single JSON-RPC object or a JSON array of them. Both
//! decode into a [`BatchEnvelope`]; the [`Shape`] is kept only so the response can
//! mirror the request (object in, object out; array in, array out).

use serde_json::Value;

use crate::{
    error::MalformedError,
    model::{ErrorData, JsonRpcMessage, JsonRpcVersion2_0, RequestId, method},
};

/// Upper bound for one newline-delimited frame on byte-stream transports.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Single,
    Batch,
}

/// A request (`id` present) or notification (`id` absent) sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
}

impl Call {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// The client's answer to a server-initiated request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: RequestId,
    pub outcome: Result<Value, ErrorData>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundItem {
    Call(Call),
    Reply(Reply),
    /// Structurally broken item. Answered with `error` when an id could be recovered,
    /// or with a null id otherwise.
    Invalid {
        id: Option<RequestId>,
        error: ErrorData,
    },
    /// An error object without an id. There is nothing to correlate it with and
    /// nothing to answer.
    Unmatched(ErrorData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchEnvelope {
    pub items: Vec<InboundItem>,
    pub shape: Shape,
}

impl BatchEnvelope {
    pub fn single(item: InboundItem) -> Self {
        Self {
            items: vec![item],
            shape: Shape::Single,
        }
    }

    /// The envelope is exactly one `initialize` request, the only shape that may
    /// open a session.
    pub fn as_initialize(&self) -> Option<&Call> {
        match (self.shape, self.items.as_slice()) {
            (Shape::Single, [InboundItem::Call(call)])
                if call.method == method::INITIALIZE && call.id.is_some() =>
            {
                Some(call)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn decode(bytes: &[u8]) -> Result<BatchEnvelope, MalformedError> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<BatchEnvelope, MalformedError> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(MalformedError::EmptyBatch);
            }
            Ok(BatchEnvelope {
                items: items.into_iter().map(decode_item).collect(),
                shape: Shape::Batch,
            })
        }
        Value::Object(_) => Ok(BatchEnvelope::single(decode_item(value))),
        Value::Null => Err(MalformedError::NotAnEnvelope("null")),
        Value::Bool(_) => Err(MalformedError::NotAnEnvelope("boolean")),
        Value::Number(_) => Err(MalformedError::NotAnEnvelope("number")),
        Value::String(_) => Err(MalformedError::NotAnEnvelope("string")),
    }
}

fn decode_item(value: Value) -> InboundItem {
    let Value::Object(mut object) = value else {
        return InboundItem::Invalid {
            id: None,
            error: ErrorData::invalid_request("batch item must be an object", None),
        };
    };

    let mut null_id = false;
    let id = match object.remove("id") {
        None => None,
        Some(Value::Null) => {
            null_id = true;
            None
        }
        Some(raw) => match serde_json::from_value::<RequestId>(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                return InboundItem::Invalid {
                    id: None,
                    error: ErrorData::invalid_request("id must be a string or an integer", None),
                };
            }
        },
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JsonRpcVersion2_0::VALUE) {
        return InboundItem::Invalid {
            id,
            error: ErrorData::invalid_request("missing or invalid jsonrpc version", None),
        };
    }

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return InboundItem::Invalid {
                id,
                error: ErrorData::invalid_request("method must be a string", None),
            };
        };
        // a null id is neither a request id nor the absence of one
        if null_id {
            return InboundItem::Invalid {
                id: None,
                error: ErrorData::invalid_request("id must not be null", None),
            };
        }
        return InboundItem::Call(Call {
            id,
            method,
            params: object.remove("params"),
        });
    }

    if let Some(result) = object.remove("result") {
        return match id {
            Some(id) => InboundItem::Reply(Reply {
                id,
                outcome: Ok(result),
            }),
            None => InboundItem::Invalid {
                id: None,
                error: ErrorData::invalid_request("response without id", None),
            },
        };
    }

    if let Some(error) = object.remove("error") {
        let error = serde_json::from_value::<ErrorData>(error)
            .unwrap_or_else(|e| ErrorData::internal_error(format!("unreadable error: {e}"), None));
        return match id {
            Some(id) => InboundItem::Reply(Reply {
                id,
                outcome: Err(error),
            }),
            None => InboundItem::Unmatched(error),
        };
    }

    InboundItem::Invalid {
        id,
        error: ErrorData::invalid_request("missing method", None),
    }
}

/// Responses for one envelope, in input order, minus notifications and replies.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub shape: Shape,
    pub responses: Vec<JsonRpcMessage>,
}

impl BatchResult {
    pub fn empty(shape: Shape) -> Self {
        Self {
            shape,
            responses: Vec::new(),
        }
    }

    /// A single top-level error answering the transmission as a whole.
    pub fn rejected(error: ErrorData) -> Self {
        Self {
            shape: Shape::Single,
            responses: vec![JsonRpcMessage::error(None, error)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Encode a result in the shape of its request. `None` when there is nothing to
/// send back, which happens when every item was a notification or a reply.
pub fn encode(result: &BatchResult) -> serde_json::Result<Option<Vec<u8>>> {
    match (result.shape, result.responses.as_slice()) {
        (_, []) => Ok(None),
        (Shape::Single, [response]) => serde_json::to_vec(response).map(Some),
        _ => serde_json::to_vec(&result.responses).map(Some),
    }
}

pub fn encode_message(message: &JsonRpcMessage) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

#[cfg(feature = "transport-async-rw")]
pub fn line_codec() -> tokio_util::codec::LinesCodec {
    tokio_util::codec::LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)
}
