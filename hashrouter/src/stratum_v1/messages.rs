//! Typed views of the Stratum v1 messages the proxy looks inside.
//!
//! Most frames are forwarded as they are; these types exist so the relay
//! can run its own handshake with each pool, answer a miner's handshake
//! locally, and route submitted shares to a validator. Each message has an
//! explicit serde schema rather than a generic field walker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const MINING_SUBSCRIBE: &str = "mining.subscribe";
pub const MINING_AUTHORIZE: &str = "mining.authorize";
pub const MINING_SUBMIT: &str = "mining.submit";
pub const MINING_NOTIFY: &str = "mining.notify";
pub const MINING_SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const MINING_SET_EXTRANONCE: &str = "mining.set_extranonce";

/// Any JSON-RPC message: request, notification or response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
}

impl Message {
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| Error::Protocol(format!("not a JSON-RPC message: {e}")))
    }

    /// Whether this is the response to request `id`.
    pub fn is_response_to(&self, id: u64) -> bool {
        self.method.is_none() && self.id.as_u64() == Some(id)
    }

    /// A response carrying an error, or a plain `false` result.
    pub fn is_error(&self) -> bool {
        !self.error.is_null() || self.result == Value::Bool(false)
    }

    pub fn is_method(&self, method: &str) -> bool {
        self.method.as_deref() == Some(method)
    }
}

/// A request or notification the proxy originates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: Value,
    pub method: &'static str,
    pub params: Value,
}

impl Request {
    pub fn subscribe(id: u64, user_agent: &str) -> Self {
        Self {
            id: id.into(),
            method: MINING_SUBSCRIBE,
            params: json!([user_agent]),
        }
    }

    pub fn authorize(id: u64, user: &str, password: &str) -> Self {
        Self {
            id: id.into(),
            method: MINING_AUTHORIZE,
            params: json!([user, password]),
        }
    }

    /// Notification telling a miner to use a new extranonce1.
    pub fn set_extranonce(extranonce: &Extranonce) -> Self {
        Self {
            id: Value::Null,
            method: MINING_SET_EXTRANONCE,
            params: json!([extranonce.extranonce1, extranonce.extranonce2_size]),
        }
    }

    /// Encode as one newline-terminated frame.
    pub fn to_line(&self) -> String {
        format!("{}\n", json!(self))
    }
}

/// Encode a successful response to request `id`.
pub fn response_line(id: &Value, result: Value) -> String {
    format!("{}\n", json!({ "id": id, "result": result, "error": null }))
}

/// Encode an error response to request `id`, `[code, message, null]` as
/// Stratum pools send them.
pub fn error_line(id: &Value, code: i64, message: &str) -> String {
    let error = json!([code, message, null]);
    format!("{}\n", json!({ "id": id, "result": null, "error": error }))
}

/// Extranonce assignment from a `mining.subscribe` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extranonce {
    pub extranonce1: String,
    pub extranonce2_size: u64,
}

impl Extranonce {
    /// Read `[subscriptions, extranonce1, extranonce2_size]`.
    pub fn from_subscribe_result(result: &Value) -> Option<Self> {
        Some(Self {
            extranonce1: result.get(1)?.as_str()?.to_string(),
            extranonce2_size: result.get(2)?.as_u64()?,
        })
    }

    /// The `mining.subscribe` result handed to a miner.
    pub fn subscribe_result(&self) -> Value {
        json!([
            [[MINING_SET_DIFFICULTY, "hashrouter"], [MINING_NOTIFY, "hashrouter"]],
            self.extranonce1,
            self.extranonce2_size,
        ])
    }
}

/// Parameters of a `mining.submit` request.
///
/// On the wire these are positional:
/// `[worker_name, job_id, extranonce2, ntime, nonce]`. Some miners append a
/// sixth version-rolling field, which is ignored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitParams {
    pub worker_name: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

impl SubmitParams {
    /// Extract submit parameters from a raw frame.
    ///
    /// Returns `Ok(None)` for well-formed messages that are not submits.
    pub fn from_frame(frame: &[u8]) -> Result<Option<Self>> {
        Self::from_message(&Message::from_frame(frame)?)
    }

    pub fn from_message(message: &Message) -> Result<Option<Self>> {
        if !message.is_method(MINING_SUBMIT) {
            return Ok(None);
        }

        let Value::Array(params) = &message.params else {
            return Err(Error::Protocol("mining.submit params must be an array".into()));
        };
        let mut fields = params.iter().map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            other => Err(Error::Protocol(format!(
                "mining.submit parameter is not a string: {other}"
            ))),
        });
        let mut next = |name: &str| {
            fields.next().unwrap_or_else(|| {
                Err(Error::Protocol(format!("mining.submit is missing {name}")))
            })
        };

        Ok(Some(Self {
            worker_name: next("worker name")?,
            job_id: next("job id")?,
            extranonce2: next("extranonce2")?,
            ntime: next("ntime")?,
            nonce: next("nonce")?,
        }))
    }

    /// Encode as a newline-terminated `mining.submit` request.
    pub fn to_request_line(&self, id: u64) -> String {
        let request = json!({
            "id": id,
            "method": MINING_SUBMIT,
            "params": [
                self.worker_name,
                self.job_id,
                self.extranonce2,
                self.ntime,
                self.nonce,
            ],
        });
        format!("{request}\n")
    }
}

/// Re-encode a `mining.submit` frame with `worker` as the worker name.
///
/// Everything else in the request, including any extra parameters, is kept.
/// A trailing newline on the input is kept too.
pub fn rewrite_submit_worker(frame: &[u8], worker: &str) -> Result<Bytes> {
    let mut request: Value = serde_json::from_slice(frame)
        .map_err(|e| Error::Protocol(format!("not a JSON-RPC message: {e}")))?;
    match request.get_mut("params").and_then(|p| p.get_mut(0)) {
        Some(name) => *name = Value::String(worker.to_string()),
        None => return Err(Error::Protocol("mining.submit is missing worker name".into())),
    }

    let mut out = request.to_string();
    if frame.ends_with(b"\n") {
        out.push('\n');
    }
    Ok(Bytes::from(out))
}
