//! Response object for the MTAP wire protocol
//!
//! One JSON object per line:
//! `{"ok": bool, "error_code": string|null, "message": string, "data": object, "meta"?: object}`
//!
//! Invariant: `ok == false` implies empty `data` and a present `error_code`;
//! `ok == true` implies no `error_code`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ErrorCode, ProtocolError, LINE_TERMINATOR};

/// Message carried by successful responses
pub const OK_MESSAGE: &str = "OK";

/// Sent in place of a response that could not be serialized
const SERIALIZE_FAILED_LINE: &str =
    r#"{"ok":false,"error_code":"E_INTERNAL","message":"response serialization failed","data":{}}"#;

/// A decoded protocol response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub error_code: Option<ErrorCode>,
    pub message: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl Response {
    /// Successful response carrying `data`
    pub fn ok(data: Map<String, Value>) -> Self {
        Response {
            ok: true,
            error_code: None,
            message: OK_MESSAGE.to_string(),
            data,
            meta: None,
        }
    }

    /// Failed response; data is always empty
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response {
            ok: false,
            error_code: Some(code),
            message: message.into(),
            data: Map::new(),
            meta: None,
        }
    }

    /// Tag the response with the command it answers
    pub fn with_cmd(mut self, cmd: &str) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert("cmd".into(), Value::String(cmd.to_string()));
        self
    }

    /// Command named in `meta.cmd`, if any
    pub fn cmd(&self) -> Option<&str> {
        self.meta.as_ref()?.get("cmd")?.as_str()
    }

    /// Whether the ok/error_code/data invariant holds
    pub fn is_well_formed(&self) -> bool {
        if self.ok {
            self.error_code.is_none()
        } else {
            self.error_code.is_some() && self.data.is_empty()
        }
    }

    /// Serialize as one framed line, terminator included
    pub fn to_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).unwrap_or_else(|_| SERIALIZE_FAILED_LINE.to_string());
        line.push(LINE_TERMINATOR);
        line
    }

    /// Decode one response line, rejecting payloads that break the invariant
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let resp: Response = serde_json::from_str(line.trim_end())
            .map_err(|e| ProtocolError::MalformedResponse(e.to_string()))?;

        if !resp.is_well_formed() {
            return Err(ProtocolError::MalformedResponse(
                "ok flag disagrees with error_code/data".into(),
            ));
        }

        Ok(resp)
    }

    /// Read a float field from `data`
    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key)?.as_f64()
    }

    /// Read a string field from `data`
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key)?.as_str()
    }
}
