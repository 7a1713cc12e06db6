use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_FAILURE_MESSAGE: &str = "request failed";

/// Shape every backend call resolves to. Failures are signalled in-band with
/// `success: false` and a human-readable `msg`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcFailure {
    #[error("{0}")]
    Rejected(String),
    #[error("unexpected response data: {0}")]
    InvalidData(String),
}

impl RpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            msg: None,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            msg: Some(msg.into()),
        }
    }

    fn accepted(self) -> Result<Option<Value>, RpcFailure> {
        if self.success {
            return Ok(self.data);
        }
        let message = self
            .msg
            .filter(|msg| !msg.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());
        Err(RpcFailure::Rejected(message))
    }

    /// Payload with JSON-encoded strings unwrapped. A string that is not JSON
    /// is returned as-is.
    pub fn into_value(self) -> Result<Value, RpcFailure> {
        Ok(match self.accepted()? {
            Some(Value::String(raw)) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            Some(value) => value,
            None => Value::Null,
        })
    }

    /// Decodes the payload into `T`. String data is tried as embedded JSON
    /// first and as the plain string second, so `"42"` still reads as a
    /// `String`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, RpcFailure> {
        let raw = match self.accepted()? {
            Some(Value::String(raw)) => raw,
            Some(value) => return decode(value),
            None => return decode(Value::Null),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => {
                decode(parsed).or_else(|err| decode(Value::String(raw)).map_err(|_| err))
            }
            Err(_) => decode(Value::String(raw)),
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(value).map_err(|err| RpcFailure::InvalidData(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Task {
        id: String,
    }

    #[test]
    fn string_data_is_parsed_as_json() {
        let response = RpcResponse::ok(json!(r#"[{"id":"t1"},{"id":"t2"}]"#));
        let tasks: Vec<Task> = response.into_data().expect("tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].id, "t2");
    }

    #[test]
    fn plain_string_data_falls_back_to_raw() {
        let response = RpcResponse::ok(json!("saved"));
        assert_eq!(response.into_value().expect("value"), json!("saved"));
    }

    #[test]
    fn plain_string_that_looks_like_json_still_reads_as_string() {
        let answer: String = RpcResponse::ok(json!("42")).into_data().expect("string");
        assert_eq!(answer, "42");
        let flag: String = RpcResponse::ok(json!("true")).into_data().expect("string");
        assert_eq!(flag, "true");

        let number: u32 = RpcResponse::ok(json!("42")).into_data().expect("number");
        assert_eq!(number, 42);
        let wrapped: String = RpcResponse::ok(json!(r#""quoted""#)).into_data().expect("string");
        assert_eq!(wrapped, "quoted");
    }

    #[test]
    fn failure_uses_backend_message_or_default() {
        let err = RpcResponse::failed("provider not found")
            .into_value()
            .expect_err("failed");
        assert_eq!(err.to_string(), "provider not found");

        let bare: RpcResponse = serde_json::from_value(json!({"success": false})).expect("decode");
        assert_eq!(
            bare.into_value().expect_err("failed"),
            RpcFailure::Rejected(DEFAULT_FAILURE_MESSAGE.to_string())
        );
    }

    #[test]
    fn mismatched_data_is_reported() {
        let response = RpcResponse::ok(json!({"name": "x"}));
        let result: Result<Task, _> = response.into_data();
        assert!(matches!(result, Err(RpcFailure::InvalidData(_))));
    }
}
