use crate::error::{Result, TransportError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request envelope as it travels to a listening service.
///
/// The caller's payload object is flattened next to `id`, so a payload of
/// `{"a": 1}` goes on the wire as `{"id": "...", "a": 1}`.
///
/// # Examples
///
/// ```
/// use amqp_rpc_transport::Request;
/// use serde_json::json;
///
/// let request = Request::new("42".to_string(), json!({ "a": 1 })).unwrap();
/// assert_eq!(request.get("a"), Some(&json!(1)));
/// assert_eq!(
///     serde_json::to_value(&request).unwrap(),
///     json!({ "id": "42", "a": 1 })
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Reply envelope published back to the caller's reply queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Request {
    /// Wraps `payload`, which must be a JSON object. A payload key named `id`
    /// is replaced by the correlation id.
    pub fn new(id: String, payload: Value) -> Result<Self> {
        let mut payload = match payload {
            Value::Object(map) => map,
            other => {
                return Err(TransportError::InvalidArgument(format!(
                    "payload must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };
        payload.remove("id");

        Ok(Self { id, payload })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Deserializes the payload fields into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = Value::Object(self.payload.clone());
        serde_json::from_value(value).map_err(Into::into)
    }
}

impl Reply {
    pub fn new(id: String, outcome: std::result::Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                result,
                error: None,
            },
            Err(error) => Self {
                id,
                result: Value::Null,
                error: Some(error),
            },
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(TransportError::Remote(error)),
            None => Ok(self.result),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
