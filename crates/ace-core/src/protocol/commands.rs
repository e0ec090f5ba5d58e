//! Protocol commands
//!
//! Defines the request methods understood by the ACE firmware and the
//! request/response envelopes they travel in.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{RequestError, RequestId};

/// Request methods understood by the ACE firmware
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Model, firmware and hardware identification
    GetInfo,

    /// Full device status including slots
    GetStatus,

    /// Start the dryer
    Drying {
        /// Degrees Celsius
        temp: u32,
        /// Fan speed in RPM
        fan_speed: u32,
        /// Seconds
        duration: u32,
    },

    /// Stop the dryer
    DryingStop,

    /// Continuously feed toward the toolhead
    StartFeedAssist {
        /// Slot, zero-based
        index: u8,
    },

    /// Stop feed assist
    StopFeedAssist {
        /// Slot, zero-based
        index: u8,
    },

    /// Feed a fixed length
    FeedFilament {
        /// Slot, zero-based
        index: u8,
        /// Millimetres
        length: u32,
        /// Millimetres per second
        speed: u32,
    },

    /// Abort an ongoing feed
    StopFeedFilament {
        /// Slot, zero-based
        index: u8,
    },

    /// Retract a fixed length
    UnwindFilament {
        /// Slot, zero-based
        index: u8,
        /// Millimetres
        length: u32,
        /// Millimetres per second
        speed: u32,
        /// Firmware unwind mode, omitted when `None`
        mode: Option<u8>,
    },

    /// Abort an ongoing retract
    StopUnwindFilament {
        /// Slot, zero-based
        index: u8,
    },

    /// Change the speed of an ongoing feed
    UpdateFeedingSpeed {
        /// Slot, zero-based
        index: u8,
        /// Millimetres per second
        speed: u32,
    },

    /// Change the speed of an ongoing retract
    UpdateUnwindingSpeed {
        /// Slot, zero-based
        index: u8,
        /// Millimetres per second
        speed: u32,
    },

    /// RFID filament details for a slot
    GetFilamentInfo {
        /// Slot, zero-based
        index: u8,
    },

    /// Arbitrary method, used for debugging
    Raw {
        /// Wire method name
        method: String,
        /// Sent verbatim
        params: Option<Value>,
    },
}

impl Command {
    /// Wire method name
    pub fn method(&self) -> &str {
        match self {
            Command::GetInfo => "get_info",
            Command::GetStatus => "get_status",
            Command::Drying { .. } => "drying",
            Command::DryingStop => "drying_stop",
            Command::StartFeedAssist { .. } => "start_feed_assist",
            Command::StopFeedAssist { .. } => "stop_feed_assist",
            Command::FeedFilament { .. } => "feed_filament",
            Command::StopFeedFilament { .. } => "stop_feed_filament",
            Command::UnwindFilament { .. } => "unwind_filament",
            Command::StopUnwindFilament { .. } => "stop_unwind_filament",
            Command::UpdateFeedingSpeed { .. } => "update_feeding_speed",
            Command::UpdateUnwindingSpeed { .. } => "update_unwinding_speed",
            Command::GetFilamentInfo { .. } => "get_filament_info",
            Command::Raw { method, .. } => method.as_str(),
        }
    }

    /// Wire params object, if the method takes any
    pub fn params(&self) -> Option<Value> {
        match self {
            Command::GetInfo | Command::GetStatus | Command::DryingStop => None,
            Command::Drying {
                temp,
                fan_speed,
                duration,
            } => Some(json!({ "temp": temp, "fan_speed": fan_speed, "duration": duration })),
            Command::StartFeedAssist { index }
            | Command::StopFeedAssist { index }
            | Command::StopFeedFilament { index }
            | Command::StopUnwindFilament { index }
            | Command::GetFilamentInfo { index } => Some(json!({ "index": index })),
            Command::FeedFilament {
                index,
                length,
                speed,
            } => Some(json!({ "index": index, "length": length, "speed": speed })),
            Command::UnwindFilament {
                index,
                length,
                speed,
                mode,
            } => {
                let mut params = json!({ "index": index, "length": length, "speed": speed });
                if let (Some(mode), Some(obj)) = (mode, params.as_object_mut()) {
                    obj.insert("mode".to_string(), json!(mode));
                }
                Some(params)
            }
            Command::UpdateFeedingSpeed { index, speed }
            | Command::UpdateUnwindingSpeed { index, speed } => {
                Some(json!({ "index": index, "speed": speed }))
            }
            Command::Raw { params, .. } => params.clone(),
        }
    }

    /// Build the wire request for this command
    pub fn into_request(self, id: RequestId) -> Request {
        Request {
            id,
            params: self.params(),
            method: self.method().to_string(),
        }
    }
}

/// Request envelope as serialized on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed in the response
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Omitted when the method takes none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response envelope as received from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Structured result, merged into device status when it is an object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Nonzero means the device rejected the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Device-side error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// What a request's continuation receives
pub type Reply = Result<Response, RequestError>;

impl Response {
    /// Result object, if the response carries one
    pub fn result_object(&self) -> Option<&Map<String, Value>> {
        self.result.as_ref().and_then(Value::as_object)
    }

    /// Integer field of the result object
    pub fn result_i64(&self, key: &str) -> Option<i64> {
        self.result_object()
            .and_then(|r| r.get(key))
            .and_then(Value::as_i64)
    }

    /// String field of the result object
    pub fn result_str(&self, key: &str) -> Option<&str> {
        self.result_object()
            .and_then(|r| r.get(key))
            .and_then(Value::as_str)
    }

    /// Turn a nonzero `code` into an application error
    pub fn into_reply(self) -> Reply {
        match self.code {
            Some(code) if code != 0 => Err(RequestError::Application {
                code,
                msg: self
                    .msg
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            }),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_order() {
        let request = Command::GetStatus.into_request(7);
        let text = serde_json::to_string(&request).unwrap();
        assert_eq!(text, r#"{"id":7,"method":"get_status"}"#);
    }

    #[test]
    fn test_unwind_params() {
        let with_mode = Command::UnwindFilament {
            index: 1,
            length: 100,
            speed: 50,
            mode: Some(1),
        };
        assert_eq!(
            with_mode.params(),
            Some(json!({"index": 1, "length": 100, "speed": 50, "mode": 1}))
        );

        let without_mode = Command::UnwindFilament {
            index: 1,
            length: 100,
            speed: 50,
            mode: None,
        };
        assert_eq!(
            without_mode.params(),
            Some(json!({"index": 1, "length": 100, "speed": 50}))
        );
    }

    #[test]
    fn test_into_reply_application_error() {
        let response: Response =
            serde_json::from_str(r#"{"id":3,"code":2,"msg":"slot empty"}"#).unwrap();
        assert_eq!(
            response.into_reply(),
            Err(RequestError::Application {
                code: 2,
                msg: "slot empty".to_string()
            })
        );

        let ok: Response = serde_json::from_str(r#"{"id":3,"code":0,"msg":"success"}"#).unwrap();
        assert!(ok.into_reply().is_ok());
    }
}
