//! Response envelope carried in every response body.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorKind, RpcFault, SUCCESS_CODE, SUCCESS_MESSAGE};

/// `{code, message, timestamp, data?}` wrapper returned by every call.
///
/// Missing fields decode to their defaults so a peer that omits `code`
/// reports success, matching how bare bodies were treated historically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Taxonomy code; `0` means success.
    #[serde(default)]
    pub code: u32,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Creation time in whole seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    /// Handler result or fault details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Builds a success envelope around `data`.
    #[must_use]
    pub fn success(data: Option<Value>) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: SUCCESS_MESSAGE.to_owned(),
            timestamp: unix_timestamp(),
            data,
        }
    }

    /// Builds an error envelope from a fault.
    #[must_use]
    pub fn failure(fault: &RpcFault) -> Self {
        Self {
            code: fault.code(),
            message: fault.message().to_owned(),
            timestamp: unix_timestamp(),
            data: fault.data().cloned(),
        }
    }

    /// Builds an envelope for an arbitrary code.
    ///
    /// When `message` is `None` the default message of the code is used;
    /// unknown codes borrow the internal-fault message.
    #[must_use]
    pub fn for_code(code: u32, message: Option<String>, data: Option<Value>) -> Self {
        let message = message.unwrap_or_else(|| {
            if code == SUCCESS_CODE {
                SUCCESS_MESSAGE.to_owned()
            } else {
                ErrorKind::resolve(code).default_message().to_owned()
            }
        });
        Self {
            code,
            message,
            timestamp: unix_timestamp(),
            data,
        }
    }

    /// Renders the envelope as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        // Every field is a plain JSON value, so serialisation cannot fail.
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Reports whether the envelope carries the success code.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Converts an error envelope into the matching fault.
    ///
    /// # Errors
    ///
    /// Returns the [`RpcFault`] described by the envelope when its code is
    /// non-zero.
    pub fn into_result(self) -> Result<Self, RpcFault> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RpcFault::from_remote(self.code, self.message, self.data))
        }
    }
}

/// Current time in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
