//! Per-request handler context and parameter extraction.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use vrpc_config::Config;
use vrpc_protocol::{Request, RpcFault};

use crate::handlers::policy::AgentPolicy;
use crate::transfer::UploadSessions;

/// Signature shared by every route handler.
///
/// A handler returns the `data` of a success envelope or a fault carrying
/// its taxonomy code.
pub type Handler = fn(&mut RequestContext<'_>) -> Result<Value, RpcFault>;

/// State handed to a handler for the duration of one request.
pub struct RequestContext<'a> {
    /// Decoded request.
    pub request: &'a Request,
    /// Values captured from `{name}` placeholders.
    pub path_params: &'a HashMap<String, String>,
    /// Decoded query string parameters.
    pub query_params: &'a HashMap<String, String>,
    /// Process-wide configuration.
    pub config: &'a Config,
    /// Path and command restrictions derived from the configuration.
    pub policy: &'a AgentPolicy,
    /// Time since the agent started serving.
    pub uptime: Duration,
    /// Chunked upload sessions.
    pub sessions: &'a mut UploadSessions,
}

impl<'a> RequestContext<'a> {
    /// Returns a parameter view over the JSON body and query string.
    ///
    /// The view borrows the request rather than the context, so handlers can
    /// hold parameters while mutating the session store.
    #[must_use]
    pub fn params(&self) -> Params<'a> {
        Params {
            body: self.request.body.as_ref().and_then(Value::as_object),
            query: self.query_params,
        }
    }
}

/// Named parameter lookup.
///
/// Fields are read from the body when it is a JSON object, then from the
/// query string. Any other body shape is treated as an empty object.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    body: Option<&'a Map<String, Value>>,
    query: &'a HashMap<String, String>,
}

impl<'a> Params<'a> {
    /// Builds a view over an explicit body and query map.
    #[must_use]
    pub const fn new(
        body: Option<&'a Map<String, Value>>,
        query: &'a HashMap<String, String>,
    ) -> Self {
        Self { body, query }
    }

    fn body_value(&self, field: &str) -> Option<&'a Value> {
        self.body
            .and_then(|body| body.get(field))
            .filter(|value| !value.is_null())
    }

    /// Reads an optional string field.
    ///
    /// # Errors
    ///
    /// Returns `2001` when the field is present but not a string.
    pub fn string(&self, field: &str) -> Result<Option<&'a str>, RpcFault> {
        match self.body_value(field) {
            Some(Value::String(text)) => Ok(Some(text.as_str())),
            Some(_) => Err(RpcFault::invalid_params(format!(
                "Parameter {field} must be a string"
            ))),
            None => Ok(self.query.get(field).map(String::as_str)),
        }
    }

    /// Reads a required, non-empty string field.
    ///
    /// # Errors
    ///
    /// Returns `2003` when the field is absent or empty and `2001` when it is
    /// not a string.
    pub fn required_string(&self, field: &str) -> Result<&'a str, RpcFault> {
        self.string(field)?
            .filter(|text| !text.is_empty())
            .ok_or_else(|| RpcFault::missing_required(field))
    }

    /// Reads an optional unsigned integer field.
    ///
    /// Query string values are parsed from text.
    ///
    /// # Errors
    ///
    /// Returns `2001` when the value is not a non-negative integer.
    pub fn unsigned(&self, field: &str) -> Result<Option<u64>, RpcFault> {
        let invalid = || RpcFault::invalid_params(format!("Invalid {field}: expected a non-negative integer"));
        match self.body_value(field) {
            Some(value) => value.as_u64().map(Some).ok_or_else(invalid),
            None => self
                .query
                .get(field)
                .map(|text| text.trim().parse::<u64>().map_err(|_| invalid()))
                .transpose(),
        }
    }

    /// Reads an optional boolean field.
    ///
    /// # Errors
    ///
    /// Returns `2001` when the value is not a boolean.
    pub fn boolean(&self, field: &str) -> Result<Option<bool>, RpcFault> {
        let invalid = || RpcFault::invalid_params(format!("Invalid {field}: expected a boolean"));
        match self.body_value(field) {
            Some(value) => value.as_bool().map(Some).ok_or_else(invalid),
            None => self
                .query
                .get(field)
                .map(|text| text.trim().parse::<bool>().map_err(|_| invalid()))
                .transpose(),
        }
    }

    /// Reads an optional object field from the body.
    ///
    /// # Errors
    ///
    /// Returns `2001` when the field is present but not an object.
    pub fn object(&self, field: &str) -> Result<Option<&'a Map<String, Value>>, RpcFault> {
        match self.body_value(field) {
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(RpcFault::invalid_params(format!(
                "Parameter {field} must be an object"
            ))),
            None => Ok(None),
        }
    }
}
