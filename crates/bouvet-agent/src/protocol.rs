//! JSON-RPC 2.0 protocol types for bouvet-agent.
//!
//! Implements the JSON-RPC 2.0 specification for guest-host communication.
//! Requests and responses are newline-delimited JSON objects.

use bouvet_guest::{Device, Interface, Route, Spec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;

    /// A link, port or PCI bridge the request refers to does not exist.
    pub const NOT_FOUND: i32 = -32001;
    /// The guest kernel lacks a required capability.
    pub const UNSUPPORTED: i32 = -32002;
    /// A hotplugged device did not show up in time.
    pub const DEADLINE_EXCEEDED: i32 = -32003;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct Response {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    /// Create an error response carrying extra data, such as the kernel
    /// state observed after a failed reconciliation.
    pub fn error_with_data(
        id: u64,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Additional error data (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Parameter types for various methods

/// Parameters for the `add_devices` method.
///
/// `null` entries in `devices` are skipped. The updated spec is returned.
#[derive(Debug, Deserialize)]
pub struct AddDevicesParams {
    #[serde(default)]
    pub devices: Vec<Option<Device>>,
    #[serde(default)]
    pub spec: Spec,
}

/// Parameters for the interface methods.
#[derive(Debug, Deserialize)]
pub struct InterfaceParams {
    pub interface: Option<Interface>,
}

/// Parameters for the `update_routes` method.
#[derive(Debug, Deserialize)]
pub struct RoutesParams {
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Parameters for the `update_route` method.
#[derive(Debug, Deserialize)]
pub struct RouteParams {
    pub route: Option<Route>,
    /// Remove the route instead of adding it.
    #[serde(default)]
    pub remove: bool,
}

/// Parameters for the `update_dns` method.
#[derive(Debug, Deserialize)]
pub struct DnsParams {
    pub servers: Vec<String>,
}
