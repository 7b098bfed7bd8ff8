//! Request handler for bouvet-agent.
//!
//! Routes JSON-RPC requests to the device registry and the sandbox network.

use crate::protocol::{
    error_codes, AddDevicesParams, DnsParams, InterfaceParams, Request, Response, RouteParams,
    RoutesParams,
};
use bouvet_guest::{AgentError, DeviceRegistry, ErrorKind, ReconcileError, Sandbox};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

/// State shared by every connection.
pub struct Agent {
    sandbox: Sandbox,
    devices: DeviceRegistry,
}

impl Agent {
    pub fn new(sandbox: Sandbox, devices: DeviceRegistry) -> Self {
        Self { sandbox, devices }
    }
}

/// Handle a JSON-RPC request and return a response.
///
/// Supported methods:
/// - `ping` - Health check, returns `{pong: true}`.
/// - `add_devices` - Attach hotplugged devices, returns the updated spec.
/// - `add_interface` / `update_interface` / `remove_interface`
/// - `update_routes` - Replace the routing table.
/// - `update_route` - Add or remove one route.
/// - `list_interfaces` / `list_routes` - Read back kernel state.
/// - `update_dns` - Rewrite the resolver configuration.
/// - `remove_network` - Remove every tracked interface.
pub async fn handle_request(agent: &Agent, req: Request) -> Response {
    debug!(method = %req.method, id = req.id, "handling request");
    trace!(params = ?req.params, "request params");

    let network = agent.sandbox.network();
    let id = req.id;

    let response = match req.method.as_str() {
        "ping" => {
            debug!(id = id, "ping request");
            Response::success(id, json!({"pong": true}))
        }

        "add_devices" => match parse_params::<AddDevicesParams>(id, &req.method, req.params) {
            Ok(mut p) => {
                debug!(id = id, count = p.devices.len(), "handling add_devices");
                match agent
                    .devices
                    .add_devices(&p.devices, &mut p.spec, &agent.sandbox)
                    .await
                {
                    Ok(()) => to_response(id, &json!({"spec": p.spec})),
                    Err(e) => error_response(id, &e),
                }
            }
            Err(resp) => resp,
        },

        "add_interface" => match parse_params::<InterfaceParams>(id, &req.method, req.params) {
            Ok(p) => match network.add_interface(p.interface.as_ref()).await {
                Ok(iface) => to_response(id, &iface),
                Err(e) => error_response(id, &e),
            },
            Err(resp) => resp,
        },

        "update_interface" => match parse_params::<InterfaceParams>(id, &req.method, req.params) {
            Ok(p) => match network.update_interface(p.interface.as_ref()).await {
                Ok(iface) => to_response(id, &iface),
                Err(e) => reconcile_error_response(id, e),
            },
            Err(resp) => resp,
        },

        "remove_interface" => match parse_params::<InterfaceParams>(id, &req.method, req.params) {
            Ok(p) => match network.remove_interface(p.interface.as_ref()).await {
                Ok(()) => Response::success(id, json!({"success": true})),
                Err(e) => error_response(id, &e),
            },
            Err(resp) => resp,
        },

        "update_routes" => match parse_params::<RoutesParams>(id, &req.method, req.params) {
            Ok(p) => match network.update_routes(&p.routes).await {
                Ok(routes) => to_response(id, &json!({"routes": routes})),
                Err(e) => reconcile_error_response(id, e),
            },
            Err(resp) => resp,
        },

        "update_route" => match parse_params::<RouteParams>(id, &req.method, req.params) {
            Ok(p) => match network.update_route(p.route.as_ref(), !p.remove).await {
                Ok(()) => Response::success(id, json!({"success": true})),
                Err(e) => error_response(id, &e),
            },
            Err(resp) => resp,
        },

        "list_interfaces" => match network.list_interfaces().await {
            Ok(interfaces) => to_response(id, &json!({"interfaces": interfaces})),
            Err(e) => error_response(id, &e),
        },

        "list_routes" => match network.current_routes().await {
            Ok(routes) => to_response(id, &json!({"routes": routes})),
            Err(e) => error_response(id, &e),
        },

        "update_dns" => match parse_params::<DnsParams>(id, &req.method, req.params) {
            Ok(p) => match network.update_dns(&p.servers).await {
                Ok(()) => Response::success(id, json!({"success": true})),
                Err(e) => error_response(id, &e),
            },
            Err(resp) => resp,
        },

        "remove_network" => match network.remove_network().await {
            Ok(()) => Response::success(id, json!({"success": true})),
            Err(e) => error_response(id, &e),
        },

        _ => {
            warn!(method = %req.method, "unknown method");
            Response::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            )
        }
    };

    if response.error.is_some() {
        debug!(id = id, error = ?response.error, "request failed");
    } else {
        debug!(id = id, "request succeeded");
        trace!(result = ?response.result, "response result");
    }

    response
}

fn parse_params<T: DeserializeOwned>(id: u64, method: &str, params: Value) -> Result<T, Response> {
    serde_json::from_value::<T>(params).map_err(|e| {
        warn!(id = id, error = %e, "invalid {} params", method);
        Response::error(
            id,
            error_codes::INVALID_PARAMS,
            format!("invalid params: {}", e),
        )
    })
}

fn to_response<T: Serialize>(id: u64, result: &T) -> Response {
    match serde_json::to_value(result) {
        Ok(v) => Response::success(id, v),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

fn error_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidArgument => error_codes::INVALID_PARAMS,
        ErrorKind::NotFound => error_codes::NOT_FOUND,
        ErrorKind::Unsupported => error_codes::UNSUPPORTED,
        ErrorKind::DeadlineExceeded => error_codes::DEADLINE_EXCEEDED,
        ErrorKind::Internal => error_codes::INTERNAL_ERROR,
    }
}

fn error_response(id: u64, err: &AgentError) -> Response {
    Response::error(id, error_code(err.kind()), err.to_string())
}

/// Error response carrying the kernel state re-read after the failure.
fn reconcile_error_response<T: Serialize>(id: u64, err: ReconcileError<T>) -> Response {
    let data = err
        .current
        .as_ref()
        .and_then(|current| serde_json::to_value(current).ok())
        .map(|current| json!({"current": current}));
    Response::error_with_data(id, error_code(err.source.kind()), err.to_string(), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bouvet_guest::network::netlink::fake::FakeNetlink;
    use bouvet_guest::AgentConfig;
    use std::sync::Arc;

    fn make_request(method: &str, params: Value) -> Request {
        Request {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: method.to_string(),
            params,
        }
    }

    fn make_agent(netlink: FakeNetlink) -> Agent {
        let config = AgentConfig::default();
        Agent::new(
            Sandbox::new(Arc::new(netlink), &config),
            DeviceRegistry::with_defaults(&config),
        )
    }

    #[tokio::test]
    async fn test_ping() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(&agent, make_request("ping", json!({}))).await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap(), json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(&agent, make_request("exec", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(&agent, make_request("update_dns", json!({"servers": 7}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_add_devices_skips_nulls() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(
            &agent,
            make_request("add_devices", json!({"devices": [null], "spec": {}})),
        )
        .await;
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap(), json!({"spec": {}}));
    }

    #[tokio::test]
    async fn test_add_devices_unknown_type() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(
            &agent,
            make_request(
                "add_devices",
                json!({"devices": [{"type": "nvme", "vm_path": "/dev/nvme0n1", "container_path": "/dev/xvda"}]}),
            ),
        )
        .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert!(error.message.contains("nvme"));
    }

    #[tokio::test]
    async fn test_add_devices_updates_spec() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(
            &agent,
            make_request(
                "add_devices",
                json!({
                    "devices": [{"type": "blk", "vm_path": "/dev/null", "container_path": "/dev/xvda"}],
                    "spec": {"linux": {"devices": [{"path": "/dev/xvda", "type": "c"}]}}
                }),
            ),
        )
        .await;
        let result = resp.result.unwrap();
        assert_eq!(result["spec"]["linux"]["devices"][0]["major"], 1);
        assert_eq!(result["spec"]["linux"]["devices"][0]["minor"], 3);
    }

    #[tokio::test]
    async fn test_interface_lifecycle() {
        let agent = make_agent(FakeNetlink::new());
        let iface = json!({
            "name": "eth0",
            "hw_addr": "02:42:ac:11:00:02",
            "mtu": 1500,
            "ip_addresses": [{"address": "10.0.0.2", "mask": "24"}]
        });

        let resp = handle_request(&agent, make_request("add_interface", json!({"interface": iface}))).await;
        assert!(resp.error.is_none());

        let resp = handle_request(&agent, make_request("list_interfaces", json!({}))).await;
        let interfaces = resp.result.unwrap()["interfaces"].clone();
        assert_eq!(interfaces.as_array().unwrap().len(), 2);

        let resp = handle_request(&agent, make_request("remove_network", Value::Null)).await;
        assert!(resp.error.is_none());

        let resp = handle_request(&agent, make_request("remove_interface", json!({"interface": iface}))).await;
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_interface_without_hw_addr() {
        let agent = make_agent(FakeNetlink::new());
        let resp = handle_request(
            &agent,
            make_request("update_interface", json!({"interface": {"name": "eth0"}})),
        )
        .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert!(error.data.is_none());
    }

    #[tokio::test]
    async fn test_update_routes_failure_carries_current_routes() {
        let agent = make_agent(FakeNetlink::new().with_link("eth0", "02:42:ac:11:00:02", 1500));
        let resp = handle_request(
            &agent,
            make_request(
                "update_routes",
                json!({"routes": [{"dest": "default", "gateway": "10.0.0.1", "device": "eth0"}]}),
            ),
        )
        .await;

        let error = resp.error.unwrap();
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        let current = &error.data.unwrap()["current"];
        assert_eq!(current.as_array().unwrap().len(), 1);
        assert_eq!(current[0]["device"], "lo");
    }

    #[tokio::test]
    async fn test_update_route_and_list() {
        let agent = make_agent(FakeNetlink::new().with_link("eth0", "02:42:ac:11:00:02", 1500));
        let route = json!({"dest": "10.0.0.0/24", "device": "eth0", "scope": 253});

        let resp = handle_request(&agent, make_request("update_route", json!({"route": route}))).await;
        assert!(resp.error.is_none());

        let resp = handle_request(&agent, make_request("list_routes", json!({}))).await;
        let routes = resp.result.unwrap()["routes"].clone();
        assert_eq!(routes.as_array().unwrap().len(), 2);

        let resp = handle_request(
            &agent,
            make_request("update_route", json!({"route": route, "remove": true})),
        )
        .await;
        assert!(resp.error.is_none());
    }
}
