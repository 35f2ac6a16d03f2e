//! Messages exchanged between clients and the manager.
//!
//! A client opens a control connection (`Hello::Control`) and receives its
//! connection id in a [`Welcome`]. It may then open a second connection with
//! `Hello::Events` carrying that id, over which the manager pushes
//! [`EventFrame`]s for every notifier the control connection registered.

use crate::conf::TunnelConfig;
use crate::conf::name::TunnelName;
use crate::manager::types::{ConnectionId, Notification, NotifierId, Tunnel, TunnelState, UpdateState};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    Control { version: u32 },
    Events { version: u32, connection: ConnectionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    StoredConfig { name: TunnelName },
    RuntimeConfig { name: TunnelName },
    Start { name: TunnelName },
    Stop { name: TunnelName },
    Delete { name: TunnelName },
    State { name: TunnelName },
    WaitForStop { name: TunnelName },
    Create { config: TunnelConfig },
    Tunnels,
    GlobalState,
    Quit { stop_tunnels_on_quit: bool },
    RegisterAsNotificationThread { notifier: NotifierId },
    UnregisterAsNotificationThread { notifier: NotifierId },
    UpdateState,
    Update,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::StoredConfig { .. } => "StoredConfig",
            Request::RuntimeConfig { .. } => "RuntimeConfig",
            Request::Start { .. } => "Start",
            Request::Stop { .. } => "Stop",
            Request::Delete { .. } => "Delete",
            Request::State { .. } => "State",
            Request::WaitForStop { .. } => "WaitForStop",
            Request::Create { .. } => "Create",
            Request::Tunnels => "Tunnels",
            Request::GlobalState => "GlobalState",
            Request::Quit { .. } => "Quit",
            Request::RegisterAsNotificationThread { .. } => "RegisterAsNotificationThread",
            Request::UnregisterAsNotificationThread { .. } => "UnregisterAsNotificationThread",
            Request::UpdateState => "UpdateState",
            Request::Update => "Update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value")]
pub enum Response {
    Config(TunnelConfig),
    State(TunnelState),
    Tunnel(Tunnel),
    Tunnels(Vec<Tunnel>),
    Quit { already_quit: bool },
    UpdateState(UpdateState),
    Done,
    Error(String),
}

impl Response {
    pub fn from_result<T>(result: anyhow::Result<T>, wrap: impl FnOnce(T) -> Response) -> Response {
        match result {
            Ok(value) => wrap(value),
            Err(e) => Response::Error(format!("{:#}", e)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub notifier: NotifierId,
    pub notification: Notification,
}

/// Requests served by a tunnel worker on its own pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    GetRuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerResponse {
    Config(TunnelConfig),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::config::tests::sample_config;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::Start {
            name: TunnelName::new("corp-vpn").unwrap(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "Start");
        assert_eq!(json["params"]["name"], "corp-vpn");
        assert_eq!(request.method(), "Start");
    }

    #[test]
    fn test_invalid_name_rejected_on_decode() {
        let json = r#"{"method":"Start","params":{"name":"bad name"}}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn test_create_carries_config() {
        let request = Request::Create {
            config: sample_config("office"),
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_error_response_keeps_context() {
        let result: anyhow::Result<()> =
            Err(anyhow::anyhow!("inner")).map_err(|e| e.context("outer"));
        match Response::from_result(result, |_| Response::Done) {
            Response::Error(message) => assert_eq!(message, "outer: inner"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
