use crate::conf::TunnelConfig;
use crate::conf::name::TunnelName;
use crate::errors;
use crate::ipc::framing::{read_frame, write_frame};
use crate::ipc::protocol::{EventFrame, Hello, PROTOCOL_VERSION, Request, Response, Welcome};
use crate::ipc::transport::{self, BoxedStream};
use crate::manager::types::{ConnectionId, NotifierId, Tunnel, TunnelState, UpdateState};
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Typed client for the manager's control protocol.
pub struct ManagerClient {
    path: PathBuf,
    stream: BoxedStream,
    connection: ConnectionId,
}

fn unexpected(method: &str, response: Response) -> anyhow::Error {
    match response {
        Response::Error(message) => anyhow::anyhow!(message),
        other => anyhow::anyhow!(errors::ipc::unexpected_response(method, &format!("{:?}", other))),
    }
}

impl ManagerClient {
    pub async fn connect(path: &Path) -> anyhow::Result<Self> {
        let mut stream = transport::connect(path).await?;
        write_frame(
            &mut stream,
            &Hello::Control {
                version: PROTOCOL_VERSION,
            },
        )
        .await?;
        let welcome: Welcome = read_frame(&mut stream)
            .await?
            .context(errors::ipc::CONNECTION_CLOSED)?;

        Ok(Self {
            path: path.to_path_buf(),
            stream,
            connection: welcome.connection,
        })
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub async fn call(&mut self, request: Request) -> anyhow::Result<Response> {
        write_frame(&mut self.stream, &request).await?;
        read_frame(&mut self.stream)
            .await?
            .context(errors::ipc::CONNECTION_CLOSED)
    }

    /// Opens the notification stream belonging to this connection.
    pub async fn events(&self) -> anyhow::Result<EventStream> {
        let mut stream = transport::connect(&self.path).await?;
        write_frame(
            &mut stream,
            &Hello::Events {
                version: PROTOCOL_VERSION,
                connection: self.connection,
            },
        )
        .await?;
        Ok(EventStream { stream })
    }

    async fn call_state(&mut self, request: Request) -> anyhow::Result<TunnelState> {
        let method = request.method();
        match self.call(request).await? {
            Response::State(state) => Ok(state),
            other => Err(unexpected(method, other)),
        }
    }

    async fn call_config(&mut self, request: Request) -> anyhow::Result<TunnelConfig> {
        let method = request.method();
        match self.call(request).await? {
            Response::Config(config) => Ok(config),
            other => Err(unexpected(method, other)),
        }
    }

    async fn call_done(&mut self, request: Request) -> anyhow::Result<()> {
        let method = request.method();
        match self.call(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(method, other)),
        }
    }

    pub async fn stored_config(&mut self, name: &TunnelName) -> anyhow::Result<TunnelConfig> {
        self.call_config(Request::StoredConfig { name: name.clone() })
            .await
    }

    pub async fn runtime_config(&mut self, name: &TunnelName) -> anyhow::Result<TunnelConfig> {
        self.call_config(Request::RuntimeConfig { name: name.clone() })
            .await
    }

    pub async fn start(&mut self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.call_state(Request::Start { name: name.clone() }).await
    }

    pub async fn stop(&mut self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.call_state(Request::Stop { name: name.clone() }).await
    }

    pub async fn delete(&mut self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.call_state(Request::Delete { name: name.clone() }).await
    }

    pub async fn state(&mut self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.call_state(Request::State { name: name.clone() }).await
    }

    pub async fn wait_for_stop(&mut self, name: &TunnelName) -> anyhow::Result<TunnelState> {
        self.call_state(Request::WaitForStop { name: name.clone() })
            .await
    }

    pub async fn global_state(&mut self) -> anyhow::Result<TunnelState> {
        self.call_state(Request::GlobalState).await
    }

    pub async fn create(&mut self, config: TunnelConfig) -> anyhow::Result<Tunnel> {
        match self.call(Request::Create { config }).await? {
            Response::Tunnel(tunnel) => Ok(tunnel),
            other => Err(unexpected("Create", other)),
        }
    }

    pub async fn tunnels(&mut self) -> anyhow::Result<Vec<Tunnel>> {
        match self.call(Request::Tunnels).await? {
            Response::Tunnels(tunnels) => Ok(tunnels),
            other => Err(unexpected("Tunnels", other)),
        }
    }

    /// Returns whether the manager was already quitting.
    pub async fn quit(&mut self, stop_tunnels_on_quit: bool) -> anyhow::Result<bool> {
        match self.call(Request::Quit { stop_tunnels_on_quit }).await? {
            Response::Quit { already_quit } => Ok(already_quit),
            other => Err(unexpected("Quit", other)),
        }
    }

    pub async fn register_notifier(&mut self, notifier: NotifierId) -> anyhow::Result<()> {
        self.call_done(Request::RegisterAsNotificationThread { notifier })
            .await
    }

    pub async fn unregister_notifier(&mut self, notifier: NotifierId) -> anyhow::Result<()> {
        self.call_done(Request::UnregisterAsNotificationThread { notifier })
            .await
    }

    pub async fn update_state(&mut self) -> anyhow::Result<UpdateState> {
        match self.call(Request::UpdateState).await? {
            Response::UpdateState(state) => Ok(state),
            other => Err(unexpected("UpdateState", other)),
        }
    }

    pub async fn update(&mut self) -> anyhow::Result<()> {
        self.call_done(Request::Update).await
    }
}

pub struct EventStream {
    stream: BoxedStream,
}

impl EventStream {
    /// `Ok(None)` once the manager closes the stream.
    pub async fn next(&mut self) -> anyhow::Result<Option<EventFrame>> {
        read_frame(&mut self.stream).await
    }
}
