use crate::errors;
use crate::ipc::framing::{read_frame, write_frame};
use crate::ipc::protocol::{EventFrame, Hello, PROTOCOL_VERSION, Request, Response, Welcome};
use crate::ipc::transport::{BoxedStream, IpcListener};
use crate::manager::types::ConnectionId;
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How long open connections get to write their last frames after shutdown.
pub const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The manager side of the control protocol.
pub trait ControlHandler: Send + Sync + 'static {
    fn connection_opened(&self, connection: ConnectionId);

    fn handle(
        &self,
        connection: ConnectionId,
        request: Request,
    ) -> impl Future<Output = Response> + Send;

    /// Returns the event queue of a live control connection. `None` if the
    /// connection is unknown or already has an event stream.
    fn attach_events(&self, connection: ConnectionId) -> Option<mpsc::Receiver<EventFrame>>;

    fn connection_closed(&self, connection: ConnectionId);
}

/// Accepts connections until `shutdown` fires. Each connection is served on
/// its own task, and those tasks get [`CONNECTION_DRAIN_TIMEOUT`] to finish
/// before this returns.
pub async fn serve<H: ControlHandler>(
    mut listener: IpcListener,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!("IPC server listening on {}", listener.path().display());
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, shutdown).await {
                            tracing::warn!("IPC connection ended with error: {:#}", e);
                        }
                    });
                }
                Err(e) => tracing::error!("{:#}", e),
            },
        }
    }

    let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Dropping {} IPC connections that did not finish", connections.len());
        connections.abort_all();
    }

    tracing::info!("IPC server stopped");
    Ok(())
}

async fn handle_connection<H: ControlHandler>(
    mut stream: BoxedStream,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let hello: Hello = read_frame(&mut stream)
        .await?
        .context(errors::ipc::MISSING_HELLO)?;

    match hello {
        Hello::Control { version } => {
            anyhow::ensure!(
                version == PROTOCOL_VERSION,
                errors::ipc::version_mismatch(version, PROTOCOL_VERSION)
            );
            let connection = ConnectionId::new();
            handler.connection_opened(connection);
            write_frame(&mut stream, &Welcome { connection }).await?;
            tracing::debug!("Control connection {} opened", connection);

            let result = serve_control(&mut stream, handler.as_ref(), connection, &shutdown).await;
            handler.connection_closed(connection);
            tracing::debug!("Control connection {} closed", connection);
            result
        }
        Hello::Events {
            version,
            connection,
        } => {
            anyhow::ensure!(
                version == PROTOCOL_VERSION,
                errors::ipc::version_mismatch(version, PROTOCOL_VERSION)
            );
            let events = handler
                .attach_events(connection)
                .with_context(|| errors::ipc::unknown_connection(&connection.to_string()))?;
            serve_events(&mut stream, events, &shutdown).await
        }
    }
}

async fn serve_control<H: ControlHandler>(
    stream: &mut BoxedStream,
    handler: &H,
    connection: ConnectionId,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let request: Request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame(stream) => match frame? {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        let method = request.method();
        tracing::debug!("{} called by {}", method, connection);
        let response = handler.handle(connection, request).await;
        if let Response::Error(message) = &response {
            tracing::debug!("{} failed: {}", method, message);
        }
        write_frame(stream, &response).await?;
    }
}

async fn serve_events(
    stream: &mut BoxedStream,
    mut events: mpsc::Receiver<EventFrame>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return flush_events(stream, &mut events).await,
            frame = events.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };
        write_frame(stream, &frame).await?;
    }
}

/// Writes what was queued before shutdown, the stopping notice included.
async fn flush_events(
    stream: &mut BoxedStream,
    events: &mut mpsc::Receiver<EventFrame>,
) -> anyhow::Result<()> {
    while let Ok(frame) = events.try_recv() {
        write_frame(stream, &frame).await?;
    }
    Ok(())
}
