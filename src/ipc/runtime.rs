//! The per-tunnel pipe a worker serves its live configuration on.

use crate::conf::TunnelConfig;
use crate::errors;
use crate::ipc::framing::{read_frame, write_frame};
use crate::ipc::protocol::{WorkerRequest, WorkerResponse};
use crate::ipc::transport::{self, BoxedStream, IpcListener};
use anyhow::Context;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Produces the live configuration of a running tunnel, including peer
/// statistics.
pub trait RuntimeConfigSource: Send + Sync + 'static {
    fn runtime_config(&self) -> impl Future<Output = anyhow::Result<TunnelConfig>> + Send;
}

pub async fn serve_runtime_config<S: RuntimeConfigSource>(
    mut listener: IpcListener,
    source: Arc<S>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("{:#}", e);
                    continue;
                }
            },
        };
        let source = source.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(stream, source.as_ref()).await {
                tracing::warn!("Runtime configuration request failed: {:#}", e);
            }
        });
    }
}

async fn answer<S: RuntimeConfigSource>(mut stream: BoxedStream, source: &S) -> anyhow::Result<()> {
    while let Some(request) = read_frame::<_, WorkerRequest>(&mut stream).await? {
        let response = match request {
            WorkerRequest::GetRuntimeConfig => match source.runtime_config().await {
                Ok(config) => WorkerResponse::Config(config),
                Err(e) => WorkerResponse::Error(format!("{:#}", e)),
            },
        };
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

pub async fn query_runtime_config(pipe_path: &Path) -> anyhow::Result<TunnelConfig> {
    let mut stream = transport::connect(pipe_path).await?;
    write_frame(&mut stream, &WorkerRequest::GetRuntimeConfig).await?;
    let response: WorkerResponse = read_frame(&mut stream)
        .await?
        .context(errors::ipc::CONNECTION_CLOSED)?;
    match response {
        WorkerResponse::Config(config) => Ok(config),
        WorkerResponse::Error(message) => Err(anyhow::anyhow!(message)),
    }
}
