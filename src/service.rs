// JSON-lines command channel
//
// Each input line is one intent envelope; each answer is one command result
// line. Monitor events share the output stream.

use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::alerts::MonitorEvent;
use crate::error::OrchestratorError;
use crate::models::{CommandResult, IntentEnvelope};
use crate::orchestrator::LifecycleOrchestrator;

pub type SharedWriter<W> = Arc<Mutex<W>>;

/// Handle every line of `reader` as one intent until EOF. Commands run
/// concurrently; the orchestrator serializes those that touch the same VMID.
/// Returns once every accepted command has written its result.
pub async fn serve_intents<R, W>(
    orchestrator: Arc<LifecycleOrchestrator>,
    mut reader: R,
    writer: SharedWriter<W>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut commands = tokio::task::JoinSet::new();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let envelope: IntentEnvelope = match serde_json::from_str(trimmed) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Rejected malformed intent: {}", e);
                        let err = OrchestratorError::InvalidArgument(format!("malformed intent: {}", e));
                        write_line(&writer, &CommandResult::failed(&err)).await;
                        continue;
                    }
                };

                let orchestrator = orchestrator.clone();
                let writer = writer.clone();
                commands.spawn(async move {
                    let result = orchestrator
                        .handle(envelope.intent, &envelope.requested_by)
                        .await
                        .with_request_id(envelope.request_id);
                    write_line(&writer, &result).await;
                });
            }
            Err(e) => {
                error!("Error reading input: {}", e);
                break;
            }
        }
    }

    // Let in-flight commands report before returning
    while let Some(joined) = commands.join_next().await {
        if let Err(e) = joined {
            error!("Command task failed: {}", e);
        }
    }
}

/// Serve `reader`, then stay pending after EOF unless `exit_on_eof` is set.
/// Monitoring does not depend on command traffic, so a closed stdin must not
/// end the service.
pub async fn serve_until_closed<R, W>(
    orchestrator: Arc<LifecycleOrchestrator>,
    reader: R,
    writer: SharedWriter<W>,
    exit_on_eof: bool,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_intents(orchestrator, reader, writer).await;
    if exit_on_eof {
        info!("Input closed, shutting down");
        return;
    }
    info!("Input closed, monitoring continues until interrupted");
    std::future::pending::<()>().await
}

/// Copy monitor events onto the output stream until the channel closes.
pub async fn forward_alerts<W>(mut alerts: mpsc::UnboundedReceiver<MonitorEvent>, writer: SharedWriter<W>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = alerts.recv().await {
        warn!("{}", event.summary());
        write_line(&writer, &event).await;
    }
}

pub async fn write_line<W, T>(writer: &Mutex<W>, value: &T)
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to encode output: {}", e);
            return;
        }
    };
    line.push('\n');

    let mut out = writer.lock().await;
    if let Err(e) = out.write_all(line.as_bytes()).await {
        error!("Failed to write output: {}", e);
        return;
    }
    if let Err(e) = out.flush().await {
        error!("Failed to flush output: {}", e);
    }
}
