//! Per-process control task.
//!
//! Each spawned process gets one task that owns its [`Service`] instance and
//! executes commands strictly one at a time, in arrival order. Listeners hand
//! work to the task through a [`ProcessHandle`].

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use super::process::{CallContext, ProcessContext, Service};
use crate::envelope::Headers;
use crate::types::{Error, ProcessId, Result};

enum Command {
    Call {
        op: String,
        args: Map<String, Value>,
        ctx: CallContext,
        reply: oneshot::Sender<Result<Value>>,
    },
    Stream {
        body: Value,
        headers: Headers,
        done: oneshot::Sender<Result<()>>,
    },
    Quit {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a process's control task.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    tx: mpsc::UnboundedSender<Command>,
}

impl ProcessHandle {
    /// Move the service into a new control task.
    pub fn spawn(service: Box<dyn Service>, ctx: ProcessContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ctx.info().id.clone();
        tokio::spawn(run(service, ctx, rx));
        Self { id, tx }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub async fn call(&self, op: String, args: Map<String, Value>, ctx: CallContext) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Call {
            op,
            args,
            ctx,
            reply,
        })?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn stream(&self, body: Value, headers: Headers) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::Stream {
            body,
            headers,
            done,
        })?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Run the quit hook and stop the control task. Queued commands ahead of
    /// the quit still run.
    pub async fn quit(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::Quit { done })?;
        rx.await.map_err(|_| self.gone())?
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::channel_closed(format!("process {} is no longer running", self.id))
    }
}

async fn run(mut service: Box<dyn Service>, ctx: ProcessContext, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Call {
                op,
                args,
                ctx: call_ctx,
                reply,
            } => {
                let result = service.call(&op, args, &call_ctx).await;
                let _ = reply.send(result);
            }
            Command::Stream {
                body,
                headers,
                done,
            } => {
                let result = service.on_stream(body, &headers, &ctx).await;
                let _ = done.send(result);
            }
            Command::Quit { done } => {
                let result = service.on_quit().await;
                let _ = done.send(result);
                break;
            }
        }
    }
    tracing::debug!(process_id = %ctx.info().id, "control task finished");
}
