//! Listen loops.
//!
//! A listener is declared first ([`PendingListener`]), then activated, which
//! starts consuming and spawns the loop. The loop hands each delivery to its
//! [`DeliveryHandler`] and acks it once the handler returns.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::envelope::Message;
use crate::transport::ListenChannel;
use crate::types::{Error, Result};

/// Consumer-side logic run for every delivery on a listener.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + fmt::Debug {
    async fn on_delivery(&self, message: Message) -> Result<()>;
}

/// A declared, not yet consuming listener.
#[derive(Debug)]
pub struct PendingListener {
    channel: Box<dyn ListenChannel>,
    handler: Arc<dyn DeliveryHandler>,
    poll: Duration,
}

impl PendingListener {
    pub fn new(channel: Box<dyn ListenChannel>, handler: Arc<dyn DeliveryHandler>, poll: Duration) -> Self {
        Self {
            channel,
            handler,
            poll,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.channel.queue_name()
    }

    /// Begin consuming. On failure the channel is closed.
    pub async fn activate(mut self) -> Result<ListenerHandle> {
        if let Err(e) = self.channel.activate().await {
            if let Err(close_err) = self.channel.close().await {
                tracing::warn!(error = %close_err, "closing listener after failed activation");
            }
            return Err(e);
        }

        let queue = self.channel.queue_name().to_string();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(listen_loop(
            self.channel,
            self.handler,
            self.poll,
            cancel.clone(),
        ));

        tracing::debug!("Activated listener on queue={}", queue);

        Ok(ListenerHandle {
            queue,
            cancel,
            join,
        })
    }

    /// Drop a listener that was never activated.
    pub async fn discard(mut self) {
        if let Err(e) = self.channel.close().await {
            tracing::warn!(queue = self.channel.queue_name(), error = %e, "closing unused listener");
        }
    }
}

async fn listen_loop(
    mut channel: Box<dyn ListenChannel>,
    handler: Arc<dyn DeliveryHandler>,
    poll: Duration,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = channel.receive(poll) => next,
        };

        match next {
            Ok(None) => continue,
            Ok(Some(delivery)) => {
                if let Err(e) = handler.on_delivery(delivery.message).await {
                    tracing::error!(queue = channel.queue_name(), error = %e, "delivery handler failed");
                }
                if let Err(e) = channel.ack(delivery.tag).await {
                    tracing::warn!(queue = channel.queue_name(), error = %e, "ack failed");
                }
            }
            Err(e) => {
                tracing::error!(queue = channel.queue_name(), error = %e, "listener receive failed");
                break;
            }
        }
    }

    if let Err(e) = channel.close().await {
        tracing::warn!(queue = channel.queue_name(), error = %e, "listener close failed");
    }
}

/// A running listen loop.
#[derive(Debug)]
pub struct ListenerHandle {
    queue: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Ask the loop to stop after the delivery in hand, if any.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait up to `wait` for the loop to close its channel.
    pub async fn shutdown(self, wait: Duration) -> Result<()> {
        self.cancel.cancel();
        match timeout(wait, self.join).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::server(format!(
                "listener on {} panicked: {}",
                self.queue, e
            ))),
            Err(_) => Err(Error::timeout(format!(
                "listener on {} did not stop within {:?}",
                self.queue, wait
            ))),
        }
    }
}
