//! RPC request/response protocol.
//!
//! Client: stamps `op`, `conv-id`, `conv-seq=1`, `ts`, `reply-by` and
//! `reply-to`, sends, then waits on its reply queue for the matching
//! `conv-id`. Anything else arriving there is stale traffic from an earlier,
//! timed-out call and is acked and dropped.
//!
//! Server: runs incoming interceptors, validates `op` against the process's
//! operation table, runs the operation's preconditions, invokes it on the
//! process's control task and always answers with `conv-seq + 1`, including
//! for failures. Anything carrying `reply-to` is handled as a request,
//! whether or not it names a performative.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};

use super::listener::DeliveryHandler;
use super::stamp_sender;
use crate::container::{CallContext, ProcessContext, ProcessHandle, ProcessInfo};
use crate::envelope::{names, now_millis, Headers, Message, Performative};
use crate::governance::GovernanceController;
use crate::interceptor::{AnnotationCategory, Direction, InterceptorStack, Invocation};
use crate::transport::{ListenChannel, ListenerSpec, Transport};
use crate::types::{CauseFrame, ConvId, ConvIdGenerator, Error, MessagingConfig, Result};

/// Seconds an operation handler may run for a request, leaving room for the
/// reply to travel back: `((reply_by - ts) - 2 * latency) * 0.9`, truncated.
pub fn handler_budget_secs(ts: i64, reply_by: i64, latency_ms: i64) -> i64 {
    let window_ms = reply_by
        .saturating_sub(ts)
        .saturating_sub(latency_ms.saturating_mul(2)) as f64;
    (window_ms / 1000.0 * 0.9) as i64
}

// =============================================================================
// Client
// =============================================================================

/// RPC client bound to one destination queue.
///
/// Calls on one client are serialized; the client keeps a single reply queue
/// across calls so late replies to abandoned calls are seen and discarded.
#[derive(Debug)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    interceptors: Arc<InterceptorStack>,
    conv_ids: Arc<ConvIdGenerator>,
    target: String,
    process: Option<Arc<ProcessInfo>>,
    context_headers: Headers,
    default_timeout: Duration,
    reply: Mutex<Option<Box<dyn ListenChannel>>>,
}

impl RpcClient {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        interceptors: Arc<InterceptorStack>,
        conv_ids: Arc<ConvIdGenerator>,
        target: String,
        process: Option<Arc<ProcessInfo>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            interceptors,
            conv_ids,
            target,
            process,
            context_headers: Headers::new(),
            default_timeout,
            reply: Mutex::new(None),
        }
    }

    /// Headers added to every request (actor identity, for example).
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.context_headers.extend(&headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Call `op` and return the reply body.
    pub async fn request(&self, op: &str, args: Value) -> Result<Value> {
        self.request_with(op, args, Headers::new(), None)
            .await
            .map(|(body, _)| body)
    }

    /// Call `op` with extra headers and an optional timeout, returning the
    /// reply body and headers.
    pub async fn request_with(
        &self,
        op: &str,
        body: Value,
        headers: Headers,
        wait: Option<Duration>,
    ) -> Result<(Value, Headers)> {
        let wait = wait.unwrap_or(self.default_timeout);
        let mut reply = self.reply.lock().await;
        if reply.is_none() {
            let mut channel = self
                .transport
                .declare_listener(ListenerSpec::anonymous())
                .await?;
            channel.activate().await?;
            *reply = Some(channel);
        }
        let Some(channel) = reply.as_mut() else {
            return Err(Error::inconsistent("reply channel missing after declare"));
        };

        let conv_id = self.conv_ids.next_id();
        let message = self.build_request(op, body, headers, &conv_id, wait, channel.queue_name());

        let invocation = Invocation::new(Direction::Outgoing, message).with_process(self.process.clone());
        let invocation = self.interceptors.process(invocation).await?;
        if let Some(rejection) = invocation.rejection() {
            return Err(match rejection.category {
                AnnotationCategory::Policy => Error::unauthorized(rejection.reason),
                AnnotationCategory::Conversation => {
                    Error::server(format!("request dropped before sending: {}", rejection.reason))
                }
            });
        }

        self.transport.send(&self.target, invocation.message).await?;
        tracing::debug!(target_queue = %self.target, op, conv_id = %conv_id, "rpc request sent");

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(wait, &conv_id));
            }
            let Some(delivery) = channel.receive(remaining).await? else {
                return Err(self.timeout_error(wait, &conv_id));
            };
            channel.ack(delivery.tag).await?;

            if delivery.message.headers.conv_id() != Some(conv_id.as_str()) {
                tracing::warn!(
                    expected = %conv_id,
                    received = delivery.message.headers.conv_id().unwrap_or(""),
                    "discarding out-of-conversation reply"
                );
                continue;
            }

            let invocation =
                Invocation::new(Direction::Incoming, delivery.message).with_process(self.process.clone());
            let invocation = self.interceptors.process(invocation).await?;
            match invocation.rejection() {
                Some(r) if r.category == AnnotationCategory::Conversation => {
                    tracing::debug!(conv_id = %conv_id, reason = %r.reason, "reply dropped by interceptor");
                    continue;
                }
                Some(r) => return Err(Error::unauthorized(r.reason)),
                None => return self.into_result(invocation.message),
            }
        }
    }

    /// Release the reply queue.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut channel) = self.reply.lock().await.take() {
            channel.close().await?;
        }
        Ok(())
    }

    fn build_request(
        &self,
        op: &str,
        body: Value,
        headers: Headers,
        conv_id: &ConvId,
        wait: Duration,
        reply_to: &str,
    ) -> Message {
        let mut h = self.context_headers.clone();
        h.extend(&headers);
        let ts = now_millis();
        let wait_ms = i64::try_from(wait.as_millis()).unwrap_or(i64::MAX);
        h.insert(names::OP, op);
        h.insert(names::CONV_ID, conv_id.as_str());
        h.insert(names::CONV_SEQ, 1);
        h.insert(names::TS, ts);
        h.insert(names::REPLY_BY, ts.saturating_add(wait_ms));
        h.insert(names::REPLY_TO, reply_to);
        h.insert(names::PERFORMATIVE, Performative::Request.as_str());
        h.insert(names::RECEIVER, self.target.as_str());
        stamp_sender(&mut h, self.process.as_deref());
        Message::new(body, h)
    }

    fn timeout_error(&self, wait: Duration, conv_id: &ConvId) -> Error {
        Error::timeout(format!(
            "request to {} timed out after {:?} (conv-id {})",
            self.target, wait, conv_id
        ))
    }

    fn into_result(&self, message: Message) -> Result<(Value, Headers)> {
        let status = message.headers.status_code().unwrap_or(200);
        if status == 200 {
            return Ok((message.body, message.headers));
        }

        let mut chain: Vec<CauseFrame> = serde_json::from_value(message.body).unwrap_or_default();
        if let Some(first) = chain.first_mut() {
            first.label = format!("in remote call to {}", self.target);
        }
        Err(Error::from_reply(
            status,
            message.headers.error_message(),
            chain,
        ))
    }
}

// =============================================================================
// Server
// =============================================================================

/// Request dispatcher for one process listener.
#[derive(Debug)]
pub struct RpcServer {
    transport: Arc<dyn Transport>,
    interceptors: Arc<InterceptorStack>,
    governance: Arc<GovernanceController>,
    context: ProcessContext,
    handle: ProcessHandle,
    messaging: MessagingConfig,
}

impl RpcServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        interceptors: Arc<InterceptorStack>,
        governance: Arc<GovernanceController>,
        context: ProcessContext,
        handle: ProcessHandle,
        messaging: MessagingConfig,
    ) -> Self {
        Self {
            transport,
            interceptors,
            governance,
            context,
            handle,
            messaging,
        }
    }

    fn process(&self) -> &Arc<ProcessInfo> {
        self.context.info()
    }

    /// Run interceptors and the operation. `None` means the request was
    /// dropped and gets no reply.
    async fn dispatch(&self, message: Message) -> Option<Result<Value>> {
        let invocation =
            Invocation::new(Direction::Incoming, message).with_process(Some(self.process().clone()));
        let invocation = match self.interceptors.process(invocation).await {
            Ok(invocation) => invocation,
            Err(e) => return Some(Err(e)),
        };

        if let Some(rejection) = invocation.rejection() {
            return match rejection.category {
                AnnotationCategory::Conversation => {
                    tracing::debug!(reason = %rejection.reason, "request dropped by interceptor");
                    None
                }
                AnnotationCategory::Policy => Some(Err(Error::unauthorized(rejection.reason))),
            };
        }

        Some(self.invoke(invocation.message).await)
    }

    async fn invoke(&self, message: Message) -> Result<Value> {
        let Message { body, headers } = message;
        let op = headers
            .op()
            .ok_or_else(|| Error::bad_request("request has no op header"))?
            .to_string();
        if !self.process().has_operation(&op) {
            return Err(Error::bad_request(format!("Unknown op name: {}", op)));
        }
        self.governance
            .check_process_operation_preconditions(self.process(), &body, &headers)
            .await?;
        let args = match body {
            Value::Object(map) => map,
            other => {
                return Err(Error::bad_request(format!(
                    "request body for {} must be a mapping, got {}",
                    op,
                    json_kind(&other)
                )))
            }
        };

        let budget = self.budget(&headers);
        let ctx = CallContext::new(self.context.clone(), headers);
        let call = self.handle.call(op.clone(), args, ctx);

        match budget {
            None => call.await,
            Some(secs) if secs <= 0 => Err(Error::server(format!(
                "no time left to run {} before the caller's deadline",
                op
            ))),
            Some(secs) => timeout(Duration::from_secs(secs.unsigned_abs()), call)
                .await
                .map_err(|_| Error::server(format!("operation {} exceeded its {}s budget", op, secs)))?,
        }
    }

    fn budget(&self, headers: &Headers) -> Option<i64> {
        if !self.messaging.enforce_handler_timeout {
            return None;
        }
        let latency = i64::try_from(self.messaging.assumed_latency.as_millis()).unwrap_or(0);
        Some(handler_budget_secs(headers.ts()?, headers.reply_by()?, latency))
    }

    fn build_reply(&self, request: &Headers, result: Result<Value>) -> Message {
        let mut headers = Headers::new();
        let (body, status, error_message, performative) = match result {
            Ok(body) => (body, 200, String::new(), Performative::InformResult),
            Err(e) => {
                let op = request.op().unwrap_or("?");
                if e.status_code() >= 500 {
                    tracing::error!(process_id = %self.process().id, op, error = %e, "operation failed");
                } else {
                    tracing::info!(process_id = %self.process().id, op, error = %e, "operation rejected");
                }
                let mut chain = vec![CauseFrame::new(
                    format!("{}: {}", e.kind(), e.message()),
                    format!("{}.{}", self.process().name, op),
                )];
                chain.extend(e.cause_chain().iter().cloned());
                let body = serde_json::to_value(&chain).unwrap_or(Value::Null);
                (body, e.status_code(), e.message(), Performative::Failure)
            }
        };

        if let Some(conv_id) = request.conv_id() {
            headers.insert(names::CONV_ID, conv_id);
        }
        headers.insert(names::CONV_SEQ, request.conv_seq().unwrap_or(1).saturating_add(1));
        if let Some(op) = request.op() {
            headers.insert(names::OP, op);
        }
        headers.insert(names::TS, now_millis());
        headers.insert(names::STATUS_CODE, status);
        headers.insert(names::ERROR_MESSAGE, error_message);
        headers.insert(names::PERFORMATIVE, performative.as_str());
        if let Some(sender) = request.sender() {
            headers.insert(names::RECEIVER, sender);
        }
        stamp_sender(&mut headers, Some(self.process()));
        Message::new(body, headers)
    }

    async fn send_through(&self, reply_to: &str, reply: Message) -> Result<()> {
        let invocation =
            Invocation::new(Direction::Outgoing, reply).with_process(Some(self.process().clone()));
        let invocation = self.interceptors.process(invocation).await?;
        if let Some(rejection) = invocation.rejection() {
            return Err(match rejection.category {
                AnnotationCategory::Policy => Error::unauthorized(rejection.reason),
                AnnotationCategory::Conversation => {
                    Error::server(format!("reply dropped by interceptor: {}", rejection.reason))
                }
            });
        }
        self.transport.send(reply_to, invocation.message).await
    }

    /// Send the reply; if that fails, send an error reply describing the
    /// failure, and as a last resort send it raw so the caller never hangs.
    async fn respond(&self, reply_to: &str, request: &Headers, result: Result<Value>) -> Result<()> {
        let reply = self.build_reply(request, result);
        let Err(e) = self.send_through(reply_to, reply).await else {
            return Ok(());
        };

        let conv_id = request.conv_id().unwrap_or("");
        tracing::error!(conv_id, error = %e, "failed to send rpc reply");
        let nested = Error::from_reply(
            e.status_code(),
            format!(
                "(while trying to send RPC response for conv-id {}) {}",
                conv_id,
                e.message()
            ),
            Vec::new(),
        );
        let fallback = self.build_reply(request, Err(nested));
        if let Err(second) = self.send_through(reply_to, fallback.clone()).await {
            tracing::error!(conv_id, error = %second, "error reply failed, sending raw");
            self.transport.send(reply_to, fallback).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for RpcServer {
    async fn on_delivery(&self, mut message: Message) -> Result<()> {
        let Some(reply_to) = message.headers.reply_to().map(str::to_string) else {
            tracing::warn!(
                process_id = %self.process().id,
                conv_id = message.headers.conv_id().unwrap_or(""),
                "request without reply-to dropped"
            );
            return Ok(());
        };
        if message.headers.performative().is_none() {
            message
                .headers
                .insert(names::PERFORMATIVE, Performative::Request.as_str());
        }
        let request = message.headers.clone();

        let result = match validate_request(&request) {
            Ok(()) => self.dispatch(message).await,
            Err(e) => Some(Err(e)),
        };
        match result {
            Some(result) => self.respond(&reply_to, &request, result).await,
            None => Ok(()),
        }
    }
}

/// Only requests are served, and a request's `conv-seq`, when present,
/// must leave room for the reply's.
fn validate_request(headers: &Headers) -> Result<()> {
    if let Some(performative) = headers.performative() {
        if Performative::parse(performative) != Some(Performative::Request) {
            return Err(Error::bad_request(format!(
                "expected a request, got performative {:?}",
                performative
            )));
        }
    }
    let Some(raw) = headers.get(names::CONV_SEQ) else {
        return Ok(());
    };
    match headers.conv_seq() {
        Some(seq) if seq >= 1 && seq < i64::MAX => Ok(()),
        _ => Err(Error::bad_request(format!("invalid conv-seq: {}", raw))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
