//! Stock interceptors: message logging and stale-request filtering.

use async_trait::async_trait;

use super::{AnnotationCategory, AnnotationStatus, Interceptor, Invocation};
use crate::envelope::{now_millis, Performative};
use crate::types::Result;

/// Logs every message at debug level.
#[derive(Debug, Default)]
pub struct MessageLogInterceptor;

impl MessageLogInterceptor {
    fn log(invocation: &Invocation) {
        let headers = invocation.headers();
        tracing::debug!(
            direction = ?invocation.direction,
            op = headers.op().unwrap_or(""),
            conv_id = headers.conv_id().unwrap_or(""),
            conv_seq = headers.conv_seq().unwrap_or(0),
            sender = headers.sender().unwrap_or(""),
            receiver = headers.receiver().unwrap_or(""),
            status_code = headers.status_code().unwrap_or(0),
            "message"
        );
    }
}

#[async_trait]
impl Interceptor for MessageLogInterceptor {
    fn name(&self) -> &str {
        "message_log"
    }

    async fn incoming(&self, invocation: &mut Invocation) -> Result<()> {
        Self::log(invocation);
        Ok(())
    }

    async fn outgoing(&self, invocation: &mut Invocation) -> Result<()> {
        Self::log(invocation);
        Ok(())
    }
}

/// Drops incoming requests whose `reply-by` deadline has already passed; the
/// caller has given up on them.
#[derive(Debug, Default)]
pub struct ConversationInterceptor;

#[async_trait]
impl Interceptor for ConversationInterceptor {
    fn name(&self) -> &str {
        "conversation"
    }

    async fn incoming(&self, invocation: &mut Invocation) -> Result<()> {
        if invocation.message.performative() != Some(Performative::Request) {
            return Ok(());
        }
        match invocation.headers().reply_by() {
            Some(deadline) if deadline < now_millis() => {
                let conv_id = invocation.headers().conv_id().unwrap_or("").to_string();
                tracing::warn!(conv_id = %conv_id, "dropping expired request");
                invocation.reject(
                    AnnotationCategory::Conversation,
                    format!("request {} expired before delivery", conv_id),
                );
            }
            _ => invocation.annotate(AnnotationCategory::Conversation, AnnotationStatus::Complete),
        }
        Ok(())
    }
}
