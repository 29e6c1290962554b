//! The messaging side of a conversion. The pipeline only needs to tell the
//! user what is going on and hand over the finished note; how that reaches a
//! chat is up to the implementor.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::Locale;
use crate::pipeline::VideoNote;

/// Identifies the conversation a request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub chat_id: i64,
    pub locale: Locale,
}

impl RequestContext {
    pub fn new(chat_id: i64, locale: Locale) -> Self {
        Self { chat_id, locale }
    }
}

/// Opaque handle of a sent "processing" notice, needed to retract it later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeHandle(pub String);

/// Failures of these calls are logged by the pipeline and never change the
/// outcome of a conversion.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_processing(&self, ctx: &RequestContext) -> Result<NoticeHandle>;

    async fn notify_too_large(&self, ctx: &RequestContext) -> Result<()>;

    async fn notify_error(&self, ctx: &RequestContext) -> Result<()>;

    async fn deliver_artifact(&self, ctx: &RequestContext, note: &VideoNote) -> Result<()>;

    async fn retract_notice(&self, ctx: &RequestContext, notice: NoticeHandle) -> Result<()>;
}
