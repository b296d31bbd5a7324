use async_trait::async_trait;

use stepline_script::{ContextRef, FrameEvent};

/// Decision of one pipeline filter for one notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Reject,
}

/// One stage of the trace pipeline. Filters are named objects composed in a
/// fixed order by the pipeline builder; they hold their own state and must
/// never block the calling context.
pub trait TraceFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn decide(&self, event: &FrameEvent) -> Verdict;
}

/// The private per-context handler events are dispatched to once every
/// filter forwarded them. One instance per execution context.
#[async_trait]
pub trait ContextHandler: Send + Sync {
    /// An accepted notification for this handler's context. May suspend the
    /// calling context while a debugger prompt is open.
    async fn handle(&self, event: &FrameEvent);

    /// Captured script output from this handler's context.
    async fn stdout(&self, text: String);

    /// The context ended; the handler will receive nothing further.
    async fn end(&self, context: ContextRef);
}
