use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stepline_core::events::EventKind;
use stepline_core::ids::ContextId;

/// How an execution context is scheduled inside the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Dedicated OS thread.
    Thread,
    /// Cooperatively scheduled task.
    Task,
}

/// Identity of one execution context. The id is dense per run and is the
/// only key tracing multiplexes over; thread and task identity never enter
/// the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub id: ContextId,
    pub kind: ContextKind,
}

/// One stack frame of the running script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: u64,
    /// Code name; wrapped in angle brackets for synthetic frames.
    pub func: String,
    pub module: String,
    pub file: String,
    pub line: u32,
}

impl Frame {
    /// Synthetic frames have no persistent identity worth pausing on.
    pub fn is_synthetic(&self) -> bool {
        self.func.starts_with('<') && self.func.ends_with('>')
    }
}

/// One call/line/return/exception notification from the interpreter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub context: ContextRef,
    pub kind: EventKind,
    pub frame: Frame,
}

/// The process-wide interpreter hook. Invoked on every notification of every
/// context; `on_event` may suspend the calling context (that is how a
/// debugger pauses it) but must never fail silently — a panic aborts the run.
#[async_trait]
pub trait TraceHook: Send + Sync {
    async fn on_event(&self, event: &FrameEvent);

    /// Captured script output. Never written to the real stdout.
    async fn on_stdout(&self, context: ContextRef, text: String);

    /// The context's outermost frame returned with no pending call.
    async fn on_context_end(&self, context: ContextRef);
}

/// Hook that ignores everything. Used when a run is executed untraced.
pub struct NullHook;

#[async_trait]
impl TraceHook for NullHook {
    async fn on_event(&self, _event: &FrameEvent) {}

    async fn on_stdout(&self, _context: ContextRef, _text: String) {}

    async fn on_context_end(&self, _context: ContextRef) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frame_detection() {
        let synthetic = Frame {
            frame_id: 1,
            func: "<spawn>".into(),
            module: "rt.thread".into(),
            file: "rt".into(),
            line: 0,
        };
        assert!(synthetic.is_synthetic());

        let user = Frame {
            frame_id: 2,
            func: "main".into(),
            module: "demo".into(),
            file: "demo".into(),
            line: 1,
        };
        assert!(!user.is_synthetic());
    }

    #[test]
    fn context_ref_is_hashable() {
        let mut seen = std::collections::HashSet::new();
        seen.insert(ContextRef {
            id: ContextId(1),
            kind: ContextKind::Thread,
        });
        seen.insert(ContextRef {
            id: ContextId(1),
            kind: ContextKind::Task,
        });
        assert_eq!(seen.len(), 2);
    }
}
