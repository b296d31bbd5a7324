use crate::ids::{PromptNo, TraceNo};

/// Failures shared across the engine's crates.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// A command arrived for a prompt that is no longer open. Self-healing:
    /// the stale command is discarded and the open prompt keeps waiting.
    #[error("stale command for trace {trace_no}: prompt {got} is not the open prompt")]
    StalePrompt { trace_no: TraceNo, got: PromptNo },

    /// No adapter is registered for the addressed trace.
    #[error("unknown trace: {0}")]
    UnknownTrace(TraceNo),

    /// The adapter protocol was violated by the caller (e.g. command loop
    /// entered without an active call region). Not recoverable.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let e = CoreError::StalePrompt {
            trace_no: TraceNo(3),
            got: PromptNo(8),
        };
        assert!(e.to_string().contains("trace 3"));
        assert!(e.to_string().contains("prompt 8"));
        assert_eq!(CoreError::UnknownTrace(TraceNo(9)).to_string(), "unknown trace: 9");
    }
}
