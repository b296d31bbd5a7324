use serde::{Deserialize, Serialize};

use crate::ids::{PromptNo, RunNo, TraceNo};

/// A user instruction addressed to one open prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub trace_no: TraceNo,
    pub prompt_no: PromptNo,
    pub text: String,
}

impl Command {
    pub fn new(trace_no: TraceNo, prompt_no: PromptNo, text: impl Into<String>) -> Self {
        Self {
            trace_no,
            prompt_no,
            text: text.into(),
        }
    }
}

/// The script unit a run executes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Module name frames of this script carry.
    pub name: String,
    pub source: String,
}

impl Script {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Input of one run, composed on entry to `initialized` and handed to the
/// worker as its first inbound message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunArg {
    pub run_no: RunNo,
    pub script: Script,
}

/// A captured exception, formatted for cross-process transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcInfo {
    pub kind: String,
    pub message: String,
}

impl ExcInfo {
    pub const INTERRUPTED: &'static str = "Interrupted";
    pub const TERMINATED: &'static str = "Terminated";
    pub const PROCESS_KILLED: &'static str = "ProcessKilled";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn process_killed() -> Self {
        Self::new(Self::PROCESS_KILLED, "the worker process was killed")
    }
}

/// Output of one run. Either a formatted return value or a captured
/// exception; a worker fault never crosses the boundary as a raw panic.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub ret: Option<String>,
    pub exc: Option<ExcInfo>,
}

impl RunResult {
    pub fn returned(ret: impl Into<String>) -> Self {
        Self {
            ret: Some(ret.into()),
            exc: None,
        }
    }

    pub fn raised(exc: ExcInfo) -> Self {
        Self {
            ret: None,
            exc: Some(exc),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.exc.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serde_roundtrip() {
        let cmd = Command::new(TraceNo(2), PromptNo(7), "next");
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn run_result_classification() {
        assert!(!RunResult::returned("None").is_fault());
        assert!(RunResult::raised(ExcInfo::process_killed()).is_fault());
    }

    #[test]
    fn process_killed_sentinel() {
        let exc = ExcInfo::process_killed();
        assert_eq!(exc.kind, ExcInfo::PROCESS_KILLED);
    }
}
