use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{ExcInfo, Script};
use crate::events::EventKind;
use crate::ids::{PromptNo, RunNo, TaskNo, ThreadNo, TraceNo};

/// Lifecycle of a derived snapshot's subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoState {
    Initialized,
    Running,
    Finished,
}

/// Immutable snapshot of one run, rebuilt on every relevant event.
/// Consumed only by observers; the core never reads these back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_no: RunNo,
    pub state: InfoState,
    pub script: Script,
    pub result: Option<String>,
    pub exception: Option<ExcInfo>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunInfo {
    /// A freshly composed run, not yet started.
    pub fn initialized(run_no: RunNo, script: Script) -> Self {
        Self {
            run_no,
            state: InfoState::Initialized,
            script,
            result: None,
            exception: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn running(mut self) -> Self {
        self.state = InfoState::Running;
        self.started_at = Utc::now();
        self
    }

    pub fn finished(mut self, result: Option<String>, exception: Option<ExcInfo>) -> Self {
        self.state = InfoState::Finished;
        self.result = result;
        self.exception = exception;
        self.ended_at = Some(Utc::now());
        self
    }
}

/// Immutable snapshot of one execution context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceInfo {
    pub run_no: RunNo,
    pub trace_no: TraceNo,
    pub thread_no: ThreadNo,
    pub task_no: Option<TaskNo>,
    pub state: InfoState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TraceInfo {
    pub fn started(
        run_no: RunNo,
        trace_no: TraceNo,
        thread_no: ThreadNo,
        task_no: Option<TaskNo>,
    ) -> Self {
        Self {
            run_no,
            trace_no,
            thread_no,
            task_no,
            state: InfoState::Running,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn finished(mut self) -> Self {
        self.state = InfoState::Finished;
        self.ended_at = Some(Utc::now());
        self
    }
}

/// Immutable snapshot of one prompt, keyed by trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptInfo {
    pub run_no: RunNo,
    pub trace_no: TraceNo,
    pub prompt_no: PromptNo,
    pub open: bool,
    pub text: String,
    pub file: String,
    pub line: u32,
    pub event_kind: EventKind,
    pub command: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PromptInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn opened(
        run_no: RunNo,
        trace_no: TraceNo,
        prompt_no: PromptNo,
        text: String,
        file: String,
        line: u32,
        event_kind: EventKind,
    ) -> Self {
        Self {
            run_no,
            trace_no,
            prompt_no,
            open: true,
            text,
            file,
            line,
            event_kind,
            command: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn closed(mut self, command: impl Into<String>) -> Self {
        self.open = false;
        self.command = Some(command.into());
        self.ended_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_info_transitions() {
        let info = RunInfo::initialized(RunNo(1), Script::new("s", "def main\nend\n"));
        assert_eq!(info.state, InfoState::Initialized);

        let info = info.running();
        assert_eq!(info.state, InfoState::Running);
        assert!(info.ended_at.is_none());

        let done = info.finished(Some("None".into()), None);
        assert_eq!(done.state, InfoState::Finished);
        assert!(done.ended_at.is_some());
        assert_eq!(done.result.as_deref(), Some("None"));
    }

    #[test]
    fn prompt_info_close_records_command() {
        let p = PromptInfo::opened(
            RunNo(1),
            TraceNo(1),
            PromptNo(1),
            "(stepline) ".into(),
            "s".into(),
            2,
            EventKind::Line,
        );
        assert!(p.open);
        let p = p.closed("continue");
        assert!(!p.open);
        assert_eq!(p.command.as_deref(), Some("continue"));
    }
}
