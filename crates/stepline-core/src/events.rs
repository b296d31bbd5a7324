use serde::{Deserialize, Serialize};

use crate::ids::{PromptNo, RunNo, TaskNo, ThreadNo, TraceNo};

/// Where a frame notification came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Call,
    Line,
    Return,
    Exception,
}

/// Debug-session events emitted by the worker and relayed to the controller.
/// Strict per-key nesting contract:
///
/// TraceStart → (CallStart → (CmdloopStart → (PromptStart → PromptEnd)* →
///              CmdloopEnd)* → CallEnd)* → TraceEnd
///
/// StdoutWrite can appear at any point while a trace is open. Across traces
/// no ordering is guaranteed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "trace_start")]
    TraceStart {
        run_no: RunNo,
        trace_no: TraceNo,
        thread_no: ThreadNo,
        task_no: Option<TaskNo>,
    },

    #[serde(rename = "trace_end")]
    TraceEnd { trace_no: TraceNo },

    #[serde(rename = "call_start")]
    CallStart {
        trace_no: TraceNo,
        file: String,
        line: u32,
        frame_id: u64,
        kind: EventKind,
    },

    #[serde(rename = "call_end")]
    CallEnd { trace_no: TraceNo },

    #[serde(rename = "cmdloop_start")]
    CmdloopStart { trace_no: TraceNo },

    #[serde(rename = "cmdloop_end")]
    CmdloopEnd { trace_no: TraceNo },

    #[serde(rename = "prompt_start")]
    PromptStart {
        trace_no: TraceNo,
        prompt_no: PromptNo,
        text: String,
        file: String,
        line: u32,
        frame_id: u64,
        kind: EventKind,
    },

    #[serde(rename = "prompt_end")]
    PromptEnd {
        trace_no: TraceNo,
        prompt_no: PromptNo,
        command: String,
    },

    #[serde(rename = "stdout_write")]
    StdoutWrite { trace_no: TraceNo, text: String },
}

impl Event {
    pub fn trace_no(&self) -> TraceNo {
        match self {
            Self::TraceStart { trace_no, .. }
            | Self::TraceEnd { trace_no }
            | Self::CallStart { trace_no, .. }
            | Self::CallEnd { trace_no }
            | Self::CmdloopStart { trace_no }
            | Self::CmdloopEnd { trace_no }
            | Self::PromptStart { trace_no, .. }
            | Self::PromptEnd { trace_no, .. }
            | Self::StdoutWrite { trace_no, .. } => *trace_no,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TraceStart { .. } => "trace_start",
            Self::TraceEnd { .. } => "trace_end",
            Self::CallStart { .. } => "call_start",
            Self::CallEnd { .. } => "call_end",
            Self::CmdloopStart { .. } => "cmdloop_start",
            Self::CmdloopEnd { .. } => "cmdloop_end",
            Self::PromptStart { .. } => "prompt_start",
            Self::PromptEnd { .. } => "prompt_end",
            Self::StdoutWrite { .. } => "stdout_write",
        }
    }
}
