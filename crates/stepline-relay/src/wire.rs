use serde::{Deserialize, Serialize};

use stepline_core::command::{Command, RunArg, RunResult};
use stepline_core::events::Event;

/// Controller → worker messages. The queue pair is the only channel between
/// the two processes; lifecycle control rides it as envelopes so delivery
/// points stay well defined (`Interrupt` lands at the next interpreter
/// check).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ToWorker {
    /// First message of a run.
    Run(RunArg),
    Command(Command),
    Interrupt,
    Terminate,
    /// End-of-stream sentinel.
    Eos,
}

/// Worker → controller messages. On a clean exit `Complete` followed by
/// `Eos` are always the final two messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FromWorker {
    Event(Event),
    Complete(RunResult),
    Eos,
}

#[cfg(test)]
mod tests {
    use super::*;

    use stepline_core::command::Script;
    use stepline_core::ids::{PromptNo, RunNo, TraceNo};

    #[test]
    fn to_worker_roundtrip() {
        let messages = vec![
            ToWorker::Run(RunArg {
                run_no: RunNo(1),
                script: Script::new("demo", "def main\nend\n"),
            }),
            ToWorker::Command(Command::new(TraceNo(1), PromptNo(2), "next")),
            ToWorker::Interrupt,
            ToWorker::Eos,
        ];
        for msg in &messages {
            let json = serde_json::to_string(msg).unwrap();
            let parsed: ToWorker = serde_json::from_str(&json).unwrap();
            assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
        }
    }

    #[test]
    fn from_worker_event_keeps_inner_tag() {
        let msg = FromWorker::Event(Event::TraceEnd {
            trace_no: TraceNo(3),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"event\""), "got: {json}");
        assert!(json.contains("\"type\":\"trace_end\""), "got: {json}");
    }

    #[test]
    fn sentinel_is_bare() {
        let json = serde_json::to_string(&FromWorker::Eos).unwrap();
        assert_eq!(json, "{\"kind\":\"eos\"}");
    }
}
