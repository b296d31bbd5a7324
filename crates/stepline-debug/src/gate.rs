use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use stepline_core::errors::CoreError;
use stepline_core::ids::{PromptNo, TraceNo};

struct GateInner {
    open: Option<PromptNo>,
    pending: HashMap<PromptNo, oneshot::Sender<String>>,
    closed: bool,
}

/// Pending-request table correlating a blocking prompt with the command
/// that eventually completes it. The prompt side registers a prompt number
/// and awaits; the command router resolves it. A resolve against anything
/// but the open prompt is a correlation mismatch, reported to the caller
/// and otherwise harmless.
pub struct PromptGate {
    trace_no: TraceNo,
    inner: Mutex<GateInner>,
}

impl PromptGate {
    pub fn new(trace_no: TraceNo) -> Self {
        Self {
            trace_no,
            inner: Mutex::new(GateInner {
                open: None,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn trace_no(&self) -> TraceNo {
        self.trace_no
    }

    /// The prompt currently waiting for a command, if any.
    pub fn open_prompt(&self) -> Option<PromptNo> {
        self.inner.lock().open
    }

    /// Open a prompt and obtain the receiver its command will arrive on.
    /// Overlapping prompts for one context cannot happen (prompts are
    /// strictly nested per context); a second registration while one is
    /// open is a protocol violation.
    pub fn register(&self, prompt_no: PromptNo) -> Result<oneshot::Receiver<String>, CoreError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Protocol(format!(
                "prompt {prompt_no} registered on closed gate for trace {}",
                self.trace_no
            )));
        }
        if let Some(open) = inner.open {
            return Err(CoreError::Protocol(format!(
                "prompt {prompt_no} registered while prompt {open} is open"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.open = Some(prompt_no);
        inner.pending.insert(prompt_no, tx);
        Ok(rx)
    }

    /// Deliver a command to the open prompt. Stale prompt numbers are a
    /// correlation mismatch: the command is discarded and the wait
    /// continues.
    pub fn resolve(&self, prompt_no: PromptNo, text: String) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        if inner.open != Some(prompt_no) {
            return Err(CoreError::StalePrompt {
                trace_no: self.trace_no,
                got: prompt_no,
            });
        }
        inner.open = None;
        match inner.pending.remove(&prompt_no) {
            Some(tx) => {
                // The receiver is dropped only when the gate closes, and
                // closing clears the table first.
                let _ = tx.send(text);
                Ok(())
            }
            None => Err(CoreError::StalePrompt {
                trace_no: self.trace_no,
                got: prompt_no,
            }),
        }
    }

    /// Close the gate: any open prompt's receiver completes with an error
    /// and further registrations fail. Used when the context ends or the
    /// run is torn down.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.open = None;
        inner.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_completes_registered_prompt() {
        let gate = PromptGate::new(TraceNo(1));
        let mut rx = gate.register(PromptNo(1)).unwrap();
        assert_eq!(gate.open_prompt(), Some(PromptNo(1)));

        gate.resolve(PromptNo(1), "next".into()).unwrap();
        assert_eq!(gate.open_prompt(), None);
        assert_eq!(rx.try_recv().unwrap(), "next");
    }

    #[test]
    fn stale_prompt_is_rejected_and_wait_continues() {
        let gate = PromptGate::new(TraceNo(1));
        let mut rx = gate.register(PromptNo(2)).unwrap();

        let err = gate.resolve(PromptNo(1), "continue".into()).unwrap_err();
        assert_eq!(
            err,
            CoreError::StalePrompt {
                trace_no: TraceNo(1),
                got: PromptNo(1)
            }
        );
        // The open prompt is untouched.
        assert_eq!(gate.open_prompt(), Some(PromptNo(2)));
        assert!(rx.try_recv().is_err());

        gate.resolve(PromptNo(2), "step".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "step");
    }

    #[test]
    fn overlapping_registration_is_a_protocol_violation() {
        let gate = PromptGate::new(TraceNo(1));
        let _rx = gate.register(PromptNo(1)).unwrap();
        let err = gate.register(PromptNo(2)).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn close_releases_waiter_and_blocks_registration() {
        let gate = PromptGate::new(TraceNo(1));
        let mut rx = gate.register(PromptNo(1)).unwrap();

        gate.close();
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            gate.register(PromptNo(2)),
            Err(CoreError::Protocol(_))
        ));
    }
}
