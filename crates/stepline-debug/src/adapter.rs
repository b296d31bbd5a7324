use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use stepline_core::errors::CoreError;
use stepline_core::events::{Event, EventKind};
use stepline_core::ids::{Counter, PromptNo, RunNo, TaskNo, ThreadNo, TraceNo};
use stepline_script::{ContextRef, Frame, FrameEvent};
use stepline_trace::ContextHandler;

use crate::gate::PromptGate;
use crate::stepper::Stepper;

const PROMPT_TEXT: &str = "(stepline) ";

/// Outbound event channel. Dropping the receiver ends a run's event stream;
/// later sends are logged and discarded.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("no event receiver — event dropped");
        }
    }
}

/// The identifiers issued to one execution context when tracing starts.
#[derive(Clone, Copy, Debug)]
pub struct TraceIdentity {
    pub run_no: RunNo,
    pub trace_no: TraceNo,
    pub thread_no: ThreadNo,
    pub task_no: Option<TaskNo>,
}

/// Per-context lifecycle of the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    InCall,
    InCmdloop,
    AwaitingCommand,
    Ended,
}

/// The scoped "current call" recorded for the life of one notification.
#[derive(Clone, Debug)]
pub struct CallRegion {
    pub file: String,
    pub line: u32,
    pub frame_id: u64,
    pub kind: EventKind,
}

/// One interactive debug session for one execution context. Turns the
/// stream of accepted call-events into command loops and prompts, speaking
/// to the controller exclusively through events out and the prompt gate in.
pub struct DebugAdapter {
    identity: TraceIdentity,
    sink: EventSink,
    gate: Arc<PromptGate>,
    prompt_counter: Arc<Counter>,
    release: CancellationToken,
    stepper: Mutex<Stepper>,
    state: Mutex<AdapterState>,
    current_call: Mutex<Option<CallRegion>>,
    /// Open frames of this context, innermost last. `where` prints it.
    stack: Mutex<Vec<Frame>>,
    last_command: Mutex<Option<String>>,
    /// Set by the `quit` command: tracing for this context is over and no
    /// further call events are emitted.
    quit: AtomicBool,
}

impl DebugAdapter {
    /// Creating the adapter announces the trace: `TraceStart` is the first
    /// event every context emits.
    pub fn new(
        identity: TraceIdentity,
        sink: EventSink,
        gate: Arc<PromptGate>,
        prompt_counter: Arc<Counter>,
        release: CancellationToken,
    ) -> Self {
        sink.send(Event::TraceStart {
            run_no: identity.run_no,
            trace_no: identity.trace_no,
            thread_no: identity.thread_no,
            task_no: identity.task_no,
        });
        Self {
            identity,
            sink,
            gate,
            prompt_counter,
            release,
            stepper: Mutex::new(Stepper::new()),
            state: Mutex::new(AdapterState::Idle),
            current_call: Mutex::new(None),
            stack: Mutex::new(Vec::new()),
            last_command: Mutex::new(None),
            quit: AtomicBool::new(false),
        }
    }

    pub fn trace_no(&self) -> TraceNo {
        self.identity.trace_no
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Valid only inside a call region.
    pub fn current_call(&self) -> Option<CallRegion> {
        self.current_call.lock().clone()
    }

    pub fn is_in_call(&self) -> bool {
        self.current_call.lock().is_some()
    }

    fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
    }

    /// The blocking command loop, entered once per paused notification.
    /// Entering it outside a call region is a protocol violation.
    pub async fn cmdloop(&self) -> Result<(), CoreError> {
        let region = self.current_call().ok_or_else(|| {
            CoreError::Protocol("command loop entered without an active call".into())
        })?;

        self.set_state(AdapterState::InCmdloop);
        self.sink.send(Event::CmdloopStart {
            trace_no: self.identity.trace_no,
        });

        loop {
            let Some(command) = self.prompt(&region).await? else {
                // Released without a command: run teardown. Stop pausing.
                self.stepper.lock().command("continue");
                break;
            };

            let command = if command.is_empty() {
                match self.last_command.lock().clone() {
                    Some(last) => last,
                    None => {
                        self.write_stdout("*** no previous command\n");
                        continue;
                    }
                }
            } else {
                command
            };

            match command.as_str() {
                "where" => self.write_stdout(self.render_stack(&region)),
                "quit" => {
                    self.quit.store(true, Ordering::SeqCst);
                    self.stepper.lock().command("continue");
                    *self.last_command.lock() = Some(command);
                    break;
                }
                _ => {
                    if self.stepper.lock().command(&command) {
                        *self.last_command.lock() = Some(command);
                        break;
                    }
                    self.write_stdout(format!("*** unknown command: {command}\n"));
                }
            }
        }

        self.sink.send(Event::CmdloopEnd {
            trace_no: self.identity.trace_no,
        });
        self.set_state(AdapterState::InCall);
        Ok(())
    }

    /// Open one prompt and block until its command arrives. Returns None
    /// when released without a command (gate closed, run cancelled, or the
    /// controller's input ended).
    async fn prompt(&self, region: &CallRegion) -> Result<Option<String>, CoreError> {
        let prompt_no = PromptNo(self.prompt_counter.next());
        let rx = self.gate.register(prompt_no)?;

        self.sink.send(Event::PromptStart {
            trace_no: self.identity.trace_no,
            prompt_no,
            text: PROMPT_TEXT.into(),
            file: region.file.clone(),
            line: region.line,
            frame_id: region.frame_id,
            kind: region.kind,
        });
        self.set_state(AdapterState::AwaitingCommand);

        let received = tokio::select! {
            received = rx => received.ok(),
            () = self.release.cancelled() => None,
        };
        self.set_state(AdapterState::InCmdloop);

        match received {
            Some(command) => {
                self.sink.send(Event::PromptEnd {
                    trace_no: self.identity.trace_no,
                    prompt_no,
                    command: command.clone(),
                });
                Ok(Some(command))
            }
            None => {
                debug!(trace_no = %self.identity.trace_no, %prompt_no, "prompt released without command");
                Ok(None)
            }
        }
    }

    /// The open-frame chain, outermost first, with current lines.
    fn render_stack(&self, region: &CallRegion) -> String {
        let stack = self.stack.lock();
        if stack.is_empty() {
            return format!(
                "  frame {} at {}:{}\n",
                region.frame_id, region.file, region.line
            );
        }
        let mut out = String::new();
        for frame in stack.iter() {
            out.push_str(&format!(
                "  frame {} in {} at {}:{}\n",
                frame.frame_id, frame.func, frame.file, frame.line
            ));
        }
        out
    }

    fn write_stdout(&self, text: impl Into<String>) {
        self.sink.send(Event::StdoutWrite {
            trace_no: self.identity.trace_no,
            text: text.into(),
        });
    }
}

#[async_trait]
impl ContextHandler for DebugAdapter {
    async fn handle(&self, event: &FrameEvent) {
        if self.state() == AdapterState::Ended {
            warn!(trace_no = %self.identity.trace_no, "event after trace end ignored");
            return;
        }
        if self.quit.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut stack = self.stack.lock();
            match event.kind {
                EventKind::Call => stack.push(event.frame.clone()),
                _ => {
                    if let Some(top) = stack.last_mut() {
                        top.line = event.frame.line;
                    }
                }
            }
        }

        let region = CallRegion {
            file: event.frame.file.clone(),
            line: event.frame.line,
            frame_id: event.frame.frame_id,
            kind: event.kind,
        };
        *self.current_call.lock() = Some(region.clone());
        self.set_state(AdapterState::InCall);
        self.sink.send(Event::CallStart {
            trace_no: self.identity.trace_no,
            file: region.file,
            line: region.line,
            frame_id: region.frame_id,
            kind: region.kind,
        });

        let pause = self.stepper.lock().observe(event.kind);
        if pause {
            if let Err(e) = self.cmdloop().await {
                // Cannot happen from this path; the call region is set.
                error!(trace_no = %self.identity.trace_no, error = %e, "command loop failed");
            }
        }

        self.sink.send(Event::CallEnd {
            trace_no: self.identity.trace_no,
        });
        if event.kind == EventKind::Return {
            self.stack.lock().pop();
        }
        *self.current_call.lock() = None;
        self.set_state(AdapterState::Idle);
    }

    async fn stdout(&self, text: String) {
        self.write_stdout(text);
    }

    async fn end(&self, _context: ContextRef) {
        self.set_state(AdapterState::Ended);
        self.gate.close();
        self.sink.send(Event::TraceEnd {
            trace_no: self.identity.trace_no,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use stepline_core::ids::ContextId;
    use stepline_script::{ContextKind, Frame};

    fn identity() -> TraceIdentity {
        TraceIdentity {
            run_no: RunNo(1),
            trace_no: TraceNo(1),
            thread_no: ThreadNo(1),
            task_no: None,
        }
    }

    fn named_event(kind: EventKind, func: &str, frame_id: u64, line: u32) -> FrameEvent {
        FrameEvent {
            context: ContextRef {
                id: ContextId(1),
                kind: ContextKind::Thread,
            },
            kind,
            frame: Frame {
                frame_id,
                func: func.into(),
                module: "demo".into(),
                file: "demo".into(),
                line,
            },
        }
    }

    fn frame_event(kind: EventKind, line: u32) -> FrameEvent {
        named_event(kind, "main", 7, line)
    }

    struct Fixture {
        adapter: Arc<DebugAdapter>,
        gate: Arc<PromptGate>,
        rx: mpsc::UnboundedReceiver<Event>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(PromptGate::new(TraceNo(1)));
        let adapter = Arc::new(DebugAdapter::new(
            identity(),
            EventSink::new(tx),
            gate.clone(),
            Arc::new(Counter::new(1)),
            CancellationToken::new(),
        ));
        Fixture { adapter, gate, rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn creation_emits_trace_start() {
        let mut f = fixture();
        let events = drain(&mut f.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "trace_start");
    }

    #[tokio::test]
    async fn paused_event_opens_prompt_and_command_releases_it() {
        let f = fixture();
        let adapter = f.adapter.clone();
        let gate = f.gate.clone();

        let handling =
            tokio::spawn(async move { adapter.handle(&frame_event(EventKind::Call, 2)).await });

        // Wait for the prompt to open, then answer it.
        let mut waited = 0;
        while f.gate.open_prompt().is_none() && waited < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            waited += 1;
        }
        let open = gate.open_prompt().expect("prompt never opened");
        gate.resolve(open, "continue".into()).unwrap();
        handling.await.unwrap();

        let mut rx = f.rx;
        let types: Vec<&'static str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "trace_start",
                "call_start",
                "cmdloop_start",
                "prompt_start",
                "prompt_end",
                "cmdloop_end",
                "call_end",
            ]
        );
    }

    #[tokio::test]
    async fn continue_suppresses_later_pauses() {
        let f = fixture();
        let adapter = f.adapter.clone();
        let gate = f.gate.clone();

        let first =
            tokio::spawn(async move { adapter.handle(&frame_event(EventKind::Call, 2)).await });
        while gate.open_prompt().is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        gate.resolve(gate.open_prompt().unwrap(), "continue".into())
            .unwrap();
        first.await.unwrap();

        // No prompt this time: the handle call completes on its own.
        f.adapter.handle(&frame_event(EventKind::Line, 3)).await;

        let mut rx = f.rx;
        let events = drain(&mut rx);
        let prompts = events
            .iter()
            .filter(|e| e.event_type() == "prompt_start")
            .count();
        assert_eq!(prompts, 1);
    }

    #[tokio::test]
    async fn cmdloop_outside_call_region_is_protocol_violation() {
        let f = fixture();
        let err = f.adapter.cmdloop().await.unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_command_reprompts() {
        let f = fixture();
        let adapter = f.adapter.clone();
        let gate = f.gate.clone();

        let handling =
            tokio::spawn(async move { adapter.handle(&frame_event(EventKind::Call, 2)).await });

        while gate.open_prompt().is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let first = gate.open_prompt().unwrap();
        gate.resolve(first, "jump".into()).unwrap();

        // A second prompt opens with a fresh number.
        let mut second = None;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if let Some(open) = gate.open_prompt() {
                if open != first {
                    second = Some(open);
                    break;
                }
            }
        }
        let second = second.expect("no second prompt");
        gate.resolve(second, "continue".into()).unwrap();
        handling.await.unwrap();

        let mut rx = f.rx;
        let events = drain(&mut rx);
        let unknown = events.iter().any(|e| {
            matches!(e, Event::StdoutWrite { text, .. } if text.contains("unknown command: jump"))
        });
        assert!(unknown);
    }

    async fn open_prompt(gate: &PromptGate) -> PromptNo {
        loop {
            if let Some(open) = gate.open_prompt() {
                return open;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn where_prints_the_whole_stack() {
        let f = fixture();
        let gate = f.gate.clone();

        let outer = {
            let adapter = f.adapter.clone();
            tokio::spawn(async move { adapter.handle(&named_event(EventKind::Call, "main", 1, 2)).await })
        };
        gate.resolve(open_prompt(&gate).await, "step".into()).unwrap();
        outer.await.unwrap();

        let inner = {
            let adapter = f.adapter.clone();
            tokio::spawn(async move { adapter.handle(&named_event(EventKind::Call, "work", 2, 5)).await })
        };
        let first = open_prompt(&gate).await;
        gate.resolve(first, "where".into()).unwrap();
        let second = loop {
            let open = open_prompt(&gate).await;
            if open != first {
                break open;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        gate.resolve(second, "continue".into()).unwrap();
        inner.await.unwrap();

        let mut rx = f.rx;
        let events = drain(&mut rx);
        let stack = events
            .iter()
            .find_map(|e| match e {
                Event::StdoutWrite { text, .. } if text.contains("frame") => Some(text.clone()),
                _ => None,
            })
            .expect("no stack output");
        assert!(stack.contains("frame 1 in main at demo:2"));
        assert!(stack.contains("frame 2 in work at demo:5"));
    }

    #[tokio::test]
    async fn quit_silences_later_call_events() {
        let f = fixture();
        let gate = f.gate.clone();

        let handling = {
            let adapter = f.adapter.clone();
            tokio::spawn(async move { adapter.handle(&frame_event(EventKind::Call, 2)).await })
        };
        gate.resolve(open_prompt(&gate).await, "quit".into()).unwrap();
        handling.await.unwrap();

        // Tracing for the context is over: no call events, no prompts.
        f.adapter.handle(&frame_event(EventKind::Line, 3)).await;
        f.adapter.handle(&frame_event(EventKind::Return, 4)).await;

        let ctx = ContextRef {
            id: ContextId(1),
            kind: ContextKind::Thread,
        };
        f.adapter.end(ctx).await;

        let mut rx = f.rx;
        let types: Vec<&'static str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "trace_start",
                "call_start",
                "cmdloop_start",
                "prompt_start",
                "prompt_end",
                "cmdloop_end",
                "call_end",
                "trace_end",
            ]
        );
    }

    #[tokio::test]
    async fn end_emits_trace_end_and_closes_gate() {
        let f = fixture();
        let ctx = ContextRef {
            id: ContextId(1),
            kind: ContextKind::Thread,
        };
        f.adapter.end(ctx).await;

        assert_eq!(f.adapter.state(), AdapterState::Ended);
        assert!(matches!(
            f.gate.register(PromptNo(9)),
            Err(CoreError::Protocol(_))
        ));

        let mut rx = f.rx;
        let types: Vec<&'static str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["trace_start", "trace_end"]);
    }
}
