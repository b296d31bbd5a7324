use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepline_core::events::EventKind;
use stepline_core::ids::{ContextId, Counter};

use crate::frame::{ContextKind, ContextRef, Frame, FrameEvent, TraceHook};
use crate::program::{Func, Program, Stmt, ENTRY_FUNC};

/// A script-level exception unwinding through the interpreter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptExc {
    pub kind: String,
    pub message: String,
}

impl ScriptExc {
    pub fn raised(message: impl Into<String>) -> Self {
        Self {
            kind: "ScriptException".into(),
            message: message.into(),
        }
    }

    pub fn interrupted() -> Self {
        Self {
            kind: "Interrupted".into(),
            message: "interrupted at interpreter check".into(),
        }
    }

    pub fn terminated() -> Self {
        Self {
            kind: "Terminated".into(),
            message: "run terminated".into(),
        }
    }
}

impl std::fmt::Display for ScriptExc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one execution context.
#[derive(Debug)]
pub struct ContextOutcome {
    pub context: ContextRef,
    pub result: Result<(), ScriptExc>,
}

enum ChildHandle {
    Thread(std::thread::JoinHandle<ContextOutcome>),
    Task(tokio::task::JoinHandle<ContextOutcome>),
}

/// The script interpreter. One instance per run; every execution context
/// runs `run_context` against the same instance. All notifications flow
/// through the trace hook, which is the only place a context may suspend
/// apart from `sleep`.
#[derive(Clone)]
pub struct Interp {
    program: Arc<Program>,
    hook: Arc<dyn TraceHook>,
    cancel: CancellationToken,
    interrupt: Arc<AtomicBool>,
    frame_ids: Arc<Counter>,
    context_ids: Arc<Counter>,
    children: Arc<Mutex<Vec<ChildHandle>>>,
    runtime: tokio::runtime::Handle,
}

impl Interp {
    pub fn new(
        program: Program,
        hook: Arc<dyn TraceHook>,
        cancel: CancellationToken,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            program: Arc::new(program),
            hook,
            cancel,
            interrupt,
            frame_ids: Arc::new(Counter::new(1)),
            context_ids: Arc::new(Counter::new(1)),
            children: Arc::new(Mutex::new(Vec::new())),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Execute the entry function on the calling context. The caller is the
    /// run's main context (an OS thread from the pipeline's point of view).
    pub async fn run(&self) -> ContextOutcome {
        let context = ContextRef {
            id: ContextId(self.context_ids.next()),
            kind: ContextKind::Thread,
        };
        self.clone()
            .run_context(context, ENTRY_FUNC.to_string(), None)
            .await
    }

    /// Join every context spawned so far, including contexts that were
    /// spawned while joining. Returns outcomes in completion order.
    pub async fn join_children(&self) -> Vec<ContextOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let drained: Vec<ChildHandle> = std::mem::take(&mut *self.children.lock());
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let outcome = match handle {
                    ChildHandle::Task(h) => match h.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(error = %e, "task context panicked");
                            continue;
                        }
                    },
                    ChildHandle::Thread(h) => {
                        match tokio::task::spawn_blocking(move || h.join()).await {
                            Ok(Ok(outcome)) => outcome,
                            _ => {
                                warn!("thread context panicked");
                                continue;
                            }
                        }
                    }
                };
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Run one function as the body of an execution context. Spawned
    /// contexts enter through a synthetic runtime frame so the pipeline can
    /// tell runtime plumbing from user code.
    async fn run_context(
        self,
        context: ContextRef,
        func: String,
        synthetic_module: Option<&'static str>,
    ) -> ContextOutcome {
        let result = match synthetic_module {
            None => self.exec_func(context, &func).await,
            Some(module) => {
                let frame = Frame {
                    frame_id: self.frame_ids.next(),
                    func: "<spawn>".into(),
                    module: module.into(),
                    file: "rt".into(),
                    line: 0,
                };
                self.emit(context, EventKind::Call, &frame).await;
                let result = self.exec_func(context, &func).await;
                self.emit(context, EventKind::Return, &frame).await;
                result
            }
        };

        if let Err(exc) = &result {
            debug!(context = %context.id, %exc, "context unwound");
        }
        self.hook.on_context_end(context).await;
        ContextOutcome { context, result }
    }

    fn exec_func<'a>(
        &'a self,
        context: ContextRef,
        name: &'a str,
    ) -> BoxFuture<'a, Result<(), ScriptExc>> {
        async move {
            // Existence checked at parse time.
            let func = &self.program.funcs[name];
            let mut frame = Frame {
                frame_id: self.frame_ids.next(),
                func: func.name.clone(),
                module: self.program.name.clone(),
                file: self.program.name.clone(),
                line: func.def_line,
            };

            self.emit(context, EventKind::Call, &frame).await;
            let result = self.exec_body(context, func, &mut frame).await;
            if result.is_err() {
                self.emit(context, EventKind::Exception, &frame).await;
            }
            self.emit(context, EventKind::Return, &frame).await;
            result
        }
        .boxed()
    }

    async fn exec_body(
        &self,
        context: ContextRef,
        func: &Func,
        frame: &mut Frame,
    ) -> Result<(), ScriptExc> {
        for sl in &func.body {
            if self.cancel.is_cancelled() {
                return Err(ScriptExc::terminated());
            }
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(ScriptExc::interrupted());
            }

            frame.line = sl.line;
            self.emit(context, EventKind::Line, frame).await;

            match &sl.stmt {
                Stmt::Pass => {}
                Stmt::Print { text } => {
                    self.hook.on_stdout(context, format!("{text}\n")).await;
                }
                Stmt::Sleep { ms } => {
                    tokio::select! {
                        () = tokio::time::sleep(std::time::Duration::from_millis(*ms)) => {}
                        () = self.cancel.cancelled() => return Err(ScriptExc::terminated()),
                    }
                }
                Stmt::Call { func } => self.exec_func(context, func).await?,
                Stmt::SpawnThread { func } => self.spawn_thread(func.clone()),
                Stmt::SpawnTask { func } => self.spawn_task(func.clone()),
                Stmt::Raise { message } => return Err(ScriptExc::raised(message.clone())),
            }
        }
        Ok(())
    }

    fn spawn_thread(&self, func: String) {
        let context = ContextRef {
            id: ContextId(self.context_ids.next()),
            kind: ContextKind::Thread,
        };
        let interp = self.clone();
        let runtime = self.runtime.clone();
        let handle = std::thread::Builder::new()
            .name(format!("stepline-ctx-{}", context.id))
            .spawn(move || runtime.block_on(interp.run_context(context, func, Some("rt.thread"))));
        match handle {
            Ok(h) => self.children.lock().push(ChildHandle::Thread(h)),
            Err(e) => warn!(error = %e, "failed to spawn thread context"),
        }
    }

    fn spawn_task(&self, func: String) {
        let context = ContextRef {
            id: ContextId(self.context_ids.next()),
            kind: ContextKind::Task,
        };
        let interp = self.clone();
        let handle = tokio::spawn(interp.run_context(context, func, Some("rt.task")));
        self.children.lock().push(ChildHandle::Task(handle));
    }

    async fn emit(&self, context: ContextRef, kind: EventKind, frame: &Frame) {
        let event = FrameEvent {
            context,
            kind,
            frame: frame.clone(),
        };
        self.hook.on_event(&event).await;
    }
}
