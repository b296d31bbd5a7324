use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stepline_core::command::{Command, ExcInfo, RunArg, RunResult, Script};
use stepline_core::ids::RunNo;
use stepline_relay::{
    channel_pair, join_with_drain_timeout, run_worker, spawn_worker_process, start_pump,
    ProcessControl, PumpOutcome, RelayError, RelayHandle, ToWorker,
};

use crate::registrar::{Registrar, Registry};

/// Session lifecycle. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Created,
    Initialized,
    Running,
    Finished,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("'{trigger}' is not allowed while {state}")]
    InvalidTransition { trigger: &'static str, state: State },

    #[error("the run has not finished")]
    NotFinished,

    #[error("signals are only valid while a run is in progress")]
    SignalOutsideRun,

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// How the session spawns its worker. `InProcess` keeps the run inside this
/// process on a tokio task (tests, embedding); `Process` forks the real
/// child so `kill` has a process to kill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerLauncher {
    InProcess,
    Process,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub script: Script,
    pub run_no_start: u64,
    pub launcher: WorkerLauncher,
    /// How long `finish` waits for the outbound queue to drain after the
    /// worker has exited before giving up on the stream tail.
    pub drain_timeout: Duration,
}

impl SessionOptions {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            run_no_start: 1,
            launcher: WorkerLauncher::InProcess,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Changes applied by `reset` before the next run is composed.
#[derive(Clone, Debug, Default)]
pub struct ResetOptions {
    pub script: Option<Script>,
    pub run_no_start: Option<u64>,
}

struct ActiveRun {
    commands: mpsc::UnboundedSender<ToWorker>,
    control: Option<ProcessControl>,
    worker_task: Option<JoinHandle<()>>,
    pump: JoinHandle<PumpOutcome>,
    registrar_task: JoinHandle<()>,
}

impl ActiveRun {
    fn send(&self, msg: ToWorker) {
        if self.commands.send(msg).is_err() {
            debug!("worker inbound queue closed; message dropped");
        }
    }
}

struct Inner {
    state: State,
    script: Script,
    next_run_no: u64,
    active: Option<ActiveRun>,
    result: Option<RunResult>,
}

/// Orchestrates one script run at a time: composes the run, launches the
/// worker over the relay, feeds the registrar from the pumped event
/// stream, and answers operator triggers. All triggers funnel through one
/// async mutex, so concurrent callers observe exactly one real transition.
pub struct Session {
    registry: Arc<Registry>,
    registrar: Arc<parking_lot::Mutex<Registrar>>,
    launcher: WorkerLauncher,
    drain_timeout: Duration,
    state_tx: watch::Sender<State>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let registry = Arc::new(Registry::new());
        let registrar = Arc::new(parking_lot::Mutex::new(Registrar::new(registry.clone())));
        let (state_tx, _) = watch::channel(State::Created);
        let session = Self {
            registry,
            registrar,
            launcher: options.launcher,
            drain_timeout: options.drain_timeout,
            state_tx,
            inner: Mutex::new(Inner {
                state: State::Created,
                script: options.script,
                next_run_no: options.run_no_start,
                active: None,
                result: None,
            }),
        };
        if let Err(e) = session.registry.state.publish((), State::Created) {
            warn!(error = %e, "state publish failed");
        }
        session
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    /// Watch mirror of the state broker, for callers that want
    /// borrow-latest semantics instead of a subscription stream.
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Compose the first run from the configured script.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state != State::Created {
            return Err(invalid("initialize", inner.state));
        }
        self.compose(&mut inner);
        Ok(())
    }

    /// Discard the pending run and compose a fresh one, optionally with a
    /// new script or a pinned run number. Returns whether the options
    /// changed the pending configuration.
    pub async fn reset(&self, options: ResetOptions) -> Result<bool, SessionError> {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, State::Initialized | State::Finished) {
            return Err(invalid("reset", inner.state));
        }
        let changed = options.script.is_some() || options.run_no_start.is_some();
        if let Some(script) = options.script {
            inner.script = script;
        }
        if let Some(run_no) = options.run_no_start {
            inner.next_run_no = run_no;
        }
        inner.result = None;
        self.compose(&mut inner);
        Ok(changed)
    }

    /// Launch the worker and start the event pump. Returns as soon as the
    /// run is underway; `finish` awaits its outcome.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Initialized => {}
            state => return Err(invalid("run", state)),
        }

        let arg = RunArg {
            run_no: RunNo(inner.next_run_no),
            script: inner.script.clone(),
        };

        let (handle, worker_task) = match self.launcher {
            WorkerLauncher::InProcess => {
                let (handle, conn) = channel_pair();
                let task = tokio::spawn(async move {
                    if let Err(e) = run_worker(conn).await {
                        warn!(error = %e, "in-process worker failed");
                    }
                });
                (handle, Some(task))
            }
            WorkerLauncher::Process => (spawn_worker_process()?, None),
        };
        let RelayHandle {
            commands,
            events,
            control,
        } = handle;

        if commands.send(ToWorker::Run(arg)).is_err() {
            return Err(RelayError::Protocol("worker rejected the run argument".into()).into());
        }

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let pump = start_pump(events, sink_tx);
        let registrar_task = {
            let registrar = self.registrar.clone();
            tokio::spawn(async move {
                while let Some(event) = sink_rx.recv().await {
                    registrar.lock().on_event(&event);
                }
            })
        };

        self.registrar.lock().run_started();
        inner.active = Some(ActiveRun {
            commands,
            control,
            worker_task,
            pump,
            registrar_task,
        });
        self.set_state(&mut inner, State::Running);
        info!(run_no = inner.next_run_no, "run started");
        Ok(())
    }

    /// Wait for the run to end and capture its result. Idempotent while
    /// finished; concurrent callers wait on the in-flight transition.
    pub async fn finish(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Finished => return Ok(()),
            State::Running => {}
            state => return Err(invalid("finish", state)),
        }
        self.finish_locked(&mut inner).await;
        Ok(())
    }

    async fn finish_locked(&self, inner: &mut Inner) {
        let Some(active) = inner.active.take() else {
            return;
        };
        active.send(ToWorker::Eos);

        // The run itself is awaited here, unbounded: the worker winds down
        // on its own once no more input is coming, or is already gone
        // after a kill.
        if let Some(control) = &active.control {
            control.wait().await;
        }
        if let Some(task) = active.worker_task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "worker task failed");
                }
            }
        }

        // The worker has exited; only the queued tail of the outbound
        // stream is left, so the drain window is bounded.
        let outcome = join_with_drain_timeout(active.pump, self.drain_timeout).await;
        let result = match outcome.result {
            Some(result) => result,
            // No Complete from an exited worker means it died before its
            // cleanup ran.
            None => {
                debug!(clean = outcome.clean, "stream ended without a result");
                RunResult::raised(ExcInfo::process_killed())
            }
        };

        if let Err(e) = active.registrar_task.await {
            warn!(error = %e, "registrar task failed");
        }

        self.registrar.lock().run_finished(&result);
        inner.result = Some(result);
        inner.next_run_no += 1;
        self.set_state(inner, State::Finished);
        info!("run finished");
    }

    /// Close the session. From `Running` the run is finished first; the
    /// close is deferred, never lost.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Closed => return Ok(()),
            State::Running => self.finish_locked(&mut inner).await,
            State::Created | State::Initialized | State::Finished => {}
        }
        self.set_state(&mut inner, State::Closed);
        self.registry.close();
        Ok(())
    }

    /// Send an operator command to an open prompt.
    pub async fn send_command(&self, command: Command) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        let active = running(&inner)?;
        active.send(ToWorker::Command(command));
        Ok(())
    }

    /// Raise a recoverable interrupt in the script at its next
    /// interpreter check.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        running(&inner)?.send(ToWorker::Interrupt);
        Ok(())
    }

    /// Ask the worker to end the run through its own cleanup.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        running(&inner)?.send(ToWorker::Terminate);
        Ok(())
    }

    /// Kill the worker outright. The state stays `Running` until `finish`
    /// reconciles the severed stream.
    pub async fn kill(&self) -> Result<(), SessionError> {
        let inner = self.inner.lock().await;
        let active = running(&inner)?;
        match (&active.control, &active.worker_task) {
            (Some(control), _) => control.kill().await,
            (None, Some(task)) => task.abort(),
            (None, None) => {}
        }
        Ok(())
    }

    pub async fn result(&self) -> Result<Option<String>, SessionError> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.result) {
            (State::Finished, Some(result)) => Ok(result.ret.clone()),
            _ => Err(SessionError::NotFinished),
        }
    }

    pub async fn exception(&self) -> Result<Option<ExcInfo>, SessionError> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.result) {
            (State::Finished, Some(result)) => Ok(result.exc.clone()),
            _ => Err(SessionError::NotFinished),
        }
    }

    fn compose(&self, inner: &mut Inner) {
        let run_no = RunNo(inner.next_run_no);
        self.registrar
            .lock()
            .run_initialized(run_no, inner.script.clone());
        self.set_state(inner, State::Initialized);
    }

    fn set_state(&self, inner: &mut Inner, state: State) {
        inner.state = state;
        // send_replace stores the value even with no receiver alive, so
        // `state()` stays truthful before anyone watches.
        self.state_tx.send_replace(state);
        if let Err(e) = self.registry.state.publish((), state) {
            warn!(error = %e, %state, "state publish failed");
        }
    }
}

fn invalid(trigger: &'static str, state: State) -> SessionError {
    SessionError::InvalidTransition { trigger, state }
}

fn running(inner: &Inner) -> Result<&ActiveRun, SessionError> {
    match (&inner.state, &inner.active) {
        (State::Running, Some(active)) => Ok(active),
        _ => Err(SessionError::SignalOutsideRun),
    }
}
