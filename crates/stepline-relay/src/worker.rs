use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepline_core::command::{ExcInfo, RunArg, RunResult};
use stepline_core::events::Event;
use stepline_core::ids::{Counter, TaskNo, ThreadNo, TraceNo};
use stepline_debug::{DebugAdapter, EventSink, PromptGate, TraceIdentity};
use stepline_script::{parse, ContextKind, Interp};
use stepline_trace::{ContextHandler, HandlerFactory, TargetSet, TracePipeline};

use crate::transport::{RelayConn, RelayError};
use crate::wire::{FromWorker, ToWorker};

/// Glob patterns for runtime-internal frames the pipeline hides.
const EXCLUDE_MODULES: &[&str] = &["rt.*"];

/// Execute one run inside the worker. The queue pair is the only channel to
/// the controller: `RunArg` in first, then commands; events out, then
/// `Complete` and the `Eos` sentinel last.
pub async fn run_worker(conn: RelayConn) -> Result<(), RelayError> {
    let RelayConn {
        mut commands,
        events,
    } = conn;

    let arg = match commands.recv().await {
        Some(ToWorker::Run(arg)) => arg,
        Some(ToWorker::Eos) | None => {
            let _ = events.send(FromWorker::Eos);
            return Ok(());
        }
        Some(other) => {
            return Err(RelayError::Protocol(format!(
                "expected run argument, got {other:?}"
            )));
        }
    };
    info!(run_no = %arg.run_no, script = %arg.script.name, "worker starting run");

    let result = match parse(arg.script.name.clone(), &arg.script.source) {
        Ok(program) => execute(&arg, program, commands, &events).await,
        Err(e) => RunResult::raised(ExcInfo::new("ScriptError", e.to_string())),
    };

    let _ = events.send(FromWorker::Complete(result));
    let _ = events.send(FromWorker::Eos);
    Ok(())
}

async fn execute(
    arg: &RunArg,
    program: stepline_script::Program,
    commands: mpsc::UnboundedReceiver<ToWorker>,
    events: &mpsc::UnboundedSender<FromWorker>,
) -> RunResult {
    let cancel = CancellationToken::new();
    // Child of the run token: released prompts resolve with no command.
    // Cancelling the run releases them too; end of input releases only
    // the prompts and lets the script finish on its own.
    let release = cancel.child_token();
    let interrupt = Arc::new(AtomicBool::new(false));
    let gates: Arc<DashMap<TraceNo, Arc<PromptGate>>> = Arc::new(DashMap::new());

    // Adapters feed one event channel; the forwarder owns the outbound
    // ordering. Complete is sent only after this channel fully drains.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let forwarder = {
        let events = events.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if events.send(FromWorker::Event(event)).is_err() {
                    debug!("outbound queue closed — remaining events dropped");
                    break;
                }
            }
        })
    };

    let factory = adapter_factory(
        arg.run_no,
        EventSink::new(event_tx),
        gates.clone(),
        release.clone(),
    );
    let pipeline = match TracePipeline::builder()
        .exclude_modules(EXCLUDE_MODULES)
        .targets(TargetSet::seeded(program.name.clone()))
        .build(factory)
    {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            forwarder.abort();
            return RunResult::raised(ExcInfo::new("PipelineError", e.to_string()));
        }
    };

    let router = {
        let gates = gates.clone();
        let cancel = cancel.clone();
        let release = release.clone();
        let interrupt = interrupt.clone();
        let mut inbound = commands;
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Some(ToWorker::Command(cmd)) => match gates.get(&cmd.trace_no) {
                        Some(gate) => {
                            if let Err(e) = gate.resolve(cmd.prompt_no, cmd.text.clone()) {
                                warn!(error = %e, "command discarded; prompt keeps waiting");
                            }
                        }
                        None => warn!(trace_no = %cmd.trace_no, "command for unknown trace"),
                    },
                    Some(ToWorker::Interrupt) => {
                        info!("interrupt latched; delivered at next interpreter check");
                        interrupt.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    Some(ToWorker::Terminate) => {
                        info!("terminate received; cancelling run");
                        cancel.cancel();
                    }
                    Some(ToWorker::Run(_)) => {
                        warn!("second run argument ignored; one live run per session");
                    }
                    Some(ToWorker::Eos) | None => {
                        debug!("input ended; releasing parked prompts");
                        release.cancel();
                        break;
                    }
                }
            }
        })
    };

    let interp = Interp::new(
        program,
        pipeline.clone() as Arc<dyn stepline_script::TraceHook>,
        cancel.clone(),
        interrupt,
    );

    let outcome = interp.run().await;
    let children = interp.join_children().await;
    for child in &children {
        if let Err(exc) = &child.result {
            // Matches thread semantics: a child fault does not fail the run.
            warn!(context = %child.context.id, %exc, "spawned context raised");
        }
    }

    // Release the event channel so the forwarder can drain and stop.
    drop(interp);
    drop(pipeline);
    if let Err(e) = forwarder.await {
        warn!(error = %e, "event forwarder failed");
    }
    router.abort();
    for gate in gates.iter() {
        gate.close();
    }

    match outcome.result {
        Ok(()) => RunResult::returned("None"),
        Err(exc) => RunResult::raised(ExcInfo::new(exc.kind, exc.message)),
    }
}

/// Builds per-context debug adapters, issuing trace/thread/task numbers in
/// context-start order and registering each context's prompt gate for the
/// command router.
fn adapter_factory(
    run_no: stepline_core::ids::RunNo,
    sink: EventSink,
    gates: Arc<DashMap<TraceNo, Arc<PromptGate>>>,
    release: CancellationToken,
) -> HandlerFactory {
    let trace_counter = Arc::new(Counter::new(1));
    let thread_counter = Arc::new(Counter::new(1));
    let task_counter = Arc::new(Counter::new(1));
    let prompt_counter = Arc::new(Counter::new(1));

    Arc::new(move |context| {
        let trace_no = TraceNo(trace_counter.next());
        let (thread_no, task_no) = match context.kind {
            ContextKind::Thread => (ThreadNo(thread_counter.next()), None),
            // Tasks share the scheduler thread of the main context.
            ContextKind::Task => (ThreadNo(1), Some(TaskNo(task_counter.next()))),
        };
        let gate = Arc::new(PromptGate::new(trace_no));
        gates.insert(trace_no, gate.clone());

        let adapter = DebugAdapter::new(
            TraceIdentity {
                run_no,
                trace_no,
                thread_no,
                task_no,
            },
            sink.clone(),
            gate,
            prompt_counter.clone(),
            release.clone(),
        );
        Arc::new(adapter) as Arc<dyn ContextHandler>
    })
}

/// Worker process entry: bridge the queue pair over real stdio. Stdout is
/// reserved for the outbound stream; logs must go to stderr.
pub async fn run_worker_stdio() -> Result<(), RelayError> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ToWorker>();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<FromWorker>();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ToWorker>(&line) {
                Ok(msg) => {
                    if cmd_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, line, "undecodable controller message"),
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = evt_rx.recv().await {
            let mut line = match serde_json::to_string(&msg) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound message");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let result = run_worker(RelayConn {
        commands: cmd_rx,
        events: evt_tx,
    })
    .await;

    // run_worker dropped its sender; drain the writer before exiting so the
    // sentinel reaches the controller.
    let _ = writer.await;
    reader.abort();
    result
}
