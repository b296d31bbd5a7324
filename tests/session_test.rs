//! End-to-end controller scenarios over the in-process worker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use stepline_core::command::{Command, ExcInfo, Script};
use stepline_core::ids::{RunNo, TraceNo};
use stepline_core::info::InfoState;
use stepline_session::{Registry, ResetOptions, Session, SessionOptions, State};

fn session(source: &str) -> Arc<Session> {
    Arc::new(Session::new(SessionOptions::new(Script::new(
        "demo", source,
    ))))
}

/// Answers every prompt in every trace with the same command, for scripts
/// that should run to completion unattended.
fn auto_respond(session: Arc<Session>, text: &'static str) -> JoinHandle<()> {
    let registry = session.registry();
    tokio::spawn(async move {
        let mut traces = registry.trace_info.subscribe((), true);
        let mut seen: HashSet<TraceNo> = HashSet::new();
        while let Some(infos) = traces.next().await {
            for info in infos {
                if !seen.insert(info.trace_no) {
                    continue;
                }
                let mut prompts = registry.prompt_info.subscribe(info.trace_no, true);
                let session = session.clone();
                tokio::spawn(async move {
                    while let Some(p) = prompts.next().await {
                        if p.open {
                            let _ = session
                                .send_command(Command::new(p.trace_no, p.prompt_no, text))
                                .await;
                        }
                    }
                });
            }
        }
    })
}

/// Blocks until every trace that started has ended. `finish` stops command
/// routing, so a test must not call it while prompts are still pending.
async fn wait_done(registry: &Arc<Registry>) {
    let mut traces = registry.trace_info.subscribe((), true);
    let mut seen_any = false;
    while let Some(infos) = traces.next().await {
        seen_any = seen_any || !infos.is_empty();
        if seen_any && infos.iter().all(|t| t.state == InfoState::Finished) {
            return;
        }
    }
}

#[tokio::test]
async fn single_pause_script_runs_to_completion() {
    let session = session("def main\n    print hello\nend\n");
    let registry = session.registry();

    let mut states = registry.state.subscribe((), true);
    let mut stdout = registry.stdout.subscribe((), false);

    session.initialize().await.unwrap();
    session.run().await.unwrap();
    let responder = auto_respond(session.clone(), "continue");
    wait_done(&registry).await;
    session.finish().await.unwrap();

    assert_eq!(session.result().await.unwrap().as_deref(), Some("None"));
    assert_eq!(session.exception().await.unwrap(), None);
    assert_eq!(stdout.next().await.as_deref(), Some("hello\n"));

    session.close().await.unwrap();
    responder.abort();

    let mut observed = Vec::new();
    while let Some(state) = states.next().await {
        observed.push(state);
    }
    assert_eq!(
        observed,
        vec![
            State::Created,
            State::Initialized,
            State::Running,
            State::Finished,
            State::Closed,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_contexts_each_get_a_debugger() {
    let session = session(
        "def main\n    spawn_thread work\n    spawn_task work\nend\n\
         def work\n    print done\nend\n",
    );
    let registry = session.registry();
    let mut stdout = registry.stdout.subscribe((), false);

    session.initialize().await.unwrap();
    session.run().await.unwrap();
    let responder = auto_respond(session.clone(), "continue");
    wait_done(&registry).await;
    session.finish().await.unwrap();
    responder.abort();

    let traces = registry.trace_info.latest(&()).unwrap();
    assert_eq!(traces.len(), 3, "main, thread, and task each trace");
    assert!(traces.iter().all(|t| t.state == InfoState::Finished));
    // One trace per spawned kind: exactly one carries a task number and
    // exactly one runs on a second thread.
    assert_eq!(traces.iter().filter(|t| t.task_no.is_some()).count(), 1);
    assert_eq!(
        traces
            .iter()
            .map(|t| t.thread_no)
            .collect::<HashSet<_>>()
            .len(),
        2
    );

    for _ in 0..2 {
        assert_eq!(stdout.next().await.as_deref(), Some("done\n"));
    }
}

#[tokio::test]
async fn kill_mid_run_reconciles_the_stream() {
    let mut options = SessionOptions::new(Script::new(
        "demo",
        "def main\n    sleep 60000\nend\n",
    ));
    options.drain_timeout = Duration::from_millis(500);
    let session = Arc::new(Session::new(options));
    let registry = session.registry();

    session.initialize().await.unwrap();
    let mut prompts = registry.prompt_info.subscribe(TraceNo(1), false);
    session.run().await.unwrap();

    let prompt = prompts.next().await.unwrap();
    session
        .send_command(Command::new(prompt.trace_no, prompt.prompt_no, "continue"))
        .await
        .unwrap();

    // The script is parked in its sleep when the worker dies.
    session.kill().await.unwrap();
    session.finish().await.unwrap();

    let exc = session.exception().await.unwrap().unwrap();
    assert_eq!(exc.kind, ExcInfo::PROCESS_KILLED);

    let traces = registry.trace_info.latest(&()).unwrap();
    assert!(!traces.is_empty());
    assert!(
        traces.iter().all(|t| t.state == InfoState::Finished),
        "every started trace is force-closed"
    );
}

#[tokio::test]
async fn reset_supports_a_second_run() {
    let session = session("def main\n    pass\nend\n");
    let registry = session.registry();

    session.initialize().await.unwrap();
    session.run().await.unwrap();
    let responder = auto_respond(session.clone(), "continue");
    wait_done(&registry).await;
    session.finish().await.unwrap();
    responder.abort();

    session
        .reset(ResetOptions {
            script: Some(Script::new("demo", "def main\n    print again\nend\n")),
            run_no_start: None,
        })
        .await
        .unwrap();
    let run = registry.run_info.latest(&()).unwrap();
    assert_eq!(run.run_no, RunNo(2));
    assert_eq!(run.state, InfoState::Initialized);

    let mut stdout = registry.stdout.subscribe((), false);
    session.run().await.unwrap();
    let responder = auto_respond(session.clone(), "continue");
    wait_done(&registry).await;
    session.finish().await.unwrap();
    responder.abort();

    assert_eq!(stdout.next().await.as_deref(), Some("again\n"));
    assert_eq!(session.result().await.unwrap().as_deref(), Some("None"));
}

#[tokio::test]
async fn interrupt_surfaces_as_a_script_exception() {
    // Interrupt lands between statements, so the script needs more than
    // one for the flag to be seen before the run ends.
    let body = "    sleep 200\n".repeat(20);
    let session = session(&format!("def main\n{body}end\n"));
    let registry = session.registry();

    session.initialize().await.unwrap();
    let mut prompts = registry.prompt_info.subscribe(TraceNo(1), false);
    session.run().await.unwrap();

    let prompt = prompts.next().await.unwrap();
    session
        .send_command(Command::new(prompt.trace_no, prompt.prompt_no, "continue"))
        .await
        .unwrap();
    session.interrupt().await.unwrap();

    wait_done(&registry).await;
    session.finish().await.unwrap();
    let exc = session.exception().await.unwrap().unwrap();
    assert_eq!(exc.kind, ExcInfo::INTERRUPTED);
}
