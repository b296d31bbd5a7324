use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use stepline_core::command::{Command, Script};
use stepline_core::ids::TraceNo;
use stepline_core::info::{InfoState, PromptInfo};
use stepline_session::{Registry, Session, SessionOptions, WorkerLauncher};
use stepline_telemetry::{init_logging, TelemetryConfig};

#[derive(Parser)]
#[command(name = "stepline", about = "Step through a script, one line at a time")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a script under the interactive controller.
    Run {
        /// Path to the script file.
        script: PathBuf,
        /// Keep the worker inside this process instead of forking a child.
        #[arg(long)]
        in_process: bool,
    },
    /// Worker process entry. Spawned by the controller; stdio carries the
    /// relay stream.
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(TelemetryConfig::default());

    match cli.command {
        Cmd::Worker => stepline_relay::run_worker_stdio().await?,
        Cmd::Run { script, in_process } => run_controller(script, in_process).await?,
    }
    Ok(())
}

async fn run_controller(path: PathBuf, in_process: bool) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("script")
        .to_string();

    let mut options = SessionOptions::new(Script::new(name, source));
    options.launcher = if in_process {
        WorkerLauncher::InProcess
    } else {
        WorkerLauncher::Process
    };
    let session = Arc::new(Session::new(options));
    let registry = session.registry();

    session.initialize().await?;

    let printer = {
        let mut sub = registry.stdout.subscribe((), false);
        tokio::spawn(async move {
            while let Some(text) = sub.next().await {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        })
    };

    let open_prompts: Arc<Mutex<BTreeMap<TraceNo, PromptInfo>>> =
        Arc::new(Mutex::new(BTreeMap::new()));
    let prompt_watcher = tokio::spawn(watch_prompts(registry.clone(), open_prompts.clone()));
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
    let completion_watcher = tokio::spawn(watch_completion(registry.clone(), done_tx));

    session.run().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = &mut done_rx => break,
            line = lines.next_line(), if stdin_open => match line? {
                // Closed stdin means no more commands can ever arrive;
                // unwind the run instead of leaving prompts parked.
                None => {
                    stdin_open = false;
                    signal(&session.terminate().await);
                }
                Some(line) => {
                    if dispatch(&session, &open_prompts, line.trim()).await {
                        break;
                    }
                }
            },
        }
    }

    session.finish().await?;
    match session.exception().await? {
        Some(exc) => println!("run raised {}: {}", exc.kind, exc.message),
        None => println!(
            "run returned {}",
            session.result().await?.unwrap_or_else(|| "None".into())
        ),
    }
    session.close().await?;

    printer.abort();
    prompt_watcher.abort();
    completion_watcher.abort();
    Ok(())
}

/// One operator line. Returns true when the control loop should stop.
async fn dispatch(
    session: &Session,
    open_prompts: &Mutex<BTreeMap<TraceNo, PromptInfo>>,
    line: &str,
) -> bool {
    match line {
        "" => return false,
        "traces" => {
            let open = open_prompts.lock();
            if open.is_empty() {
                println!("no open prompts");
            }
            for (trace_no, p) in open.iter() {
                println!("[trace {trace_no}] paused at {}:{}", p.file, p.line);
            }
            return false;
        }
        "interrupt" => {
            signal(&session.interrupt().await);
            return false;
        }
        "terminate" | "quit" => {
            signal(&session.terminate().await);
            return false;
        }
        "kill" => {
            signal(&session.kill().await);
            return true;
        }
        _ => {}
    }

    // "<trace> <command>" addresses one prompt; a bare command is
    // unambiguous only while a single prompt is open.
    let (target, text) = match line.split_once(' ') {
        Some((first, rest)) => match first.parse::<u64>() {
            Ok(n) => (Some(TraceNo(n)), rest.trim()),
            Err(_) => (None, line),
        },
        None => (None, line),
    };

    let prompt = {
        let open = open_prompts.lock();
        match target {
            Some(trace_no) => open.get(&trace_no).cloned(),
            None if open.len() == 1 => open.values().next().cloned(),
            None if open.is_empty() => None,
            None => {
                println!(
                    "{} prompts open; prefix the command with a trace number",
                    open.len()
                );
                return false;
            }
        }
    };
    match prompt {
        Some(p) => signal(
            &session
                .send_command(Command::new(p.trace_no, p.prompt_no, text))
                .await,
        ),
        None => println!("no prompt is waiting for '{text}'"),
    }
    false
}

fn signal<E: std::fmt::Display>(result: &Result<(), E>) {
    if let Err(e) = result {
        warn!(error = %e, "trigger rejected");
    }
}

/// Announces every prompt as it opens and keeps the open-prompt table
/// current. One subscription task per trace, started as traces appear.
async fn watch_prompts(
    registry: Arc<Registry>,
    open_prompts: Arc<Mutex<BTreeMap<TraceNo, PromptInfo>>>,
) {
    let mut traces = registry.trace_info.subscribe((), true);
    let mut seen: HashSet<TraceNo> = HashSet::new();
    while let Some(infos) = traces.next().await {
        for info in infos {
            if !seen.insert(info.trace_no) {
                continue;
            }
            let mut sub = registry.prompt_info.subscribe(info.trace_no, true);
            let open_prompts = open_prompts.clone();
            tokio::spawn(async move {
                while let Some(p) = sub.next().await {
                    if p.open {
                        println!("[trace {}] {}:{} {}", p.trace_no, p.file, p.line, p.text);
                        open_prompts.lock().insert(p.trace_no, p);
                    } else {
                        open_prompts.lock().remove(&p.trace_no);
                    }
                }
            });
        }
    }
}

/// Fires once every trace that ever started has ended, which is how the
/// controller learns the script ran to completion.
async fn watch_completion(registry: Arc<Registry>, done: tokio::sync::oneshot::Sender<()>) {
    let mut traces = registry.trace_info.subscribe((), true);
    let mut seen_any = false;
    while let Some(infos) = traces.next().await {
        seen_any = seen_any || !infos.is_empty();
        if seen_any && infos.iter().all(|t| t.state == InfoState::Finished) {
            let _ = done.send(());
            return;
        }
    }
}
