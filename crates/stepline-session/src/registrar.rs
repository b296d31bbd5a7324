use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use stepline_core::command::{RunResult, Script};
use stepline_core::events::Event;
use stepline_core::ids::{RunNo, TraceNo};
use stepline_core::info::{PromptInfo, RunInfo, TraceInfo};

use crate::broker::Broker;
use crate::machine::State;

/// The addressable streams the broker exposes to observers. Unit-keyed
/// streams carry session-wide state; prompt state is keyed per trace.
pub struct Registry {
    pub state: Broker<(), State>,
    pub run_info: Broker<(), RunInfo>,
    pub trace_info: Broker<(), Vec<TraceInfo>>,
    pub prompt_info: Broker<TraceNo, PromptInfo>,
    pub stdout: Broker<(), String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Broker::new(),
            run_info: Broker::new(),
            trace_info: Broker::new(),
            prompt_info: Broker::new(),
            stdout: Broker::new(),
        }
    }

    pub fn close(&self) {
        self.state.close();
        self.run_info.close();
        self.trace_info.close();
        self.prompt_info.close();
        self.stdout.close();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes the relayed event stream and republishes derived, immutable
/// snapshots through the registry. Owned by the controller; the core never
/// reads the snapshots back.
pub struct Registrar {
    registry: Arc<Registry>,
    run: Option<RunInfo>,
    traces: HashMap<TraceNo, TraceInfo>,
    prompts: HashMap<TraceNo, PromptInfo>,
}

impl Registrar {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            run: None,
            traces: HashMap::new(),
            prompts: HashMap::new(),
        }
    }

    /// Number of traces with a start but no end yet.
    pub fn open_traces(&self) -> usize {
        self.traces
            .values()
            .filter(|t| t.ended_at.is_none())
            .count()
    }

    /// A fresh run was composed on `initialize`/`reset`.
    pub fn run_initialized(&mut self, run_no: RunNo, script: Script) {
        self.traces.clear();
        self.prompts.clear();
        // Trace numbers restart at 1 every run, so ended per-trace keys
        // from the previous run must become publishable again.
        self.registry.prompt_info.clear();
        // The previous run's traces no longer exist.
        self.publish_traces();
        let info = RunInfo::initialized(run_no, script);
        self.run = Some(info.clone());
        self.publish_run(info);
    }

    pub fn run_started(&mut self) {
        if let Some(info) = self.run.take() {
            let info = info.running();
            self.run = Some(info.clone());
            self.publish_run(info);
        }
    }

    pub fn on_event(&mut self, event: &Event) {
        match event {
            Event::TraceStart {
                run_no,
                trace_no,
                thread_no,
                task_no,
            } => {
                let info = TraceInfo::started(*run_no, *trace_no, *thread_no, *task_no);
                self.traces.insert(*trace_no, info);
                self.publish_traces();
            }
            Event::TraceEnd { trace_no } => {
                self.end_trace(*trace_no);
                self.publish_traces();
            }
            Event::PromptStart {
                trace_no,
                prompt_no,
                text,
                file,
                line,
                kind,
                ..
            } => {
                let run_no = self.run.as_ref().map(|r| r.run_no).unwrap_or_default();
                let info = PromptInfo::opened(
                    run_no,
                    *trace_no,
                    *prompt_no,
                    text.clone(),
                    file.clone(),
                    *line,
                    *kind,
                );
                self.prompts.insert(*trace_no, info.clone());
                self.publish_prompt(*trace_no, info);
            }
            Event::PromptEnd {
                trace_no,
                prompt_no,
                command,
            } => match self.prompts.remove(trace_no) {
                Some(info) if info.prompt_no == *prompt_no => {
                    self.publish_prompt(*trace_no, info.closed(command.clone()));
                }
                Some(info) => {
                    warn!(%trace_no, got = %prompt_no, open = %info.prompt_no, "prompt end for wrong prompt");
                    self.prompts.insert(*trace_no, info);
                }
                None => warn!(%trace_no, %prompt_no, "prompt end without open prompt"),
            },
            Event::StdoutWrite { text, .. } => {
                if let Err(e) = self.registry.stdout.publish((), text.clone()) {
                    warn!(error = %e, "stdout publish failed");
                }
            }
            // Call and cmdloop boundaries carry no derived state.
            Event::CallStart { .. }
            | Event::CallEnd { .. }
            | Event::CmdloopStart { .. }
            | Event::CmdloopEnd { .. } => {}
        }
    }

    /// The run is over. Residual open traces and prompts are force-closed
    /// here so observers always see balanced starts and ends, even when the
    /// worker was killed.
    pub fn run_finished(&mut self, result: &RunResult) {
        let open: Vec<TraceNo> = self
            .traces
            .iter()
            .filter(|(_, t)| t.ended_at.is_none())
            .map(|(no, _)| *no)
            .collect();
        for trace_no in open {
            debug!(%trace_no, "force-closing residual trace");
            self.end_trace(trace_no);
        }
        if !self.traces.is_empty() {
            self.publish_traces();
        }

        if let Some(info) = self.run.take() {
            let info = info.finished(result.ret.clone(), result.exc.clone());
            self.run = Some(info.clone());
            self.publish_run(info);
        }
    }

    fn end_trace(&mut self, trace_no: TraceNo) {
        if let Some(info) = self.traces.remove(&trace_no) {
            self.traces.insert(trace_no, info.finished());
        }
        // A trace cannot end with its prompt open unless the worker died;
        // close the straggler before ending the key.
        if let Some(prompt) = self.prompts.remove(&trace_no) {
            if prompt.open {
                self.publish_prompt(trace_no, prompt.closed(""));
            }
        }
        self.registry.prompt_info.end(&trace_no);
    }

    fn publish_run(&self, info: RunInfo) {
        if let Err(e) = self.registry.run_info.publish((), info) {
            warn!(error = %e, "run info publish failed");
        }
    }

    fn publish_traces(&self) {
        let mut infos: Vec<TraceInfo> = self.traces.values().cloned().collect();
        infos.sort_by_key(|t| t.trace_no);
        if let Err(e) = self.registry.trace_info.publish((), infos) {
            warn!(error = %e, "trace info publish failed");
        }
    }

    fn publish_prompt(&self, trace_no: TraceNo, info: PromptInfo) {
        if let Err(e) = self.registry.prompt_info.publish(trace_no, info) {
            warn!(error = %e, "prompt info publish failed");
        }
    }
}
