use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use stepline_core::command::RunResult;
use stepline_core::events::Event;

use crate::wire::FromWorker;

/// What the pump observed by the time the outbound stream ended.
#[derive(Debug)]
pub struct PumpOutcome {
    pub result: Option<RunResult>,
    /// True when the stream ended with the sentinel; false when the channel
    /// simply closed (worker death).
    pub clean: bool,
}

/// Controller-side pump: blocks on the outbound queue and republishes each
/// event until the end-of-stream sentinel. The pump is the only reader of
/// the outbound queue.
pub fn start_pump(
    mut events: mpsc::UnboundedReceiver<FromWorker>,
    sink: mpsc::UnboundedSender<Event>,
) -> JoinHandle<PumpOutcome> {
    tokio::spawn(async move {
        let mut result = None;
        let clean = loop {
            match events.recv().await {
                Some(FromWorker::Event(event)) => {
                    if sink.send(event).is_err() {
                        debug!("event sink closed; events discarded");
                    }
                }
                Some(FromWorker::Complete(r)) => result = Some(r),
                Some(FromWorker::Eos) => break true,
                None => {
                    debug!("outbound queue closed without sentinel");
                    break false;
                }
            }
        };
        PumpOutcome { result, clean }
    })
}

/// Join the pump, giving the worker a bounded window to drain. A timeout is
/// a warning, not an error — the worker may have been forcibly killed.
pub async fn join_with_drain_timeout(
    mut pump: JoinHandle<PumpOutcome>,
    drain: Duration,
) -> PumpOutcome {
    match tokio::time::timeout(drain, &mut pump).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(error = %e, "pump task failed");
            PumpOutcome {
                result: None,
                clean: false,
            }
        }
        Err(_) => {
            warn!(?drain, "outbound queue did not drain in time");
            pump.abort();
            PumpOutcome {
                result: None,
                clean: false,
            }
        }
    }
}
