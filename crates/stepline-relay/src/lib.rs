pub mod pump;
pub mod transport;
pub mod wire;
pub mod worker;

pub use pump::{join_with_drain_timeout, start_pump, PumpOutcome};
pub use transport::{
    channel_pair, spawn_worker_process, ProcessControl, RelayConn, RelayError, RelayHandle,
    WORKER_SUBCOMMAND,
};
pub use wire::{FromWorker, ToWorker};
pub use worker::{run_worker, run_worker_stdio};
