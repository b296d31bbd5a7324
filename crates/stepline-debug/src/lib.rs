pub mod adapter;
pub mod gate;
pub mod stepper;

pub use adapter::{AdapterState, CallRegion, DebugAdapter, EventSink, TraceIdentity};
pub use gate::PromptGate;
pub use stepper::{StepMode, Stepper};
