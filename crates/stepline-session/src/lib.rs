pub mod broker;
pub mod machine;
pub mod registrar;

pub use broker::{Broker, BrokerError, Subscription};
pub use machine::{ResetOptions, Session, SessionError, SessionOptions, State, WorkerLauncher};
pub use registrar::{Registrar, Registry};
