pub mod frame;
pub mod interp;
pub mod program;

pub use frame::{ContextKind, ContextRef, Frame, FrameEvent, TraceHook};
pub use interp::{ContextOutcome, Interp, ScriptExc};
pub use program::{parse, Program, ScriptError, Stmt};
