pub mod filter;
pub mod filters;
pub mod pipeline;

pub use filter::{ContextHandler, TraceFilter, Verdict};
pub use filters::{FirstModuleAdd, FirstModuleSelect, PatternSkip, SyntheticSkip, TargetSet};
pub use pipeline::{HandlerFactory, TracePipeline, TracePipelineBuilder};
