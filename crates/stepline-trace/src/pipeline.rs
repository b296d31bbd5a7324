use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use stepline_core::ids::ContextId;
use stepline_script::{ContextRef, FrameEvent, TraceHook};

use crate::filter::{ContextHandler, TraceFilter, Verdict};
use crate::filters::{FirstModuleAdd, FirstModuleSelect, PatternSkip, SyntheticSkip, TargetSet};

/// Produces the private handler for a newly traced context.
pub type HandlerFactory = Arc<dyn Fn(ContextRef) -> Arc<dyn ContextHandler> + Send + Sync>;

/// The process-wide trace hook: a fixed chain of filters in front of a
/// per-context dispatch arena. Skips run before dispatch, so rejected
/// events never pay for handler creation. One instance per run, owned by
/// the worker.
pub struct TracePipeline {
    filters: Vec<Box<dyn TraceFilter>>,
    factory: HandlerFactory,
    handlers: DashMap<ContextId, Arc<dyn ContextHandler>>,
}

impl TracePipeline {
    pub fn builder() -> TracePipelineBuilder {
        TracePipelineBuilder::default()
    }

    /// Number of contexts currently holding a handler.
    pub fn live_contexts(&self) -> usize {
        self.handlers.len()
    }

    fn accepted(&self, event: &FrameEvent) -> bool {
        for filter in &self.filters {
            if filter.decide(event) == Verdict::Reject {
                trace!(
                    filter = filter.name(),
                    context = %event.context.id,
                    module = %event.frame.module,
                    "event rejected"
                );
                return false;
            }
        }
        true
    }

    /// At most one handler ever exists per context; the entry lives until
    /// the context ends.
    fn handler_for(&self, context: ContextRef) -> Arc<dyn ContextHandler> {
        self.handlers
            .entry(context.id)
            .or_insert_with(|| {
                debug!(context = %context.id, "creating context handler");
                (self.factory)(context)
            })
            .clone()
    }
}

#[async_trait]
impl TraceHook for TracePipeline {
    async fn on_event(&self, event: &FrameEvent) {
        if !self.accepted(event) {
            return;
        }
        let handler = self.handler_for(event.context);
        handler.handle(event).await;
    }

    async fn on_stdout(&self, context: ContextRef, text: String) {
        // Output from untraced contexts has no trace to attribute it to.
        let handler = self.handlers.get(&context.id).map(|h| h.value().clone());
        match handler {
            Some(handler) => handler.stdout(text).await,
            None => debug!(context = %context.id, "stdout from untraced context dropped"),
        }
    }

    async fn on_context_end(&self, context: ContextRef) {
        if let Some((_, handler)) = self.handlers.remove(&context.id) {
            handler.end(context).await;
        }
    }
}

/// Assembles the pipeline in its one valid order: pattern skip, synthetic
/// skip, first-module select, first-module add, dispatch.
#[derive(Default)]
pub struct TracePipelineBuilder {
    exclude: Vec<String>,
    targets: Option<TargetSet>,
}

impl TracePipelineBuilder {
    /// Glob patterns for modules to hide (runtime internals).
    pub fn exclude_modules(mut self, patterns: &[&str]) -> Self {
        self.exclude = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    /// The shared target set tracing arms on.
    pub fn targets(mut self, targets: TargetSet) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn build(self, factory: HandlerFactory) -> Result<TracePipeline, glob::PatternError> {
        let patterns: Vec<&str> = self.exclude.iter().map(String::as_str).collect();
        let targets = self.targets.unwrap_or_default();

        let filters: Vec<Box<dyn TraceFilter>> = vec![
            Box::new(PatternSkip::new(&patterns)?),
            Box::new(SyntheticSkip),
            Box::new(FirstModuleSelect::new(targets.clone())),
            Box::new(FirstModuleAdd::new(targets)),
        ];

        Ok(TracePipeline {
            filters,
            factory,
            handlers: DashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use stepline_core::events::EventKind;
    use stepline_script::{ContextKind, Frame};

    #[derive(Default)]
    struct Spy {
        handled: Mutex<Vec<(ContextId, u32)>>,
        stdout: Mutex<Vec<String>>,
        ended: Mutex<Vec<ContextId>>,
    }

    struct SpyHandler {
        context: ContextRef,
        spy: Arc<Spy>,
    }

    #[async_trait]
    impl ContextHandler for SpyHandler {
        async fn handle(&self, event: &FrameEvent) {
            self.spy
                .handled
                .lock()
                .push((self.context.id, event.frame.line));
        }

        async fn stdout(&self, text: String) {
            self.spy.stdout.lock().push(text);
        }

        async fn end(&self, context: ContextRef) {
            self.spy.ended.lock().push(context.id);
        }
    }

    fn pipeline(spy: Arc<Spy>) -> TracePipeline {
        let factory: HandlerFactory = Arc::new(move |context| {
            Arc::new(SpyHandler {
                context,
                spy: spy.clone(),
            }) as Arc<dyn ContextHandler>
        });
        TracePipeline::builder()
            .exclude_modules(&["rt.*"])
            .targets(TargetSet::seeded("demo"))
            .build(factory)
            .unwrap()
    }

    fn event(context_id: u64, module: &str, func: &str, line: u32) -> FrameEvent {
        FrameEvent {
            context: ContextRef {
                id: ContextId(context_id),
                kind: ContextKind::Thread,
            },
            kind: EventKind::Line,
            frame: Frame {
                frame_id: 1,
                func: func.into(),
                module: module.into(),
                file: module.into(),
                line,
            },
        }
    }

    #[tokio::test]
    async fn rejected_events_create_no_handler() {
        let spy = Arc::new(Spy::default());
        let p = pipeline(spy.clone());

        p.on_event(&event(1, "rt.thread", "<spawn>", 0)).await;
        p.on_event(&event(1, "other", "f", 1)).await;

        assert_eq!(p.live_contexts(), 0);
        assert!(spy.handled.lock().is_empty());
    }

    #[tokio::test]
    async fn accepted_events_reach_one_handler_per_context() {
        let spy = Arc::new(Spy::default());
        let p = pipeline(spy.clone());

        p.on_event(&event(1, "demo", "main", 1)).await;
        p.on_event(&event(1, "demo", "main", 2)).await;
        p.on_event(&event(2, "demo", "work", 5)).await;

        assert_eq!(p.live_contexts(), 2);
        assert_eq!(
            spy.handled.lock().as_slice(),
            [(ContextId(1), 1), (ContextId(1), 2), (ContextId(2), 5)]
        );
    }

    #[tokio::test]
    async fn context_end_removes_arena_entry() {
        let spy = Arc::new(Spy::default());
        let p = pipeline(spy.clone());
        let ctx = ContextRef {
            id: ContextId(1),
            kind: ContextKind::Thread,
        };

        p.on_event(&event(1, "demo", "main", 1)).await;
        assert_eq!(p.live_contexts(), 1);

        p.on_context_end(ctx).await;
        assert_eq!(p.live_contexts(), 0);
        assert_eq!(spy.ended.lock().as_slice(), [ContextId(1)]);

        // Ending an unknown context is a no-op.
        p.on_context_end(ctx).await;
        assert_eq!(spy.ended.lock().len(), 1);
    }

    #[tokio::test]
    async fn stdout_routes_to_traced_contexts_only() {
        let spy = Arc::new(Spy::default());
        let p = pipeline(spy.clone());
        let ctx = ContextRef {
            id: ContextId(1),
            kind: ContextKind::Thread,
        };

        p.on_stdout(ctx, "early\n".into()).await;
        p.on_event(&event(1, "demo", "main", 1)).await;
        p.on_stdout(ctx, "traced\n".into()).await;

        assert_eq!(spy.stdout.lock().as_slice(), ["traced\n"]);
    }
}
