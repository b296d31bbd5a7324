use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashSet;
use glob::Pattern;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use stepline_core::ids::ContextId;
use stepline_script::FrameEvent;

use crate::filter::{TraceFilter, Verdict};

/// Module names tracing "arms" on, shared between `FirstModuleSelect` and
/// `FirstModuleAdd`. Seeded with the script's own module name.
#[derive(Clone, Default)]
pub struct TargetSet {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl TargetSet {
    pub fn seeded(module: impl Into<String>) -> Self {
        let set = Self::default();
        set.insert(module.into());
        set
    }

    pub fn insert(&self, module: String) {
        self.inner.write().insert(module);
    }

    pub fn contains(&self, module: &str) -> bool {
        self.inner.read().contains(module)
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.inner.read().clone()
    }
}

/// Rejects events whose frame module glob-matches an exclusion pattern.
/// Runs on every event, so module→verdict lookups are memoized.
pub struct PatternSkip {
    patterns: Vec<Pattern>,
    memo: Mutex<HashMap<String, bool>>,
}

impl PatternSkip {
    pub fn new(patterns: &[&str]) -> Result<Self, glob::PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            memo: Mutex::new(HashMap::new()),
        })
    }

    fn is_excluded(&self, module: &str) -> bool {
        if let Some(&hit) = self.memo.lock().get(module) {
            return hit;
        }
        let hit = self.patterns.iter().any(|p| p.matches(module));
        self.memo.lock().insert(module.to_string(), hit);
        hit
    }
}

impl TraceFilter for PatternSkip {
    fn name(&self) -> &'static str {
        "pattern_skip"
    }

    fn decide(&self, event: &FrameEvent) -> Verdict {
        if self.is_excluded(&event.frame.module) {
            Verdict::Reject
        } else {
            Verdict::Forward
        }
    }
}

/// Rejects synthetic frames (code name wrapped in angle brackets): nothing
/// worth pausing on.
pub struct SyntheticSkip;

impl TraceFilter for SyntheticSkip {
    fn name(&self) -> &'static str {
        "synthetic_skip"
    }

    fn decide(&self, event: &FrameEvent) -> Verdict {
        if event.frame.is_synthetic() {
            Verdict::Reject
        } else {
            Verdict::Forward
        }
    }
}

/// Per context: reject everything until a frame's module is in the target
/// set; from then on the context is armed for its remaining lifetime.
pub struct FirstModuleSelect {
    targets: TargetSet,
    armed: DashSet<ContextId>,
}

impl FirstModuleSelect {
    pub fn new(targets: TargetSet) -> Self {
        Self {
            targets,
            armed: DashSet::new(),
        }
    }
}

impl TraceFilter for FirstModuleSelect {
    fn name(&self) -> &'static str {
        "first_module_select"
    }

    fn decide(&self, event: &FrameEvent) -> Verdict {
        let id = event.context.id;
        if self.armed.contains(&id) {
            return Verdict::Forward;
        }
        if self.targets.contains(&event.frame.module) {
            debug!(context = %id, module = %event.frame.module, "context armed");
            self.armed.insert(id);
            return Verdict::Forward;
        }
        Verdict::Reject
    }
}

/// Records each context's first resolvable module into the shared target
/// set, so contexts started afterward are traced from their first user-code
/// frame.
pub struct FirstModuleAdd {
    targets: TargetSet,
    seen: DashSet<ContextId>,
}

impl FirstModuleAdd {
    pub fn new(targets: TargetSet) -> Self {
        Self {
            targets,
            seen: DashSet::new(),
        }
    }
}

impl TraceFilter for FirstModuleAdd {
    fn name(&self) -> &'static str {
        "first_module_add"
    }

    fn decide(&self, event: &FrameEvent) -> Verdict {
        let id = event.context.id;
        if !self.seen.contains(&id) && !event.frame.module.is_empty() {
            self.seen.insert(id);
            self.targets.insert(event.frame.module.clone());
        }
        Verdict::Forward
    }
}
