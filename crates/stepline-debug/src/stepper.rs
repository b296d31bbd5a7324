use stepline_core::events::EventKind;

/// What the embedded debugger is currently doing between pauses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    /// Pause at every notification, entering calls.
    Step,
    /// Pause at the next notification at or above the given depth.
    Next { depth: usize },
    /// Pause once the frame at the given depth returns.
    Return { depth: usize },
    /// Run to the end of the context. No breakpoints exist, so this never
    /// pauses again.
    Continue,
}

/// The embedded line debugger's stepping logic for one context. Tracks the
/// open-frame depth from Call/Return notifications and decides, per event,
/// whether the context pauses. The first traced event always pauses.
#[derive(Debug)]
pub struct Stepper {
    mode: StepMode,
    depth: usize,
    started: bool,
}

impl Stepper {
    pub fn new() -> Self {
        Self {
            mode: StepMode::Step,
            depth: 0,
            started: false,
        }
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    /// Current number of open frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Set the mode for the current depth from a debugger command. Returns
    /// false for commands the stepper does not recognize.
    pub fn command(&mut self, command: &str) -> bool {
        self.mode = match command {
            "step" => StepMode::Step,
            "next" => StepMode::Next { depth: self.depth },
            "return" => StepMode::Return { depth: self.depth },
            "continue" => StepMode::Continue,
            _ => return false,
        };
        true
    }

    /// Observe one notification; true means the context pauses on it.
    pub fn observe(&mut self, kind: EventKind) -> bool {
        if kind == EventKind::Call {
            self.depth += 1;
        }

        let mut pause = match self.mode {
            StepMode::Step => true,
            StepMode::Next { depth } => self.depth <= depth,
            StepMode::Return { depth } => {
                (kind == EventKind::Return && self.depth == depth) || self.depth < depth
            }
            StepMode::Continue => false,
        };
        if !self.started {
            self.started = true;
            pause = true;
        }

        if kind == EventKind::Return {
            self.depth = self.depth.saturating_sub(1);
        }
        pause
    }
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}
