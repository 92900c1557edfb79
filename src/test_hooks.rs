use std::time::Duration;

/// Deterministic hook used to alter cursor behavior during tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestHook {
    /// Sleep before each blocking wait on the event source.
    InjectAwaitDelay { delay_ms: u64 },
    /// Behave as if high-water marks were unavailable for the session.
    SuppressHighWaterMarks,
    /// Answer every resume attempt with a lost-history error.
    ForceHistoryLost,
}

/// Registry of active hooks used by integration tests and the harness.
#[derive(Debug, Default, Clone)]
pub struct TestHookRegistry {
    hooks: Vec<TestHook>,
}

impl TestHookRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Registers a new hook.
    pub fn register(&mut self, hook: TestHook) {
        self.hooks.push(hook);
    }

    /// Returns all hooks in deterministic order.
    pub fn hooks(&self) -> &[TestHook] {
        &self.hooks
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Returns the delay to inject before awaiting new entries, if any.
    pub fn await_delay(&self) -> Option<Duration> {
        self.hooks.iter().find_map(|hook| match hook {
            TestHook::InjectAwaitDelay { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        })
    }

    /// Returns true when high-water-mark emission is disabled.
    pub fn high_water_marks_suppressed(&self) -> bool {
        self.hooks
            .iter()
            .any(|hook| matches!(hook, TestHook::SuppressHighWaterMarks))
    }

    /// Returns true when resume attempts must report lost history.
    pub fn force_history_lost(&self) -> bool {
        self.hooks
            .iter()
            .any(|hook| matches!(hook, TestHook::ForceHistoryLost))
    }
}
