use std::time::Duration;

/// Polling delay tiers: `(last iteration of the tier, delay)`.
///
/// Iterations past the last tier use `ceiling`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffSchedule {
    pub tiers: Vec<(usize, Duration)>,
    pub ceiling: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                (3, Duration::from_millis(200)),
                (10, Duration::from_millis(300)),
                (20, Duration::from_millis(500)),
            ],
            ceiling: Duration::from_millis(1_000),
        }
    }
}

impl BackoffSchedule {
    /// Constant delay, mostly for tests.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            tiers: Vec::new(),
            ceiling: delay,
        }
    }

    /// Delay after the 1-based poll `iteration`.
    pub fn delay_for(&self, iteration: usize) -> Duration {
        self.tiers
            .iter()
            .find(|(last, _)| iteration <= *last)
            .map(|(_, delay)| *delay)
            .unwrap_or(self.ceiling)
    }
}

/// Runtime configuration for the run completion poller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollerConfig {
    pub max_iterations: usize,
    pub backoff: BackoffSchedule,
    pub message_page_size: usize,
    pub parallel_tool_calls: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 120,
            backoff: BackoffSchedule::default(),
            message_page_size: 20,
            parallel_tool_calls: true,
        }
    }
}
