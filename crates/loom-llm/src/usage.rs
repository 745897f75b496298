//! Token accounting across the polls of a single run.

use crate::types::TokenUsage;

/// Characters per token used when a provider reports no usage at all.
pub const ESTIMATED_CHARS_PER_TOKEN: u64 = 4;

/// How a provider's per-run usage figure should be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageReporting {
    /// Each reported snapshot is a delta since the previous one.
    Delta,
    /// Each reported snapshot is the run-to-date total.
    Cumulative,
}

impl TokenUsage {
    /// Deterministic estimate from character lengths, rounded up.
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        let prompt = (prompt_chars as u64).div_ceil(ESTIMATED_CHARS_PER_TOKEN);
        let completion = (completion_chars as u64).div_ceil(ESTIMATED_CHARS_PER_TOKEN);
        Self::new(prompt, completion)
    }
}

/// Sums a sequence of usage deltas.
pub fn accumulate<'a>(snapshots: impl IntoIterator<Item = &'a TokenUsage>) -> TokenUsage {
    snapshots
        .into_iter()
        .fold(TokenUsage::default(), |total, usage| total + *usage)
}

#[derive(Clone, Debug)]
pub struct TokenAccountant {
    reporting: UsageReporting,
    totals: TokenUsage,
    reported: bool,
}

impl TokenAccountant {
    pub fn new(reporting: UsageReporting) -> Self {
        Self {
            reporting,
            totals: TokenUsage::default(),
            reported: false,
        }
    }

    pub fn record(&mut self, snapshot: &TokenUsage) {
        self.reported = true;
        match self.reporting {
            UsageReporting::Delta => self.totals += *snapshot,
            UsageReporting::Cumulative => self.totals = *snapshot,
        }
    }

    pub fn has_reported(&self) -> bool {
        self.reported
    }

    pub fn totals(&self) -> TokenUsage {
        self.totals
    }

    /// Reported totals, or an estimate when the provider never reported usage.
    pub fn finish_or_estimate(&self, prompt_chars: usize, completion_chars: usize) -> TokenUsage {
        if self.reported {
            return self.totals;
        }
        TokenUsage::estimate(prompt_chars, completion_chars)
    }
}
