//! Per-tenant token accounting.

use std::collections::HashMap;

/// Token counts extracted from a single completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn totals(input: u64, output: u64) -> Self {
        Self {
            input_tokens: Some(input),
            output_tokens: Some(output),
            total_tokens: Some(input + output),
        }
    }

    /// Provider-reported total, or the sum of the parts.
    pub fn total(&self) -> u64 {
        self.total_tokens.unwrap_or_else(|| {
            self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
        })
    }
}

/// Running totals for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TenantUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Accumulates [`TokenUsage`] per tenant id.
#[derive(Debug, Default)]
pub struct UsageTracker {
    totals: HashMap<String, TenantUsage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tenant: &str, usage: &TokenUsage) {
        let entry = self.totals.entry(tenant.to_string()).or_default();
        entry.input_tokens += usage.input_tokens.unwrap_or(0);
        entry.output_tokens += usage.output_tokens.unwrap_or(0);
        entry.total_tokens += usage.total();
    }

    /// Snapshot copy of a tenant's totals.
    pub fn snapshot(&self, tenant: &str) -> Option<TenantUsage> {
        self.totals.get(tenant).copied()
    }
}
