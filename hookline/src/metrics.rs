//! Built-in metrics collection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::hook::{FinallyHook, HookError};
use crate::types::CallResult;

#[derive(Debug, Default)]
struct Counters {
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    total_latency_ms: f64,
    total_tokens: u64,
    calls_by_model: BTreeMap<String, u64>,
}

/// Finally hook that aggregates per-call statistics.
///
/// Register one instance (usually in the global scope) and read it back
/// with [`summary`](Self::summary).
#[derive(Debug, Default)]
pub struct MetricsHook {
    counters: RwLock<Counters>,
}

impl MetricsHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub async fn summary(&self) -> MetricsSummary {
        let counters = self.counters.read().await;

        let (success_rate, avg_latency_ms) = if counters.total_calls > 0 {
            let total = counters.total_calls as f64;
            (
                counters.successful_calls as f64 / total,
                counters.total_latency_ms / total,
            )
        } else {
            (0.0, 0.0)
        };

        MetricsSummary {
            total_calls: counters.total_calls,
            successful_calls: counters.successful_calls,
            failed_calls: counters.failed_calls,
            success_rate,
            avg_latency_ms,
            total_tokens: counters.total_tokens,
            calls_by_model: counters.calls_by_model.clone(),
        }
    }

    /// Forget all recorded calls.
    pub async fn reset(&self) {
        *self.counters.write().await = Counters::default();
    }
}

#[async_trait]
impl FinallyHook for MetricsHook {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn finally(&self, result: &CallResult<'_>) -> Result<(), HookError> {
        let tokens = result
            .output
            .and_then(|output| output.usage_u64("total_tokens"))
            .unwrap_or(0);

        let mut counters = self.counters.write().await;
        counters.total_calls += 1;
        if result.is_success() {
            counters.successful_calls += 1;
        } else {
            counters.failed_calls += 1;
        }
        counters.total_latency_ms += result.elapsed_ms;
        counters.total_tokens += tokens;
        *counters
            .calls_by_model
            .entry(result.input.model.clone())
            .or_insert(0) += 1;

        Ok(())
    }
}

/// Aggregated call statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Fraction of calls that succeeded, 0.0 when nothing was recorded
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    /// Calls per model, keyed by the model the operation was invoked with
    pub calls_by_model: BTreeMap<String, u64>,
}
