//! Metrics emission boundary.
//!
//! The trainer reports named scalar loss components, the learning rate and
//! periodic patch snapshots, keyed by a monotonically increasing step
//! counter. Where they end up (log lines, files, an external tracker) is
//! the sink's business.

use ndarray::ArrayView3;

/// Receives training telemetry.
pub trait MetricsSink {
    fn scalar(&mut self, name: &str, value: f32, step: u64);

    /// A patch snapshot at the given step.
    fn snapshot(&mut self, name: &str, patch: &ArrayView3<f32>, step: u64);
}

/// Emits metrics as tracing events.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn scalar(&mut self, name: &str, value: f32, step: u64) {
        tracing::info!(target: "advpatch::metrics", step, name, value);
    }

    fn snapshot(&mut self, name: &str, patch: &ArrayView3<f32>, step: u64) {
        let n = patch.len() as f32;
        let mean = patch.iter().sum::<f32>() / n;
        let min = patch.iter().copied().fold(f32::INFINITY, f32::min);
        let max = patch.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        tracing::info!(target: "advpatch::metrics", step, name, mean, min, max);
    }
}

/// Discards everything.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn scalar(&mut self, _name: &str, _value: f32, _step: u64) {}
    fn snapshot(&mut self, _name: &str, _patch: &ArrayView3<f32>, _step: u64) {}
}

/// Records scalars in memory. Used by tests to assert on loss curves.
#[derive(Default)]
pub struct MemorySink {
    pub scalars: Vec<(String, f32, u64)>,
    pub snapshots: u64,
}

impl MetricsSink for MemorySink {
    fn scalar(&mut self, name: &str, value: f32, step: u64) {
        self.scalars.push((name.to_string(), value, step));
    }

    fn snapshot(&mut self, _name: &str, _patch: &ArrayView3<f32>, _step: u64) {
        self.snapshots += 1;
    }
}

impl MemorySink {
    /// All recorded values for one metric name, in emission order.
    pub fn series(&self, name: &str) -> Vec<f32> {
        self.scalars
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| *v)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_memory_sink_records_series() {
        let mut sink = MemorySink::default();
        sink.scalar("loss/total", 1.0, 0);
        sink.scalar("loss/det", 0.5, 0);
        sink.scalar("loss/total", 0.8, 15);
        assert_eq!(sink.series("loss/total"), vec![1.0, 0.8]);
        assert_eq!(sink.series("loss/det"), vec![0.5]);

        let patch = Array3::from_elem((3, 2, 2), 0.5);
        sink.snapshot("patch", &patch.view(), 15);
        assert_eq!(sink.snapshots, 1);
    }
}
