use std::collections::HashMap;
use std::time::Instant;

/// Per-stage sink for timing and throughput events emitted by a worker.
///
/// Decouples the worker loop from how those events are reported, so the CLI
/// can print summaries while tests and embedders discard them.
pub trait PipelineLogger: Send {
    /// A record was transformed and handed downstream.
    fn frame_processed(&mut self, frame_index: usize);

    /// How long a named phase took for one record.
    fn timing(&mut self, phase: &str, duration_ms: f64);

    /// A point-in-time metric (e.g. backpressure retries, dropped records).
    fn metric(&mut self, name: &str, value: f64);

    fn info(&mut self, message: &str);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn frame_processed(&mut self, _frame_index: usize) {}
    fn timing(&mut self, _phase: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn info(&mut self, _message: &str) {}
}

/// Aggregates one stage's timings and metrics and logs a summary when the
/// worker exits. Throughput lines are throttled to every `throttle_frames`.
pub struct StdoutPipelineLogger {
    stage: String,
    throttle_frames: usize,
    timings: HashMap<String, Vec<f64>>,
    metrics: HashMap<String, Vec<f64>>,
    start_time: Instant,
    frames: usize,
    messages: Vec<String>,
}

impl StdoutPipelineLogger {
    pub fn new(stage: &str, throttle_frames: usize) -> Self {
        Self {
            stage: stage.to_string(),
            throttle_frames: throttle_frames.max(1),
            timings: HashMap::new(),
            metrics: HashMap::new(),
            start_time: Instant::now(),
            frames: 0,
            messages: Vec::new(),
        }
    }

    /// Returns the formatted summary, or `None` if nothing was recorded.
    pub fn summary_string(&self) -> Option<String> {
        if self.timings.is_empty() && self.metrics.is_empty() {
            return None;
        }

        let elapsed_s = self.start_time.elapsed().as_secs_f64();
        let mut lines = vec![format!(
            "Stage {} summary ({} frames, {elapsed_s:.1}s):",
            self.stage, self.frames
        )];

        let mut phases: Vec<_> = self.timings.keys().collect();
        phases.sort();
        for phase in phases {
            let durations = &self.timings[phase];
            let total_ms: f64 = durations.iter().sum();
            let avg_ms = average(durations);
            let max_ms = durations.iter().copied().fold(0.0, f64::max);
            lines.push(format!(
                "  {phase:12}: avg {avg_ms:6.1}ms  max {max_ms:6.1}ms  total {total_ms:7.0}ms"
            ));
        }

        let mut names: Vec<_> = self.metrics.keys().collect();
        names.sort();
        for name in names {
            let values = &self.metrics[name];
            let sum: f64 = values.iter().sum();
            lines.push(format!("  {name}: total {sum:.0}, avg {:.1}", average(values)));
        }

        if self.frames > 0 && elapsed_s > 0.0 {
            lines.push(format!(
                "  Throughput: {:.1} fps",
                self.frames as f64 / elapsed_s
            ));
        }

        Some(lines.join("\n"))
    }

    pub fn timings_for(&self, phase: &str) -> Option<&[f64]> {
        self.timings.get(phase).map(|v| v.as_slice())
    }

    pub fn metrics_for(&self, name: &str) -> Option<&[f64]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

impl PipelineLogger for StdoutPipelineLogger {
    fn frame_processed(&mut self, frame_index: usize) {
        self.frames += 1;
        if self.frames % self.throttle_frames == 0 {
            log::debug!(
                "{}: {} frames processed (last frame #{frame_index})",
                self.stage,
                self.frames
            );
        }
    }

    fn timing(&mut self, phase: &str, duration_ms: f64) {
        self.timings
            .entry(phase.to_string())
            .or_default()
            .push(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn info(&mut self, message: &str) {
        self.messages.push(message.to_string());
        log::info!("{}: {message}", self.stage);
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n{text}");
        }
    }
}
