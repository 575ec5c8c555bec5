//! Phase weights and progress math (§4.3 "Pipeline"). Grounded on
//! `pipeline/progress.rs`'s `PreprocessingStage::weight`/`base_progress`
//! pair, adapted from a nine-stage 1-D enum to the six named export
//! phases. Unlike that file's in-process `CancellationToken`, export
//! cancellation crosses process restarts, so `ExportEngine` polls the
//! ExportJob row's status instead of holding a token.

use std::time::Duration;

use seg_store::entities::ExportPhase;

pub const PHASES: [ExportPhase; 5] = [
    ExportPhase::Images,
    ExportPhase::Visualizations,
    ExportPhase::Annotations,
    ExportPhase::Metrics,
    ExportPhase::Compression,
];

fn weight(phase: ExportPhase) -> f32 {
    match phase {
        ExportPhase::Queued => 0.0,
        ExportPhase::Images => 0.30,
        ExportPhase::Visualizations => 0.30,
        ExportPhase::Annotations => 0.15,
        ExportPhase::Metrics => 0.15,
        ExportPhase::Compression => 0.10,
        ExportPhase::Ready => 0.0,
    }
}

fn base_progress(phase: ExportPhase) -> f32 {
    let mut base = 0.0;
    for p in PHASES {
        if p == phase {
            return base;
        }
        base += weight(p);
    }
    base
}

/// Overall job progress given a phase and how far through that phase
/// we are (0.0-1.0).
pub fn overall_progress(phase: ExportPhase, stage_progress: f32) -> f32 {
    (base_progress(phase) + weight(phase) * stage_progress.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Minimum gap between progress events for one job (§4.3: "throttled
/// to at most one event per 200 ms per job").
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// Emits progress at most once per `PROGRESS_THROTTLE` regardless of how
/// often `maybe_emit` is called; the final `progress == 1.0` for a phase
/// always fires so clients see every phase boundary.
pub struct ProgressThrottle {
    last_emit: Option<tokio::time::Instant>,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self { last_emit: None }
    }
}

impl ProgressThrottle {
    pub fn should_emit(&mut self, stage_progress: f32) -> bool {
        let now = tokio::time::Instant::now();
        let force = stage_progress >= 1.0;
        let due = match self.last_emit {
            Some(last) => now.duration_since(last) >= PROGRESS_THROTTLE,
            None => true,
        };
        if force || due {
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_weights_sum_to_one() {
        let total: f32 = PHASES.iter().map(|&p| weight(p)).sum();
        assert!((total - 1.0).abs() < 0.001);
    }

    #[test]
    fn base_progress_is_cumulative() {
        assert_eq!(base_progress(ExportPhase::Images), 0.0);
        assert!((base_progress(ExportPhase::Visualizations) - 0.30).abs() < 0.001);
        assert!((base_progress(ExportPhase::Compression) - 0.90).abs() < 0.001);
    }

    #[test]
    fn overall_progress_interpolates_within_a_phase() {
        let start = overall_progress(ExportPhase::Annotations, 0.0);
        let mid = overall_progress(ExportPhase::Annotations, 0.5);
        let end = overall_progress(ExportPhase::Annotations, 1.0);
        assert!(start < mid && mid < end);
        assert!((end - base_progress(ExportPhase::Metrics)).abs() < 0.001);
    }

    #[test]
    fn throttle_always_allows_the_first_and_the_final_update() {
        let mut throttle = ProgressThrottle::default();
        assert!(throttle.should_emit(0.0));
        assert!(!throttle.should_emit(0.1));
        assert!(throttle.should_emit(1.0));
    }
}
