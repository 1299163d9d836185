use rand::Rng;
use squall_run_model::PatternKind;

/// Fraction of units that form the spike subset.
///
/// Taken from the 80/20 split the stress scenarios were originally tuned with: most units idle
/// along at the baseline while a small minority runs flat out.
const SPIKE_FRACTION: f64 = 0.2;

/// The low constant intensity for baseline units, one notch out of the four discrete stress
/// levels the pod workloads understand.
const BASELINE_INTENSITY: f64 = 0.25;

/// Sample the load intensity for one workload unit at one point in a run.
///
/// `elapsed_fraction` is how far through the run we are, from 0.0 at the start to 1.0 at the
/// configured end. Out of range values are clamped rather than rejected because the caller's
/// clock may overshoot the deadline by a tick. The result is always within `[0.0, 1.0]`.
///
/// The same unit asking twice with the same arguments gets the same answer for `gradual` and
/// `spike`; `random` draws a fresh uniform sample per call.
pub fn intensity(
    pattern: PatternKind,
    elapsed_fraction: f64,
    unit_index: usize,
    unit_count: usize,
) -> f64 {
    let elapsed_fraction = if elapsed_fraction.is_finite() {
        elapsed_fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };

    match pattern {
        PatternKind::Random => rand::thread_rng().gen_range(0.0..=1.0),
        PatternKind::Gradual => {
            BASELINE_INTENSITY + (1.0 - BASELINE_INTENSITY) * elapsed_fraction
        }
        PatternKind::Spike => {
            if is_spike_unit(unit_index, unit_count) {
                1.0
            } else {
                BASELINE_INTENSITY
            }
        }
    }
}

/// The number of units in the spike subset for a run of `unit_count` units.
///
/// Never zero for a non-empty run, so a spike scenario always spikes, and never more than the
/// fixed minority fraction allows, so the spike units stay the minority from two units up.
pub fn spike_unit_count(unit_count: usize) -> usize {
    if unit_count == 0 {
        return 0;
    }
    (((unit_count as f64) * SPIKE_FRACTION).floor() as usize).max(1)
}

/// Whether the unit at `unit_index` belongs to the spike subset. The highest indices spike.
pub fn is_spike_unit(unit_index: usize, unit_count: usize) -> bool {
    if unit_count == 0 {
        return false;
    }
    unit_index >= unit_count - spike_unit_count(unit_count)
}
