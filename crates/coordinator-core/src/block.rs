//! The cross-worker "global block" cooldown FSM (§4.G).
//!
//! Entering the blocked state is the only transition modelled
//! explicitly; leaving it is implicit once `now >= block_until` (§9 open
//! question) — no affirmative "unblock" event exists.

use std::collections::HashMap;

use model::GlobalBlockState;
use rand::Rng;

/// Checks the trigger condition on an incoming worker metrics report and,
/// if it fires, returns the new block state plus a fresh recovery-jitter
/// assignment for every currently active worker.
///
/// The `now >= block_until` guard (rather than unconditional firing)
/// prevents re-triggering — and therefore re-incrementing the epoch —
/// while a cooldown from an earlier trigger is still in effect (§8
/// invariant 3: two reports during one cooldown produce exactly one
/// epoch increment).
pub fn maybe_trigger<R: Rng + ?Sized>(
    current: &GlobalBlockState,
    block_rate: f64,
    threshold: f64,
    cooldown_s: u64,
    triggered_by: &str,
    active_workers: &[String],
    now: u64,
    rng: &mut R,
) -> Option<(GlobalBlockState, HashMap<String, f64>)> {
    if block_rate <= threshold || now < current.block_until {
        return None;
    }
    let jitter = active_workers.iter().map(|w| (w.clone(), rng.gen_range(0.0..=1.0))).collect();
    let new_state = GlobalBlockState {
        block_until: now + cooldown_s,
        recovery_epoch: current.recovery_epoch + 1,
        triggered_by: Some(triggered_by.to_string()),
    };
    Some((new_state, jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn fires_once_across_two_reports_in_one_cooldown() {
        let mut rng = StepRng::new(0, 1);
        let mut state = GlobalBlockState::default();
        let workers = vec!["w1".to_string(), "w2".to_string()];

        let result = maybe_trigger(&state, 0.10, 0.05, 30, "w1", &workers, 1000, &mut rng);
        let (new_state, jitter) = result.expect("should trigger");
        assert_eq!(new_state.recovery_epoch, 1);
        assert_eq!(jitter.len(), 2);
        state = new_state;

        // A second report arriving at now=1010, still inside the 30s
        // cooldown, must not fire again.
        let result = maybe_trigger(&state, 0.20, 0.05, 30, "w2", &workers, 1010, &mut rng);
        assert!(result.is_none());
    }

    #[test]
    fn fires_again_once_cooldown_has_elapsed() {
        let mut rng = StepRng::new(0, 1);
        let state = GlobalBlockState { block_until: 1000, recovery_epoch: 1, triggered_by: Some("w1".into()) };
        let workers = vec!["w1".to_string()];
        let result = maybe_trigger(&state, 0.10, 0.05, 30, "w1", &workers, 1001, &mut rng);
        let (new_state, _) = result.expect("cooldown elapsed, should trigger");
        assert_eq!(new_state.recovery_epoch, 2);
    }

    #[test]
    fn below_threshold_never_fires() {
        let mut rng = StepRng::new(0, 1);
        let state = GlobalBlockState::default();
        let result = maybe_trigger(&state, 0.01, 0.05, 30, "w1", &[], 1000, &mut rng);
        assert!(result.is_none());
    }
}
