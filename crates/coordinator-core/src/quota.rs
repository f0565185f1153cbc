//! Quota allocation (§4.G `AllocateQuotas`): per-worker health-weighted
//! split of the fleet-wide concurrency/QPS budget, shrunk during a
//! global block and de-synchronised across workers by recovery jitter.

use std::collections::HashMap;

use model::{GlobalBlockState, MetricsSnapshot, Quota, RuntimeSettings};

/// Freshness window within which a worker's last-reported metrics are
/// trusted for scoring (§4.G step 3).
pub const METRICS_FRESHNESS_S: u64 = 90;

/// One worker's most recently reported snapshot, plus when it arrived.
#[derive(Debug, Clone, Copy)]
pub struct WorkerMetricsEntry {
    /// The snapshot itself.
    pub snapshot: MetricsSnapshot,
    /// Unix seconds it was received.
    pub reported_at: u64,
}

/// Computes the per-worker `(concurrency, qps)` split for the given set
/// of active workers. Returns an empty map if `active_workers` is empty
/// (§4.G step 1: "if none, clear all quotas and return").
#[must_use]
pub fn allocate_quotas(
    active_workers: &[String],
    metrics: &HashMap<String, WorkerMetricsEntry>,
    settings: &RuntimeSettings,
    block: &GlobalBlockState,
    jitter: &HashMap<String, f64>,
    now: u64,
) -> HashMap<String, Quota> {
    if active_workers.is_empty() {
        return HashMap::new();
    }
    let n = active_workers.len() as f64;
    let c_min = settings.min_concurrency;

    // Step 2: budget, halved (and floored) during an active cooldown.
    let cooldown_active = block.is_active(now);
    let mut budget_concurrency = f64::from(settings.global_max_concurrency);
    let mut budget_qps = settings.global_max_qps;
    if cooldown_active {
        budget_concurrency = (budget_concurrency * 0.5).max(n * f64::from(c_min));
        budget_qps = (budget_qps * 0.5).max(n * 0.5);
    }

    // Step 3 (+ step 4's jitter multiplier folded in per-worker).
    let mut scores: HashMap<String, f64> = HashMap::with_capacity(active_workers.len());
    for worker in active_workers {
        let mut score = match metrics.get(worker) {
            Some(entry) if now.saturating_sub(entry.reported_at) < METRICS_FRESHNESS_S => {
                let s = entry.snapshot;
                (s.success_rate * (1.0 - 5.0 * s.block_rate).max(0.0)).clamp(0.1, 1.0)
            }
            _ => 0.5,
        };
        if cooldown_active {
            let j = jitter.get(worker).copied().unwrap_or(0.5);
            score *= 0.5 + 0.5 * j;
        }
        let _ = scores.insert(worker.clone(), score);
    }
    let total_score: f64 = scores.values().sum();

    // Step 4: proportional raw split.
    let mut raw_concurrency: HashMap<String, f64> = HashMap::with_capacity(active_workers.len());
    let mut raw_qps: HashMap<String, f64> = HashMap::with_capacity(active_workers.len());
    for worker in active_workers {
        let share = if total_score > 0.0 { scores[worker] / total_score } else { 1.0 / n };
        let _ = raw_concurrency.insert(worker.clone(), budget_concurrency * share);
        let _ = raw_qps.insert(worker.clone(), budget_qps * share);
    }

    // Step 5: integer-round concurrency, floor at effective_min, then
    // trim back under budget.
    let effective_min = f64::from(c_min).min((budget_concurrency / n).floor()) as u32;
    let mut rounded: HashMap<String, u32> = raw_concurrency
        .iter()
        .map(|(w, v)| (w.clone(), (v.round() as i64).max(i64::from(effective_min)) as u32))
        .collect();
    trim_to_budget(&mut rounded, budget_concurrency, effective_min);

    // QPS: uniform scale-down if the proportional split overshoots, then
    // a per-worker floor (mirroring concurrency's `effective_min`: capped
    // at `budget_qps / n` so flooring every worker can never itself push
    // the sum over budget) and a trim pass for any rounding slack left
    // by the floor (§8 invariant 2).
    let qps_sum: f64 = raw_qps.values().sum();
    let qps_scale = if qps_sum > budget_qps && qps_sum > 0.0 { budget_qps / qps_sum } else { 1.0 };
    let effective_qps_floor = 0.1_f64.min(budget_qps / n);
    let mut qps: HashMap<String, f64> =
        raw_qps.iter().map(|(w, v)| (w.clone(), (v * qps_scale).max(effective_qps_floor))).collect();
    trim_qps_to_budget(&mut qps, budget_qps, effective_qps_floor);

    active_workers
        .iter()
        .map(|worker| {
            let quota = Quota { concurrency: rounded[worker], qps: qps[worker], assigned_at: now };
            (worker.clone(), quota)
        })
        .collect()
}

/// Proportionally trims workers above `floor`, then greedily shaves the
/// current largest allocation, until the sum no longer exceeds `budget`.
/// The floating-point counterpart to [`trim_to_budget`], needed because
/// flooring each worker's QPS share can reintroduce an overshoot that the
/// upstream `qps_scale` already accounted for.
fn trim_qps_to_budget(values: &mut HashMap<String, f64>, budget: f64, floor: f64) {
    let sum: f64 = values.values().sum();
    if sum <= budget {
        return;
    }
    let excess = sum - budget;
    let above_total: f64 = values.values().filter(|&&v| v > floor).map(|&v| v - floor).sum();
    if above_total > 0.0 {
        for value in values.values_mut() {
            if *value > floor {
                let share = (*value - floor) / above_total;
                let reduction = (excess * share).min(*value - floor);
                *value -= reduction;
            }
        }
    }

    // Final greedy pass for any slack the proportional pass leaves
    // behind; by construction `floor * n <= budget`, so this always
    // terminates with the invariant satisfied.
    loop {
        let sum: f64 = values.values().sum();
        if sum <= budget {
            return;
        }
        let Some((_, max_value)) = values.iter_mut().filter(|(_, v)| **v > floor).max_by(|a, b| a.1.total_cmp(b.1))
        else {
            return;
        };
        *max_value = (*max_value - (sum - budget)).max(floor);
    }
}

/// Proportionally trims workers above `effective_min`, then greedily
/// decrements the largest allocations one at a time, until the sum no
/// longer exceeds `budget` (§4.G step 5, §8 invariant 2).
fn trim_to_budget(rounded: &mut HashMap<String, u32>, budget: f64, effective_min: u32) {
    let sum: u32 = rounded.values().sum();
    if f64::from(sum) <= budget {
        return;
    }
    let excess = f64::from(sum) - budget;
    let above_total: u32 = rounded.values().filter(|&&v| v > effective_min).map(|&v| v - effective_min).sum();
    if above_total > 0 {
        for value in rounded.values_mut() {
            if *value > effective_min {
                let share = f64::from(*value - effective_min) / f64::from(above_total);
                let reduction = ((excess * share).round() as u32).min(*value - effective_min);
                *value -= reduction;
            }
        }
    }

    // Final greedy pass: budget is a float, so rounding above can still
    // leave the sum one or two units over. Shave the current largest
    // allocation until the invariant holds.
    loop {
        let sum: u32 = rounded.values().sum();
        if f64::from(sum) <= budget {
            return;
        }
        let Some((_, max_value)) = rounded
            .iter_mut()
            .filter(|(_, v)| **v > effective_min)
            .max_by_key(|(_, v)| **v)
        else {
            // Every worker is already pinned at effective_min; by
            // construction effective_min * n <= budget, so this should
            // not be reachable, but don't loop forever if it is.
            return;
        };
        *max_value -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::ProxyMode;

    fn settings() -> RuntimeSettings {
        let mut s = RuntimeSettings::default();
        s.global_max_concurrency = 30;
        s.global_max_qps = 6.0;
        s.min_concurrency = 2;
        s.proxy_mode = ProxyMode::Tps;
        s
    }

    fn snapshot(success_rate: f64, block_rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            count: 100,
            success_rate,
            block_rate,
            p50_latency_s: 1.0,
            p95_latency_s: 1.5,
            bytes_per_sec: 0.0,
            bandwidth_pct: 0.0,
            in_flight: 0,
            window_span_s: 10.0,
        }
    }

    #[test]
    fn empty_active_set_clears_quotas() {
        let quotas = allocate_quotas(&[], &HashMap::new(), &settings(), &GlobalBlockState::default(), &HashMap::new(), 1000);
        assert!(quotas.is_empty());
    }

    #[test]
    fn sum_never_exceeds_budget_asymmetric_health() {
        let workers = vec!["a".to_string(), "b".to_string()];
        let mut metrics = HashMap::new();
        let _ = metrics.insert(
            "a".to_string(),
            WorkerMetricsEntry { snapshot: snapshot(0.95, 0.0), reported_at: 1000 },
        );
        let _ = metrics.insert(
            "b".to_string(),
            WorkerMetricsEntry { snapshot: snapshot(0.60, 0.10), reported_at: 1000 },
        );
        let quotas = allocate_quotas(&workers, &metrics, &settings(), &GlobalBlockState::default(), &HashMap::new(), 1000);
        let total_c: u32 = quotas.values().map(|q| q.concurrency).sum();
        let total_q: f64 = quotas.values().map(|q| q.qps).sum();
        assert!(total_c <= 30);
        assert!(total_q <= 6.0 + 0.1);
        assert!(quotas["a"].concurrency > quotas["b"].concurrency);
    }

    #[test]
    fn many_workers_tight_budget_still_respects_invariant() {
        let workers: Vec<String> = (0..25).map(|i| format!("w{i}")).collect();
        let mut metrics = HashMap::new();
        for w in &workers {
            let _ = metrics.insert(w.clone(), WorkerMetricsEntry { snapshot: snapshot(0.9, 0.0), reported_at: 1000 });
        }
        let quotas = allocate_quotas(&workers, &metrics, &settings(), &GlobalBlockState::default(), &HashMap::new(), 1000);
        let total_c: u32 = quotas.values().map(|q| q.concurrency).sum();
        assert!(total_c <= 30, "total concurrency {total_c} exceeded budget");
    }

    #[test]
    fn active_cooldown_halves_budget_and_applies_jitter() {
        let workers = vec!["a".to_string(), "b".to_string()];
        let mut metrics = HashMap::new();
        for w in &workers {
            let _ = metrics.insert(w.clone(), WorkerMetricsEntry { snapshot: snapshot(0.9, 0.0), reported_at: 1000 });
        }
        let block = GlobalBlockState {
            block_until: 2000,
            recovery_epoch: 1,
            triggered_by: Some("a".to_string()),
        };
        let mut jitter = HashMap::new();
        let _ = jitter.insert("a".to_string(), 0.0);
        let _ = jitter.insert("b".to_string(), 1.0);
        let quotas = allocate_quotas(&workers, &metrics, &settings(), &block, &jitter, 1000);
        let total_c: u32 = quotas.values().map(|q| q.concurrency).sum();
        assert!(total_c <= 15 + workers.len() as u32, "halved budget respected with rounding slack");
        // Worker with jitter=1.0 scores higher than jitter=0.0 and should
        // receive a strictly larger share.
        assert!(quotas["b"].qps >= quotas["a"].qps);
    }

    #[test]
    fn missing_metrics_score_neutral() {
        let workers = vec!["a".to_string()];
        let quotas = allocate_quotas(&workers, &HashMap::new(), &settings(), &GlobalBlockState::default(), &HashMap::new(), 1000);
        assert!(quotas["a"].concurrency >= settings().min_concurrency);
    }

    #[test]
    fn many_workers_tiny_qps_budget_still_respects_invariant() {
        // With global_max_qps at its settings floor (0.5) and 10 active
        // workers, an unconditional per-worker 0.1 floor would alone sum
        // to 1.0, blowing through the 0.5 budget. No cooldown is active
        // here, so `budget_qps` is exactly `global_max_qps` (§4.G step 2
        // only floors the budget during cooldown); this isolates the
        // per-worker floor in step 5 as the thing under test.
        let mut s = settings();
        s.global_max_qps = 0.5;
        let workers: Vec<String> = (0..10).map(|i| format!("w{i}")).collect();
        let mut metrics = HashMap::new();
        for w in &workers {
            let _ = metrics.insert(w.clone(), WorkerMetricsEntry { snapshot: snapshot(0.9, 0.0), reported_at: 1000 });
        }
        let quotas = allocate_quotas(&workers, &metrics, &s, &GlobalBlockState::default(), &HashMap::new(), 1000);
        let total_q: f64 = quotas.values().map(|q| q.qps).sum();
        assert!(total_q <= s.global_max_qps + 1e-6, "total qps {total_q} exceeded budget {}", s.global_max_qps);
    }
}
