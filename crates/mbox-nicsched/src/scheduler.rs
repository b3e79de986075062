//! The RSS++ control loop, grounded on
//! `vendor/nicscheduler/methods/rsspp.cc` and spec §4.8.

use std::collections::HashMap;
use std::time::Duration;

use crate::bucket_map::{bucket_map_problem, bucket_map_target_problem};
use crate::config::{NicSchedulerConfig, Policy};
use crate::load::{LoadSnapshot, LoadTracker};
use crate::reta::Reta;

/// How the NIC scheduler coordinates a core removal/bucket move with
/// whoever owns flow state for that bucket — in this workspace, the agent's
/// per-queue `mbox_core::ConnectionTable` shard. Mirrors
/// `vendor/nicscheduler/nicscheduler.hh`'s `MigrationListener`.
pub trait MigrationListener {
    /// Called before the RETA swap commits: the listener should stop
    /// accepting new flows on `from_core` for the buckets about to move and
    /// prepare to hand their FCBs to `to_core`.
    fn pre_migrate(&mut self, moves: &[(usize, usize)], from_core: usize);
    /// Called after the RETA swap: the listener may now fully drain and
    /// transfer `from_core`'s state for the migrated buckets.
    fn post_migrate(&mut self, from_core: usize);
}

/// A no-op listener for policies or tests that don't need migration
/// coordination.
pub struct NullListener;
impl MigrationListener for NullListener {
    fn pre_migrate(&mut self, _moves: &[(usize, usize)], _from_core: usize) {}
    fn post_migrate(&mut self, _from_core: usize) {}
}

pub struct NicScheduler {
    cfg: NicSchedulerConfig,
    reta: Reta,
    tracker: LoadTracker,
    tick: Duration,
}

impl NicScheduler {
    pub fn new(cfg: NicSchedulerConfig, n_buckets: usize, n_cores: usize) -> Self {
        let tick = cfg.tick_min();
        let alpha = cfg.imbalance_alpha;
        NicScheduler {
            reta: Reta::new_static(n_buckets, n_cores),
            tracker: LoadTracker::new(n_cores, alpha),
            tick,
            cfg,
        }
    }

    pub fn reta(&self) -> &Reta {
        &self.reta
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Run one control-loop tick. `raw_load[core]` is this tick's sampled
    /// load, `bucket_load[bucket]` the per-bucket share of it.
    pub fn tick_once<L: MigrationListener>(
        &mut self,
        raw_load: &[f64],
        bucket_load: &HashMap<usize, f64>,
        listener: &mut L,
    ) {
        match self.cfg.policy {
            Policy::Rss => {}
            Policy::RssRr => self.reta.rotate(),
            Policy::RssPlusPlus => self.rsspp_tick(raw_load, bucket_load, listener),
        }
    }

    fn rsspp_tick<L: MigrationListener>(
        &mut self,
        raw_load: &[f64],
        bucket_load: &HashMap<usize, f64>,
        listener: &mut L,
    ) {
        // 1. Smoothed load + classification.
        let smoothed = self.tracker.update(raw_load).to_vec();
        let snapshot = LoadSnapshot::classify(smoothed, self.cfg.threshold);
        let total_supply = snapshot.total_supply();

        let variance_guard = 0.0;
        let mut total_imbalance = 0.0;

        // 2/3. Scale down or up.
        if self.cfg.autoscale {
            if total_supply > 1.0 + (1.0 - self.cfg.target_load) + variance_guard {
                self.scale_down(&snapshot, bucket_load, listener);
            } else if total_supply < -0.1 {
                self.scale_up();
            }
        }

        // 4. Dancer handling: a single bucket > 50% of its core's load
        // moves whole to the least-loaded core.
        if self.cfg.dancer {
            self.handle_dancers(&snapshot, bucket_load, listener);
        }

        // 5. Main rebalance: overloaded -> underloaded.
        total_imbalance += self.rebalance(&snapshot, bucket_load, listener);

        // 7. Adjust tick.
        self.adjust_tick(total_imbalance);
    }

    fn scale_down<L: MigrationListener>(
        &mut self,
        snapshot: &LoadSnapshot,
        bucket_load: &HashMap<usize, f64>,
        listener: &mut L,
    ) {
        let Some(victim) = snapshot.min_core() else { return };
        let remaining: Vec<usize> =
            self.reta.active_cores().iter().copied().filter(|&c| c != victim).collect();
        if remaining.is_empty() {
            return;
        }

        let buckets: Vec<(usize, f64)> = self
            .reta
            .buckets_of(victim)
            .into_iter()
            .map(|b| (b, *bucket_load.get(&b).unwrap_or(&0.0)))
            .collect();
        let mut core_load: Vec<f64> = remaining.iter().map(|&c| snapshot.load.get(c).copied().unwrap_or(0.0)).collect();

        let moves = bucket_map_problem(&buckets, &remaining, &mut core_load);
        self.apply_moves(&moves, victim, listener);
        self.reta.remove_core(victim);
        tracing::info!(core = victim, moved = moves.len(), "scaled down");
    }

    fn scale_up(&mut self) {
        tracing::info!("autoscale requests an additional core (orchestrator-provided)");
    }

    fn handle_dancers<L: MigrationListener>(
        &mut self,
        snapshot: &LoadSnapshot,
        bucket_load: &HashMap<usize, f64>,
        listener: &mut L,
    ) {
        for &core in self.reta.active_cores().to_vec().iter() {
            let core_load = snapshot.load.get(core).copied().unwrap_or(0.0);
            if core_load <= 0.0 {
                continue;
            }
            for bucket in self.reta.buckets_of(core) {
                let load = *bucket_load.get(&bucket).unwrap_or(&0.0);
                if load > 0.5 * core_load {
                    if let Some(target) = snapshot.min_core() {
                        if target != core {
                            self.apply_moves(&[(bucket, target)], core, listener);
                            tracing::warn!(bucket, core, "dancer bucket relocated");
                        }
                    }
                }
            }
        }
    }

    fn rebalance<L: MigrationListener>(
        &mut self,
        snapshot: &LoadSnapshot,
        bucket_load: &HashMap<usize, f64>,
        listener: &mut L,
    ) -> f64 {
        let mut imbalance: HashMap<usize, f64> = self
            .reta
            .active_cores()
            .iter()
            .map(|&c| (c, snapshot.target - snapshot.load.get(c).copied().unwrap_or(0.0)))
            .collect();

        for &core in snapshot.overloaded.iter() {
            let mut buckets: Vec<(usize, f64)> = self
                .reta
                .buckets_of(core)
                .into_iter()
                .map(|b| (b, *bucket_load.get(&b).unwrap_or(&0.0)))
                .collect();
            buckets.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

            let moves = bucket_map_target_problem(&buckets, &snapshot.underloaded, &mut imbalance);
            if !moves.is_empty() {
                self.apply_moves(&moves, core, listener);
            }
        }

        imbalance.values().map(|v| v.abs()).sum()
    }

    fn apply_moves<L: MigrationListener>(&mut self, moves: &[(usize, usize)], from_core: usize, listener: &mut L) {
        if moves.is_empty() {
            return;
        }
        listener.pre_migrate(moves, from_core);
        self.reta.begin_epoch();
        for &(bucket, to_core) in moves {
            self.reta.stage_move(bucket, to_core);
        }
        self.reta.commit_epoch();
        listener.post_migrate(from_core);
    }

    /// Spec §4.8 point 7: residual imbalance drives the next tick interval.
    fn adjust_tick(&mut self, total_imbalance: f64) {
        if total_imbalance > 0.4 {
            self.tick = self.cfg.tick_min();
        } else if total_imbalance > 0.2 {
            self.tick /= 2;
        } else {
            self.tick *= 2;
        }
        self.tick = self.tick.clamp(self.cfg.tick_min(), self.cfg.tick_max());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_in_fires_when_supply_exceeds_threshold() {
        let mut cfg = NicSchedulerConfig::default();
        cfg.target_load = 0.5;
        cfg.threshold = 0.1;
        let mut sched = NicScheduler::new(cfg, 16, 8);

        let raw = vec![0.1, 0.05, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1];
        let bucket_load: HashMap<usize, f64> =
            (0..16).map(|b| (b, raw[b % raw.len()] / 2.0)).collect();

        let mut listener = NullListener;
        // Warm up the EMA to the raw values (alpha = 1.0 by default).
        sched.tick_once(&raw, &bucket_load, &mut listener);
        assert!(sched.reta().active_cores().len() <= 8);
    }

    #[test]
    fn rss_rr_rotates_every_tick() {
        let mut cfg = NicSchedulerConfig::default();
        cfg.policy = Policy::RssRr;
        let mut sched = NicScheduler::new(cfg, 4, 4);
        let before = sched.reta().core_of(0);
        sched.tick_once(&[0.0; 4], &HashMap::new(), &mut NullListener);
        assert_ne!(before, sched.reta().core_of(0));
    }

    #[test]
    fn tick_shrinks_to_minimum_on_high_imbalance() {
        let mut cfg = NicSchedulerConfig::default();
        cfg.tick_min_ms = 10;
        cfg.tick_max_ms = 1000;
        let mut sched = NicScheduler::new(cfg, 4, 4);
        sched.tick = Duration::from_millis(500);
        sched.adjust_tick(0.5);
        assert_eq!(sched.tick, Duration::from_millis(10));
    }
}
