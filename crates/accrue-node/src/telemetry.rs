//! Phase instrumentation and the cross-shard balance-sync cadence.

use std::time::{Duration, Instant};

use accrue_core::types::GlobalCounter;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Referrals,
    Accrue,
    Events,
    History,
    Commit,
}

impl Phase {
    pub const ALL: [Phase; 6] =
        [Phase::Fetch, Phase::Referrals, Phase::Accrue, Phase::Events, Phase::History, Phase::Commit];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Referrals => "referrals",
            Self::Accrue => "accrue",
            Self::Events => "events",
            Self::History => "history",
            Self::Commit => "commit",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Wall-clock time spent per phase within one iteration.
#[derive(Debug)]
pub struct PhaseTimer {
    last: Instant,
    spent: [Duration; 6],
}

impl PhaseTimer {
    pub fn start() -> Self {
        Self { last: Instant::now(), spent: [Duration::ZERO; 6] }
    }

    /// Attribute the time since the previous mark to `phase`.
    pub fn mark(&mut self, phase: Phase) {
        let now = Instant::now();
        self.spent[phase.index()] += now - self.last;
        self.last = now;
    }

    pub fn spent(&self, phase: Phase) -> Duration {
        self.spent[phase.index()]
    }

    pub fn total(&self) -> Duration {
        self.spent.iter().sum()
    }

    pub fn log(&self, worker: u32, users: usize) {
        debug!(
            worker,
            users,
            fetch_ms = self.spent(Phase::Fetch).as_millis() as u64,
            referrals_ms = self.spent(Phase::Referrals).as_millis() as u64,
            accrue_ms = self.spent(Phase::Accrue).as_millis() as u64,
            events_ms = self.spent(Phase::Events).as_millis() as u64,
            history_ms = self.spent(Phase::History).as_millis() as u64,
            commit_ms = self.spent(Phase::Commit).as_millis() as u64,
            "iteration phases"
        );
    }
}

/// Per-worker pacing of the global counter flush and periodic summaries.
///
/// Amounts are only folded in after their iteration committed, so a retried
/// iteration never double counts.
#[derive(Debug)]
pub struct TelemetryGovernor {
    worker: u32,
    balance_sync_every: u64,
    telemetry_every: u64,
    iterations: u64,
    unsynced_minted: f64,
    unsynced_slashed: f64,
    window_users: u64,
    window_elapsed: Duration,
    window_phases: [Duration; 6],
}

impl TelemetryGovernor {
    pub fn new(worker: u32, balance_sync_every: u64, telemetry_every: u64) -> Self {
        Self {
            worker,
            balance_sync_every: balance_sync_every.max(1),
            telemetry_every: telemetry_every.max(1),
            iterations: 0,
            unsynced_minted: 0.0,
            unsynced_slashed: 0.0,
            window_users: 0,
            window_elapsed: Duration::ZERO,
            window_phases: [Duration::ZERO; 6],
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Whether the iteration about to commit carries the global flush.
    pub fn sync_due(&self) -> bool {
        (self.iterations + 1) % self.balance_sync_every == 0
    }

    /// Global counter deltas for the next commit, including this iteration's
    /// own amounts. Empty when no flush is due or nothing accrued.
    pub fn global_deltas(&self, minted: f64, slashed: f64) -> Vec<(GlobalCounter, f64)> {
        if !self.sync_due() {
            return Vec::new();
        }
        let mut deltas = Vec::new();
        let minted = self.unsynced_minted + minted;
        let slashed = self.unsynced_slashed + slashed;
        if minted != 0.0 {
            deltas.push((GlobalCounter::TotalMinted, minted));
        }
        if slashed != 0.0 {
            deltas.push((GlobalCounter::TotalSlashed, slashed));
        }
        deltas
    }

    /// Fold in a committed iteration.
    pub fn committed(&mut self, minted: f64, slashed: f64, users: usize, timer: &PhaseTimer) {
        if self.sync_due() {
            self.unsynced_minted = 0.0;
            self.unsynced_slashed = 0.0;
        } else {
            self.unsynced_minted += minted;
            self.unsynced_slashed += slashed;
        }
        self.iterations += 1;
        self.window_users += users as u64;
        self.window_elapsed += timer.total();
        for phase in Phase::ALL {
            self.window_phases[phase.index()] += timer.spent(phase);
        }

        if self.iterations % self.telemetry_every == 0 {
            info!(
                worker = self.worker,
                iterations = self.iterations,
                users = self.window_users,
                elapsed_ms = self.window_elapsed.as_millis() as u64,
                commit_ms = self.window_phases[Phase::Commit.index()].as_millis() as u64,
                accrue_ms = self.window_phases[Phase::Accrue.index()].as_millis() as u64,
                "mining telemetry"
            );
            self.window_users = 0;
            self.window_elapsed = Duration::ZERO;
            self.window_phases = [Duration::ZERO; 6];
        }
    }

    /// Minted and slashed amounts not yet flushed.
    pub fn unsynced(&self) -> (f64, f64) {
        (self.unsynced_minted, self.unsynced_slashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- PhaseTimer ---

    #[test]
    fn marks_accumulate_per_phase() {
        let mut timer = PhaseTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        timer.mark(Phase::Fetch);
        timer.mark(Phase::Commit);
        assert!(timer.spent(Phase::Fetch) >= Duration::from_millis(5));
        assert_eq!(timer.spent(Phase::Events), Duration::ZERO);
        assert!(timer.total() >= timer.spent(Phase::Fetch));
    }

    #[test]
    fn phase_names_are_distinct() {
        let names: std::collections::HashSet<&str> = Phase::ALL.iter().map(Phase::name).collect();
        assert_eq!(names.len(), 6);
    }

    // --- Governor ---

    #[test]
    fn flush_every_third_iteration() {
        let mut g = TelemetryGovernor::new(0, 3, 100);
        let timer = PhaseTimer::start();

        assert!(g.global_deltas(1.0, 0.0).is_empty());
        g.committed(1.0, 0.0, 1, &timer);
        assert!(g.global_deltas(2.0, 0.5).is_empty());
        g.committed(2.0, 0.5, 1, &timer);

        assert!(g.sync_due());
        assert_eq!(
            g.global_deltas(4.0, 0.0),
            vec![(GlobalCounter::TotalMinted, 7.0), (GlobalCounter::TotalSlashed, 0.5)]
        );
        g.committed(4.0, 0.0, 1, &timer);
        assert_eq!(g.unsynced(), (0.0, 0.0));
        assert_eq!(g.iterations(), 3);
    }

    #[test]
    fn failed_commit_keeps_unsynced_amounts() {
        let mut g = TelemetryGovernor::new(0, 2, 100);
        let timer = PhaseTimer::start();
        g.committed(3.0, 0.0, 1, &timer);
        // The due flush is computed but never committed.
        assert_eq!(g.global_deltas(1.0, 0.0), vec![(GlobalCounter::TotalMinted, 4.0)]);
        assert_eq!(g.unsynced(), (3.0, 0.0));
        assert_eq!(g.global_deltas(1.0, 0.0), vec![(GlobalCounter::TotalMinted, 4.0)]);
    }

    #[test]
    fn zero_amounts_produce_no_deltas() {
        let g = TelemetryGovernor::new(0, 1, 1);
        assert!(g.global_deltas(0.0, 0.0).is_empty());
    }
}
