//! Rolling sync log and the statistics derived from it.

use crate::Timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Entries kept in each rolling log.
const LOG_CAPACITY: usize = 1000;

/// Derived snapshot of sync health. Never persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub pending_count: usize,
    pub completed_today: usize,
    pub failed_today: usize,
    /// Mean duration of recorded sync runs, in milliseconds
    pub average_sync_time: f64,
    /// Conflicts per remote row pulled, in `0.0..=1.0`
    pub conflict_rate: f64,
}

/// Final outcome of one queued action's replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncRun {
    finished_at: Timestamp,
    duration_ms: u64,
    remote_rows: usize,
    conflicts: usize,
}

/// Bounded log of replay outcomes and sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncLog {
    replays: VecDeque<(Timestamp, ReplayOutcome)>,
    runs: VecDeque<SyncRun>,
}

impl SyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_replay(&mut self, at: Timestamp, outcome: ReplayOutcome) {
        push_bounded(&mut self.replays, (at, outcome));
    }

    /// Record a finished incremental sync run.
    pub fn record_run(
        &mut self,
        finished_at: Timestamp,
        duration_ms: u64,
        remote_rows: usize,
        conflicts: usize,
    ) {
        push_bounded(
            &mut self.runs,
            SyncRun {
                finished_at,
                duration_ms,
                remote_rows,
                conflicts,
            },
        );
    }

    pub fn last_run_at(&self) -> Option<Timestamp> {
        self.runs.back().map(|run| run.finished_at)
    }

    /// Compute statistics as of `now`. "Today" is the current UTC day.
    pub fn statistics(&self, pending_count: usize, now: Timestamp) -> SyncStatistics {
        let day_start = start_of_day(now);
        let today = |outcome: ReplayOutcome| {
            self.replays
                .iter()
                .filter(|(at, o)| *o == outcome && *at >= day_start && *at <= now)
                .count()
        };

        let average_sync_time = if self.runs.is_empty() {
            0.0
        } else {
            let total: u64 = self.runs.iter().map(|run| run.duration_ms).sum();
            total as f64 / self.runs.len() as f64
        };

        let rows: usize = self.runs.iter().map(|run| run.remote_rows).sum();
        let conflicts: usize = self.runs.iter().map(|run| run.conflicts).sum();
        let conflict_rate = if rows == 0 {
            0.0
        } else {
            conflicts as f64 / rows as f64
        };

        SyncStatistics {
            pending_count,
            completed_today: today(ReplayOutcome::Completed),
            failed_today: today(ReplayOutcome::Failed),
            average_sync_time,
            conflict_rate,
        }
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(entry);
}

fn start_of_day(now: Timestamp) -> Timestamp {
    let Some(at) = DateTime::<Utc>::from_timestamp_millis(now as i64) else {
        return 0;
    };
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc().timestamp_millis().max(0) as Timestamp)
        .unwrap_or(0)
}
