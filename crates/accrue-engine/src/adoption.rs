//! Base mining rate as a step function of time.
//!
//! The curve is built from [`AdoptionMilestone`]s written by an external
//! collaborator. The rate in force at an instant is the one of the latest
//! milestone achieved at or before it; instants before the first milestone
//! use the first milestone's rate.

use accrue_core::constants::MIN_BASE_MINING_RATE;
use accrue_core::error::AccrualError;
use accrue_core::time::TimeUnit;
use accrue_core::types::AdoptionMilestone;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct AdoptionCurve {
    milestones: Vec<AdoptionMilestone>,
}

impl AdoptionCurve {
    pub fn new(mut milestones: Vec<AdoptionMilestone>) -> Result<Self, AccrualError> {
        if milestones.is_empty() {
            return Err(AccrualError::EmptyAdoptionCurve);
        }
        if let Some(bad) = milestones
            .iter()
            .find(|m| m.base_mining_rate.is_nan() || m.base_mining_rate < MIN_BASE_MINING_RATE)
        {
            return Err(AccrualError::InvalidBaseRate(bad.base_mining_rate));
        }
        milestones.sort_by_key(|m| m.achieved_at);
        Ok(Self { milestones })
    }

    /// A curve with a single rate for all time.
    pub fn constant(base_mining_rate: f64) -> Result<Self, AccrualError> {
        Self::new(vec![AdoptionMilestone {
            milestone: 1,
            achieved_at: DateTime::<Utc>::MIN_UTC,
            base_mining_rate,
        }])
    }

    pub fn milestones(&self) -> &[AdoptionMilestone] {
        &self.milestones
    }

    /// The milestone in force at `at`.
    pub fn milestone_at(&self, at: DateTime<Utc>) -> &AdoptionMilestone {
        let idx = self.milestones.partition_point(|m| m.achieved_at <= at);
        &self.milestones[idx.saturating_sub(1)]
    }

    pub fn rate_at(&self, at: DateTime<Utc>) -> f64 {
        self.milestone_at(at).base_mining_rate
    }

    /// Split `[from, to)` at milestone boundaries into constant-rate pieces.
    pub fn segments(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>, f64)> {
        let mut out = Vec::new();
        if to <= from {
            return out;
        }
        let mut cursor = from;
        for next in self.milestones.iter().map(|m| m.achieved_at).filter(|t| *t > from && *t < to) {
            out.push((cursor, next, self.rate_at(cursor)));
            cursor = next;
        }
        out.push((cursor, to, self.rate_at(cursor)));
        out
    }

    /// Rate-weighted accrual units over `[from, to)`: `Σ rate × units`.
    pub fn integrate(&self, unit: TimeUnit, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        self.segments(from, to).into_iter().map(|(a, b, rate)| rate * unit.between(a, b)).sum()
    }
}
