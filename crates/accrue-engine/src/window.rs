//! Splitting an elapsed interval into mining and expired pieces.

use accrue_core::types::SessionWindow;
use chrono::{DateTime, Utc};

/// Half-open `[from, to)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Span {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<Self> {
        (to > from).then_some(Self { from, to })
    }

    /// Intersection with `[lo, hi)`; a missing bound is unbounded.
    pub fn clip(&self, lo: Option<DateTime<Utc>>, hi: Option<DateTime<Utc>>) -> Option<Self> {
        let from = lo.map_or(self.from, |lo| lo.max(self.from));
        let to = hi.map_or(self.to, |hi| hi.min(self.to));
        Self::new(from, to)
    }

    /// Split at every boundary strictly inside the span.
    pub fn split(&self, boundaries: impl IntoIterator<Item = DateTime<Utc>>) -> Vec<Span> {
        let mut cuts: Vec<DateTime<Utc>> = boundaries.into_iter().filter(|b| *b > self.from && *b < self.to).collect();
        cuts.sort();
        cuts.dedup();
        let mut out = Vec::with_capacity(cuts.len() + 1);
        let mut cursor = self.from;
        for cut in cuts {
            out.push(Span { from: cursor, to: cut });
            cursor = cut;
        }
        out.push(Span { from: cursor, to: self.to });
        out
    }
}

/// Expired piece together with the session end it decays from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredSpan {
    pub span: Span,
    pub expired_at: DateTime<Utc>,
}

/// Pieces of `[last, now)` during which the user was mining.
///
/// Time before `previously_ended_at` belongs to the previous session, which
/// was still running when the balance was last updated.
pub fn mining_spans(last: DateTime<Utc>, now: DateTime<Utc>, session: &SessionWindow) -> Vec<Span> {
    let Some(elapsed) = Span::new(last, now) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if let Some(prev_end) = session.previously_ended_at {
        let hi = session.started_at.map_or(prev_end, |s| s.min(prev_end));
        out.extend(elapsed.clip(None, Some(hi)));
    }
    if session.started_at.is_some() {
        out.extend(elapsed.clip(session.started_at, session.ended_at));
    }
    out
}

/// Pieces of `[last, now)` after a session expired without renewal.
pub fn expired_spans(last: DateTime<Utc>, now: DateTime<Utc>, session: &SessionWindow) -> Vec<ExpiredSpan> {
    let Some(elapsed) = Span::new(last, now) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if let (Some(prev_end), Some(start)) = (session.previously_ended_at, session.started_at) {
        if let Some(span) = elapsed.clip(Some(prev_end), Some(start)) {
            out.push(ExpiredSpan { span, expired_at: prev_end });
        }
    }
    if let Some(end) = session.ended_at {
        if let Some(span) = elapsed.clip(Some(end), None) {
            out.push(ExpiredSpan { span, expired_at: end });
        }
    }
    out
}
