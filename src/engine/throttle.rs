//! Graded attempt budgeting.
//!
//! With a window `w` and a budget `m`, a user's scored submissions are split
//! into two buckets relative to `now`:
//!
//! * `latest`: submissions in `[now - w, now)`
//! * `prior`: submissions in `[now - w*m, now - w)`
//!
//! and the remaining budget is `min(m, 2m - 1 - prior) - latest`, floored at 0.
//! A user who skipped earlier windows can catch up, but never spend more than
//! `m` attempts inside any single rolling window.

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    /// `None` caps attempts over the lifetime of the task.
    pub window: Option<TimeDelta>,
}

pub fn remaining_attempts(
    policy: &AttemptPolicy,
    graded: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> u32 {
    let max = i64::from(policy.max_attempts);
    let remaining = match policy.window {
        None => max - graded.len() as i64,
        Some(window) => {
            let latest_start = shift_back(now, Some(window));
            let relevant_start = shift_back(
                now,
                i32::try_from(policy.max_attempts)
                    .ok()
                    .and_then(|m| window.checked_mul(m)),
            );
            let prior = count_between(graded, relevant_start, latest_start);
            let latest = count_between(graded, latest_start, now);
            max.min(2 * max - 1 - prior) - latest
        }
    };
    remaining.max(0) as u32
}

/// Earliest instant after which at least one graded attempt is available
/// again. `None` while attempts remain, or when they never refill.
pub fn next_attempt_at(
    policy: &AttemptPolicy,
    graded: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let window = policy.window?;
    if policy.max_attempts == 0 || remaining_attempts(policy, graded, now) > 0 {
        return None;
    }
    let span = i32::try_from(policy.max_attempts)
        .ok()
        .and_then(|m| window.checked_mul(m))?;

    // The counts only change when a submission crosses one of the two bucket edges.
    let mut boundaries: Vec<DateTime<Utc>> = graded
        .iter()
        .flat_map(|at| [at.checked_add_signed(window), at.checked_add_signed(span)])
        .flatten()
        .filter(|boundary| *boundary >= now)
        .collect();
    boundaries.sort();
    boundaries.dedup();

    let step = TimeDelta::nanoseconds(1);
    boundaries
        .into_iter()
        .find(|boundary| remaining_attempts(policy, graded, *boundary + step) > 0)
}

fn shift_back(now: DateTime<Utc>, by: Option<TimeDelta>) -> DateTime<Utc> {
    by.and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn count_between(graded: &[DateTime<Utc>], from: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    graded
        .iter()
        .filter(|at| **at >= from && **at < until)
        .count() as i64
}
