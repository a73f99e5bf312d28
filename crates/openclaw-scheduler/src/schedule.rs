use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::types::Schedule;

/// A cron expression pinned to the top of the hour (`0 H * * *` / `0 0 H * * *`)
/// gets a deterministic 5-minute stagger unless `stagger_ms` says otherwise,
/// so a fleet of identically-scheduled jobs doesn't thunder together.
const DEFAULT_TOP_OF_HOUR_STAGGER_RANGE_MS: i64 = 5 * 60 * 1000;

/// Derive a deterministic stagger offset in `[0, range_ms)` from a job id.
///
/// Same id always yields the same offset — the point is spreading load across
/// restarts and across the fleet, not randomness.
pub fn stagger_offset_ms(job_id: &str, range_ms: i64) -> i64 {
    if range_ms <= 0 {
        return 0;
    }
    let mut hash: u64 = 0xcbf29ce484222325; // FNV-1a seed
    for b in job_id.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % range_ms as u64) as i64
}

/// Does this expression look like it's pinned to the top of an hour (or day)?
/// e.g. `"0 13 * * *"`, `"0 0 * * *"`.
fn looks_top_of_hour(expr: &str) -> bool {
    expr.split_whitespace()
        .next()
        .map(|minute_field| minute_field == "0")
        .unwrap_or(false)
}

/// Compute the next UTC execution instant for `schedule`, strictly after `from`.
///
/// Returns `None` only when the schedule is permanently exhausted (an `At`
/// schedule whose instant has already passed) or the cron expression itself
/// fails to parse.
pub fn compute_next_run(
    job_id: &str,
    schedule: &Schedule,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::At { at } => {
            if *at > from {
                Some(*at)
            } else {
                None
            }
        }

        Schedule::Every { every_ms, anchor_ms } => {
            let every = chrono::Duration::milliseconds(*every_ms);
            match anchor_ms {
                Some(anchor) => {
                    // Find the smallest anchor + k*every strictly greater than `from`.
                    let anchor_dt = Utc.timestamp_millis_opt(*anchor).single()?;
                    if anchor_dt > from {
                        return Some(anchor_dt);
                    }
                    let elapsed_ms = (from - anchor_dt).num_milliseconds();
                    let k = elapsed_ms / every_ms + 1;
                    Some(anchor_dt + chrono::Duration::milliseconds(k * every_ms))
                }
                None => Some(from + every),
            }
        }

        Schedule::Cron { expr, tz, stagger_ms } => {
            compute_next_cron(job_id, expr, tz, *stagger_ms, from)
        }
    }
}

/// Compute the next cron fire time, applying hash-derived stagger for
/// top-of-hour expressions unless the job explicitly requests exactness.
fn compute_next_cron(
    job_id: &str,
    expr: &str,
    tz: &str,
    stagger_ms: Option<i64>,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let tz: chrono_tz::Tz = tz.parse().unwrap_or_else(|_| {
        warn!(tz, "unknown IANA timezone, falling back to UTC");
        chrono_tz::UTC
    });

    // The `cron` crate expects 6 fields (sec min hour dom mon dow); accept a
    // bare 5-field expression by prefixing seconds="0".
    let normalized = normalize_cron_expr(expr);
    let schedule = match cron::Schedule::from_str(&normalized) {
        Ok(s) => s,
        Err(e) => {
            warn!(expr, error = %e, "invalid cron expression");
            return None;
        }
    };

    let from_tz = from.with_timezone(&tz);
    let base = schedule.after(&from_tz).next()?.with_timezone(&Utc);

    let stagger = stagger_ms.unwrap_or_else(|| {
        if looks_top_of_hour(expr) {
            stagger_offset_ms(job_id, DEFAULT_TOP_OF_HOUR_STAGGER_RANGE_MS)
        } else {
            0
        }
    });

    if stagger == 0 {
        Some(base)
    } else {
        Some(base + chrono::Duration::milliseconds(stagger))
    }
}

fn normalize_cron_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Minimum gap enforced between the end of one cron fire and the next, so a
/// sub-second-duration run doesn't re-fire within the same second.
pub const MIN_REFIRE_GAP_MS: i64 = 2_000;

/// Recompute `next_run_at_ms` for a cron job after it finishes, anchored to
/// `ended_at_ms + MIN_REFIRE_GAP_MS` rather than to the nominal fire time,
/// per the anti-spin rule. Retries one second later if the cron library
/// can't produce a fire time from the gap instant (observed when the
/// underlying library returns nothing for "now").
pub fn next_after_anti_spin(
    job_id: &str,
    schedule: &Schedule,
    ended_at_ms: i64,
) -> Option<DateTime<Utc>> {
    let floor = Utc.timestamp_millis_opt(ended_at_ms + MIN_REFIRE_GAP_MS).single()?;
    let mut from = floor;
    for _ in 0..5 {
        match compute_next_run(job_id, schedule, from) {
            Some(next) => return Some(next),
            None => {
                if matches!(schedule, Schedule::At { .. }) {
                    return None;
                }
                from += chrono::Duration::seconds(1);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_schedule_fires_once_then_exhausts() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let sched = Schedule::At { at };
        let from = at - chrono::Duration::seconds(1);
        assert_eq!(compute_next_run("job-1", &sched, from), Some(at));
        assert_eq!(compute_next_run("job-1", &sched, at), None);
    }

    #[test]
    fn every_schedule_anchors_deterministically() {
        let anchor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let sched = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(anchor.timestamp_millis()),
        };
        let from = anchor + chrono::Duration::seconds(90);
        let next = compute_next_run("job-1", &sched, from).unwrap();
        assert_eq!(next, anchor + chrono::Duration::minutes(2));
    }

    #[test]
    fn cron_next_fire_is_strictly_after_from() {
        let sched = Schedule::Cron {
            expr: "0 13 * * *".to_string(),
            tz: "UTC".to_string(),
            stagger_ms: Some(0),
        };
        let from = Utc.with_ymd_and_hms(2026, 2, 15, 13, 0, 0).unwrap();
        let next = compute_next_run("job-1", &sched, from).unwrap();
        assert!(next > from);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 16, 13, 0, 0).unwrap());
    }

    #[test]
    fn top_of_hour_cron_gets_deterministic_stagger_when_unset() {
        let sched = Schedule::Cron {
            expr: "0 13 * * *".to_string(),
            tz: "UTC".to_string(),
            stagger_ms: None,
        };
        let from = Utc.with_ymd_and_hms(2026, 2, 14, 13, 0, 0).unwrap();
        let a = compute_next_run("job-1", &sched, from).unwrap();
        let b = compute_next_run("job-1", &sched, from).unwrap();
        assert_eq!(a, b, "stagger must be deterministic for the same job");
        let base = Utc.with_ymd_and_hms(2026, 2, 15, 13, 0, 0).unwrap();
        let offset = (a - base).num_milliseconds();
        assert!((0..DEFAULT_TOP_OF_HOUR_STAGGER_RANGE_MS).contains(&offset));
    }

    #[test]
    fn top_of_hour_cron_stagger_differs_across_jobs_with_same_expr() {
        let sched = Schedule::Cron {
            expr: "0 13 * * *".to_string(),
            tz: "UTC".to_string(),
            stagger_ms: None,
        };
        let from = Utc.with_ymd_and_hms(2026, 2, 14, 13, 0, 0).unwrap();
        let a = compute_next_run("job-a", &sched, from).unwrap();
        let b = compute_next_run("job-b", &sched, from).unwrap();
        assert_ne!(
            a, b,
            "two jobs sharing a top-of-hour expression must not get the same stagger"
        );
    }

    #[test]
    fn anti_spin_refire_respects_min_gap() {
        let sched = Schedule::Cron {
            expr: "0 13 * * *".to_string(),
            tz: "UTC".to_string(),
            stagger_ms: Some(0),
        };
        let fired_at = Utc.with_ymd_and_hms(2026, 2, 15, 13, 0, 0).unwrap();
        let ended_at_ms = fired_at.timestamp_millis() + 7;
        let next = next_after_anti_spin("job-1", &sched, ended_at_ms).unwrap();
        assert!(next.timestamp_millis() >= ended_at_ms + MIN_REFIRE_GAP_MS);
        assert!(next > fired_at);
    }
}
