use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";

/// A parsed crontab expression.
///
/// When both day-of-month and day-of-week are restricted, a day matches if
/// either field does, as in classic cron. That case is held as two
/// schedules and the earlier occurrence wins.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    /// First occurrence strictly after `from`.
    pub fn after(&self, from: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules.iter().filter_map(|s| s.after(from).next()).min()
    }
}

/// Parses a classic 5-field crontab expression (minute precision, UTC).
///
/// The `cron` crate wants a leading seconds field and numbers weekdays
/// 1-7 from Sunday, so both are adapted here. Day names pass through.
pub fn parse_schedule(expr: &str) -> anyhow::Result<CronSchedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        anyhow::bail!("expected 5 fields (minute hour day month weekday), got {}", fields.len());
    }
    let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
    let dow = translate_weekdays(fields[4])?;

    let variants = if is_restricted(dom) && is_restricted(fields[4]) {
        vec![(dom, "*"), ("*", dow.as_str())]
    } else {
        vec![(dom, dow.as_str())]
    };
    let schedules = variants
        .into_iter()
        .map(|(dom, dow)| {
            Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}")).map_err(|e| anyhow::anyhow!("{e}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CronSchedule { schedules })
}

/// First occurrence strictly after `from`.
pub fn next_run_after(expr: &str, from: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    parse_schedule(expr)?
        .after(&from)
        .ok_or_else(|| anyhow::anyhow!("schedule {expr:?} has no future occurrence"))
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

fn parse_weekday(n: &str) -> anyhow::Result<u32> {
    n.parse::<u32>()
        .ok()
        .filter(|d| *d <= 7)
        .ok_or_else(|| anyhow::anyhow!("invalid weekday {n:?}"))
}

/// Rewrites a numeric crontab weekday field (0-7, Sunday is 0 and 7) as an
/// explicit list in the `cron` crate's numbering.
fn translate_weekdays(field: &str) -> anyhow::Result<String> {
    if !is_restricted(field) || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((b, s)) => {
                let step = s
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| anyhow::anyhow!("invalid weekday step {s:?}"))?;
                (b, Some(step))
            }
            None => (item, None),
        };
        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((a, b)) => (parse_weekday(a)?, parse_weekday(b)?),
            None => {
                let start = parse_weekday(base)?;
                (start, if step.is_some() { start.max(6) } else { start })
            }
        };
        if start > end {
            anyhow::bail!("invalid weekday range {base:?}");
        }
        days.extend((start..=end).step_by(step.unwrap_or(1)).map(|d| d % 7));
    }

    Ok(days.iter().map(|d| (d + 1).to_string()).collect::<Vec<_>>().join(","))
}
