use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::{
    store::entities::PracticeRecordEntity,
    utils::time::{date_to_bucket_key, next_day_start, start_of_day_before},
};

/// Records of a single calendar day.
#[derive(Debug, Clone, PartialEq)]
pub struct DayBucket {
    pub date: NaiveDate,
    /// `MM-DD-YYYY`
    pub date_key: String,
    pub items: Vec<PracticeRecordEntity>,
}

impl DayBucket {
    pub fn total_duration(&self) -> f64 {
        self.items.iter().map(|item| *item.duration_minutes).sum()
    }
}

/// Calendar day bounds as `[start, end)`, where `end` is the start of the following day. Days
/// shortened or stretched by clock changes keep their local length.
pub fn day_bounds<Tz: TimeZone>(
    now: &DateTime<Tz>,
    days_back: u64,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start_of_day_before(now, days_back);
    let end = next_day_start(&start);
    (start.with_timezone(&Utc), end.with_timezone(&Utc))
}

/// Groups `items` into one bucket per day for `days` days ending today, oldest first. Every
/// day gets a bucket even when it has no records. `items` are expected in ascending timestamp
/// order, which each bucket preserves.
pub fn group_by_day<Tz: TimeZone>(
    items: &[&PracticeRecordEntity],
    now: &DateTime<Tz>,
    days: u64,
) -> Vec<DayBucket> {
    let now_utc = now.with_timezone(&Utc);
    (0..days)
        .rev()
        .map(|days_back| {
            let (start, end) = day_bounds(now, days_back);
            let date = start.with_timezone(&now.timezone()).date_naive();
            let items = items
                .iter()
                .filter(|item| {
                    let timestamp = item.effective_timestamp(now_utc);
                    start <= timestamp && timestamp < end
                })
                .map(|item| (*item).clone())
                .collect();
            DayBucket {
                date,
                date_key: date_to_bucket_key(date),
                items,
            }
        })
        .collect()
}
