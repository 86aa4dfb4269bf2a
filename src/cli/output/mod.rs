//! Plain-text rendering of repository snapshots for the terminal.

use ansi_term::{Colour, Style};
use chrono::{DateTime, Local, Utc};

use crate::{
    repository::{days::DayBucket, RepositorySnapshot, RECENT_DAYS},
    store::entities::PracticeRecordEntity,
    utils::time::format_minutes,
    widget::WidgetEntry,
};

const TIME_FORMAT: &str = "%x %H:%M:%S";

fn format_timestamp(item: &PracticeRecordEntity, now: DateTime<Utc>) -> String {
    item.effective_timestamp(now)
        .with_timezone(&Local)
        .format(TIME_FORMAT)
        .to_string()
}

/// One line per record, prefixed with the position used by `delete` and `adjust`.
pub fn render_items(snapshot: &RepositorySnapshot, only_this_device: bool) -> String {
    let mut lines = vec![];
    for (position, item) in snapshot.items.iter().enumerate() {
        if only_this_device && !item.is_created_by(&snapshot.device_id) {
            continue;
        }
        lines.push(format!(
            "{position}\t{}\t{}",
            format_timestamp(item, snapshot.taken_at),
            format_minutes(*item.duration_minutes)
        ));
    }
    if lines.is_empty() {
        lines.push("No practice in the last 30 days".into());
    }
    lines.join("\n")
}

fn render_bucket(bucket: &DayBucket, now: DateTime<Utc>) -> String {
    let header = format!(
        "{}\t{}",
        bucket.date_key,
        format_minutes(bucket.total_duration())
    );
    let header = if bucket.items.is_empty() {
        Style::new().dimmed().paint(header).to_string()
    } else {
        Style::new().bold().paint(header).to_string()
    };
    let mut lines = vec![header];
    for item in &bucket.items {
        lines.push(format!(
            "\t{}\t{}",
            format_timestamp(item, now),
            format_minutes(*item.duration_minutes)
        ));
    }
    lines.join("\n")
}

pub fn render_totals(snapshot: &RepositorySnapshot) -> String {
    format!(
        "Total (30 days): {}\nStored total: {}\nLast {RECENT_DAYS} days: {}",
        Colour::Green.paint(format_minutes(snapshot.total_duration)),
        Colour::Green.paint(format_minutes(snapshot.total_duration_sum)),
        format_minutes(snapshot.recent_duration),
    )
}

/// The seven day buckets followed by both totals.
pub fn render_days(snapshot: &RepositorySnapshot, only_this_device: bool) -> String {
    let days = if only_this_device {
        &snapshot.device_days
    } else {
        &snapshot.days
    };
    let mut sections = days
        .iter()
        .map(|bucket| render_bucket(bucket, snapshot.taken_at))
        .collect::<Vec<_>>();
    sections.push(render_totals(snapshot));
    sections.join("\n")
}

pub fn render_widget(entry: &WidgetEntry) -> String {
    if entry.is_placeholder() {
        return "Practice: -".into();
    }
    format!(
        "Practice: {} (updated {})",
        format_minutes(entry.sum),
        entry.date.with_timezone(&Local).format(TIME_FORMAT)
    )
}
