use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone};

/// Longest stretch of local time skipped by a clock change that [start_of_date] looks past.
const MAX_SKIPPED_MINUTES: i64 = 3 * 60;

/// This is the standard way of converting a date to a day bucket key in practicelog.
pub fn date_to_bucket_key(date: NaiveDate) -> String {
    date.format("%m-%d-%Y").to_string()
}

/// First instant of `date` in `timezone`. Midnight is ambiguous or skipped on some clock
/// changes, then the earliest midnight or the first instant after the gap is used.
pub fn start_of_date<Tz: TimeZone>(timezone: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = date.and_time(NaiveTime::MIN);
    (0..=MAX_SKIPPED_MINUTES)
        .find_map(|minutes| {
            timezone
                .from_local_datetime(&(midnight + Duration::minutes(minutes)))
                .earliest()
        })
        .unwrap_or_else(|| timezone.from_utc_datetime(&midnight))
}

/// Calendar start of the day that lies `days` calendar days before `moment`.
pub fn start_of_day_before<Tz: TimeZone>(moment: &DateTime<Tz>, days: u64) -> DateTime<Tz> {
    let date = moment
        .date_naive()
        .checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN);
    start_of_date(&moment.timezone(), date)
}

/// Returns start of the next day.
pub fn next_day_start<Tz: TimeZone>(date: &DateTime<Tz>) -> DateTime<Tz> {
    let date_naive = date.date_naive();
    start_of_date(&date.timezone(), date_naive.succ_opt().unwrap_or(date_naive))
}

pub fn format_minutes(minutes: f64) -> String {
    if minutes.fract() == 0.0 {
        format!("{minutes:.0} min")
    } else {
        format!("{minutes:.1} min")
    }
}

#[cfg(test)]
pub mod test_zone {
    use chrono::{
        Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    };

    /// US Eastern rules for 2024 (UTC-5, UTC-4 in summer) with clocks changing at
    /// `SWITCH_HOUR` local time on March 10th and November 3rd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DaylightSavingZone<const SWITCH_HOUR: u32>;

    pub type Eastern2024 = DaylightSavingZone<2>;

    /// Same offsets, but midnight itself is skipped in spring.
    pub type MidnightSwitch2024 = DaylightSavingZone<0>;

    // Value-namespace counterparts so the aliases can be used like unit structs.
    #[allow(non_upper_case_globals)]
    pub const Eastern2024: Eastern2024 = DaylightSavingZone;
    #[allow(non_upper_case_globals)]
    pub const MidnightSwitch2024: MidnightSwitch2024 = DaylightSavingZone;

    impl<const SWITCH_HOUR: u32> DaylightSavingZone<SWITCH_HOUR> {
        pub fn standard() -> FixedOffset {
            FixedOffset::west_opt(5 * 3600).unwrap()
        }

        pub fn daylight() -> FixedOffset {
            FixedOffset::west_opt(4 * 3600).unwrap()
        }

        fn offset_at_utc(utc: &NaiveDateTime) -> FixedOffset {
            let switch = |month, day, offset_hours| {
                NaiveDate::from_ymd_opt(2024, month, day)
                    .unwrap()
                    .and_hms_opt(SWITCH_HOUR, 0, 0)
                    .unwrap()
                    + Duration::hours(offset_hours)
            };
            if switch(3, 10, 5) <= *utc && *utc < switch(11, 3, 4) {
                Self::daylight()
            } else {
                Self::standard()
            }
        }

        fn is_valid(local: &NaiveDateTime, offset: FixedOffset) -> bool {
            let utc = *local - Duration::seconds(offset.local_minus_utc() as i64);
            Self::offset_at_utc(&utc) == offset
        }
    }

    impl<const SWITCH_HOUR: u32> TimeZone for DaylightSavingZone<SWITCH_HOUR> {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            Self
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_time(NaiveTime::MIN))
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let (daylight, standard) = (Self::daylight(), Self::standard());
            match (
                Self::is_valid(local, daylight),
                Self::is_valid(local, standard),
            ) {
                // The daylight reading is the earlier instant.
                (true, true) => LocalResult::Ambiguous(daylight, standard),
                (true, false) => LocalResult::Single(daylight),
                (false, true) => LocalResult::Single(standard),
                (false, false) => LocalResult::None,
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            Self::offset_at_utc(&utc.and_time(NaiveTime::MIN))
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            Self::offset_at_utc(utc)
        }
    }
}
