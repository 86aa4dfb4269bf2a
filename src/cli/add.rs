use std::fmt::Display;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use chrono_english::parse_date_string;
use clap::{CommandFactory, Parser, ValueEnum};

use crate::store::entities::DurationMinutes;

use super::Args;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Parser)]
pub struct AddCommand {
    #[arg(
        long = "at",
        help = "When the session happened. Examples are \"yesterday\", \"1 hour ago\", \"15/03/2025\", \"12:00 16/03/2025\". Defaults to now"
    )]
    at: Option<String>,
    #[arg(long, short, default_value_t = DurationMinutes::DEFAULT, help = "Length of the session in minutes")]
    minutes: DurationMinutes,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
}

pub struct AddParams {
    pub at: Option<DateTime<Utc>>,
    pub minutes: DurationMinutes,
}

impl AddCommand {
    pub fn parse_values(self, now: DateTime<Local>) -> Result<AddParams> {
        let AddCommand {
            at,
            minutes,
            date_style,
        } = self;
        let at = match at.map(|s| parse_date_string(&s, now, date_style.into())) {
            Some(Ok(v)) => Some(v.with_timezone(&Utc)),
            Some(Err(e)) => {
                return Err(Args::command()
                    .error(
                        clap::error::ErrorKind::ValueValidation,
                        format!("Failed to validate date {e}"),
                    )
                    .into());
            }
            None => None,
        };
        Ok(AddParams { at, minutes })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone, Utc};
    use clap::Parser;

    use super::AddCommand;

    #[test]
    fn test_parse_relative_date() {
        let now = Local.with_ymd_and_hms(2025, 3, 16, 12, 0, 0).unwrap();
        let command = AddCommand::parse_from(["add", "--at", "1 hour ago", "--minutes", "12.5"]);
        let params = command.parse_values(now).unwrap();
        assert_eq!(
            params.at,
            Some((now - chrono::Duration::hours(1)).with_timezone(&Utc))
        );
        assert_eq!(*params.minutes, 12.5);
    }

    #[test]
    fn test_default_is_now_and_five_minutes() {
        let now = Local.with_ymd_and_hms(2025, 3, 16, 12, 0, 0).unwrap();
        let params = AddCommand::parse_from(["add"]).parse_values(now).unwrap();
        assert_eq!(params.at, None);
        assert_eq!(*params.minutes, 5.);
    }

    #[test]
    fn test_rejects_negative_minutes() {
        assert!(AddCommand::try_parse_from(["add", "--minutes", "-3"]).is_err());
    }

    #[test]
    fn test_rejects_garbage_date() {
        let now = Local.with_ymd_and_hms(2025, 3, 16, 12, 0, 0).unwrap();
        let command = AddCommand::parse_from(["add", "--at", "whenever you like"]);
        assert!(command.parse_values(now).is_err());
    }
}
