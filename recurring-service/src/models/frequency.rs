//! Billing frequency and the due-date rule engine.

use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cadence of a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Yearly,
}

/// Failure to compute the next anchor date.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleRuleError {
    #[error("unknown frequency '{0}'")]
    UnknownFrequency(String),

    #[error("next date after {anchor} for {frequency} frequency is out of range")]
    OutOfRange {
        anchor: NaiveDate,
        frequency: Frequency,
    },
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Weekly,
        Frequency::Biweekly,
        Frequency::Monthly,
        Frequency::Quarterly,
        Frequency::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::Biweekly => "biweekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
        }
    }

    /// Next anchor date after `anchor`.
    ///
    /// Calendar-month steps clamp to the last day of the target month, so
    /// Jan 31 + 1 month is Feb 29 in a leap year and Feb 28 otherwise. The
    /// clamped day is carried forward on the following step.
    pub fn next_date(self, anchor: NaiveDate) -> Result<NaiveDate, ScheduleRuleError> {
        let next = match self {
            Frequency::Weekly => anchor.checked_add_days(Days::new(7)),
            Frequency::Biweekly => anchor.checked_add_days(Days::new(14)),
            Frequency::Monthly => anchor.checked_add_months(Months::new(1)),
            Frequency::Quarterly => anchor.checked_add_months(Months::new(3)),
            Frequency::Yearly => anchor.checked_add_months(Months::new(12)),
        };

        next.ok_or(ScheduleRuleError::OutOfRange {
            anchor,
            frequency: self,
        })
    }
}

impl FromStr for Frequency {
    type Err = ScheduleRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" => Ok(Frequency::Biweekly),
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            "yearly" => Ok(Frequency::Yearly),
            other => Err(ScheduleRuleError::UnknownFrequency(other.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next anchor date for a schedule's stored frequency text.
///
/// An unrecognised frequency is an error, never a silent no-advance.
pub fn next_generate_date(
    anchor: NaiveDate,
    frequency: &str,
) -> Result<NaiveDate, ScheduleRuleError> {
    frequency.parse::<Frequency>()?.next_date(anchor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekly_and_biweekly_add_fixed_days() {
        assert_eq!(Frequency::Weekly.next_date(date(2024, 3, 1)).unwrap(), date(2024, 3, 8));
        assert_eq!(
            Frequency::Biweekly.next_date(date(2024, 12, 25)).unwrap(),
            date(2025, 1, 8)
        );
    }

    #[test]
    fn monthly_clamps_to_end_of_month() {
        assert_eq!(Frequency::Monthly.next_date(date(2024, 1, 31)).unwrap(), date(2024, 2, 29));
        assert_eq!(Frequency::Monthly.next_date(date(2023, 1, 31)).unwrap(), date(2023, 2, 28));
        assert_eq!(Frequency::Monthly.next_date(date(2024, 3, 31)).unwrap(), date(2024, 4, 30));
        assert_eq!(Frequency::Monthly.next_date(date(2024, 3, 1)).unwrap(), date(2024, 4, 1));
    }

    #[test]
    fn clamped_day_carries_forward() {
        let feb = Frequency::Monthly.next_date(date(2024, 1, 31)).unwrap();
        assert_eq!(Frequency::Monthly.next_date(feb).unwrap(), date(2024, 3, 29));
    }

    #[test]
    fn quarterly_and_yearly_use_calendar_months() {
        assert_eq!(
            Frequency::Quarterly.next_date(date(2024, 11, 30)).unwrap(),
            date(2025, 2, 28)
        );
        assert_eq!(Frequency::Yearly.next_date(date(2024, 2, 29)).unwrap(), date(2025, 2, 28));
        assert_eq!(Frequency::Yearly.next_date(date(2024, 6, 15)).unwrap(), date(2025, 6, 15));
    }

    #[test]
    fn next_date_is_strictly_later_for_every_frequency() {
        let anchors = [
            date(2024, 1, 1),
            date(2024, 1, 31),
            date(2024, 2, 29),
            date(2023, 12, 31),
            date(2025, 8, 30),
        ];
        for frequency in Frequency::ALL {
            for anchor in anchors {
                let next = frequency.next_date(anchor).unwrap();
                assert!(next > anchor, "{frequency} from {anchor} gave {next}");
            }
        }
    }

    #[test]
    fn unknown_frequency_fails_loudly() {
        assert_eq!(
            next_generate_date(date(2024, 1, 1), "fortnightly"),
            Err(ScheduleRuleError::UnknownFrequency("fortnightly".to_string()))
        );
    }

    #[test]
    fn out_of_range_is_reported() {
        let err = Frequency::Yearly.next_date(NaiveDate::MAX).unwrap_err();
        assert!(matches!(err, ScheduleRuleError::OutOfRange { .. }));
    }
}
