pub const SECOND: u64 = 1;
pub const MINUTE: u64 = 60;
pub const HOUR: u64 = 60 * MINUTE;
pub const DAY: u64 = 24 * HOUR;
pub const WEEK: u64 = 7 * DAY;
/// Mean Gregorian year (365.2425 days)
pub const YEAR: u64 = 31_556_952;
pub const MONTH: u64 = YEAR / 12;

/// Unit used to present durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TimeUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// All units, smallest first
    pub const ALL: [TimeUnit; 7] = [
        TimeUnit::Seconds,
        TimeUnit::Minutes,
        TimeUnit::Hours,
        TimeUnit::Days,
        TimeUnit::Weeks,
        TimeUnit::Months,
        TimeUnit::Years,
    ];

    /// Length of one unit in seconds
    pub fn divisor(self) -> u64 {
        match self {
            TimeUnit::Seconds => SECOND,
            TimeUnit::Minutes => MINUTE,
            TimeUnit::Hours => HOUR,
            TimeUnit::Days => DAY,
            TimeUnit::Weeks => WEEK,
            TimeUnit::Months => MONTH,
            TimeUnit::Years => YEAR,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        }
    }

    pub fn short_label(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "min",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        }
    }

    /// Largest unit whose length does not exceed `seconds`
    pub fn for_duration(seconds: u64) -> TimeUnit {
        TimeUnit::ALL
            .iter()
            .rev()
            .copied()
            .find(|unit| seconds >= unit.divisor())
            .unwrap_or(TimeUnit::Seconds)
    }

    /// Expresses `seconds` in this unit
    pub fn scale(self, seconds: u64) -> f64 {
        seconds as f64 / self.divisor() as f64
    }
}

/// Formats a duration with one decimal in its natural unit, e.g. `"1.5 hours"`
pub fn format_duration(seconds: u64) -> String {
    let unit = TimeUnit::for_duration(seconds);
    format!("{:.1} {}", unit.scale(seconds), unit.short_label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, TimeUnit::Seconds)]
    #[case(59, TimeUnit::Seconds)]
    #[case(60, TimeUnit::Minutes)]
    #[case(HOUR - 1, TimeUnit::Minutes)]
    #[case(HOUR, TimeUnit::Hours)]
    #[case(DAY, TimeUnit::Days)]
    #[case(WEEK + 1, TimeUnit::Weeks)]
    #[case(MONTH, TimeUnit::Months)]
    #[case(YEAR - 1, TimeUnit::Months)]
    #[case(3 * YEAR, TimeUnit::Years)]
    fn test_unit_for_duration(#[case] seconds: u64, #[case] expected: TimeUnit) {
        assert_eq!(TimeUnit::for_duration(seconds), expected);
    }

    #[test]
    fn test_divisors_are_increasing() {
        for pair in TimeUnit::ALL.windows(2) {
            assert!(pair[0].divisor() < pair[1].divisor());
        }
        assert_eq!(MONTH, 2_629_746);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0.0 s");
        assert_eq!(format_duration(90), "1.5 min");
        assert_eq!(format_duration(2 * HOUR), "2.0 hours");
        assert_eq!(format_duration(YEAR), "1.0 years");
    }
}
