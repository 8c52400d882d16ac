use chrono::TimeDelta;

/// Format a duration with `{days}`, `{hrs}`, `{min}` and `{sec}` placeholders.
///
/// `{hrs}` counts the hours beyond whole days and `{sec}` keeps two
/// decimals, so `strfdelta(d, "{hrs}h {min}m {sec}s")` reads `1h 2m 3.5s`.
pub fn strfdelta(delta: TimeDelta, fmt: &str) -> String {
    let days = delta.num_days();
    let micros_in_day = (delta - TimeDelta::days(days))
        .num_microseconds()
        .unwrap_or(0);

    const MICROS_PER_SECOND: i64 = 1_000_000;
    const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
    const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

    let hrs = micros_in_day / MICROS_PER_HOUR;
    let rem = micros_in_day % MICROS_PER_HOUR;
    let min = rem / MICROS_PER_MINUTE;
    let sec = (rem % MICROS_PER_MINUTE) as f64 / MICROS_PER_SECOND as f64;

    fmt.replace("{days}", &days.to_string())
        .replace("{hrs}", &hrs.to_string())
        .replace("{min}", &min.to_string())
        .replace("{sec}", &format_seconds(sec))
}

/// Seconds rounded to two decimals, always with a fractional part.
fn format_seconds(sec: f64) -> String {
    let rounded = (sec * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{rounded:.1}")
    } else {
        format!("{rounded}")
    }
}

/// Whole hours, minutes and seconds of a millisecond wall time: `0h 1m 5s`.
pub fn format_wall(wall_ms: i64) -> String {
    let h = wall_ms / 3_600_000;
    let m = (wall_ms / 60_000) % 60;
    let s = (wall_ms / 1000) % 60;
    format!("{h}h {m}m {s}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strfdelta() {
        let delta = TimeDelta::hours(1) + TimeDelta::minutes(2) + TimeDelta::milliseconds(3500);
        assert_eq!(strfdelta(delta, "{hrs}h {min}m {sec}s"), "1h 2m 3.5s");
    }

    #[test]
    fn test_strfdelta_zero() {
        assert_eq!(
            strfdelta(TimeDelta::zero(), "{hrs}h {min}m {sec}s"),
            "0h 0m 0.0s"
        );
    }

    #[test]
    fn test_strfdelta_days_and_rounding() {
        let delta = TimeDelta::days(2) + TimeDelta::hours(5) + TimeDelta::microseconds(1_234_567);
        assert_eq!(
            strfdelta(delta, "{days}d {hrs}h {min}m {sec}s"),
            "2d 5h 0m 1.23s"
        );
    }

    #[test]
    fn test_format_wall() {
        assert_eq!(format_wall(0), "0h 0m 0s");
        assert_eq!(format_wall(1999), "0h 0m 1s");
        assert_eq!(format_wall(3_725_000), "1h 2m 5s");
    }
}
