use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as an RFC 3339 string with millisecond precision.
    fn current_time(&self) -> String {
        rfc3339(self.now())
    }
}

pub fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse the ISO-8601 forms callers send: RFC 3339, offsets without a colon, local date-times
/// (read as UTC) and plain dates (midnight UTC).
pub fn parse_iso8601(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Some(time.with_timezone(&Utc));
    }
    if let Ok(time) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(time.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_millis_and_zulu() {
        let time = FixedTime {
            time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        };
        assert_eq!(time.current_time(), "2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn parses_iso8601_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 4, 30, 8, 0, 0).unwrap();

        assert_eq!(parse_iso8601("2024-04-30T08:00:00Z"), Some(expected));
        assert_eq!(parse_iso8601("2024-04-30T09:00:00+01:00"), Some(expected));
        assert_eq!(parse_iso8601("2024-04-30T09:00:00+0100"), Some(expected));
        assert_eq!(parse_iso8601("2024-04-30T08:00:00"), Some(expected));
        assert_eq!(
            parse_iso8601("2024-04-30T08:00:00.250"),
            Some(expected + chrono::Duration::milliseconds(250))
        );
        assert_eq!(
            parse_iso8601("2024-04-30"),
            Some(Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn rejects_non_timestamps() {
        assert_eq!(parse_iso8601("yesterday"), None);
        assert_eq!(parse_iso8601("2024-13-01"), None);
        assert_eq!(parse_iso8601(""), None);
    }
}
