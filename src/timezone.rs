//! Resolving IANA time zone names to the offset used for month boundaries.

use time::{OffsetDateTime, UtcOffset};
use time_tz::{Offset, TimeZone};

/// Get the current time in `canonical_timezone`, e.g. "Pacific/Auckland".
///
/// Returns `None` if the time zone name is not known.
pub fn now_in_timezone(canonical_timezone: &str) -> Option<OffsetDateTime> {
    let now = OffsetDateTime::now_utc();

    offset_at(canonical_timezone, now).map(|offset| now.to_offset(offset))
}

fn offset_at(canonical_timezone: &str, instant: OffsetDateTime) -> Option<UtcOffset> {
    time_tz::timezones::get_by_name(canonical_timezone)
        .map(|tz| tz.get_offset_utc(&instant).to_utc())
}

#[cfg(test)]
mod tests {
    use time::{UtcOffset, macros::datetime};

    use crate::timezone::{now_in_timezone, offset_at};

    #[test]
    fn resolves_known_timezone() {
        assert_eq!(
            now_in_timezone("Etc/UTC").map(|now| now.offset()),
            Some(UtcOffset::UTC)
        );
    }

    #[test]
    fn unknown_timezone_is_none() {
        assert_eq!(offset_at("Mars/Olympus_Mons", datetime!(2024-01-15 00:00 UTC)), None);
        assert_eq!(now_in_timezone("Mars/Olympus_Mons"), None);
    }

    #[test]
    fn follows_daylight_saving() {
        let summer = offset_at("Pacific/Auckland", datetime!(2024-01-15 00:00 UTC)).unwrap();
        let winter = offset_at("Pacific/Auckland", datetime!(2024-07-15 00:00 UTC)).unwrap();

        assert_eq!(summer.whole_hours(), 13);
        assert_eq!(winter.whole_hours(), 12);
    }
}
