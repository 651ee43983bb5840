use std::time::Duration;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// RFC 1123 date as sent in HTTP headers, always in GMT.
const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Parse a `Retry-After` value: delta seconds or an HTTP date.
///
/// Dates in the past clamp to zero. Returns `None` when the value is neither.
pub fn parse_retry_after(value: &str, now: OffsetDateTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = PrimitiveDateTime::parse(value, HTTP_DATE).ok()?.assume_utc();
    let wait = at - now;
    if wait.is_negative() {
        return Some(Duration::ZERO);
    }
    wait.try_into().ok()
}
