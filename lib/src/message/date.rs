//! HTTP-date (IMF-fixdate) formatting and parsing
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, Weekday};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Monday => "Mon",
        Weekday::Tuesday => "Tue",
        Weekday::Wednesday => "Wed",
        Weekday::Thursday => "Thu",
        Weekday::Friday => "Fri",
        Weekday::Saturday => "Sat",
        Weekday::Sunday => "Sun",
    }
}

/// `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn format_http_date(date: OffsetDateTime) -> String {
    let date = date.to_offset(time::UtcOffset::UTC);
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        weekday_name(date.weekday()),
        date.day(),
        MONTHS[usize::from(u8::from(date.month())) - 1],
        date.year(),
        date.hour(),
        date.minute(),
        date.second(),
    )
}

pub fn http_date_now() -> String {
    format_http_date(OffsetDateTime::now_utc())
}

/// Parse an IMF-fixdate, the day may have one or two digits and the weekday
/// is not checked
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let mut parts = value.split_ascii_whitespace();
    let _weekday = parts.next()?.strip_suffix(',')?;
    let day: u8 = parse_digits(parts.next()?, 1, 2)?;
    let month_name = parts.next()?;
    let month_index = MONTHS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(month_name))?;
    let month = Month::try_from(month_index as u8 + 1).ok()?;
    let year: i32 = parse_digits(parts.next()?, 4, 4)?;

    let mut clock = parts.next()?.split(':');
    let hour: u8 = parse_digits(clock.next()?, 2, 2)?;
    let minute: u8 = parse_digits(clock.next()?, 2, 2)?;
    let second: u8 = parse_digits(clock.next()?, 2, 2)?;
    if clock.next().is_some() || parts.next()? != "GMT" || parts.next().is_some() {
        return None;
    }

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

fn parse_digits<T: std::str::FromStr>(value: &str, min: usize, max: usize) -> Option<T> {
    if value.len() < min || value.len() > max || !value.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_parse() {
        let date = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").expect("valid date");
        assert_eq!(date.unix_timestamp(), 784111777);
        assert_eq!(format_http_date(date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn single_digit_day() {
        let short = parse_http_date("Mon, 5 Dec 2016 13:59:39 GMT").expect("valid date");
        let long = parse_http_date("Mon, 05 Dec 2016 13:59:39 GMT").expect("valid date");
        assert_eq!(short, long);
    }

    #[test]
    fn invalid_dates() {
        for value in [
            "",
            "Sun 06 Nov 1994 08:49:37 GMT",
            "Sun, 06 Nov 94 08:49:37 GMT",
            "Sun, 31 Feb 1994 08:49:37 GMT",
            "Sun, 06 Nov 1994 08:49 GMT",
            "Sun, 06 Nov 1994 08:49:37 UTC",
            "Sun, 006 Nov 1994 08:49:37 GMT",
        ] {
            assert!(parse_http_date(value).is_none(), "{value} should not parse");
        }
    }
}
