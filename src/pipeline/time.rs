/// Time discretization.
///
/// Raw time values are converted to an absolute UTC instant, decomposed into
/// calendar parts down to the requested granularity and rebuilt from exactly
/// those parts. Cubes store the truncated instant as epoch milliseconds.
use crate::model::{Granularity, TimeEncoding};
use chrono::{DateTime, Datelike, SecondsFormat, TimeZone, Timelike, Utc};
use serde_json::Value as JsonValue;

/// Convert a raw value to an instant.
///
/// `Ok(None)` means the value is null and the dimension falls back to the
/// null sentinel. `Err` carries a description of a value that cannot be
/// read as a time at all.
pub fn to_instant(value: &JsonValue, encoding: TimeEncoding) -> Result<Option<DateTime<Utc>>, String> {
    if value.is_null() {
        return Ok(None);
    }

    let millis = match encoding {
        TimeEncoding::Millis => as_integer(value)?,
        TimeEncoding::Seconds => as_integer(value)?
            .checked_mul(1000)
            .ok_or_else(|| format!("{} seconds is out of range", value))?,
        TimeEncoding::Iso => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("expected an RFC 3339 string, got {}", value))?;
            return DateTime::parse_from_rfc3339(text)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| format!("cannot parse '{}': {}", text, e));
        }
    };

    from_millis(millis).map(Some)
}

/// Truncate an instant to `granularity`, discarding finer components.
pub fn truncate(instant: DateTime<Utc>, granularity: Granularity) -> Result<DateTime<Utc>, String> {
    let month = if granularity >= Granularity::Month {
        instant.month()
    } else {
        1
    };
    let day = if granularity >= Granularity::Day {
        instant.day()
    } else {
        1
    };
    let hour = if granularity >= Granularity::Hour {
        instant.hour()
    } else {
        0
    };

    Utc.with_ymd_and_hms(instant.year(), month, day, hour, 0, 0)
        .single()
        .ok_or_else(|| format!("cannot rebuild {} at {}", instant, granularity))
}

/// Discretize a raw value straight to truncated epoch milliseconds.
pub fn discretize(
    value: &JsonValue,
    encoding: TimeEncoding,
    granularity: Granularity,
) -> Result<Option<i64>, String> {
    match to_instant(value, encoding)? {
        Some(instant) => Ok(Some(truncate(instant, granularity)?.timestamp_millis())),
        None => Ok(None),
    }
}

/// Coerce a filter bound to epoch milliseconds.
///
/// Accepts numbers, integer strings and RFC 3339 strings.
pub fn coerce_bound(value: &JsonValue) -> Result<i64, String> {
    if let Some(text) = value.as_str() {
        if let Ok(ms) = text.trim().parse::<i64>() {
            return Ok(ms);
        }
        return DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| format!("cannot parse time bound '{}': {}", text, e));
    }
    as_integer(value)
}

/// Render stored epoch milliseconds in the requested output format.
pub fn render(millis: &JsonValue, iso: bool) -> JsonValue {
    if !iso {
        return millis.clone();
    }
    match millis.as_i64().and_then(|ms| from_millis(ms).ok()) {
        Some(dt) => JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => millis.clone(),
    }
}

fn as_integer(value: &JsonValue) -> Result<i64, String> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| format!("{} is not a usable time", n)),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer time", s)),
        other => Err(format!("{} is not a time value", other)),
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| format!("{} ms is out of range", millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // 2020-05-12T13:30:00Z
    const HALF_PAST: i64 = 1_589_290_200_000;

    #[test]
    fn test_truncate_each_granularity() {
        let value = json!(HALF_PAST);
        let at = |g| discretize(&value, TimeEncoding::Millis, g).unwrap().unwrap();

        assert_eq!(at(Granularity::Hour), 1_589_288_400_000);
        assert_eq!(at(Granularity::Day), 1_589_241_600_000);
        assert_eq!(at(Granularity::Month), 1_588_291_200_000);
        assert_eq!(at(Granularity::Year), 1_577_836_800_000);
    }

    #[test]
    fn test_encodings_agree() {
        let ms = discretize(&json!(HALF_PAST), TimeEncoding::Millis, Granularity::Hour).unwrap();
        let text = discretize(&json!(HALF_PAST.to_string()), TimeEncoding::Millis, Granularity::Hour).unwrap();
        let secs = discretize(&json!(HALF_PAST / 1000), TimeEncoding::Seconds, Granularity::Hour).unwrap();
        let iso = discretize(&json!("2020-05-12T13:30:00Z"), TimeEncoding::Iso, Granularity::Hour).unwrap();

        assert_eq!(ms, text);
        assert_eq!(ms, secs);
        assert_eq!(ms, iso);
    }

    #[test]
    fn test_null_is_not_an_error() {
        assert_eq!(discretize(&JsonValue::Null, TimeEncoding::Millis, Granularity::Day).unwrap(), None);
    }

    #[test]
    fn test_unreadable_values() {
        assert!(discretize(&json!("yesterday"), TimeEncoding::Millis, Granularity::Day).is_err());
        assert!(discretize(&json!(true), TimeEncoding::Millis, Granularity::Day).is_err());
        assert!(discretize(&json!(12), TimeEncoding::Iso, Granularity::Day).is_err());
    }

    #[test]
    fn test_coerce_bound() {
        assert_eq!(coerce_bound(&json!(HALF_PAST)).unwrap(), HALF_PAST);
        assert_eq!(coerce_bound(&json!("1589290200000")).unwrap(), HALF_PAST);
        assert_eq!(coerce_bound(&json!("2020-05-12T13:30:00.000Z")).unwrap(), HALF_PAST);
        assert!(coerce_bound(&json!({"x": 1})).is_err());
    }

    #[test]
    fn test_render_iso() {
        assert_eq!(render(&json!(HALF_PAST), false), json!(HALF_PAST));
        assert_eq!(render(&json!(HALF_PAST), true), json!("2020-05-12T13:30:00.000Z"));
        assert_eq!(render(&json!("__null__"), true), json!("__null__"));
    }
}
