use time::Duration;

use crate::error::Error;

// Nanoseconds per unit
const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 60 * 60 * 1_000_000_000),
];

/// Parses a duration string such as `"300ms"`, `"1.5h"` or `"1h30m"`.
///
/// A duration is an optionally signed sequence of decimal numbers, each with
/// an optional fraction and a mandatory unit. The lone string `"0"` is also
/// accepted.
pub fn parse(value: &str) -> Result<Duration, Error> {
    let err = || Error::parse("duration", value);

    let (negative, mut rest) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(err());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (whole, after) = split_digits(rest);
        let (fraction, after) = match after.strip_prefix('.') {
            Some(after) => split_digits(after),
            None => ("", after),
        };
        // "." alone or a missing number before the unit
        if whole.is_empty() && fraction.is_empty() {
            return Err(err());
        }

        let unit_len = after
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(after.len());
        let unit = &after[..unit_len];
        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(err)?;

        total = total
            .checked_add(component(whole, fraction, scale).ok_or_else(err)?)
            .ok_or_else(err)?;
        rest = &after[unit_len..];
    }

    let nanos = i64::try_from(total).map_err(|_| err())?;
    Ok(Duration::nanoseconds(if negative { -nanos } else { nanos }))
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn component(whole: &str, fraction: &str, scale: u128) -> Option<u128> {
    let mut nanos: u128 = 0;
    for d in whole.bytes() {
        nanos = nanos.checked_mul(10)?.checked_add(u128::from(d - b'0'))?;
    }
    nanos = nanos.checked_mul(scale)?;

    // Anything past nanosecond precision is dropped
    let mut frac: u128 = 0;
    let mut div: u128 = 1;
    for d in fraction.bytes().take(18) {
        frac = frac * 10 + u128::from(d - b'0');
        div *= 10;
    }
    nanos.checked_add(frac * scale / div)
}

#[cfg(test)]
mod test_duration {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn simple_units() {
        assert_eq!(parse("1s").unwrap(), Duration::seconds(1));
        assert_eq!(parse("300ms").unwrap(), Duration::milliseconds(300));
        assert_eq!(parse("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse("10us").unwrap(), Duration::microseconds(10));
        assert_eq!(parse("10µs").unwrap(), Duration::microseconds(10));
        assert_eq!(parse("7ns").unwrap(), Duration::nanoseconds(7));
    }

    #[test]
    fn compound_and_fraction() {
        assert_eq!(parse("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse("1.5h").unwrap(), Duration::minutes(90));
        assert_eq!(parse(".5s").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse("1.s").unwrap(), Duration::seconds(1));
        assert_eq!(parse("2m3.25s").unwrap(), Duration::milliseconds(123_250));
    }

    #[test]
    fn sign_and_zero() {
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
        assert_eq!(parse("-0").unwrap(), Duration::ZERO);
        assert_eq!(parse("+1s").unwrap(), Duration::seconds(1));
        assert_eq!(parse("-1m").unwrap(), Duration::minutes(-1));
    }

    #[test]
    fn malformed() {
        for bad in ["", "-", "1", "s", "1x", "1.5", ".s", "1s2", "one second", "1 s", "+", "5M"] {
            assert!(
                matches!(parse(bad), Err(Error::ParseError { .. })),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn overflow() {
        assert!(parse("9999999999999999999h").is_err());
        assert!(parse("3000000h").is_err());
    }

    proptest! {
        #[test]
        fn prop_whole_seconds(secs in 0i64..1_000_000) {
            prop_assert_eq!(parse(&format!("{}s", secs)).unwrap(), Duration::seconds(secs));
        }

        #[test]
        fn prop_never_panics(s in "\\PC{0,16}") {
            let _ = parse(&s);
        }
    }
}
