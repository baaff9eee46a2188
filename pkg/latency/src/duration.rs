use std::{fmt::Write as _, time::Duration};

use crate::LatencyError;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;
const MAX_FRACTION_DIGITS: usize = 18;

/// Parses durations written as a sequence of decimal numbers with unit
/// suffixes: `300ms`, `1.5s`, `1h30m`, `250us`. A bare `0` is accepted and a
/// leading sign is allowed, but anything negative other than zero is rejected.
pub fn parse_duration(input: &str) -> Result<Duration, LatencyError> {
    let invalid = |reason: &'static str| LatencyError::InvalidDuration {
        input: input.to_string(),
        reason,
    };

    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (whole, after) = split_digits(rest);
        let (fraction, after) = match after.strip_prefix('.') {
            Some(after_dot) => split_digits(after_dot),
            None => ("", after),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("expected a number"));
        }

        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, after) = after.split_at(unit_len);
        let scale = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => NANOS_PER_MICRO,
            "ms" => NANOS_PER_MILLI,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3_600 * NANOS_PER_SEC,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("overflow"))?
        };
        let mut value = whole.checked_mul(scale).ok_or_else(|| invalid("overflow"))?;
        if !fraction.is_empty() {
            let digits = &fraction[..fraction.len().min(MAX_FRACTION_DIGITS)];
            let numerator: u128 = digits.parse().map_err(|_| invalid("overflow"))?;
            value = value
                .checked_add(numerator * scale / 10u128.pow(digits.len() as u32))
                .ok_or_else(|| invalid("overflow"))?;
        }
        total = total.checked_add(value).ok_or_else(|| invalid("overflow"))?;
        rest = after;
    }

    let nanos = u64::try_from(total).map_err(|_| invalid("overflow"))?;
    if negative && nanos > 0 {
        return Err(LatencyError::NegativeDuration(input.to_string()));
    }
    Ok(Duration::from_nanos(nanos))
}

/// Renders a duration the way `parse_duration` reads it back: `0s`, `750ns`,
/// `1.5µs`, `120ms`, `1.5s`, `2m30s`, `1h0m0s`.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < NANOS_PER_MICRO {
        return format!("{nanos}ns");
    }
    if nanos < NANOS_PER_MILLI {
        return format!("{}µs", decimal(nanos / NANOS_PER_MICRO, nanos % NANOS_PER_MICRO, 3));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", decimal(nanos / NANOS_PER_MILLI, nanos % NANOS_PER_MILLI, 6));
    }

    let total_secs = nanos / NANOS_PER_SEC;
    let hours = total_secs / 3_600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    out.push_str(&decimal(seconds, nanos % NANOS_PER_SEC, 9));
    out.push('s');
    out
}

fn split_digits(value: &str) -> (&str, &str) {
    let len = value.bytes().take_while(u8::is_ascii_digit).count();
    value.split_at(len)
}

fn decimal(whole: u128, fraction: u128, width: usize) -> String {
    if fraction == 0 {
        return whole.to_string();
    }
    let digits = format!("{fraction:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
