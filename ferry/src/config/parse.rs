//! Parsers for configuration values.
//!
//! Sizes take an optional `k`/`m`/`g` suffix (powers of 1024), durations a
//! `ns`/`us`/`ms`/`s` suffix (bare numbers are nanoseconds).

use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty value")]
    Empty,
    #[error("not a number: {0}")]
    NotANumber(String),
    #[error("unknown suffix '{suffix}' in {value}")]
    UnknownSuffix { value: String, suffix: String },
    #[error("value overflows: {0}")]
    Overflow(String),
    #[error("not a boolean: {0}")]
    NotABool(String),
}

fn split_number(value: &str) -> Result<(u64, &str), ParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ParseError::Empty);
    }
    let digits = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    if digits == 0 {
        return Err(ParseError::NotANumber(value.to_owned()));
    }
    let number = value[..digits]
        .parse::<u64>()
        .map_err(|_| ParseError::Overflow(value.to_owned()))?;
    Ok((number, &value[digits..]))
}

/// Parses a byte size such as `64k`, `1m` or `4096`.
///
/// # Errors
///
/// Fails on an empty or non-numeric value, an unknown suffix, or overflow.
pub fn parse_size64(value: &str) -> Result<u64, ParseError> {
    let (number, suffix) = split_number(value)?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1 << 10,
        "m" | "M" => 1 << 20,
        "g" | "G" => 1 << 30,
        _ => {
            return Err(ParseError::UnknownSuffix {
                value: value.to_owned(),
                suffix: suffix.to_owned(),
            });
        }
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| ParseError::Overflow(value.to_owned()))
}

/// Parses a duration such as `1234ms`, `3s` or `500us`.
///
/// # Errors
///
/// Fails on an empty or non-numeric value, an unknown suffix, or overflow.
pub fn parse_duration(value: &str) -> Result<Duration, ParseError> {
    let (number, suffix) = split_number(value)?;
    let nanos_per_unit: u64 = match suffix.to_ascii_lowercase().as_str() {
        "" | "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        _ => {
            return Err(ParseError::UnknownSuffix {
                value: value.to_owned(),
                suffix: suffix.to_owned(),
            });
        }
    };
    number
        .checked_mul(nanos_per_unit)
        .map(Duration::from_nanos)
        .ok_or_else(|| ParseError::Overflow(value.to_owned()))
}

/// Parses `true`/`false`, `1`/`0`, `yes`/`no` or `on`/`off`, ignoring case.
///
/// # Errors
///
/// Fails on anything else.
pub fn parse_bool(value: &str) -> Result<bool, ParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        "" => Err(ParseError::Empty),
        _ => Err(ParseError::NotABool(value.to_owned())),
    }
}
