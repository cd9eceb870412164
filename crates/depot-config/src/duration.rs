//! Human-friendly duration literals.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Parse `"250ms"`, `"5s"`, `"30m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::invalid("duration", format!("'{}' is not a duration", input)))?;

    let secs = |scale: u64| {
        value
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::invalid("duration", format!("'{}' is too large", input)))
    };

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => secs(60),
        "h" => secs(3600),
        other => Err(ConfigError::invalid(
            "duration",
            format!("unknown unit '{}' in '{}'", other, input),
        )),
    }
}
