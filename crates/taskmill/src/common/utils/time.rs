use std::time::Duration;

use anyhow::anyhow;

/// Parses durations given in humantime format (`30s`, `5m`, `2h`) or as plain seconds.
pub fn parse_duration(text: &str) -> anyhow::Result<Duration> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text)
        .map_err(|e| anyhow!("Invalid duration `{text}`, use e.g. `90s` or `5m`: {e}"))
}
