//! Shared CLI argument parsers.

use std::time::Duration;
use vmctl::connection::ssh_uri;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a memory size in MiB, accepting an optional `M`/`G` suffix.
pub fn parse_memory(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    let (digits, factor) = match trimmed.chars().last() {
        Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1),
        _ => (trimmed, 1),
    };
    let value = digits
        .parse::<u64>()
        .map_err(|_| format!("invalid memory size: {}", s))?;
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("memory size too large: {}", s))
}

/// Turn a connection destination into a URI.
///
/// Full URIs pass through. `[user@]host` becomes an `ssh://` URI on `port`
/// pointing at `socket`.
pub fn destination_to_uri(destination: &str, port: u16, socket: &str) -> String {
    if destination.contains("://") {
        return destination.to_string();
    }
    match destination.split_once('@') {
        Some((user, host)) => ssh_uri(user, host, port, socket),
        None => ssh_uri("", destination, port, socket),
    }
}
