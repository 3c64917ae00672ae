//! Coordinator timing configuration.
//!
//! Environment variables:
//! - `CSISNAP_SNAPSHOT_TIMEOUT`: how long to wait for a snapshot to be bound
//!   to a handle-bearing content. Defaults to `10m`.
//! - `CSISNAP_POLL_INTERVAL`: polling interval of that wait. Defaults to `5s`.
//! - `CSISNAP_RECREATE_POLL_INTERVAL`: polling interval used while waiting for
//!   a deleted content to disappear before it is recreated. Defaults to `1s`.
//!
//! Values use the `humantime` syntax (`90s`, `10m`, `1h 30m`). Go duration
//! strings with fractions (`1.5s`, `1m30.5s`) are accepted as well, since
//! that is how a backup's `csiSnapshotTimeout` is serialized.

use std::time::Duration;

use tracing::warn;

use crate::error::SnapshotError;

/// Overrides [`Config::snapshot_timeout`].
pub const ENV_SNAPSHOT_TIMEOUT: &str = "CSISNAP_SNAPSHOT_TIMEOUT";
/// Overrides [`Config::poll_interval`].
pub const ENV_POLL_INTERVAL: &str = "CSISNAP_POLL_INTERVAL";
/// Overrides [`Config::recreate_poll_interval`].
pub const ENV_RECREATE_POLL_INTERVAL: &str = "CSISNAP_RECREATE_POLL_INTERVAL";

const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_RECREATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timing knobs shared by every action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on the reconciliation wait when the backup sets none.
    pub snapshot_timeout: Duration,
    /// Interval between reconciliation polls.
    pub poll_interval: Duration,
    /// Interval between absence checks before a content is recreated.
    pub recreate_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            recreate_poll_interval: DEFAULT_RECREATE_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, SnapshotError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SnapshotError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str, default: Duration| match lookup(key) {
            Some(raw) if !raw.trim().is_empty() => parse_duration(key, &raw),
            _ => Ok(default),
        };

        Ok(Self {
            snapshot_timeout: read(ENV_SNAPSHOT_TIMEOUT, defaults.snapshot_timeout)?,
            poll_interval: read(ENV_POLL_INTERVAL, defaults.poll_interval)?,
            recreate_poll_interval: read(
                ENV_RECREATE_POLL_INTERVAL,
                defaults.recreate_poll_interval,
            )?,
        })
    }

    /// Reconciliation timeout for a backup, honouring its own
    /// `csiSnapshotTimeout` (e.g. `"10m0s"`) when that is set and non-zero.
    pub fn snapshot_timeout_for(&self, backup_timeout: Option<&str>) -> Duration {
        let Some(raw) = backup_timeout.filter(|s| !s.trim().is_empty()) else {
            return self.snapshot_timeout;
        };
        match parse_duration("csiSnapshotTimeout", raw) {
            Ok(d) if !d.is_zero() => d,
            Ok(_) => self.snapshot_timeout,
            Err(e) => {
                warn!(value = %raw, error = %e, "ignoring unparseable snapshot timeout");
                self.snapshot_timeout
            }
        }
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, SnapshotError> {
    let raw = raw.trim();
    humantime::parse_duration(raw).or_else(|e| {
        parse_go_duration(raw).ok_or_else(|| SnapshotError::InvalidDuration {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    })
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parse a Go `time.Duration` string: a sequence of decimal numbers, each
/// with an optional fraction and a unit (`ns`, `us`, `µs`, `ms`, `s`, `m`,
/// `h`). Negative durations are rejected.
fn parse_go_duration(raw: &str) -> Option<Duration> {
    let s = raw.strip_prefix('+').unwrap_or(raw);
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() {
        return None;
    }

    let mut rest = s;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_end);
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        rest = tail;

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3600 * NANOS_PER_SEC,
            _ => return None,
        };
        let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
        if (whole.is_empty() && frac.is_empty()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        total = total.checked_add(whole.checked_mul(scale)?)?;

        let mut place = scale;
        for digit in frac.bytes() {
            place /= 10;
            if place == 0 {
                break;
            }
            total = total.checked_add(u128::from(digit - b'0') * place)?;
        }
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).ok()?;
    let nanos = u32::try_from(total % NANOS_PER_SEC).ok()?;
    Some(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.snapshot_timeout, Duration::from_secs(600));
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.recreate_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn overrides_from_lookup() {
        let cfg = Config::from_lookup(lookup(&[
            (ENV_SNAPSHOT_TIMEOUT, "2m"),
            (ENV_POLL_INTERVAL, "500ms"),
        ]))
        .unwrap();
        assert_eq!(cfg.snapshot_timeout, Duration::from_secs(120));
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.recreate_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_garbage() {
        let err = Config::from_lookup(lookup(&[(ENV_POLL_INTERVAL, "soon")])).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidDuration { .. }));
    }

    #[test]
    fn backup_timeout_takes_precedence() {
        let cfg = Config::default();
        assert_eq!(
            cfg.snapshot_timeout_for(Some("3m0s")),
            Duration::from_secs(180)
        );
        assert_eq!(cfg.snapshot_timeout_for(Some("0s")), cfg.snapshot_timeout);
        assert_eq!(cfg.snapshot_timeout_for(None), cfg.snapshot_timeout);
        assert_eq!(cfg.snapshot_timeout_for(Some("soon")), cfg.snapshot_timeout);
    }

    #[test]
    fn fractional_go_durations_are_honoured() {
        let cfg = Config::default();
        assert_eq!(
            cfg.snapshot_timeout_for(Some("1m30.5s")),
            Duration::from_millis(90_500)
        );
        assert_eq!(cfg.snapshot_timeout_for(Some("1.5h")), Duration::from_secs(5400));
        assert_eq!(cfg.snapshot_timeout_for(Some("1.5s")), Duration::from_millis(1500));
        assert_eq!(cfg.snapshot_timeout_for(Some("2h0m0s")), Duration::from_secs(7200));
        assert_eq!(cfg.snapshot_timeout_for(Some(".25s")), Duration::from_millis(250));
        assert_eq!(cfg.snapshot_timeout_for(Some("1.5µs")), Duration::from_nanos(1500));
    }

    #[test]
    fn malformed_go_durations_fall_back() {
        let cfg = Config::default();
        for raw in ["1.2.3s", "-1m", "1x", ".s", "10"] {
            assert_eq!(cfg.snapshot_timeout_for(Some(raw)), cfg.snapshot_timeout, "{raw}");
        }
        let err = Config::from_lookup(lookup(&[(ENV_SNAPSHOT_TIMEOUT, "1.2.3s")])).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidDuration { .. }));
    }
}
