/// Tunables shared by every session of a process.
///
/// Sessions never read the registry directly: they take an
/// `Arc<WdtOptions>` snapshot when they are constructed. Changing the
/// registry while a session runs is unsupported. The running session keeps
/// the values it started with and the change applies to the next one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WdtError};

/// Prefix for environment overrides, e.g. `WDT_MAX_RETRIES=5`.
pub const ENV_PREFIX: &str = "WDT_";

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WdtOptions {
    /// Ports opened when a request doesn't say otherwise.
    pub num_ports: u16,
    pub start_port: u16,
    /// Length of one accept attempt on a receiver port.
    pub accept_timeout_millis: u64,
    /// Accept attempts per receiver port before the port is given up.
    pub max_accept_retries: u32,
    /// Dial attempts per sender port.
    pub max_retries: u32,
    /// Pause between failed dial attempts.
    pub sleep_millis: u64,
    pub connect_timeout_millis: u64,
    pub read_timeout_millis: u64,
    pub write_timeout_millis: u64,
    /// Aggregate rate cap in MiB/s. Zero or negative disables throttling.
    pub avg_mbytes_per_sec: f64,
    /// Peak rate in MiB/s, sizes the throttler burst. Ignored when below avg.
    pub max_mbytes_per_sec: f64,
    pub throttler_window_millis: u64,
    /// Size of one socket read/write chunk.
    pub buffer_size: usize,
    /// SO_SNDBUF / SO_RCVBUF for data connections.
    pub socket_buffer_size: usize,
    /// Files are split into blocks of this many MiB. Zero or negative sends
    /// each file as a single block.
    pub block_size_mbytes: f64,
    /// Send a SHA-256 digest with every block and verify it on receipt.
    pub enable_checksum: bool,
    pub progress_report_interval_millis: u64,
}

impl Default for WdtOptions {
    fn default() -> Self {
        WdtOptions {
            num_ports: 8,
            start_port: 22356,
            accept_timeout_millis: 100,
            max_accept_retries: 500,
            max_retries: 20,
            sleep_millis: 50,
            connect_timeout_millis: 1000,
            read_timeout_millis: 5000,
            write_timeout_millis: 5000,
            avg_mbytes_per_sec: -1.0,
            max_mbytes_per_sec: -1.0,
            throttler_window_millis: 250,
            buffer_size: 256 * 1024,
            socket_buffer_size: 4 * 1024 * 1024,
            block_size_mbytes: 16.0,
            enable_checksum: false,
            progress_report_interval_millis: 200,
        }
    }
}

impl WdtOptions {
    /// Defaults overridden by `WDT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `WDT_<FIELD>` key (field name upper-cased).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = WdtOptions::default();
        let get = |field: &str| lookup(&format!("{}{}", ENV_PREFIX, field.to_ascii_uppercase()));

        override_field(&get, "num_ports", &mut opts.num_ports)?;
        override_field(&get, "start_port", &mut opts.start_port)?;
        override_field(&get, "accept_timeout_millis", &mut opts.accept_timeout_millis)?;
        override_field(&get, "max_accept_retries", &mut opts.max_accept_retries)?;
        override_field(&get, "max_retries", &mut opts.max_retries)?;
        override_field(&get, "sleep_millis", &mut opts.sleep_millis)?;
        override_field(&get, "connect_timeout_millis", &mut opts.connect_timeout_millis)?;
        override_field(&get, "read_timeout_millis", &mut opts.read_timeout_millis)?;
        override_field(&get, "write_timeout_millis", &mut opts.write_timeout_millis)?;
        override_field(&get, "avg_mbytes_per_sec", &mut opts.avg_mbytes_per_sec)?;
        override_field(&get, "max_mbytes_per_sec", &mut opts.max_mbytes_per_sec)?;
        override_field(&get, "throttler_window_millis", &mut opts.throttler_window_millis)?;
        override_field(&get, "buffer_size", &mut opts.buffer_size)?;
        override_field(&get, "socket_buffer_size", &mut opts.socket_buffer_size)?;
        override_field(&get, "block_size_mbytes", &mut opts.block_size_mbytes)?;
        override_field(&get, "enable_checksum", &mut opts.enable_checksum)?;
        override_field(
            &get,
            "progress_report_interval_millis",
            &mut opts.progress_report_interval_millis,
        )?;

        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_ports == 0 {
            return Err(WdtError::Config("num_ports must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(WdtError::Config("buffer_size must be positive".into()));
        }
        if self.socket_buffer_size == 0 {
            return Err(WdtError::Config("socket_buffer_size must be positive".into()));
        }
        if self.avg_mbytes_per_sec.is_nan() || self.max_mbytes_per_sec.is_nan() {
            return Err(WdtError::Config("throttler rates must be numbers".into()));
        }
        Ok(())
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis.max(1))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_millis > 0).then(|| Duration::from_millis(self.read_timeout_millis))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_millis > 0).then(|| Duration::from_millis(self.write_timeout_millis))
    }

    pub fn throttler_window(&self) -> Duration {
        Duration::from_millis(self.throttler_window_millis)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_report_interval_millis.max(10))
    }

    /// Average rate cap in bytes/sec, if throttling is on.
    pub fn avg_rate_bytes(&self) -> Option<f64> {
        (self.avg_mbytes_per_sec > 0.0).then(|| self.avg_mbytes_per_sec * MIB)
    }

    /// Peak rate in bytes/sec. Never below the average rate.
    pub fn peak_rate_bytes(&self) -> Option<f64> {
        let avg = self.avg_rate_bytes()?;
        Some((self.max_mbytes_per_sec * MIB).max(avg))
    }

    /// Block size in bytes, or `None` for whole-file blocks.
    pub fn block_size_bytes(&self) -> Option<u64> {
        (self.block_size_mbytes > 0.0).then(|| ((self.block_size_mbytes * MIB) as u64).max(1))
    }
}

fn override_field<G, T>(get: &G, field: &str, slot: &mut T) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = get(field) {
        let raw = raw.trim();
        *slot = raw.parse().map_err(|_| {
            WdtError::Config(format!(
                "{}{}={:?} is not valid",
                ENV_PREFIX,
                field.to_ascii_uppercase(),
                raw
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> Box<dyn Fn(&str) -> Option<String>> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Box::new(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_disable_throttling() {
        let opts = WdtOptions::default();
        assert!(opts.avg_rate_bytes().is_none());
        assert!(opts.peak_rate_bytes().is_none());
        assert_eq!(opts.block_size_bytes(), Some(16 * 1024 * 1024));
        opts.validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let opts = WdtOptions::from_lookup(lookup(&[
            ("WDT_MAX_RETRIES", "3"),
            ("WDT_AVG_MBYTES_PER_SEC", "100"),
            ("WDT_ENABLE_CHECKSUM", "true"),
            ("WDT_ACCEPT_TIMEOUT_MILLIS", " 7 "),
        ]))
        .unwrap();
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.accept_timeout_millis, 7);
        assert!(opts.enable_checksum);
        assert_eq!(opts.avg_rate_bytes(), Some(100.0 * MIB));
        assert_eq!(opts.num_ports, WdtOptions::default().num_ports);
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let err = WdtOptions::from_lookup(lookup(&[("WDT_NUM_PORTS", "many")])).unwrap_err();
        assert!(matches!(err, WdtError::Config(_)));
        let err = WdtOptions::from_lookup(lookup(&[("WDT_NUM_PORTS", "0")])).unwrap_err();
        assert!(matches!(err, WdtError::Config(_)));
    }

    #[test]
    fn peak_rate_never_below_average() {
        let opts = WdtOptions {
            avg_mbytes_per_sec: 10.0,
            max_mbytes_per_sec: 5.0,
            ..Default::default()
        };
        assert_eq!(opts.peak_rate_bytes(), Some(10.0 * MIB));
        let opts = WdtOptions {
            avg_mbytes_per_sec: 10.0,
            max_mbytes_per_sec: 40.0,
            ..Default::default()
        };
        assert_eq!(opts.peak_rate_bytes(), Some(40.0 * MIB));
    }

    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let opts: WdtOptions = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(opts.max_retries, 2);
        assert_eq!(opts.buffer_size, WdtOptions::default().buffer_size);
    }
}
