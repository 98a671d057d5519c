//! Network condition emulation: latency, throughput caps, offline state and CPU rate
//!
//! Conditions are snapshotted when an exchange or session starts; a later
//! `set_conditions` never affects operations already in flight.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{InterposeError, Result};

/// Shaping parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConditions {
    /// Fail every new exchange and socket immediately
    pub offline: bool,
    /// Fixed per-exchange latency floor in milliseconds
    pub latency_ms: u64,
    /// Download cap in bytes per second (`None` = unlimited)
    pub download_throughput: Option<u64>,
    /// Upload cap in bytes per second (`None` = unlimited)
    pub upload_throughput: Option<u64>,
    /// CPU slowdown factor; advisory, consumed by the host scheduler
    pub cpu_rate: f64,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self::no_throttling()
    }
}

impl NetworkConditions {
    /// No shaping at all
    #[must_use]
    pub fn no_throttling() -> Self {
        Self {
            offline: false,
            latency_ms: 0,
            download_throughput: None,
            upload_throughput: None,
            cpu_rate: 1.0,
        }
    }

    /// Offline
    #[must_use]
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::no_throttling()
        }
    }

    /// DevTools "Slow 3G" preset
    #[must_use]
    pub fn slow_3g() -> Self {
        Self {
            offline: false,
            latency_ms: 2000,
            download_throughput: Some(50_000),
            upload_throughput: Some(50_000),
            cpu_rate: 1.0,
        }
    }

    /// DevTools "Fast 3G" preset
    #[must_use]
    pub fn fast_3g() -> Self {
        Self {
            offline: false,
            latency_ms: 563,
            download_throughput: Some(180_000),
            upload_throughput: Some(84_375),
            cpu_rate: 1.0,
        }
    }

    /// Latency floor as a duration
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Time to push `bytes` through the download cap
    #[must_use]
    pub fn download_delay(&self, bytes: usize) -> Duration {
        transfer_time(bytes, self.download_throughput)
    }

    /// Time to push `bytes` through the upload cap
    #[must_use]
    pub fn upload_delay(&self, bytes: usize) -> Duration {
        transfer_time(bytes, self.upload_throughput)
    }

    /// Whether any delay would ever be applied
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.latency_ms > 0
            || self.download_throughput.is_some()
            || self.upload_throughput.is_some()
    }

    /// Validate parameters
    ///
    /// # Errors
    ///
    /// Returns error on a zero throughput cap or a CPU rate below 1
    pub fn validate(&self) -> Result<()> {
        if self.download_throughput == Some(0) {
            return Err(InterposeError::ConfigError(
                "download_throughput must be > 0 (omit it for unlimited)".to_string(),
            ));
        }
        if self.upload_throughput == Some(0) {
            return Err(InterposeError::ConfigError(
                "upload_throughput must be > 0 (omit it for unlimited)".to_string(),
            ));
        }
        if !self.cpu_rate.is_finite() || self.cpu_rate < 1.0 {
            return Err(InterposeError::ConfigError(format!(
                "cpu_rate must be >= 1, got {}",
                self.cpu_rate
            )));
        }
        Ok(())
    }
}

fn transfer_time(bytes: usize, throughput: Option<u64>) -> Duration {
    match throughput {
        Some(rate) if rate > 0 && bytes > 0 => {
            Duration::from_secs_f64(bytes as f64 / rate as f64)
        }
        _ => Duration::ZERO,
    }
}

/// Holder of the conditions currently in force for one engine
#[derive(Debug, Default)]
pub struct ConditionShaper {
    current: RwLock<Arc<NetworkConditions>>,
}

impl ConditionShaper {
    /// Create a shaper with the given initial conditions
    #[must_use]
    pub fn new(conditions: NetworkConditions) -> Self {
        Self {
            current: RwLock::new(Arc::new(conditions)),
        }
    }

    /// Replace the conditions for all operations started from now on
    ///
    /// # Errors
    ///
    /// Returns error if the conditions are invalid
    pub fn set_conditions(&self, conditions: NetworkConditions) -> Result<()> {
        conditions.validate()?;
        info!(
            "Network conditions: offline={} latency={}ms down={:?} up={:?} cpu_rate={}",
            conditions.offline,
            conditions.latency_ms,
            conditions.download_throughput,
            conditions.upload_throughput,
            conditions.cpu_rate
        );
        *self.current.write() = Arc::new(conditions);
        Ok(())
    }

    /// Go back to no shaping
    pub fn reset(&self) {
        *self.current.write() = Arc::new(NetworkConditions::no_throttling());
    }

    /// Conditions to apply to an operation starting now
    #[must_use]
    pub fn snapshot(&self) -> Arc<NetworkConditions> {
        Arc::clone(&self.current.read())
    }

    /// CPU slowdown factor for the host scheduler
    #[must_use]
    pub fn cpu_rate(&self) -> f64 {
        self.current.read().cpu_rate
    }
}

/// Hold back a request body as if it were pushed through the upload cap
pub async fn shape_upload(conditions: &NetworkConditions, bytes: usize) {
    let delay = conditions.upload_delay(bytes);
    if !delay.is_zero() {
        debug!("Upload shaping: {} bytes, {:?}", bytes, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Hold back a response until the latency floor and download cap allow it
pub async fn shape_download(conditions: &NetworkConditions, bytes: usize) {
    let delay = conditions.latency() + conditions.download_delay(bytes);
    if !delay.is_zero() {
        debug!("Download shaping: {} bytes, {:?}", bytes, delay);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_delay() {
        let conditions = NetworkConditions {
            download_throughput: Some(1000),
            ..NetworkConditions::default()
        };
        assert_eq!(conditions.download_delay(5000), Duration::from_secs(5));
        assert_eq!(conditions.upload_delay(5000), Duration::ZERO);
        assert_eq!(conditions.download_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_validation() {
        assert!(NetworkConditions::default().validate().is_ok());
        assert!(NetworkConditions::slow_3g().validate().is_ok());

        let zero = NetworkConditions {
            download_throughput: Some(0),
            ..NetworkConditions::default()
        };
        assert!(zero.validate().is_err());

        let cpu = NetworkConditions {
            cpu_rate: 0.5,
            ..NetworkConditions::default()
        };
        assert!(cpu.validate().is_err());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let shaper = ConditionShaper::default();
        let before = shaper.snapshot();

        shaper.set_conditions(NetworkConditions::offline()).unwrap();
        assert!(!before.offline);
        assert!(shaper.snapshot().offline);

        shaper.reset();
        assert!(!shaper.snapshot().offline);
    }

    #[test]
    fn test_cpu_rate_is_advisory_metadata() {
        let shaper = ConditionShaper::default();
        shaper
            .set_conditions(NetworkConditions {
                cpu_rate: 4.0,
                ..NetworkConditions::default()
            })
            .unwrap();
        assert!((shaper.cpu_rate() - 4.0).abs() < f64::EPSILON);
        assert!(!shaper.snapshot().is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shape_download_waits() {
        let conditions = NetworkConditions {
            latency_ms: 100,
            download_throughput: Some(1000),
            ..NetworkConditions::default()
        };
        let start = tokio::time::Instant::now();
        shape_download(&conditions, 2000).await;
        assert!(start.elapsed() >= Duration::from_millis(2100));
    }

    #[test]
    fn test_toml_defaults() {
        let conditions: NetworkConditions = toml::from_str("latency_ms = 40").unwrap();
        assert_eq!(conditions.latency(), Duration::from_millis(40));
        assert!(!conditions.offline);
        assert!((conditions.cpu_rate - 1.0).abs() < f64::EPSILON);
    }
}
