//! Device configuration store.
//!
//! [`DeviceConfig`] records the receiver settings most recently requested
//! by a client. The control session mutates it under the store's lock, and
//! holds that lock across the matching capture-source call so a setting and
//! its hardware round-trip are atomic with respect to the streaming worker.
//! The worker only ever takes a short [`BlockParams`] snapshot.

use tokio::sync::{Mutex, MutexGuard};

use sdrbridge_core::types::{ClockSource, sample_depth_catalog};

/// Receiver settings as last requested by a client.
///
/// Values are the *requested* ones, which may differ from what the
/// hardware applied. The one exception is [`tuned_frequency_hz`], which
/// caches the frequency the receiver actually tuned to for status queries.
///
/// [`tuned_frequency_hz`]: DeviceConfig::tuned_frequency_hz
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub clock_source: ClockSource,
    pub rx_gain_db: f64,
    pub rx_bandwidth_hz: f64,
    /// Requested center frequency.
    pub center_frequency_hz: i64,
    /// Center frequency achieved by the last successful tune.
    pub tuned_frequency_hz: i64,
    pub sample_rate_hz: u64,
    /// Samples per block.
    pub block_depth: u64,
}

/// Sample rate assumed until a client sets one, if the receiver cannot
/// report its own.
pub const DEFAULT_SAMPLE_RATE_HZ: u64 = 1_000_000;

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            clock_source: ClockSource::Internal,
            rx_gain_db: 0.0,
            rx_bandwidth_hz: 0.0,
            center_frequency_hz: 0,
            tuned_frequency_hz: 0,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            // Smallest advertised depth.
            block_depth: sample_depth_catalog().first().copied().unwrap_or(10_000),
        }
    }
}

/// The two values the streaming worker needs at each block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockParams {
    pub depth: u64,
    pub sample_rate_hz: u64,
}

/// Lock-guarded [`DeviceConfig`].
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: Mutex<DeviceConfig>,
}

impl ConfigStore {
    pub fn new(config: DeviceConfig) -> Self {
        ConfigStore {
            inner: Mutex::new(config),
        }
    }

    /// Lock the configuration for a read-modify-write.
    pub async fn lock(&self) -> MutexGuard<'_, DeviceConfig> {
        self.inner.lock().await
    }

    /// A copy of the whole configuration.
    pub async fn snapshot(&self) -> DeviceConfig {
        self.inner.lock().await.clone()
    }

    /// Read depth and sample rate together, holding the lock only for the copy.
    pub async fn block_params(&self) -> BlockParams {
        let config = self.inner.lock().await;
        BlockParams {
            depth: config.block_depth,
            sample_rate_hz: config.sample_rate_hz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.clock_source, ClockSource::Internal);
        assert_eq!(config.block_depth, 10_000);
        assert_eq!(config.sample_rate_hz, DEFAULT_SAMPLE_RATE_HZ);
    }

    #[tokio::test]
    async fn block_params_reflect_latest_write() {
        let store = ConfigStore::default();
        {
            let mut config = store.lock().await;
            config.block_depth = 20_000;
            config.sample_rate_hz = 2_000_000;
        }
        assert_eq!(
            store.block_params().await,
            BlockParams {
                depth: 20_000,
                sample_rate_hz: 2_000_000
            }
        );
    }

    #[tokio::test]
    async fn snapshot_waits_for_writer() {
        let store = Arc::new(ConfigStore::default());
        let mut guard = store.lock().await;

        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.block_params().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        // Both fields change in one critical section; the reader never sees
        // a mix of old and new.
        guard.block_depth = 50_000;
        guard.sample_rate_hz = 4_000_000;
        drop(guard);

        let params = reader.await.unwrap();
        assert_eq!(params.depth, 50_000);
        assert_eq!(params.sample_rate_hz, 4_000_000);
    }
}
