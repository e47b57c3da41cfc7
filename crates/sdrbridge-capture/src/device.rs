//! Device-string parsing and backend selection.
//!
//! The `--device` argument picks the capture backend:
//!
//! - `sim` or `sim:key=value,...` opens the [`SimulatedSource`]
//! - anything else is a UHD device-argument string (for example
//!   `addr=192.168.10.2` or `type=b200,serial=30AD2C5`) and is handed to
//!   the UHD backend unchanged

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use sdrbridge_core::capture::CaptureSource;
use sdrbridge_core::error::{Error, Result};

use crate::sim::{SimConfig, SimulatedSource};

/// Ordered `key=value` pairs from a device string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceArgs {
    pairs: Vec<(String, String)>,
}

impl DeviceArgs {
    /// Iterate over `(key, value)` pairs in the order given.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The value of the last occurrence of `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl FromStr for DeviceArgs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::Parse(format!("device argument '{}' is not key=value", part))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Parse(format!("device argument '{}' has no key", part)));
            }
            pairs.push((key.to_string(), value.trim().to_string()));
        }
        Ok(DeviceArgs { pairs })
    }
}

impl fmt::Display for DeviceArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Which backend a device string selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// The simulated receiver with its arguments.
    Simulated(DeviceArgs),
    /// A UHD device-argument string, passed through verbatim.
    Uhd(String),
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidParameter("empty device string".into()));
        }
        if s.eq_ignore_ascii_case("sim") {
            return Ok(DeviceSpec::Simulated(DeviceArgs::default()));
        }
        if let Some(args) = s.strip_prefix("sim:") {
            return Ok(DeviceSpec::Simulated(args.parse()?));
        }
        Ok(DeviceSpec::Uhd(s.to_string()))
    }
}

/// Open the capture source named by `device`.
pub async fn open(device: &str) -> Result<Arc<dyn CaptureSource>> {
    match device.parse::<DeviceSpec>()? {
        DeviceSpec::Simulated(args) => {
            let config = SimConfig::from_args(&args)?;
            Ok(Arc::new(SimulatedSource::new(config)))
        }
        DeviceSpec::Uhd(args) => open_uhd(&args).await,
    }
}

#[cfg(feature = "uhd")]
async fn open_uhd(args: &str) -> Result<Arc<dyn CaptureSource>> {
    let source = crate::uhd::UhdSource::open(args).await?;
    Ok(Arc::new(source))
}

#[cfg(not(feature = "uhd"))]
async fn open_uhd(args: &str) -> Result<Arc<dyn CaptureSource>> {
    tracing::error!(device = %args, "UHD support not compiled in");
    Err(Error::Unsupported(format!(
        "device '{}' needs the UHD backend; rebuild with --features uhd or use 'sim'",
        args
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args() {
        let args: DeviceArgs = " rate=2e6 , model = B210,,serial=x ".parse().unwrap();
        let pairs: Vec<_> = args.iter().collect();
        assert_eq!(pairs, vec![("rate", "2e6"), ("model", "B210"), ("serial", "x")]);
        assert_eq!(args.get("model"), Some("B210"));
        assert_eq!(args.get("tone"), None);
        assert_eq!(args.to_string(), "rate=2e6,model=B210,serial=x");
    }

    #[test]
    fn last_duplicate_wins() {
        let args: DeviceArgs = "rate=1,rate=2".parse().unwrap();
        assert_eq!(args.get("rate"), Some("2"));
    }

    #[test]
    fn parse_args_rejects_bare_words() {
        assert!(matches!("rate".parse::<DeviceArgs>(), Err(Error::Parse(_))));
        assert!(matches!("=1".parse::<DeviceArgs>(), Err(Error::Parse(_))));
    }

    #[test]
    fn parse_spec() {
        assert_eq!(
            "sim".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::Simulated(DeviceArgs::default())
        );
        match "sim:chunk=64".parse::<DeviceSpec>().unwrap() {
            DeviceSpec::Simulated(args) => assert_eq!(args.get("chunk"), Some("64")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            "addr=192.168.10.2".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::Uhd("addr=192.168.10.2".into())
        );
        assert!("  ".parse::<DeviceSpec>().is_err());
    }

    #[tokio::test]
    async fn open_simulator() {
        let src = open("sim:model=ANTSDR-E310,serial=77").await.unwrap();
        assert_eq!(src.info().model, "ANTSDR-E310");
        assert_eq!(src.info().serial, "77");
        assert_eq!(src.info().make(), "Microphase");
    }

    #[cfg(not(feature = "uhd"))]
    #[tokio::test]
    async fn uhd_without_feature_is_unsupported() {
        assert!(matches!(
            open("type=b200").await,
            Err(Error::Unsupported(_))
        ));
    }
}
