// sdrbridge -- serve a software-defined radio receiver to SCPI clients.
//
// The control plane (default port 5025) accepts SCPI lines; the data plane
// (default port 5026) streams captured blocks as binary frames.
//
// Usage:
//   sdrbridge --device sim
//   sdrbridge --device sim:rate=2e6,tone=250e3 --scpi-port 6025 --waveform-port 6026
//   sdrbridge --device addr=192.168.10.2 --verbose          (needs --features uhd)
//   sdrbridge --device type=b200 --debug --logfile bridge.log

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use sdrbridge::BridgeServerBuilder;
use sdrbridge::server::{DEFAULT_BIND_ADDRESS, DEFAULT_SCPI_PORT, DEFAULT_WAVEFORM_PORT};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// SCPI bridge for software-defined radio receivers.
#[derive(Parser, Debug)]
#[command(name = "sdrbridge", version, about)]
struct Cli {
    /// Receiver to open: `sim`, `sim:key=value,...`, or a UHD device
    /// string such as `addr=192.168.10.2`.
    #[arg(long)]
    device: String,

    /// Control-plane (SCPI) TCP port.
    #[arg(long, default_value_t = DEFAULT_SCPI_PORT)]
    scpi_port: u16,

    /// Data-plane (waveform) TCP port.
    #[arg(long, default_value_t = DEFAULT_WAVEFORM_PORT)]
    waveform_port: u16,

    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    bind: String,

    /// Log less: warnings and errors only.
    #[arg(short, long)]
    quiet: bool,

    /// Log configuration round-trips and session events.
    #[arg(long)]
    verbose: bool,

    /// Log everything, including every control line and frame.
    #[arg(long)]
    debug: bool,

    /// Append logs to this file instead of stderr.
    #[arg(short, long)]
    logfile: Option<PathBuf>,
}

impl Cli {
    /// Log level implied by the verbosity flags. `RUST_LOG` overrides it.
    fn log_level(&self) -> LevelFilter {
        let level = if self.debug {
            LevelFilter::TRACE
        } else if self.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        if !self.quiet {
            return level;
        }
        if level == LevelFilter::TRACE {
            LevelFilter::DEBUG
        } else if level == LevelFilter::DEBUG {
            LevelFilter::INFO
        } else {
            LevelFilter::WARN
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(cli.log_level().into())
        .from_env_lossy();

    match &cli.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let source = sdrbridge_capture::open(&cli.device)
        .await
        .with_context(|| format!("failed to open device '{}'", cli.device))?;

    let server = BridgeServerBuilder::new()
        .bind_address(&cli.bind)
        .scpi_port(cli.scpi_port)
        .waveform_port(cli.waveform_port)
        .build(source)
        .await
        .context("failed to start bridge")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await.context("bridge failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sdrbridge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&["--device", "sim"]);
        assert_eq!(cli.device, "sim");
        assert_eq!(cli.scpi_port, 5025);
        assert_eq!(cli.waveform_port, 5026);
        assert_eq!(cli.bind, "0.0.0.0");
        assert!(cli.logfile.is_none());
        assert_eq!(cli.log_level(), LevelFilter::INFO);
    }

    #[test]
    fn device_is_required() {
        assert!(Cli::try_parse_from(["sdrbridge"]).is_err());
    }

    #[test]
    fn ports_and_logfile() {
        let cli = parse(&[
            "--device",
            "addr=192.168.10.2",
            "--scpi-port",
            "6025",
            "--waveform-port",
            "6026",
            "-l",
            "bridge.log",
        ]);
        assert_eq!(cli.device, "addr=192.168.10.2");
        assert_eq!(cli.scpi_port, 6025);
        assert_eq!(cli.waveform_port, 6026);
        assert_eq!(cli.logfile, Some(PathBuf::from("bridge.log")));
    }

    #[test]
    fn verbosity_flags() {
        assert_eq!(parse(&["--device", "sim", "--verbose"]).log_level(), LevelFilter::DEBUG);
        assert_eq!(parse(&["--device", "sim", "--debug"]).log_level(), LevelFilter::TRACE);
        assert_eq!(parse(&["--device", "sim", "-q"]).log_level(), LevelFilter::WARN);
        assert_eq!(
            parse(&["--device", "sim", "--verbose", "--quiet"]).log_level(),
            LevelFilter::INFO
        );
        assert_eq!(
            parse(&["--device", "sim", "--debug", "-q"]).log_level(),
            LevelFilter::DEBUG
        );
    }
}
