// Doma - Sensor telemetry daemon for single-board computers
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use doma::daemon::Daemon;
use doma::http::{ScrapeExporter, TimestampUnit};
use doma::report::{FluentReporter, WriterReporter};
use doma::schedule::{ReportConfig, ReportServer};
use doma::sensor::{open_bus, Hdc1000Sensor, Sensor, SensorSet, StubSensor};
use doma::value::{Labels, SensorValue, ValueError};
use std::error::Error;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8888);
const DEFAULT_PREFIX: &str = "doma";
const DEFAULT_I2C_BUS: u8 = 1;
const DEFAULT_STDOUT_INTERVAL_SECS: u64 = 5;
const DEFAULT_FLUENT_TAG: &str = "doma.sensors";
const DEFAULT_FLUENT_INTERVAL_SECS: u64 = 5;

/// Publish sensor readings as scrape metrics and forward them to Fluentd
///
/// Read temperature and humidity from an HDC1000 sensor connected via I2C (and/or
/// a set of dummy readings) and expose them for scraping at `/metrics`. The same
/// readings are periodically written to standard output and, optionally, posted
/// to a Fluentd HTTP input, each at its own interval.
#[derive(Debug, Parser)]
#[clap(name = "doma", version = clap::crate_version!())]
struct DomaApplication {
    /// Address to bind to for scrape requests
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,

    /// Prefix for the name of each metric exposed for scraping
    #[clap(long, default_value_t = DEFAULT_PREFIX.to_owned())]
    prefix: String,

    /// Emit scrape timestamps in milliseconds instead of seconds
    #[clap(long)]
    timestamp_millis: bool,

    /// Include a sensor that returns a fixed set of dummy readings
    #[clap(long)]
    dummy: bool,

    /// I2C bus number the HDC1000 sensor is connected to
    #[clap(long, default_value_t = DEFAULT_I2C_BUS)]
    i2c_bus: u8,

    /// I2C address of the HDC1000 sensor, decimal or hex (0x40). If not set, the
    /// sensor is not read
    #[clap(long, value_parser = parse_address)]
    i2c_address: Option<u16>,

    /// Prefix for the name of readings from the HDC1000 sensor
    #[clap(long, default_value = "")]
    i2c_prefix: String,

    /// Write readings to standard output at this interval, in seconds
    #[clap(long, default_value_t = DEFAULT_STDOUT_INTERVAL_SECS)]
    stdout_interval_secs: u64,

    /// Base URL of a Fluentd HTTP input to forward readings to. If not set,
    /// readings are not forwarded
    #[clap(long)]
    fluent_url: Option<String>,

    /// Tag to forward readings to Fluentd under
    #[clap(long, default_value_t = DEFAULT_FLUENT_TAG.to_owned())]
    fluent_tag: String,

    /// Forward readings to Fluentd at this interval, in seconds
    #[clap(long, default_value_t = DEFAULT_FLUENT_INTERVAL_SECS)]
    fluent_interval_secs: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = DomaApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let daemon = new_daemon(&opts).unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize daemon", error = %e);
        process::exit(1)
    });

    tracing::info!(
        message = "starting daemon",
        address = %opts.bind,
        prefix = %opts.prefix,
        fluent_url = ?opts.fluent_url,
    );

    daemon
        .run(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await;

    tracing::info!("daemon shutdown");
    Ok(())
}

/// Acquire every sensor and reporter. Anything acquired before a failure is
/// dropped (and released) before this returns.
fn new_daemon(opts: &DomaApplication) -> Result<Daemon, Box<dyn Error + Send + Sync>> {
    let mut sensors = SensorSet::new();

    if opts.dummy {
        sensors.push(dummy_sensor()?);
    }

    if let Some(address) = opts.i2c_address {
        let bus = open_bus(opts.i2c_bus, address)?;
        sensors.push(Hdc1000Sensor::from_bus(bus).with_prefix(&opts.i2c_prefix)?);
        tracing::info!(message = "opened HDC1000 sensor", bus = opts.i2c_bus, address = address);
    }

    if sensors.is_empty() {
        tracing::warn!("no sensors configured, use --dummy or --i2c-address to add some");
    }

    let mut configs = vec![ReportConfig::new(
        "stdout",
        WriterReporter::new(tokio::io::stdout()),
        Duration::from_secs(opts.stdout_interval_secs),
    )?];

    if let Some(url) = &opts.fluent_url {
        let reporter = FluentReporter::new(url, &opts.fluent_tag)?;
        configs.push(ReportConfig::new(
            "fluent",
            reporter,
            Duration::from_secs(opts.fluent_interval_secs),
        )?);
    }

    let unit = if opts.timestamp_millis {
        TimestampUnit::Milliseconds
    } else {
        TimestampUnit::Seconds
    };

    let sensors: Arc<dyn Sensor> = Arc::new(sensors);
    let exporter = ScrapeExporter::new(&opts.prefix, sensors.clone())?.with_timestamp_unit(unit);
    Ok(Daemon::new(sensors, exporter, ReportServer::new(configs), opts.bind))
}

fn dummy_sensor() -> Result<StubSensor, ValueError> {
    Ok(StubSensor::new(vec![
        SensorValue::new("dummy_value", Labels::new(), 42.0)?,
        SensorValue::new("dummy_number", Labels::new().with("type", "a"), 0.2)?,
        SensorValue::new("dummy_number", Labels::new().with("type", "b"), 0.8)?,
    ]))
}

fn parse_address(s: &str) -> Result<u16, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
