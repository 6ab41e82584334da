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

use crate::http::ScrapeExporter;
use crate::schedule::ReportServer;
use crate::sensor::Sensor;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task;

/// Top level of the daemon: one set of sensors exposed via the scrape exporter
/// and dispatched to reporters by the scheduler.
///
/// The exporter and the scheduler run as separate tasks, each with its own
/// supervision loop, so that a failure of one never stops the other. Sensors
/// and reporters release their resources when dropped, which happens once
/// `run` returns.
pub struct Daemon {
    sensors: Arc<dyn Sensor>,
    exporter: Arc<ScrapeExporter>,
    server: ReportServer,
    bind: SocketAddr,
}

impl Daemon {
    /// Create a new daemon. The exporter is expected to read from the same
    /// `sensors` handed to the scheduler.
    pub fn new(sensors: Arc<dyn Sensor>, exporter: ScrapeExporter, server: ReportServer, bind: SocketAddr) -> Self {
        Self {
            sensors,
            exporter: Arc::new(exporter),
            server,
            bind,
        }
    }

    /// Run the exporter and the scheduler until `shutdown` completes, then stop
    /// both and wait for them to finish.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Daemon {
            sensors,
            exporter,
            mut server,
            bind,
        } = self;

        let http = task::spawn(exporter.serve_forever(bind, |e| {
            tracing::error!(message = "scrape server failed, restarting", error = %e);
        }));

        let scheduler = task::spawn(async move {
            server
                .serve_forever(sensors, |e| {
                    tracing::error!(message = "unable to report readings", error = %e);
                })
                .await
        });

        shutdown.await;
        tracing::info!(message = "stopping scrape server and scheduler");

        // Both loops run forever so the only way they complete is by being cancelled
        // (or panicking). Wait for each so that everything they own is dropped before
        // we return.
        http.abort();
        scheduler.abort();

        for (name, res) in [("http", http.await), ("scheduler", scheduler.await)] {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!(message = "task panicked", task = name, error = %e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Daemon;
    use crate::http::ScrapeExporter;
    use crate::report::{calls_to, CallLog, RecordingReporter};
    use crate::schedule::{ReportConfig, ReportServer};
    use crate::sensor::{Sensor, SensorSet, TrackedSensor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn test_run_until_shutdown_releases_resources() {
        let reads = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let sensors: Arc<dyn Sensor> =
            Arc::new(SensorSet::new().with(TrackedSensor::new(reads.clone(), dropped.clone())));

        let log = CallLog::default();
        let server = ReportServer::new(vec![ReportConfig::new(
            "recording",
            RecordingReporter::new("recording", log.clone()),
            Duration::from_millis(20),
        )
        .unwrap()]);

        let exporter = ScrapeExporter::new("doma", sensors.clone()).unwrap();
        let daemon = Daemon::new(sensors, exporter, server, ([127, 0, 0, 1], 0).into());

        daemon.run(time::sleep(Duration::from_millis(200))).await;

        assert!(calls_to(&log, "recording") >= 2);
        assert!(reads.load(Ordering::SeqCst) >= 2);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
