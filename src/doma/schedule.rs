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

//! Multi-rate dispatch of sensor readings to reporters.
//!
//! A `ReportServer` owns a set of reporter bindings (`ReportConfig`), each with
//! its own interval. The server sleeps until the earliest binding is due, reads
//! the sensor once, and hands the same batch of readings to every binding that
//! is due at that instant. Bindings that aren't due yet are skipped until a later
//! wake-up.

use crate::report::{ReportError, Reporter};
use crate::retry::Backoff;
use crate::sensor::{read_blocking, Sensor, SensorError};
use crate::value::SensorValue;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Error constructing a reporter binding
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleError {
    Interval(String, Duration),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Interval(name, interval) => {
                write!(f, "interval for reporter '{}' must be positive, got {:?}", name, interval)
            }
        }
    }
}

impl Error for ScheduleError {}

/// Error during a single wake-up of the scheduler, either reading the sensor or
/// dispatching readings to a reporter.
#[derive(Debug)]
pub enum ServeError {
    Sensor(SensorError),
    Report(String, ReportError),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::Sensor(e) => write!(f, "unable to read sensors: {}", e),
            ServeError::Report(name, e) => write!(f, "unable to report to '{}': {}", name, e),
        }
    }
}

impl Error for ServeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServeError::Sensor(e) => Some(e),
            ServeError::Report(_, e) => Some(e),
        }
    }
}

impl From<SensorError> for ServeError {
    fn from(e: SensorError) -> Self {
        ServeError::Sensor(e)
    }
}

/// A reporter, how often it should receive readings, and when it last did.
pub struct ReportConfig {
    name: String,
    reporter: Box<dyn Reporter>,
    interval: Duration,
    last_reported: Option<Instant>,
}

impl ReportConfig {
    /// Bind `reporter` to `interval`, returning an error if the interval is zero.
    /// `name` is only used for logging and errors.
    pub fn new<R>(name: &str, reporter: R, interval: Duration) -> Result<Self, ScheduleError>
    where
        R: Reporter + 'static,
    {
        if interval.is_zero() {
            return Err(ScheduleError::Interval(name.to_owned(), interval));
        }

        Ok(Self {
            name: name.to_owned(),
            reporter: Box::new(reporter),
            interval,
            last_reported: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When readings were last dispatched to this reporter, `None` if never.
    pub fn last_reported(&self) -> Option<Instant> {
        self.last_reported
    }

    /// Earliest instant this binding is due. A binding that has never reported
    /// is due immediately. `None` if the due instant is too far in the future to
    /// be represented, in which case the binding never comes due again.
    fn next_due(&self, now: Instant) -> Option<Instant> {
        match self.last_reported {
            Some(t) => t.checked_add(self.interval),
            None => Some(now),
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_reported {
            Some(t) => now.saturating_duration_since(t) >= self.interval,
            None => true,
        }
    }
}

impl fmt::Debug for ReportConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportConfig")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("last_reported", &self.last_reported)
            .finish()
    }
}

/// Scheduler that periodically reads a sensor and dispatches the readings to
/// reporters, each at its own interval.
#[derive(Debug, Default)]
pub struct ReportServer {
    configs: Vec<ReportConfig>,
}

impl ReportServer {
    pub fn new(configs: Vec<ReportConfig>) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &[ReportConfig] {
        &self.configs
    }

    /// Earliest instant at which any binding is due, `None` if there are no bindings
    /// (or none of them will ever be due again).
    pub fn next_reporting_time(&self, now: Instant) -> Option<Instant> {
        self.configs.iter().filter_map(|c| c.next_due(now)).min()
    }

    /// Instant to dispatch readings at after waking up at `now` for a wake-up
    /// scheduled at `wake`. Dispatch stays on the schedule so that bindings with
    /// intervals that are multiples of each other keep sharing wake-ups. A wake-up
    /// that is late by at least the shortest interval dispatches at `now` instead,
    /// skipping missed slots rather than catching up on all of them at once.
    fn dispatch_instant(&self, wake: Instant, now: Instant) -> Instant {
        let late = now.saturating_duration_since(wake);
        match self.configs.iter().map(|c| c.interval).min() {
            Some(shortest) if late < shortest => wake,
            _ => now,
        }
    }

    /// Dispatch `values` to every binding due at `now`, in the order bindings were
    /// declared, returning the number of reporters called. Each due binding is marked
    /// as reported at `now` before its reporter is called. The first reporter error
    /// stops dispatch for the remaining bindings.
    pub async fn report(&mut self, values: &[SensorValue], now: Instant) -> Result<usize, ServeError> {
        let mut dispatched = 0;

        for config in self.configs.iter_mut().filter(|c| c.is_due(now)) {
            config.last_reported = Some(now);

            tracing::debug!(
                message = "dispatching readings",
                reporter = %config.name,
                num_values = values.len(),
            );

            config
                .reporter
                .report(values)
                .await
                .map_err(|e| ServeError::Report(config.name.clone(), e))?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Sleep until the next binding is due, read the sensor, and dispatch readings
    /// to every binding that is due as of the wake-up, regardless of how long the
    /// read took. With no bindings, this never completes.
    pub async fn serve_once<S>(&mut self, sensor: &Arc<S>) -> Result<usize, ServeError>
    where
        S: Sensor + ?Sized + 'static,
    {
        let wake = match self.next_reporting_time(Instant::now()) {
            Some(t) => t,
            None => return future::pending().await,
        };

        time::sleep_until(wake).await;
        let at = self.dispatch_instant(wake, Instant::now());

        let values = read_blocking(sensor.clone()).await?;
        self.report(&values, at).await
    }

    /// Run `serve_once` in a loop, returning the first error encountered.
    pub async fn serve<S>(&mut self, sensor: Arc<S>) -> Result<(), ServeError>
    where
        S: Sensor + ?Sized + 'static,
    {
        loop {
            self.serve_once(&sensor).await?;
        }
    }

    /// Run `serve_once` in a loop forever, passing each error to `on_error` and
    /// waiting an increasing amount of time before the next attempt while errors
    /// persist.
    pub async fn serve_forever<S, F>(&mut self, sensor: Arc<S>, mut on_error: F)
    where
        S: Sensor + ?Sized + 'static,
        F: FnMut(ServeError),
    {
        let mut backoff = Backoff::default();

        loop {
            match self.serve_once(&sensor).await {
                Ok(_) => backoff.mark_success(),
                Err(e) => {
                    on_error(e);
                    time::sleep(backoff.mark_failure()).await;
                }
            }
        }
    }
}
