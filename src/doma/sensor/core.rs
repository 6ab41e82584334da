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

use crate::value::SensorValue;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task;
use tracing::{Instrument, Level};

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Relative humidity (from 0 to 1)
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct Humidity(f64);

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0
    }
}

impl From<f64> for Humidity {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0 * 100.0)
    }
}

/// Potential kinds of errors that can be encountered reading a sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    Io,
    ShortRead,
    Runtime,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::Io => "io",
            SensorErrorKind::ShortRead => "short_read",
            SensorErrorKind::Runtime => "runtime",
        }
    }
}

/// Error initializing or reading a sensor
#[derive(Debug)]
pub enum SensorError {
    ShortRead(usize, usize),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::ShortRead(_, _) => SensorErrorKind::ShortRead,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::ShortRead(expected, got) => {
                write!(f, "short read: expected {} bytes, got {}", expected, got)
            }
            SensorError::KindMsg(_, msg) => f.write_str(msg),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Source of readings that can be sampled on demand.
///
/// Implementations are shared between the scrape exporter and the reporting
/// scheduler so `read` may be called from several threads at once. Sensors
/// backed by hardware that can't handle concurrent transactions must serialize
/// access internally (e.g. by holding their bus behind a `Mutex`).
///
/// Reads may block (for I/O or conversion delays) and are expected to be run
/// on a blocking thread pool by callers.
pub trait Sensor: Send + Sync {
    /// Sample the sensor, returning zero or more readings each timestamped by the
    /// sensor at the time of sampling. On error, no readings are returned.
    fn read(&self) -> Result<Vec<SensorValue>, SensorError>;
}

impl<S> Sensor for Box<S>
where
    S: Sensor + ?Sized,
{
    fn read(&self) -> Result<Vec<SensorValue>, SensorError> {
        self.as_ref().read()
    }
}

impl<S> Sensor for Arc<S>
where
    S: Sensor + ?Sized,
{
    fn read(&self) -> Result<Vec<SensorValue>, SensorError> {
        self.as_ref().read()
    }
}

/// Read `sensor` on the blocking thread pool managed by the tokio runtime.
///
/// Sensor reads may take tens or hundreds of milliseconds (bus transactions and
/// conversion delays) and must not block the future they're called from.
pub async fn read_blocking<S>(sensor: Arc<S>) -> Result<Vec<SensorValue>, SensorError>
where
    S: Sensor + ?Sized + 'static,
{
    task::spawn_blocking(move || sensor.read())
        .instrument(tracing::span!(Level::DEBUG, "sensor_read"))
        .await
        .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Runtime, "sensor read task failed", Box::new(e)))?
}

/// Sensor that returns a fixed set of readings, restamped with the current
/// time on every read. Useful for tests and smoke runs without hardware.
#[derive(Debug, Clone, Default)]
pub struct StubSensor {
    values: Vec<SensorValue>,
}

impl StubSensor {
    pub fn new(values: Vec<SensorValue>) -> Self {
        Self { values }
    }
}

impl Sensor for StubSensor {
    fn read(&self) -> Result<Vec<SensorValue>, SensorError> {
        let now = SystemTime::now();
        Ok(self.values.iter().cloned().map(|v| v.at(now)).collect())
    }
}

/// Ordered collection of sensors read one after another.
///
/// Readings are concatenated in the order sensors were added. If any sensor
/// fails, the entire read fails and readings from other sensors are discarded.
#[derive(Default)]
pub struct SensorSet {
    sensors: Vec<Box<dyn Sensor>>,
}

impl SensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S>(&mut self, sensor: S)
    where
        S: Sensor + 'static,
    {
        self.sensors.push(Box::new(sensor));
    }

    pub fn with<S>(mut self, sensor: S) -> Self
    where
        S: Sensor + 'static,
    {
        self.push(sensor);
        self
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl Sensor for SensorSet {
    fn read(&self) -> Result<Vec<SensorValue>, SensorError> {
        let mut out = Vec::new();
        for s in self.sensors.iter() {
            out.extend(s.read()?);
        }

        Ok(out)
    }
}

impl fmt::Debug for SensorSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorSet").field("sensors", &self.sensors.len()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::{read_blocking, Humidity, Sensor, SensorErrorKind, SensorSet, StubSensor, TemperatureCelsius};
    use crate::sensor::test::{dummy_values, FailingSensor, FixedSensor};
    use crate::value::Labels;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_display_units() {
        assert_eq!("42.5c", TemperatureCelsius::from(42.5).to_string());
        assert_eq!("25%", Humidity::from(0.25).to_string());
    }

    #[test]
    fn test_stub_sensor_refreshes_timestamps() {
        let old = UNIX_EPOCH + Duration::from_secs(10);
        let values = dummy_values().into_iter().map(|v| v.at(old)).collect();
        let sensor = StubSensor::new(values);

        let res = sensor.read().unwrap();
        assert_eq!(3, res.len());
        assert!(res.iter().all(|v| v.timestamp() > old));
        assert_eq!("dummy_value", res[0].name());
        assert_eq!(42.0, res[0].value());
        assert_eq!(Some("b"), res[2].labels().get("type"));
    }

    #[test]
    fn test_sensor_set_empty() {
        let set = SensorSet::new();
        assert!(set.is_empty());
        assert!(set.read().unwrap().is_empty());
    }

    #[test]
    fn test_sensor_set_preserves_order_and_values() {
        let first = FixedSensor::new("first", 1.0);
        let second = FixedSensor::new("second", 2.0);
        let expected_first = first.read().unwrap();
        let expected_second = second.read().unwrap();

        let set = SensorSet::new().with(first).with(second);
        let res = set.read().unwrap();

        assert_eq!(2, set.len());
        assert_eq!(expected_first[0], res[0]);
        assert_eq!(expected_second[0], res[1]);
    }

    #[test]
    fn test_sensor_set_failure_discards_partial() {
        let set = SensorSet::new()
            .with(FixedSensor::new("first", 1.0))
            .with(FailingSensor)
            .with(FixedSensor::new("third", 3.0));

        let res = set.read();
        assert_eq!(SensorErrorKind::Io, res.unwrap_err().kind());
    }

    #[test]
    fn test_sensor_shared_via_arc() {
        let labels = Labels::new().with("room", "office");
        let sensor: Arc<dyn Sensor> = Arc::new(FixedSensor::with_labels("temperature", labels.clone(), 21.0));
        let res = sensor.read().unwrap();

        assert_eq!(&labels, res[0].labels());
    }

    #[tokio::test]
    async fn test_read_blocking() {
        let set = Arc::new(SensorSet::new().with(FixedSensor::new("first", 1.0)));
        let res = read_blocking(set).await.unwrap();
        assert_eq!("first", res[0].name());

        let failing: Arc<dyn Sensor> = Arc::new(FailingSensor);
        let res = read_blocking(failing).await;
        assert_eq!(SensorErrorKind::Io, res.unwrap_err().kind());
    }
}
