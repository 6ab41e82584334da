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

use crate::sensor::core::{Humidity, Sensor, SensorError, SensorErrorKind, TemperatureCelsius};
use crate::value::{is_valid_name, Labels, SensorValue, ValueError};
use rppal::i2c::I2c;
use std::error::Error;
use std::fmt::{self, Debug, Formatter};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

pub(crate) const TRIGGER_REGISTER: u8 = 0x00;
pub(crate) const CONVERSION_DELAY: Duration = Duration::from_millis(13);
pub(crate) const DATA_SIZE: usize = 4;

/// Abstraction around an `rppal::i2c::I2c` bus to allow for easier testing.
pub trait I2cBus {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Box<dyn Error + Send + Sync>>;
    fn write(&mut self, buffer: &[u8]) -> Result<usize, Box<dyn Error + Send + Sync>>;
    fn address(&self) -> u16;
}

/// Device on an I2C bus, owning the open bus handle.
///
/// The underlying file descriptor is closed when this is dropped.
#[derive(Debug)]
pub struct I2cDevice {
    i2c: I2c,
    address: u16,
}

impl I2cBus for I2cDevice {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Box<dyn Error + Send + Sync>> {
        self.i2c.read(buffer).map_err(|e| e.into())
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize, Box<dyn Error + Send + Sync>> {
        self.i2c.write(buffer).map_err(|e| e.into())
    }

    fn address(&self) -> u16 {
        self.address
    }
}

/// Open the I2C bus with the given number and address all transactions to the
/// device at `address`.
pub fn open_bus(bus: u8, address: u16) -> Result<I2cDevice, SensorError> {
    let mut i2c = I2c::with_bus(bus).map_err(|e| {
        SensorError::KindMsgCause(SensorErrorKind::Initialization, "unable to open I2C bus", Box::new(e))
    })?;

    i2c.set_slave_address(address).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to set I2C device address",
            Box::new(e),
        )
    })?;

    Ok(I2cDevice { i2c, address })
}

/// Raw bytes read from the sensor after a conversion.
///
/// The first two bytes are temperature and the second two bytes are humidity,
/// each a big-endian 16 bit unsigned integer scaled to the full range of the
/// sensor.
#[derive(Debug)]
struct Reading {
    bytes: [u8; DATA_SIZE],
}

impl From<Reading> for (TemperatureCelsius, Humidity) {
    fn from(reading: Reading) -> Self {
        // See https://www.ti.com/lit/ds/symlink/hdc1000.pdf section 8.6.1 and 8.6.2
        let temp_raw = u16::from_be_bytes([reading.bytes[0], reading.bytes[1]]);
        let humidity_raw = u16::from_be_bytes([reading.bytes[2], reading.bytes[3]]);

        let temperature = TemperatureCelsius::from(f64::from(temp_raw) / f64::from(u16::MAX) * 165.0 - 40.0);
        let humidity = Humidity::from(f64::from(humidity_raw) / f64::from(u16::MAX));

        tracing::debug!(
            message = "parsed sensor data",
            raw_temperature = temp_raw,
            raw_humidity = humidity_raw,
            temperature = %temperature,
            humidity = %humidity
        );

        (temperature, humidity)
    }
}

/// Read temperature in degrees celsius and relative humidity from an HDC1000
/// (or compatible) sensor over I2C.
///
/// The bus is held behind a mutex so that concurrent reads from the scrape
/// exporter and the reporting scheduler are serialized into complete
/// trigger / wait / read transactions.
pub struct Hdc1000Sensor {
    bus: Mutex<Box<dyn I2cBus + Send + 'static>>,
    prefix: String,
}

impl Hdc1000Sensor {
    pub fn from_bus<T>(bus: T) -> Self
    where
        T: I2cBus + Send + 'static,
    {
        Self {
            bus: Mutex::new(Box::new(bus)),
            prefix: String::new(),
        }
    }

    /// Prepend `prefix` to the name of each reading, separated by an underscore
    /// unless the prefix already ends with one. An empty prefix is allowed.
    pub fn with_prefix(mut self, prefix: &str) -> Result<Self, ValueError> {
        let mut prefix = prefix.to_owned();
        if !prefix.is_empty() && !prefix.ends_with('_') {
            prefix.push('_');
        }

        if !prefix.is_empty() && !is_valid_name(&prefix) {
            return Err(ValueError::Name(prefix));
        }

        self.prefix = prefix;
        Ok(self)
    }

    fn transact(bus: &mut dyn I2cBus) -> Result<Reading, SensorError> {
        bus.write(&[TRIGGER_REGISTER])
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "unable to trigger conversion", e))?;

        thread::sleep(CONVERSION_DELAY);

        let mut bytes = [0; DATA_SIZE];
        let n = bus
            .read(&mut bytes)
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "unable to read conversion result", e))?;

        if n < DATA_SIZE {
            return Err(SensorError::ShortRead(DATA_SIZE, n));
        }

        Ok(Reading { bytes })
    }

    fn value(&self, name: &str, value: f64, timestamp: SystemTime) -> Result<SensorValue, SensorError> {
        SensorValue::new(format!("{}{}", self.prefix, name), Labels::new(), value)
            .map(|v| v.at(timestamp))
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Runtime, "unable to build reading", Box::new(e)))
    }
}

impl Sensor for Hdc1000Sensor {
    fn read(&self) -> Result<Vec<SensorValue>, SensorError> {
        let reading = {
            let mut bus = self
                .bus
                .lock()
                .map_err(|_| SensorError::KindMsg(SensorErrorKind::Runtime, "I2C bus lock poisoned"))?;
            Self::transact(&mut **bus)?
        };

        let timestamp = SystemTime::now();
        let (temperature, humidity) = reading.into();

        Ok(vec![
            self.value("temperature", temperature.into(), timestamp)?,
            self.value("humidity", humidity.into(), timestamp)?,
        ])
    }
}

impl Debug for Hdc1000Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let address = self.bus.lock().map(|b| b.address()).ok();
        f.debug_struct("Hdc1000Sensor")
            .field("address", &address)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Hdc1000Sensor, Reading, DATA_SIZE, TRIGGER_REGISTER};
    use crate::sensor::core::{Humidity, Sensor, SensorError, SensorErrorKind, TemperatureCelsius};
    use crate::sensor::test::{BrokenBus, MockBus};
    use crate::value::ValueErrorKind;
    use std::sync::Arc;
    use std::thread;

    fn assert_close(expected: f64, got: f64) {
        assert!((expected - got).abs() < 0.01, "expected {} got {}", expected, got);
    }

    #[test]
    fn test_reading_into_min() {
        let (t, h) = Reading { bytes: [0x00; DATA_SIZE] }.into();

        assert_eq!(TemperatureCelsius::from(-40.0), t);
        assert_eq!(Humidity::from(0.0), h);
    }

    #[test]
    fn test_reading_into_max() {
        let (t, h) = Reading { bytes: [0xFF; DATA_SIZE] }.into();

        assert_eq!(TemperatureCelsius::from(125.0), t);
        assert_eq!(Humidity::from(1.0), h);
    }

    #[test]
    fn test_sensor_read_framing() {
        let bus = MockBus::new(vec![0x80, 0x00, 0x40, 0x00]);
        let written = bus.written();
        let sensor = Hdc1000Sensor::from_bus(bus);

        let res = sensor.read().unwrap();

        assert_eq!(vec![TRIGGER_REGISTER], *written.lock().unwrap());
        assert_eq!(2, res.len());
        assert_eq!("temperature", res[0].name());
        assert_close(42.5, res[0].value());
        assert_eq!("humidity", res[1].name());
        assert_close(0.25, res[1].value());
        assert_eq!(res[0].timestamp(), res[1].timestamp());
        assert!(res[0].labels().is_empty());
    }

    #[test]
    fn test_sensor_prefix_separator() {
        let sensor = Hdc1000Sensor::from_bus(MockBus::new(vec![0x80, 0x00, 0x40, 0x00]))
            .with_prefix("office")
            .unwrap();
        let res = sensor.read().unwrap();
        assert_eq!("office_temperature", res[0].name());
        assert_eq!("office_humidity", res[1].name());

        let sensor = Hdc1000Sensor::from_bus(MockBus::new(vec![0x80, 0x00, 0x40, 0x00]))
            .with_prefix("office_")
            .unwrap();
        let res = sensor.read().unwrap();
        assert_eq!("office_temperature", res[0].name());
    }

    #[test]
    fn test_sensor_prefix_invalid() {
        let res = Hdc1000Sensor::from_bus(MockBus::new(vec![])).with_prefix("bad-prefix");
        assert_eq!(ValueErrorKind::InvalidName, res.unwrap_err().kind());
    }

    #[test]
    fn test_sensor_short_read() {
        let sensor = Hdc1000Sensor::from_bus(MockBus::new(vec![0x80, 0x00]));
        let res = sensor.read();

        match res.unwrap_err() {
            SensorError::ShortRead(expected, got) => {
                assert_eq!(4, expected);
                assert_eq!(2, got);
            }
            e => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_sensor_bus_error() {
        let sensor = Hdc1000Sensor::from_bus(BrokenBus);
        let res = sensor.read();

        assert_eq!(SensorErrorKind::Io, res.unwrap_err().kind());
    }

    #[test]
    fn test_sensor_concurrent_reads_serialized() {
        let bus = MockBus::new(vec![0x80, 0x00, 0x40, 0x00]);
        let overlaps = bus.overlaps();
        let sensor = Arc::new(Hdc1000Sensor::from_bus(bus));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = sensor.clone();
                thread::spawn(move || s.read().map(|v| v.len()))
            })
            .collect();

        for h in handles {
            assert_eq!(2, h.join().unwrap().unwrap());
        }

        assert_eq!(0, overlaps.load(std::sync::atomic::Ordering::SeqCst));
    }
}
