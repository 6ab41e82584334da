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

mod core;
mod hdc1000;

pub use crate::sensor::core::{
    read_blocking, Humidity, Sensor, SensorError, SensorErrorKind, SensorSet, StubSensor, TemperatureCelsius,
};
pub use crate::sensor::hdc1000::{open_bus, Hdc1000Sensor, I2cBus, I2cDevice};

#[cfg(test)]
pub(crate) use crate::sensor::test::{dummy_values, CountingSensor, FailingSensor, FixedSensor, FlakySensor, TrackedSensor};
