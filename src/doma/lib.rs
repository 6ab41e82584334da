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

//! Sample sensors on a single-board computer and publish their readings.
//!
//! ## Features
//!
//! Doma reads one or more sensors (an HDC1000 temperature and humidity sensor
//! connected via I2C, or a set of dummy readings for testing) and publishes the
//! readings through two independent channels:
//!
//! * A scrape endpoint at `/metrics` that reads every sensor on each request and
//!   responds with one line per reading in a Prometheus-like text format.
//! * A scheduler that periodically reads every sensor and hands the readings to a
//!   set of reporters, each at its own interval. Reporters included are a line
//!   based writer (for standard output) and a forwarder that posts JSON records to
//!   a Fluentd HTTP input.
//!
//! ## Scrape format
//!
//! Each reading is rendered as a single line with the configured prefix, the name
//! of the reading, labels (if any), the value, and a UNIX timestamp in seconds
//! (or milliseconds, with `--timestamp-millis`).
//!
//! ```text
//! doma_dummy_value 42.000000 1650000000
//! doma_dummy_number{type="a"} 0.200000 1650000000
//! doma_dummy_number{type="b"} 0.800000 1650000000
//! ```
//!
//! ## Forwarder format
//!
//! Each batch of readings is posted to `<fluent-url>/<fluent-tag>` as a JSON object
//! keyed by reading name. Readings with the same name but different labels are
//! collapsed into a single entry.
//!
//! ```text
//! {"dummy_number":{"labels":{"type":"b"},"timestamp":"2022-03-14 15:09:26","value":0.8}}
//! ```
//!
//! ## Build
//!
//! Since doma is meant to run on a Raspberry PI, you will likely need to cross-compile
//! it, the same way as other Rust programs for ARMv7.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! ```text
//! doma --dummy --i2c-address 0x40 --fluent-url http://localhost:9880
//! ```
//!

pub mod daemon;
pub mod http;
pub mod report;
pub mod retry;
pub mod schedule;
pub mod sensor;
pub mod value;
