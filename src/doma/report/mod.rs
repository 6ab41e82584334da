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
mod fluent;
mod writer;

pub use crate::report::core::{ReportError, ReportErrorKind, Reporter};
pub use crate::report::fluent::{payload, FluentReporter, ForwardRecord};
pub use crate::report::writer::{render_line, WriterReporter};

#[cfg(test)]
pub(crate) use crate::report::test::{calls_to, CallLog, RecordingReporter};
