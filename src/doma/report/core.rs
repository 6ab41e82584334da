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
use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt::{self, Formatter};

/// Potential kinds of errors that can be encountered delivering readings
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum ReportErrorKind {
    Io,
    Encoding,
    Transport,
    Rejected,
}

impl ReportErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            ReportErrorKind::Io => "io",
            ReportErrorKind::Encoding => "encoding",
            ReportErrorKind::Transport => "transport",
            ReportErrorKind::Rejected => "rejected",
        }
    }
}

/// Error delivering a batch of readings to a reporter's sink
#[derive(Debug)]
pub enum ReportError {
    Status(u16),
    KindMsg(ReportErrorKind, &'static str),
    KindMsgCause(ReportErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl ReportError {
    pub fn kind(&self) -> ReportErrorKind {
        match self {
            ReportError::Status(_) => ReportErrorKind::Rejected,
            ReportError::KindMsg(kind, _) => *kind,
            ReportError::KindMsgCause(kind, _, _) => *kind,
        }
    }

    /// Return true if part of the batch may have reached the sink before the
    /// error occurred. Stream writes can fail midway, while encoding failures
    /// happen before anything is sent and rejected or failed HTTP requests are
    /// not stored by the receiving end.
    pub fn may_have_emitted(&self) -> bool {
        self.kind() == ReportErrorKind::Io
    }
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::Status(code) => write!(f, "readings rejected with HTTP status {}", code),
            ReportError::KindMsg(_, msg) => f.write_str(msg),
            ReportError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ReportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReportError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Sink for batches of readings, such as a log stream or a remote aggregator.
///
/// Each call consumes the entire batch or returns an error. Reporters are owned
/// by exactly one scheduler binding and are only ever called from its task.
pub trait Reporter: Send {
    fn report<'a>(&'a mut self, values: &'a [SensorValue]) -> BoxFuture<'a, Result<(), ReportError>>;
}

impl<R> Reporter for Box<R>
where
    R: Reporter + ?Sized,
{
    fn report<'a>(&'a mut self, values: &'a [SensorValue]) -> BoxFuture<'a, Result<(), ReportError>> {
        self.as_mut().report(values)
    }
}
