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

use crate::report::core::{ReportError, ReportErrorKind, Reporter};
use crate::value::SensorValue;
use futures_util::future::BoxFuture;
use std::fmt::Write as _;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reporter that writes each batch as a single line to a stream, typically
/// standard output (`tokio::io::stdout()`), for log tailing.
///
/// Each reading is rendered as a space followed by `name{labels}=value` with
/// six digits after the decimal point.
#[derive(Debug)]
pub struct WriterReporter<W> {
    writer: W,
}

impl<W> WriterReporter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Render a batch of readings as a single newline-terminated line.
pub fn render_line(values: &[SensorValue]) -> String {
    let mut line = String::new();
    for v in values {
        // Writing to a String can't fail
        let _ = write!(line, " {}{}={:.6}", v.name(), v.labels(), v.value());
    }

    line.push('\n');
    line
}

impl<W> Reporter for WriterReporter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn report<'a>(&'a mut self, values: &'a [SensorValue]) -> BoxFuture<'a, Result<(), ReportError>> {
        Box::pin(async move {
            let line = render_line(values);
            let res = match self.writer.write_all(line.as_bytes()).await {
                Ok(()) => self.writer.flush().await,
                Err(e) => Err(e),
            };

            res.map_err(|e| ReportError::KindMsgCause(ReportErrorKind::Io, "unable to write readings", Box::new(e)))
        })
    }
}

#[cfg(test)]
mod test {
    use super::{render_line, WriterReporter};
    use crate::report::core::{ReportErrorKind, Reporter};
    use crate::report::test::BrokenWriter;
    use crate::sensor::dummy_values;
    use tokio::io::{self, AsyncReadExt};

    #[test]
    fn test_render_line_empty() {
        assert_eq!("\n", render_line(&[]));
    }

    #[test]
    fn test_render_line_dummy() {
        assert_eq!(
            " dummy_value=42.000000 dummy_number{type=\"a\"}=0.200000 dummy_number{type=\"b\"}=0.800000\n",
            render_line(&dummy_values())
        );
    }

    #[tokio::test]
    async fn test_reporter_one_line_per_call() {
        let mut reporter = WriterReporter::new(Vec::new());
        let values = dummy_values();

        reporter.report(&values).await.unwrap();
        reporter.report(&values[..1]).await.unwrap();

        let out = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(2, lines.len());
        assert_eq!(" dummy_value=42.000000", lines[1]);
    }

    #[tokio::test]
    async fn test_reporter_waits_for_slow_reader() {
        // Pipe buffer is smaller than a line so the write has to wait for the reader
        let (tx, mut rx) = io::duplex(8);
        let mut reporter = WriterReporter::new(tx);

        let reader = tokio::spawn(async move {
            let mut out = String::new();
            rx.read_to_string(&mut out).await.unwrap();
            out
        });

        reporter.report(&dummy_values()).await.unwrap();
        drop(reporter);

        assert_eq!(render_line(&dummy_values()), reader.await.unwrap());
    }

    #[tokio::test]
    async fn test_reporter_write_error() {
        let mut reporter = WriterReporter::new(BrokenWriter);
        let res = reporter.report(&dummy_values()).await;
        let err = res.unwrap_err();

        assert_eq!(ReportErrorKind::Io, err.kind());
        assert!(err.may_have_emitted());
    }
}
