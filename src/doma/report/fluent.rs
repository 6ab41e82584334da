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
use crate::value::{Labels, SensorValue};
use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, Uri};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time;

const JSON_FORMAT: &str = "application/json";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Record sent to the aggregator for each distinct reading name.
#[derive(Debug, Serialize, PartialEq)]
pub struct ForwardRecord<'a> {
    pub value: f64,
    pub labels: &'a Labels,
    pub timestamp: String,
}

/// Build the payload sent to the aggregator: a map of reading name to record.
///
/// Readings that share a name but differ by labels collapse into a single
/// entry, the last one in `values` wins.
pub fn payload(values: &[SensorValue]) -> BTreeMap<&str, ForwardRecord<'_>> {
    values
        .iter()
        .map(|v| {
            let timestamp = DateTime::<Local>::from(v.timestamp()).format(TIMESTAMP_FORMAT).to_string();
            let record = ForwardRecord {
                value: v.value(),
                labels: v.labels(),
                timestamp,
            };

            (v.name(), record)
        })
        .collect()
}

/// Reporter that forwards readings to a Fluentd (or compatible) HTTP input.
///
/// Each batch is posted as a JSON object to `<base>/<tag>` with the event time
/// set to the time of the post. Connections are pooled by the underlying HTTP
/// client and closed when the reporter is dropped.
#[derive(Debug)]
pub struct FluentReporter {
    client: Client<HttpConnector>,
    base: String,
    tag: String,
    timeout: Duration,
}

impl FluentReporter {
    /// Create a new reporter posting to the HTTP input at `base` (for example
    /// `http://localhost:9880`) under `tag`, returning an error if the resulting
    /// URL is not valid.
    pub fn new(base: &str, tag: &str) -> Result<Self, ReportError> {
        let reporter = Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_owned(),
            tag: tag.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        };

        // Make sure the URL we'll be posting to is valid so that we fail at startup instead
        // of each time we try to forward readings.
        let _ = reporter.uri(SystemTime::now())?;
        Ok(reporter)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn uri(&self, time: SystemTime) -> Result<Uri, ReportError> {
        let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        format!("{}/{}?time={}", self.base, self.tag, secs)
            .parse::<Uri>()
            .map_err(|e| ReportError::KindMsgCause(ReportErrorKind::Transport, "invalid forwarder URL", Box::new(e)))
    }

    async fn post(&self, values: &[SensorValue]) -> Result<(), ReportError> {
        let body = serde_json::to_vec(&payload(values))
            .map_err(|e| ReportError::KindMsgCause(ReportErrorKind::Encoding, "unable to encode readings", Box::new(e)))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.uri(SystemTime::now())?)
            .header(CONTENT_TYPE, JSON_FORMAT)
            .body(Body::from(body))
            .map_err(|e| ReportError::KindMsgCause(ReportErrorKind::Encoding, "unable to build request", Box::new(e)))?;

        let res = time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|e| ReportError::KindMsgCause(ReportErrorKind::Transport, "timeout forwarding readings", Box::new(e)))?
            .map_err(|e| ReportError::KindMsgCause(ReportErrorKind::Transport, "unable to forward readings", Box::new(e)))?;

        let status = res.status();
        if !status.is_success() {
            return Err(ReportError::Status(status.as_u16()));
        }

        tracing::debug!(
            message = "forwarded readings",
            tag = %self.tag,
            num_values = values.len(),
            status = status.as_u16(),
        );

        Ok(())
    }
}

impl Reporter for FluentReporter {
    fn report<'a>(&'a mut self, values: &'a [SensorValue]) -> BoxFuture<'a, Result<(), ReportError>> {
        Box::pin(self.post(values))
    }
}
