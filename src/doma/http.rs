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

use crate::retry::Backoff;
use crate::sensor::{read_blocking, Sensor, SensorError};
use crate::value::{is_valid_name, SensorValue, ValueError};
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::error::Error;
use std::fmt::{self, Formatter, Write as _};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time;
use tracing::{event, span, Instrument, Level};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";
const HTML_FORMAT: &str = "text/html; charset=utf-8";
const INDEX_PAGE: &str = "<a href=\"/metrics\">metrics</a>\n";

/// Unit of the timestamp emitted with each scraped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampUnit {
    Seconds,
    Milliseconds,
}

impl Default for TimestampUnit {
    fn default() -> Self {
        TimestampUnit::Seconds
    }
}

/// Error serving scrape requests.
#[derive(Debug)]
pub enum ExporterError {
    Sensor(SensorError),
    Bind(SocketAddr, hyper::Error),
    Server(hyper::Error),
}

impl fmt::Display for ExporterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            // Sensor errors end up as the body of HTTP 500 responses, leave them as-is
            ExporterError::Sensor(e) => fmt::Display::fmt(e, f),
            ExporterError::Bind(addr, e) => write!(f, "unable to bind to {}: {}", addr, e),
            ExporterError::Server(e) => write!(f, "server error: {}", e),
        }
    }
}

impl Error for ExporterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExporterError::Sensor(e) => Some(e),
            ExporterError::Bind(_, e) => Some(e),
            ExporterError::Server(e) => Some(e),
        }
    }
}

/// Pull-model exporter that reads all sensors for each scrape request and
/// renders the readings in a line-oriented text format.
///
/// Each reading is rendered as `<prefix>_<name><labels> <value> <timestamp>` with
/// the value using six digits after the decimal point. There is no caching: every
/// request performs a fresh read.
pub struct ScrapeExporter {
    prefix: String,
    sensors: Arc<dyn Sensor>,
    unit: TimestampUnit,
}

impl ScrapeExporter {
    /// Create an exporter for `sensors`, returning an error if `prefix` is not empty
    /// and not a valid metric name. An empty prefix renders bare reading names.
    pub fn new(prefix: &str, sensors: Arc<dyn Sensor>) -> Result<Self, ValueError> {
        if !prefix.is_empty() && !is_valid_name(prefix) {
            return Err(ValueError::Name(prefix.to_owned()));
        }

        Ok(Self {
            prefix: prefix.to_owned(),
            sensors,
            unit: TimestampUnit::default(),
        })
    }

    pub fn with_timestamp_unit(mut self, unit: TimestampUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Render readings in the text format, one line per reading.
    pub fn render(&self, values: &[SensorValue]) -> String {
        let mut buf = String::new();

        for v in values {
            let ts = match self.unit {
                TimestampUnit::Seconds => u128::from(v.unix_secs()),
                TimestampUnit::Milliseconds => v.unix_millis(),
            };

            // Writing to a String can't fail
            let _ = if self.prefix.is_empty() {
                writeln!(buf, "{}{} {:.6} {}", v.name(), v.labels(), v.value(), ts)
            } else {
                writeln!(buf, "{}_{}{} {:.6} {}", self.prefix, v.name(), v.labels(), v.value(), ts)
            };
        }

        buf
    }

    /// Read all sensors and render the readings in the text format, returning an
    /// error if any sensor couldn't be read.
    pub async fn encoded_text(&self) -> Result<String, ExporterError> {
        let values = read_blocking(self.sensors.clone())
            .await
            .map_err(ExporterError::Sensor)?;

        event!(
            Level::DEBUG,
            message = "encoding readings to text format",
            num_values = values.len(),
        );

        Ok(self.render(&values))
    }

    /// Bind to `addr` and serve scrape requests until the server fails.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<(), ExporterError> {
        let context = self;
        let service = make_service_fn(move |_| {
            let context = context.clone();

            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    http_route(req, context.clone()).instrument(span!(Level::DEBUG, "doma_request"))
                }))
            }
        });

        let server = Server::try_bind(&addr).map_err(|e| ExporterError::Bind(addr, e))?;
        event!(Level::INFO, message = "server started", address = %addr);

        server.serve(service).await.map_err(ExporterError::Server)
    }

    /// Serve scrape requests forever, passing each failure of the server to
    /// `on_error` and restarting it after an increasing delay while failures
    /// persist.
    pub async fn serve_forever<F>(self: Arc<Self>, addr: SocketAddr, mut on_error: F)
    where
        F: FnMut(ExporterError),
    {
        let mut backoff = Backoff::default();

        loop {
            match self.clone().serve(addr).await {
                Ok(()) => backoff.mark_success(),
                Err(e) => {
                    on_error(e);
                    time::sleep(backoff.mark_failure()).await;
                }
            }
        }
    }
}

impl fmt::Debug for ScrapeExporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeExporter")
            .field("prefix", &self.prefix)
            .field("unit", &self.unit)
            .finish()
    }
}

pub async fn http_route(req: Request<Body>, exporter: Arc<ScrapeExporter>) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let res = match (&method, path.as_ref()) {
        (&Method::GET, "/metrics") => match exporter.encoded_text().await {
            Ok(buffer) => http_response(StatusCode::OK, TEXT_FORMAT, buffer),
            Err(e) => {
                event!(
                    Level::ERROR,
                    message = "error scraping sensors",
                    error = %e,
                );

                http_response(StatusCode::INTERNAL_SERVER_ERROR, TEXT_FORMAT, e.to_string())
            }
        },

        (_, "/metrics") => http_status_no_body(StatusCode::METHOD_NOT_ALLOWED),

        (&Method::GET, "/") => http_response(StatusCode::OK, HTML_FORMAT, INDEX_PAGE.to_owned()),

        _ => http_status_no_body(StatusCode::NOT_FOUND),
    };

    Ok(res)
}

fn http_response(code: StatusCode, content_type: &'static str, body: String) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = code;
    res.headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    res
}

fn http_status_no_body(code: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = code;
    res
}
