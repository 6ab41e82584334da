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

use serde::Serialize;
use std::collections::btree_map::{self, BTreeMap};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::iter::FromIterator;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Potential kinds of errors constructing readings or label maps
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum ValueErrorKind {
    InvalidName,
    InvalidLabel,
    NonFinite,
    Malformed,
}

impl ValueErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            ValueErrorKind::InvalidName => "invalid_name",
            ValueErrorKind::InvalidLabel => "invalid_label",
            ValueErrorKind::NonFinite => "non_finite",
            ValueErrorKind::Malformed => "malformed",
        }
    }
}

/// Error building a `SensorValue` or parsing a rendered `Labels` block
#[derive(Debug, Clone, PartialEq)]
pub enum ValueError {
    Name(String),
    Label(String),
    NonFinite(String, f64),
    Malformed(String),
}

impl ValueError {
    pub fn kind(&self) -> ValueErrorKind {
        match self {
            ValueError::Name(_) => ValueErrorKind::InvalidName,
            ValueError::Label(_) => ValueErrorKind::InvalidLabel,
            ValueError::NonFinite(_, _) => ValueErrorKind::NonFinite,
            ValueError::Malformed(_) => ValueErrorKind::Malformed,
        }
    }
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::Name(name) => write!(f, "invalid metric name '{}'", name),
            ValueError::Label(name) => write!(f, "invalid label name '{}'", name),
            ValueError::NonFinite(name, v) => write!(f, "non-finite value {} for metric '{}'", v, name),
            ValueError::Malformed(input) => write!(f, "malformed label block '{}'", input),
        }
    }
}

impl Error for ValueError {}

/// Return true if `name` matches `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Mapping of label names to label values attached to a reading.
///
/// Entries are kept sorted by name so that rendering is deterministic. Rendering
/// via `Display` yields an empty string for an empty map, otherwise a brace
/// delimited list of `key="value"` pairs. Values are not escaped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style insert, replacing any existing value for `name`.
    pub fn with<K, V>(mut self, name: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(name, value);
        self
    }

    pub fn insert<K, V>(&mut self, name: K, value: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Return a new map with every entry of `self` and `other`, with values from
    /// `other` taking precedence when both contain the same name. Neither operand
    /// is modified.
    pub fn merge(&self, other: &Labels) -> Labels {
        let mut out = self.0.clone();
        for (k, v) in other.iter() {
            out.insert(k.clone(), v.clone());
        }

        Labels(out)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }

        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}=\"{}\"", k, v)?;
        }
        f.write_str("}")
    }
}

impl FromStr for Labels {
    type Err = ValueError;

    /// Parse the subset `{k="v"(,k="v")*}` of the rendered form. Values containing
    /// `"` or `,` can't be recovered since rendering doesn't escape them.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValueError::Malformed(s.to_owned());
        let mut labels = Labels::new();

        if s.is_empty() {
            return Ok(labels);
        }

        let inner = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(malformed)?;

        for pair in inner.split(',') {
            let (name, quoted) = pair.split_once('=').ok_or_else(malformed)?;
            let value = quoted
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
                .ok_or_else(malformed)?;

            if !is_valid_name(name) {
                return Err(ValueError::Label(name.to_owned()));
            }

            labels.insert(name, value);
        }

        Ok(labels)
    }
}

impl<K, V> FromIterator<(K, V)> for Labels
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Labels(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A single named numeric observation with labels and the instant the
/// observation was made.
///
/// The timestamp is set when the value is constructed (i.e. by the sensor at
/// the time of sampling) and is never modified by exporters or reporters.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorValue {
    name: String,
    labels: Labels,
    value: f64,
    timestamp: SystemTime,
}

impl SensorValue {
    /// Create a new reading timestamped with the current time, returning an error
    /// if the metric name or any label name isn't a valid identifier or if the
    /// value is NaN or infinite.
    pub fn new<S>(name: S, labels: Labels, value: f64) -> Result<Self, ValueError>
    where
        S: Into<String>,
    {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(ValueError::Name(name));
        }

        if let Some(bad) = labels.0.keys().find(|k| !is_valid_name(k)) {
            return Err(ValueError::Label(bad.clone()));
        }

        if !value.is_finite() {
            return Err(ValueError::NonFinite(name, value));
        }

        Ok(Self {
            name,
            labels,
            value,
            timestamp: SystemTime::now(),
        })
    }

    /// Replace the timestamp of this reading, used by sensors to stamp every
    /// reading from a single sample with the same instant.
    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Whole seconds since the UNIX epoch, zero for instants before the epoch.
    pub fn unix_secs(&self) -> u64 {
        self.timestamp.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Whole milliseconds since the UNIX epoch, zero for instants before the epoch.
    pub fn unix_millis(&self) -> u128 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::{is_valid_name, Labels, SensorValue, ValueErrorKind};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("temperature"));
        assert!(is_valid_name("_private"));
        assert!(is_valid_name("doma_dummy_value2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("2fast"));
        assert!(!is_valid_name("has-dash"));
        assert!(!is_valid_name("has space"));
    }

    #[test]
    fn test_labels_render_empty() {
        assert_eq!("", Labels::new().to_string());
    }

    #[test]
    fn test_labels_render_braces() {
        let rendered = Labels::new().with("type", "a").to_string();
        assert_eq!("{type=\"a\"}", rendered);
    }

    #[test]
    fn test_labels_render_multiple_round_trip() {
        let labels = Labels::new().with("a", "1").with("b", "2");
        let rendered = labels.to_string();

        assert!(rendered == "{a=\"1\",b=\"2\"}" || rendered == "{b=\"2\",a=\"1\"}");
        assert_eq!(labels, rendered.parse::<Labels>().unwrap());
        assert_eq!(labels, "{b=\"2\",a=\"1\"}".parse::<Labels>().unwrap());
    }

    #[test]
    fn test_labels_parse_empty() {
        assert!("".parse::<Labels>().unwrap().is_empty());
    }

    #[test]
    fn test_labels_parse_malformed() {
        let res = "{a=1}".parse::<Labels>();
        assert_eq!(ValueErrorKind::Malformed, res.unwrap_err().kind());

        let res = "a=\"1\"".parse::<Labels>();
        assert_eq!(ValueErrorKind::Malformed, res.unwrap_err().kind());
    }

    #[test]
    fn test_labels_values_not_escaped() {
        let rendered = Labels::new().with("path", "C:\\tmp").to_string();
        assert_eq!("{path=\"C:\\tmp\"}", rendered);
    }

    #[test]
    fn test_labels_merge_right_wins() {
        let a = Labels::new().with("room", "kitchen").with("floor", "1");
        let b = Labels::new().with("floor", "2").with("sensor", "hdc1000");
        let merged = a.merge(&b);

        assert_eq!(3, merged.len());
        assert_eq!(Some("kitchen"), merged.get("room"));
        assert_eq!(Some("2"), merged.get("floor"));
        assert_eq!(Some("hdc1000"), merged.get("sensor"));

        // Operands are untouched
        assert_eq!(Some("1"), a.get("floor"));
        assert_eq!(2, b.len());
    }

    #[test]
    fn test_labels_merge_empty() {
        let a = Labels::new().with("room", "kitchen");
        assert_eq!(a, a.merge(&Labels::new()));
        assert_eq!(a, Labels::new().merge(&a));
    }

    #[test]
    fn test_labels_serialize_as_map() {
        let labels: Labels = vec![("type", "a")].into_iter().collect();
        assert_eq!("{\"type\":\"a\"}", serde_json::to_string(&labels).unwrap());
    }

    #[test]
    fn test_sensor_value_invalid_name() {
        let res = SensorValue::new("bad-name", Labels::new(), 1.0);
        assert_eq!(ValueErrorKind::InvalidName, res.unwrap_err().kind());
    }

    #[test]
    fn test_sensor_value_invalid_label() {
        let res = SensorValue::new("good", Labels::new().with("", "x"), 1.0);
        assert_eq!(ValueErrorKind::InvalidLabel, res.unwrap_err().kind());
    }

    #[test]
    fn test_sensor_value_non_finite() {
        let res = SensorValue::new("good", Labels::new(), f64::NAN);
        assert_eq!(ValueErrorKind::NonFinite, res.unwrap_err().kind());

        let res = SensorValue::new("good", Labels::new(), f64::INFINITY);
        assert_eq!(ValueErrorKind::NonFinite, res.unwrap_err().kind());
    }

    #[test]
    fn test_sensor_value_unix_time() {
        let ts = UNIX_EPOCH + Duration::from_millis(1_650_000_000_123);
        let v = SensorValue::new("dummy_value", Labels::new(), 42.0).unwrap().at(ts);

        assert_eq!(1_650_000_000, v.unix_secs());
        assert_eq!(1_650_000_000_123, v.unix_millis());
        assert_eq!(ts, v.timestamp());
    }
}
