use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Type used for counter deltas and accumulated counter values.
pub type CounterType = i64;

/// Type used for gauge values.
pub type GaugeType = f64;

/// A sequence of metrics that is delivered and applied as one unit.
pub type Batch = Vec<Metric>;

/// The type of a [`MetricValue`], determining how updates are applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Stores absolute snapshots of values.
    ///
    /// Every update replaces the stored value.
    Gauge,
    /// Counts instances of an event.
    ///
    /// Every update adds its delta to the stored value.
    Counter,
}

impl MetricType {
    /// Returns the name of this metric type as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "gauge" => Self::Gauge,
            "counter" => Self::Counter,
            _ => return Err(ParseMetricError::UnknownType(s.to_owned())),
        })
    }
}

/// An error returned when parsing metric types, values or records.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseMetricError {
    /// The metric type is neither `gauge` nor `counter`.
    #[error("unknown metric type {0:?}")]
    UnknownType(String),
    /// The value cannot be parsed for the metric type.
    #[error("invalid value {value:?} for {ty}")]
    InvalidValue {
        /// The metric type the value was parsed for.
        ty: MetricType,
        /// The raw value.
        value: String,
    },
    /// The metric name is empty.
    #[error("metric name is empty")]
    EmptyName,
    /// A gauge record without `value`.
    #[error("gauge metric {0:?} must have a value")]
    MissingValue(String),
    /// A counter record without `delta`.
    #[error("counter metric {0:?} must have a delta")]
    MissingDelta(String),
}

/// Raised when an update does not match the type of the stored metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("cannot apply {update} update to {stored} metric")]
pub struct TypeMismatch {
    /// Type of the stored value.
    pub stored: MetricType,
    /// Type of the incoming update.
    pub update: MetricType,
}

/// The typed value of a metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// An absolute snapshot. See [`MetricType::Gauge`].
    Gauge(GaugeType),
    /// A delta or an accumulated count. See [`MetricType::Counter`].
    Counter(CounterType),
}

impl MetricValue {
    /// Returns the type of this value.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Gauge(_) => MetricType::Gauge,
            Self::Counter(_) => MetricType::Counter,
        }
    }

    /// Parses a value of the given type from its text representation.
    pub fn parse(ty: MetricType, value: &str) -> Result<Self, ParseMetricError> {
        let invalid = || ParseMetricError::InvalidValue {
            ty,
            value: value.to_owned(),
        };

        match ty {
            MetricType::Gauge => value
                .parse::<GaugeType>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Self::Gauge)
                .ok_or_else(invalid),
            MetricType::Counter => value
                .parse::<CounterType>()
                .map(Self::Counter)
                .map_err(|_| invalid()),
        }
    }

    /// Applies this update on top of the currently stored value.
    ///
    /// Counters add their delta to the stored count, gauges replace the stored value.
    pub fn apply_to(self, stored: MetricValue) -> Result<MetricValue, TypeMismatch> {
        match (stored, self) {
            (Self::Counter(current), Self::Counter(delta)) => {
                Ok(Self::Counter(current.saturating_add(delta)))
            }
            (Self::Gauge(_), Self::Gauge(value)) => Ok(Self::Gauge(value)),
            (stored, update) => Err(TypeMismatch {
                stored: stored.ty(),
                update: update.ty(),
            }),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(value) => value.fmt(f),
            MetricValue::Counter(value) => value.fmt(f),
        }
    }
}

/// A named metric with a typed value.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// The unique name of the metric.
    pub name: String,
    /// The typed value.
    pub value: MetricValue,
}

impl Metric {
    /// Creates a new metric.
    pub fn new(name: impl Into<String>, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Creates a gauge metric.
    pub fn gauge(name: impl Into<String>, value: GaugeType) -> Self {
        Self::new(name, MetricValue::Gauge(value))
    }

    /// Creates a counter metric.
    pub fn counter(name: impl Into<String>, delta: CounterType) -> Self {
        Self::new(name, MetricValue::Counter(delta))
    }

    /// Returns the type of this metric.
    pub fn ty(&self) -> MetricType {
        self.value.ty()
    }
}

/// The wire representation of a [`Metric`].
///
/// Exactly one of `delta` and `value` is set, matching `type`. Lookup requests carry neither.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricRecord {
    /// The metric name.
    pub id: String,
    /// The metric type.
    #[serde(rename = "type")]
    pub ty: MetricType,
    /// The counter delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<CounterType>,
    /// The gauge value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<GaugeType>,
}

impl From<&Metric> for MetricRecord {
    fn from(metric: &Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Gauge(value) => (None, Some(value)),
            MetricValue::Counter(delta) => (Some(delta), None),
        };

        Self {
            id: metric.name.clone(),
            ty: metric.ty(),
            delta,
            value,
        }
    }
}

impl TryFrom<MetricRecord> for Metric {
    type Error = ParseMetricError;

    fn try_from(record: MetricRecord) -> Result<Self, Self::Error> {
        if record.id.is_empty() {
            return Err(ParseMetricError::EmptyName);
        }

        let value = match record.ty {
            MetricType::Gauge => match record.value {
                Some(value) => MetricValue::Gauge(value),
                None => return Err(ParseMetricError::MissingValue(record.id)),
            },
            MetricType::Counter => match record.delta {
                Some(delta) => MetricValue::Counter(delta),
                None => return Err(ParseMetricError::MissingDelta(record.id)),
            },
        };

        Ok(Metric::new(record.id, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type() {
        assert_eq!("gauge".parse::<MetricType>().unwrap(), MetricType::Gauge);
        assert_eq!(
            "counter".parse::<MetricType>().unwrap(),
            MetricType::Counter
        );
        assert_eq!(
            "histogram".parse::<MetricType>(),
            Err(ParseMetricError::UnknownType("histogram".to_owned()))
        );
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(
            MetricValue::parse(MetricType::Gauge, "3.14").unwrap(),
            MetricValue::Gauge(3.14)
        );
        assert_eq!(
            MetricValue::parse(MetricType::Counter, "-5").unwrap(),
            MetricValue::Counter(-5)
        );
        assert!(MetricValue::parse(MetricType::Counter, "1.5").is_err());
        assert!(MetricValue::parse(MetricType::Gauge, "abc").is_err());
        assert!(MetricValue::parse(MetricType::Gauge, "NaN").is_err());
    }

    #[test]
    fn test_display_value() {
        assert_eq!(MetricValue::Gauge(9.8).to_string(), "9.8");
        assert_eq!(MetricValue::Gauge(10.0).to_string(), "10");
        assert_eq!(MetricValue::Counter(42).to_string(), "42");
    }

    #[test]
    fn test_apply_counter_accumulates() {
        let stored = MetricValue::Counter(5);
        assert_eq!(
            MetricValue::Counter(5).apply_to(stored),
            Ok(MetricValue::Counter(10))
        );
    }

    #[test]
    fn test_apply_counter_saturates() {
        let stored = MetricValue::Counter(i64::MAX);
        assert_eq!(
            MetricValue::Counter(1).apply_to(stored),
            Ok(MetricValue::Counter(i64::MAX))
        );
    }

    #[test]
    fn test_apply_gauge_replaces() {
        let stored = MetricValue::Gauge(3.14);
        assert_eq!(
            MetricValue::Gauge(9.8).apply_to(stored),
            Ok(MetricValue::Gauge(9.8))
        );
    }

    #[test]
    fn test_apply_type_mismatch() {
        let stored = MetricValue::Gauge(1.0);
        assert_eq!(
            MetricValue::Counter(1).apply_to(stored),
            Err(TypeMismatch {
                stored: MetricType::Gauge,
                update: MetricType::Counter,
            })
        );
    }

    #[test]
    fn test_record_conversion() {
        let record: MetricRecord =
            serde_json::from_str(r#"{"id":"Requests","type":"counter","delta":5}"#).unwrap();
        assert_eq!(
            Metric::try_from(record).unwrap(),
            Metric::counter("Requests", 5)
        );

        let record = MetricRecord::from(&Metric::gauge("Temp", 3.14));
        insta::assert_json_snapshot!(record, @r###"
        {
          "id": "Temp",
          "type": "gauge",
          "value": 3.14
        }
        "###);
    }

    #[test]
    fn test_record_missing_field() {
        let record: MetricRecord = serde_json::from_str(r#"{"id":"Temp","type":"gauge"}"#).unwrap();
        assert_eq!(
            Metric::try_from(record),
            Err(ParseMetricError::MissingValue("Temp".to_owned()))
        );

        let record: MetricRecord =
            serde_json::from_str(r#"{"id":"Requests","type":"counter","value":1.0}"#).unwrap();
        assert_eq!(
            Metric::try_from(record),
            Err(ParseMetricError::MissingDelta("Requests".to_owned()))
        );
    }

    #[test]
    fn test_record_empty_name() {
        let record: MetricRecord = serde_json::from_str(r#"{"id":"","type":"counter","delta":1}"#).unwrap();
        assert_eq!(Metric::try_from(record), Err(ParseMetricError::EmptyName));
    }
}
