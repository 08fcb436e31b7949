use crate::codec::point::{FieldValue, Point};
use crate::error::{RelayError, RelayResult};
use prost::Message;

/// Hand-derived messages for the Prometheus remote-write wire schema.
/// Only the fields the relay actually reads/writes are modeled.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

const METRIC_NAME_LABEL: &str = "__name__";

/// Decodes a raw-snappy-compressed `WriteRequest` body into points. Each
/// Prometheus sample becomes one point with a single `value` field and the
/// series' labels (minus `__name__`, which becomes the measurement) as tags.
pub fn decode(compressed: &[u8]) -> RelayResult<Vec<Point>> {
    let mut decoder = snap::raw::Decoder::new();
    let raw = decoder
        .decompress_vec(compressed)
        .map_err(|e| RelayError::Prometheus(format!("snappy decompress failed: {}", e)))?;

    let write_request = WriteRequest::decode(raw.as_slice())
        .map_err(|e| RelayError::Prometheus(format!("protobuf decode failed: {}", e)))?;

    let mut points = Vec::new();
    for series in write_request.timeseries {
        let mut measurement = None;
        let mut tags = std::collections::BTreeMap::new();
        for label in &series.labels {
            if label.name == METRIC_NAME_LABEL {
                measurement = Some(label.value.clone());
            } else {
                tags.insert(label.name.clone(), label.value.clone());
            }
        }
        let measurement = measurement.ok_or_else(|| {
            RelayError::Prometheus("time series missing __name__ label".to_string())
        })?;

        for sample in &series.samples {
            if sample.value.is_nan() || sample.value.is_infinite() {
                tracing::debug!(
                    measurement = %measurement,
                    value = sample.value,
                    "dropping prometheus sample with non-finite value"
                );
                continue;
            }
            let mut point = Point::new(measurement.clone());
            point.tags = tags.clone();
            point
                .fields
                .insert("value".to_string(), FieldValue::Float(sample.value));
            // Prometheus sample timestamps are milliseconds since epoch.
            point.timestamp = Some(sample.timestamp * 1_000_000);
            points.push(point);
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_write_request() -> WriteRequest {
        WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![
                    Label {
                        name: "__name__".into(),
                        value: "http_requests_total".into(),
                    },
                    Label {
                        name: "job".into(),
                        value: "api".into(),
                    },
                ],
                samples: vec![Sample {
                    value: 42.0,
                    timestamp: 1_700_000_000_000,
                }],
            }],
        }
    }

    #[test]
    fn decodes_snappy_compressed_write_request() {
        let wr = sample_write_request();
        let mut buf = Vec::new();
        wr.encode(&mut buf).unwrap();
        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder.compress_vec(&buf).unwrap();

        let points = decode(&compressed).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement, "http_requests_total");
        assert_eq!(points[0].tags.get("job").unwrap(), "api");
        assert_eq!(
            points[0].fields.get("value").unwrap(),
            &FieldValue::Float(42.0)
        );
    }

    #[test]
    fn drops_non_finite_samples_without_erroring() {
        let wr = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![Label {
                    name: "__name__".into(),
                    value: "temp".into(),
                }],
                samples: vec![
                    Sample { value: f64::NAN, timestamp: 0 },
                    Sample { value: f64::INFINITY, timestamp: 1 },
                    Sample { value: 1.5, timestamp: 2 },
                ],
            }],
        };
        let mut buf = Vec::new();
        wr.encode(&mut buf).unwrap();
        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder.compress_vec(&buf).unwrap();

        let points = decode(&compressed).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields.get("value").unwrap(), &FieldValue::Float(1.5));
    }

    #[test]
    fn rejects_series_missing_metric_name() {
        let wr = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![Label {
                    name: "job".into(),
                    value: "api".into(),
                }],
                samples: vec![Sample {
                    value: 1.0,
                    timestamp: 0,
                }],
            }],
        };
        let mut buf = Vec::new();
        wr.encode(&mut buf).unwrap();
        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder.compress_vec(&buf).unwrap();
        assert!(decode(&compressed).is_err());
    }
}
