use std::collections::HashMap;

use serde::Deserialize;

/// Envelope returned by `/api/v1/query_range`.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub status: String,

    #[serde(default)]
    pub data: Option<QueryData>,

    #[serde(default, rename = "errorType")]
    pub error_type: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    /// Non-fatal warnings attached to a successful result.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Query result, tagged by `resultType`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    /// Many samples per series (range results).
    Matrix(Vec<RangeSeries>),
    /// One sample per series (instant results).
    Vector(Vec<InstantSample>),
    Scalar(SamplePair),
    String(serde_json::Value),
}

impl QueryData {
    /// The `resultType` name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Matrix(_) => "matrix",
            Self::Vector(_) => "vector",
            Self::Scalar(_) => "scalar",
            Self::String(_) => "string",
        }
    }

    /// Number of samples carried by the result.
    pub fn sample_count(&self) -> usize {
        match self {
            Self::Matrix(series) => series.iter().map(|s| s.values.len()).sum(),
            Self::Vector(samples) => samples.len(),
            Self::Scalar(_) | Self::String(_) => 1,
        }
    }
}

/// One series of a matrix result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RangeSeries {
    #[serde(default)]
    pub metric: HashMap<String, String>,
    #[serde(default)]
    pub values: Vec<SamplePair>,
}

/// One series of a vector result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstantSample {
    #[serde(default)]
    pub metric: HashMap<String, String>,
    pub value: SamplePair,
}

/// `[<unix seconds as float>, "<value as string>"]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplePair(pub f64, pub String);

impl SamplePair {
    /// Sample time in milliseconds since the epoch, the wire's native resolution.
    pub fn timestamp_millis(&self) -> i64 {
        (self.0 * 1000.0).round() as i64
    }

    pub fn raw_value(&self) -> &str {
        &self.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_matrix() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {
                        "metric": {"__name__": "up", "job": "tidb", "instance": "a:10080"},
                        "values": [[1435781430.781, "1"], [1435781445.781, "0"]]
                    }
                ]
            }
        }"#;

        let resp: ApiResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(resp.status, "success");
        assert!(resp.warnings.is_empty());

        let data = resp.data.expect("data");
        assert_eq!(data.kind(), "matrix");
        assert_eq!(data.sample_count(), 2);

        let QueryData::Matrix(series) = data else {
            panic!("expected matrix");
        };
        assert_eq!(series[0].metric.get("job").map(String::as_str), Some("tidb"));
        assert_eq!(series[0].values[0].timestamp_millis(), 1_435_781_430_781);
        assert_eq!(series[0].values[1].raw_value(), "0");
    }

    #[test]
    fn test_decode_vector_with_warnings() {
        let body = r#"{
            "status": "success",
            "warnings": ["partial response"],
            "data": {
                "resultType": "vector",
                "result": [{"metric": {"job": "pd"}, "value": [1700000000, "NaN"]}]
            }
        }"#;

        let resp: ApiResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(resp.warnings, vec!["partial response".to_string()]);

        let data = resp.data.expect("data");
        assert_eq!(data.kind(), "vector");
        assert_eq!(data.sample_count(), 1);
    }

    #[test]
    fn test_decode_scalar() {
        let body = r#"{"status":"success","data":{"resultType":"scalar","result":[1700000000,"3"]}}"#;
        let resp: ApiResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(resp.data.expect("data").kind(), "scalar");
    }

    #[test]
    fn test_decode_error_envelope() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error at char 4"}"#;
        let resp: ApiResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(resp.status, "error");
        assert!(resp.data.is_none());
        assert_eq!(resp.error_type.as_deref(), Some("bad_data"));
    }

    #[test]
    fn test_timestamp_millis_rounds_float_noise() {
        let pair = SamplePair(1_700_000_000.123, "1".to_string());
        assert_eq!(pair.timestamp_millis(), 1_700_000_000_123);
    }
}
