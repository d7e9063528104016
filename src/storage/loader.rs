//! Columnar reconstruction of a persisted episode log.
//!
//! Every record is flattened into dotted keys (`side_effects.wall`), and each
//! key becomes one dense array with one row per record. Rows where a key is
//! missing get a default: `""` for text, NaT (`None`) for `time`, zero
//! otherwise, or a per-key override. Keys whose values do not share one type
//! and one shape are reported and skipped; the rest still load.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::{ArrayD, Axis, IxDyn};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{LogError, Result};

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
    Time,
}

/// One dense column; the first axis indexes records.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Bool(ArrayD<bool>),
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
    Text(ArrayD<String>),
    /// `None` is "not a time".
    Time(ArrayD<Option<DateTime<Utc>>>),
}

impl Column {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Bool(_) => ColumnKind::Bool,
            Self::Int(_) => ColumnKind::Int,
            Self::Float(_) => ColumnKind::Float,
            Self::Text(_) => ColumnKind::Text,
            Self::Time(_) => ColumnKind::Time,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Bool(a) => a.shape(),
            Self::Int(a) => a.shape(),
            Self::Float(a) => a.shape(),
            Self::Text(a) => a.shape(),
            Self::Time(a) => a.shape(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric view: integers and booleans are widened to `f64`.
    pub fn to_f64(&self) -> Option<ArrayD<f64>> {
        match self {
            Self::Float(a) => Some(a.clone()),
            Self::Int(a) => Some(a.mapv(|v| v as f64)),
            Self::Bool(a) => Some(a.mapv(|v| if v { 1.0 } else { 0.0 })),
            Self::Text(_) | Self::Time(_) => None,
        }
    }
}

/// The loaded columns of one log.
#[derive(Debug, Clone, Default)]
pub struct LoadedLog {
    rows: usize,
    columns: BTreeMap<String, Column>,
    skipped: Vec<String>,
}

impl LoadedLog {
    /// Number of records in the log.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn get(&self, key: &str) -> Option<&Column> {
        self.columns.get(key)
    }

    /// Numeric column `key`, widened to `f64`.
    pub fn floats(&self, key: &str) -> Option<ArrayD<f64>> {
        self.columns.get(key).and_then(Column::to_f64)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys that could not be turned into a uniform column.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFileLoader {
    defaults: HashMap<String, Value>,
}

impl LogFileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill rows missing `key` with `value` instead of the type default.
    pub fn with_default(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn load(&self, path: &Path) -> Result<LoadedLog> {
        let load_err = |reason: String| LogError::Load {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let data: Value = serde_json::from_str(&text).map_err(|e| load_err(e.to_string()))?;
        let Value::Array(records) = data else {
            return Err(load_err("top-level value is not an array".into()));
        };
        let log = self.load_records(&records).map_err(|e| load_err(e.to_string()))?;
        debug!(
            path = %path.display(),
            rows = log.rows(),
            columns = log.columns.len(),
            "Loaded episode log"
        );
        Ok(log)
    }

    /// Build columns from already-parsed records.
    pub fn load_records(&self, records: &[Value]) -> Result<LoadedLog> {
        let mut observed: BTreeMap<String, Vec<(usize, Value)>> = BTreeMap::new();
        for (row, record) in records.iter().enumerate() {
            let Value::Object(fields) = record else {
                return Err(LogError::InvalidRecord(format!("record {row} is not an object")));
            };
            let mut flat = Vec::new();
            flatten("", fields, &mut flat);
            for (key, value) in flat {
                observed.entry(key).or_default().push((row, value));
            }
        }

        let rows = records.len();
        let mut log = LoadedLog {
            rows,
            ..LoadedLog::default()
        };
        for (key, values) in observed {
            match self.build_column(&key, rows, &values) {
                Ok(column) => {
                    log.columns.insert(key, column);
                }
                Err(reason) => {
                    error!(key = %key, reason = %reason, "Cannot load key");
                    log.skipped.push(key);
                }
            }
        }
        Ok(log)
    }

    fn build_column(
        &self,
        key: &str,
        rows: usize,
        values: &[(usize, Value)],
    ) -> std::result::Result<Column, String> {
        let default = self.defaults.get(key);

        if key == "time" {
            let column = scatter(rows, &[], values, default_as(default, as_time), |v| {
                v.as_str().and_then(parse_time).map(Some)
            })?;
            return Ok(Column::Time(column));
        }

        let mut kind: Option<ColumnKind> = None;
        let mut shape: Option<Vec<usize>> = None;
        for (_, value) in values {
            let (leaf, dims) = describe(value)?;
            match &shape {
                Some(s) if *s != dims => {
                    return Err(format!("inconsistent shapes {s:?} and {dims:?}"))
                }
                Some(_) => {}
                None => shape = Some(dims),
            }
            if let Some(leaf) = leaf {
                kind = Some(match kind {
                    None => leaf,
                    Some(k) => unify(k, leaf)?,
                });
            }
        }
        let inner = shape.unwrap_or_default();

        let column = match kind.unwrap_or(ColumnKind::Float) {
            ColumnKind::Bool => Column::Bool(scatter(
                rows,
                &inner,
                values,
                default_as(default, Value::as_bool),
                Value::as_bool,
            )?),
            ColumnKind::Int => Column::Int(scatter(
                rows,
                &inner,
                values,
                default_as(default, int_default),
                as_int,
            )?),
            ColumnKind::Float => Column::Float(scatter(
                rows,
                &inner,
                values,
                default_as(default, as_float),
                as_float,
            )?),
            ColumnKind::Text => Column::Text(scatter(
                rows,
                &inner,
                values,
                default_as(default, as_text),
                as_text,
            )?),
            ColumnKind::Time => return Err("unexpected time values".into()),
        };
        Ok(column)
    }
}

fn as_int(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_bool().map(i64::from))
}

/// Integral overrides given as floats (`-1.0`) are accepted for int columns.
fn int_default(value: &Value) -> Option<i64> {
    as_int(value).or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

/// `null` is NaT; strings are parsed like logged timestamps.
fn as_time(value: &Value) -> Option<Option<DateTime<Utc>>> {
    match value {
        Value::Null => Some(None),
        other => other.as_str().and_then(parse_time).map(Some),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_bool().map(|b| if b { 1.0 } else { 0.0 }))
}

fn as_text(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn default_as<T>(default: Option<&Value>, convert: impl Fn(&Value) -> Option<T>) -> Option<T> {
    let value = default?;
    let converted = convert(value);
    if converted.is_none() {
        warn!(default = %value, "Ignoring default of the wrong type");
    }
    converted
}

/// Flatten nested objects into dotted keys. Arrays are kept as values.
fn flatten(prefix: &str, fields: &Map<String, Value>, out: &mut Vec<(String, Value)>) {
    for (key, value) in fields {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten(&path, inner, out),
            other => out.push((path, other.clone())),
        }
    }
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Naive timestamps are taken as UTC.
            text.parse::<chrono::NaiveDateTime>().ok().map(|t| t.and_utc())
        })
}

/// Leaf kind (`None` for empty arrays) and shape of one value.
fn describe(value: &Value) -> std::result::Result<(Option<ColumnKind>, Vec<usize>), String> {
    match value {
        Value::Bool(_) => Ok((Some(ColumnKind::Bool), Vec::new())),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok((Some(ColumnKind::Int), Vec::new())),
        Value::Number(_) => Ok((Some(ColumnKind::Float), Vec::new())),
        Value::String(_) => Ok((Some(ColumnKind::Text), Vec::new())),
        Value::Array(items) => {
            let mut kind = None;
            let mut inner: Option<Vec<usize>> = None;
            for item in items {
                let (k, dims) = describe(item)?;
                match &inner {
                    Some(s) if *s != dims => return Err("ragged nested array".into()),
                    Some(_) => {}
                    None => inner = Some(dims),
                }
                if let Some(k) = k {
                    kind = Some(match kind {
                        None => k,
                        Some(prev) => unify(prev, k)?,
                    });
                }
            }
            let mut dims = vec![items.len()];
            dims.extend(inner.unwrap_or_default());
            Ok((kind, dims))
        }
        Value::Null => Err("null values".into()),
        Value::Object(_) => Err("objects inside arrays".into()),
    }
}

/// Common element type of two leaves. Booleans widen to numbers; text never
/// mixes with anything else.
fn unify(a: ColumnKind, b: ColumnKind) -> std::result::Result<ColumnKind, String> {
    use ColumnKind::*;
    match (a, b) {
        (x, y) if x == y => Ok(x),
        (Float, Int | Bool) | (Int | Bool, Float) => Ok(Float),
        (Int, Bool) | (Bool, Int) => Ok(Int),
        (x, y) => Err(format!("mixed {x:?} and {y:?} values")),
    }
}

/// Allocate a `[rows, inner..]` array filled with the default and write
/// every observed value into its row.
fn scatter<T: Clone + Default>(
    rows: usize,
    inner: &[usize],
    values: &[(usize, Value)],
    default: Option<T>,
    convert: impl Fn(&Value) -> Option<T>,
) -> std::result::Result<ArrayD<T>, String> {
    let mut shape = vec![rows];
    shape.extend_from_slice(inner);
    let mut array = ArrayD::from_elem(IxDyn(&shape), default.unwrap_or_default());

    for (row, value) in values {
        let mut leaves = Vec::new();
        collect_leaves(value, &mut leaves);
        let mut slot = array.index_axis_mut(Axis(0), *row);
        if slot.len() != leaves.len() {
            return Err(format!("row {row} has {} values, expected {}", leaves.len(), slot.len()));
        }
        for (dst, leaf) in slot.iter_mut().zip(leaves) {
            *dst = convert(leaf).ok_or_else(|| format!("row {row}: cannot convert {leaf}"))?;
        }
    }
    Ok(array)
}

fn collect_leaves<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        leaf => out.push(leaf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records() -> Vec<Value> {
        vec![
            json!({
                "level_name": "a",
                "length": 10,
                "reward": 1.5,
                "completed": true,
                "side_effects": {"wall": [2.0, 5.0]},
                "time": "2024-03-01T12:00:00Z",
            }),
            json!({
                "level_name": "b",
                "length": 20,
                "reward": 3,
                "completed": false,
                "time": "2024-03-01T12:05:00.250",
            }),
        ]
    }

    #[test]
    fn missing_nested_key_gets_zero_default() {
        let log = LogFileLoader::new().load_records(&records()).unwrap();
        assert_eq!(log.rows(), 2);

        let wall = log.floats("side_effects.wall").unwrap();
        assert_eq!(wall.shape(), &[2, 2]);
        assert_eq!(wall[[0, 0]], 2.0);
        assert_eq!(wall[[0, 1]], 5.0);
        assert_eq!(wall[[1, 0]], 0.0);
        assert_eq!(wall[[1, 1]], 0.0);
    }

    #[test]
    fn columns_get_their_natural_types() {
        let log = LogFileLoader::new().load_records(&records()).unwrap();
        assert_eq!(log.get("length").unwrap().kind(), ColumnKind::Int);
        assert_eq!(log.get("reward").unwrap().kind(), ColumnKind::Float);
        assert_eq!(log.get("completed").unwrap().kind(), ColumnKind::Bool);
        match log.get("level_name").unwrap() {
            Column::Text(names) => assert_eq!(names[[1]], "b"),
            other => panic!("unexpected column {other:?}"),
        }
        match log.get("time").unwrap() {
            Column::Time(times) => {
                assert!(times[[0]].is_some());
                assert!(times[[1]].is_some());
            }
            other => panic!("unexpected column {other:?}"),
        }
    }

    #[test]
    fn text_and_time_defaults() {
        let mut data = records();
        data.push(json!({"length": 3}));
        let log = LogFileLoader::new()
            .with_default("length", json!(-1))
            .load_records(&data)
            .unwrap();

        match log.get("level_name").unwrap() {
            Column::Text(names) => assert_eq!(names[[2]], ""),
            other => panic!("unexpected column {other:?}"),
        }
        match log.get("time").unwrap() {
            Column::Time(times) => assert_eq!(times[[2]], None),
            other => panic!("unexpected column {other:?}"),
        }
        match log.get("completed").unwrap() {
            Column::Bool(done) => assert!(!done[[2]]),
            other => panic!("unexpected column {other:?}"),
        }
        // The override only applies to rows that lack the key.
        let lengths = log.floats("length").unwrap();
        assert_eq!(lengths.as_slice().unwrap(), &[10.0, 20.0, 3.0]);

        let log = LogFileLoader::new()
            .with_default("reward", json!(-1.0))
            .load_records(&[json!({"reward": 2.0}), json!({})])
            .unwrap();
        assert_eq!(log.floats("reward").unwrap().as_slice().unwrap(), &[2.0, -1.0]);
    }

    #[test]
    fn overrides_apply_to_time_and_convert_to_int() {
        let data = vec![
            json!({"length": 4, "time": "2024-03-01T12:00:00Z"}),
            json!({}),
        ];
        let log = LogFileLoader::new()
            .with_default("length", json!(-1.0))
            .with_default("time", json!("2020-01-01T00:00:00Z"))
            .load_records(&data)
            .unwrap();

        match log.get("length").unwrap() {
            Column::Int(lengths) => assert_eq!(lengths.as_slice().unwrap(), &[4, -1]),
            other => panic!("unexpected column {other:?}"),
        }
        let epoch: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();
        match log.get("time").unwrap() {
            Column::Time(times) => assert_eq!(times[[1]], Some(epoch)),
            other => panic!("unexpected column {other:?}"),
        }
    }

    #[test]
    fn mixed_shapes_are_skipped_not_fatal() {
        let data = vec![
            json!({"reward": 1.0, "level_name": "single"}),
            json!({"reward": [1.0, 2.0], "level_name": "multi", "agents": ["A", "B"]}),
        ];
        let log = LogFileLoader::new().load_records(&data).unwrap();
        assert_eq!(log.skipped(), &["reward".to_string()]);
        assert!(log.get("reward").is_none());
        assert_eq!(log.get("level_name").unwrap().len(), 2);

        match log.get("agents").unwrap() {
            Column::Text(agents) => {
                assert_eq!(agents.shape(), &[2, 2]);
                assert_eq!(agents[[0, 0]], "");
                assert_eq!(agents[[1, 1]], "B");
            }
            other => panic!("unexpected column {other:?}"),
        }
    }

    #[test]
    fn loads_an_append_log_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = crate::storage::AppendLog::open(&path).unwrap();
        for record in records() {
            log.append(&record).unwrap();
        }
        drop(log);

        let loaded = LogFileLoader::new().load(&path).unwrap();
        assert_eq!(loaded.rows(), 2);
        assert!(loaded.column_names().any(|k| k == "side_effects.wall"));
    }

    #[test]
    fn non_array_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(&path, b"{\"a\": 1}").unwrap();
        let err = LogFileLoader::new().load(&path).unwrap_err();
        assert!(matches!(err, LogError::Load { .. }));

        let err = LogFileLoader::new().load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, LogError::Load { .. }));
    }
}
