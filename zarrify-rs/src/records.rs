//! Geometry, time and frame quantities.
//!
//! These are small descriptive values rather than fields, so they are stored as
//! attributes of the group their result file maps to, under synonym keys (a box
//! `xywh` expands to `xStart`, `yStart`, `boxWidth`, `boxHeight`).

use ndarray::ArrayViewD;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::mat::MatValue;

/// Quantities stored as records instead of datasets.
pub const RECORD_QUANTITIES: &[&str] = &[
    "xyStart",
    "xywh",
    "Overlap",
    "Coordinates",
    "TimeArray",
    "FrameArray",
];

pub fn is_record_quantity(quantity: &str) -> bool {
    RECORD_QUANTITIES.contains(&quantity)
}

/// Attribute keys a record quantity expands into.
pub fn synonym_keys(quantity: &str) -> Vec<&str> {
    match quantity {
        "xyStart" => vec!["xStart", "yStart"],
        "xywh" => vec!["xStart", "yStart", "boxWidth", "boxHeight"],
        "Coordinates" => vec!["grid_xStart", "grid_yStart"],
        other => vec![other],
    }
}

/// Format a record quantity into `(key, value)` attribute entries.
pub fn format_record(quantity: &str, value: &MatValue) -> Result<Vec<(String, Value)>> {
    let values = match quantity {
        "xyStart" => xy_start(quantity, value)?,
        "xywh" => numbers(quantity, value, 4)?,
        "Coordinates" => grid_start(quantity, value)?,
        "FrameArray" => vec![to_json(value)],
        "TimeArray" => vec![time_pairs(quantity, value)?],
        _ => vec![to_json(value)],
    };
    Ok(synonym_keys(quantity)
        .into_iter()
        .map(String::from)
        .zip(values)
        .collect())
}

/// Integral values become JSON integers, NaN becomes null.
pub fn json_number(v: f64) -> Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 {
        json!(v as i64)
    } else if v.is_finite() {
        json!(v)
    } else {
        Value::Null
    }
}

fn array_to_json(a: ArrayViewD<f64>) -> Value {
    if a.ndim() == 0 {
        return a.iter().next().map(|&v| json_number(v)).unwrap_or(Value::Null);
    }
    Value::Array(a.outer_iter().map(array_to_json).collect())
}

fn cells_to_json(a: ArrayViewD<MatValue>) -> Value {
    if a.ndim() == 0 {
        return a.iter().next().map(to_json).unwrap_or(Value::Null);
    }
    Value::Array(a.outer_iter().map(cells_to_json).collect())
}

/// JSON rendition of any decoded value.
pub fn to_json(value: &MatValue) -> Value {
    match value {
        MatValue::Scalar(v) => json_number(*v),
        MatValue::Array(a) => array_to_json(a.view()),
        MatValue::Text(s) => Value::String(s.clone()),
        MatValue::Record(r) => Value::Object(r.iter().map(|(k, v)| (k.clone(), to_json(v))).collect()),
        MatValue::Cells(c) => cells_to_json(c.view()),
        MatValue::Invalid(_) => Value::Null,
    }
}

fn numbers(quantity: &str, value: &MatValue, count: usize) -> Result<Vec<Value>> {
    let array = value
        .as_array()
        .ok_or_else(|| Error::record(quantity, format!("expected numbers, got {}", value.kind())))?;
    if array.len() < count {
        return Err(Error::record(
            quantity,
            format!("expected {count} numbers, got {}", array.len()),
        ));
    }
    Ok(array.iter().take(count).map(|&v| json_number(v)).collect())
}

/// `"[x, y]"`, `"[x y]"` or a numeric pair. Empty brackets give two nulls.
fn xy_start(quantity: &str, value: &MatValue) -> Result<Vec<Value>> {
    let MatValue::Text(text) = value else {
        return numbers(quantity, value, 2);
    };
    let inner = text.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if inner.is_empty() {
        return Ok(vec![Value::Null, Value::Null]);
    }
    let parts: Vec<&str> = inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 2 {
        return Err(Error::record(quantity, format!("cannot read two values from {text:?}")));
    }
    parts[..2]
        .iter()
        .map(|p| {
            p.parse::<i64>()
                .map(|v| json!(v))
                .map_err(|_| Error::record(quantity, format!("{p:?} is not an integer")))
        })
        .collect()
}

/// First grid node (row-major) whose two coordinates are both zero, as
/// `[column, row]`. Cell grids must be 2-D so rows and columns are known.
fn grid_start(quantity: &str, value: &MatValue) -> Result<Vec<Value>> {
    let origin_at = |row: usize, col: usize| vec![json!(col), json!(row)];
    match value {
        MatValue::Cells(grid) => {
            if grid.ndim() != 2 {
                return Err(Error::record(
                    quantity,
                    format!("expected a 2-D grid, got {}-D", grid.ndim()),
                ));
            }
            let cols = grid.shape()[1];
            for (i, node) in grid.iter().enumerate() {
                let is_origin = node
                    .as_array()
                    .map(|xy| xy.len() >= 2 && xy.iter().take(2).all(|&v| v == 0.0))
                    .unwrap_or(false);
                if is_origin {
                    return Ok(origin_at(i / cols, i % cols));
                }
            }
        }
        MatValue::Array(a) if a.ndim() == 3 && a.shape()[2] == 2 => {
            let (rows, cols) = (a.shape()[0], a.shape()[1]);
            for row in 0..rows {
                for col in 0..cols {
                    if a[[row, col, 0]] == 0.0 && a[[row, col, 1]] == 0.0 {
                        return Ok(origin_at(row, col));
                    }
                }
            }
        }
        other => {
            return Err(Error::record(
                quantity,
                format!("expected a grid of coordinate pairs, got {}", other.kind()),
            ))
        }
    }
    Err(Error::record(quantity, "no grid node at (0, 0)"))
}

/// Render a number the way the analysis scripts print floats (`12.0`, `0.25`).
fn float_text(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_finite() && v.fract() == 0.0 && v.abs() < 1.0e16 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn entry_text(value: &MatValue) -> String {
    match value {
        MatValue::Text(s) => s.clone(),
        MatValue::Scalar(v) => float_text(*v),
        other => to_json(other).to_string(),
    }
}

/// Rows of two entries become `[start, end]` string pairs.
fn time_pairs(quantity: &str, value: &MatValue) -> Result<Value> {
    let pairs: Vec<Value> = match value {
        MatValue::Array(a) if a.ndim() == 2 && a.shape()[1] >= 2 => a
            .outer_iter()
            .map(|row| json!([float_text(row[[0]]), float_text(row[[1]])]))
            .collect(),
        MatValue::Array(a) if a.ndim() == 1 && a.len() == 2 => {
            vec![json!([float_text(a[[0]]), float_text(a[[1]])])]
        }
        MatValue::Cells(c) if c.ndim() == 2 && c.shape()[1] >= 2 => c
            .outer_iter()
            .map(|row| json!([entry_text(&row[[0]]), entry_text(&row[[1]])]))
            .collect(),
        other => {
            return Err(Error::record(
                quantity,
                format!("expected rows of two entries, got {}", other.kind()),
            ))
        }
    };
    Ok(Value::Array(pairs))
}
