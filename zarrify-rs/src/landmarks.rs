//! Anatomical landmarks kept as root attributes of a specimen store.
//!
//! Each landmark set is a list of `[x, y]` points, `"NaN"` until annotated.
//! The space-registration step reads them back as tab-separated text files.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};
use crate::zarr::{self, Store};

/// Landmark attribute names and their number of points.
pub const LANDMARKS: [(&str, usize); 3] = [("Macro_XYs", 8), ("MidLine_XYs", 2), ("Neck_XYs", 2)];

pub const PLACEHOLDER: &str = "NaN";

/// Folder of the registration step for project `name`.
pub fn registration_dir(project_dir: &Path, name: &str) -> PathBuf {
    project_dir
        .join(format!("SAP_{name}"))
        .join(format!("spaceReg_{name}_999"))
}

/// Create missing landmark attributes with placeholder points. Returns the
/// names created.
pub fn init_landmarks(store: &Store) -> Result<Vec<String>> {
    zarr::ensure_group(store, "/")?;
    let existing = zarr::group_attributes(store, "/")?;
    let created: Vec<(String, Value)> = LANDMARKS
        .iter()
        .filter(|(attr, _)| !existing.contains_key(*attr))
        .map(|&(attr, points)| {
            let pairs = vec![json!([PLACEHOLDER, PLACEHOLDER]); points];
            (attr.to_string(), Value::Array(pairs))
        })
        .collect();
    let names = created.iter().map(|(k, _)| k.clone()).collect();
    if !created.is_empty() {
        zarr::set_group_attributes(store, "/", created)?;
    }
    Ok(names)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write every landmark set as `<attr>_<name>.txt` into the registration
/// folder, one point per line.
pub fn export_landmarks(store: &Store, project_dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let attrs = zarr::group_attributes(store, "/")?;
    let target = registration_dir(project_dir, name);
    fs::create_dir_all(&target)?;

    let mut written = Vec::new();
    for (attr, _) in LANDMARKS {
        let points = attrs
            .get(attr)
            .and_then(Value::as_array)
            .ok_or_else(|| Error::MissingInput(format!("landmark attribute {attr} not set")))?;
        let path = target.join(format!("{attr}_{name}.txt"));
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| Error::Io(e.into()))?;
        for point in points {
            let row: Vec<String> = match point {
                Value::Array(xy) => xy.iter().map(cell_text).collect(),
                other => vec![cell_text(other)],
            };
            writer.write_record(&row).map_err(|e| Error::Io(e.into()))?;
        }
        writer.flush()?;
        info!(file = %path.display(), points = points.len(), "landmarks exported");
        written.push(path);
    }
    Ok(written)
}
