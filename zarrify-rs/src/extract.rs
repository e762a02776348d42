//! Result-file extraction: load one MATLAB result file and forward the
//! requested quantities into a store group.

use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::harmonize;
use crate::mat::{self, MatValue, Record};
use crate::records;
use crate::zarr::{self, Store};

/// Root-level record whose fields are merged into the top level.
pub const PROMOTED_RECORD: &str = "REG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    AlreadyPresent,
    Records(usize),
}

/// What happened to each requested quantity of one file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub written: Vec<String>,
    pub existing: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<String>,
}

/// Load a result file with its `REG` record merged into the root.
pub fn load_result_file(path: &Path) -> Result<Record> {
    let mut record = mat::read_file(path)?;
    promote_record(&mut record, PROMOTED_RECORD);
    Ok(record)
}

/// Move the fields of the record stored under `key` up into `root`, replacing
/// same-named entries. Non-record values are left where they are.
pub fn promote_record(root: &mut Record, key: &str) {
    match root.remove(key) {
        Some(MatValue::Record(inner)) => root.extend(inner),
        Some(other) => {
            root.insert(key.to_string(), other);
        }
        None => {}
    }
}

/// Last component of a store node path.
pub fn group_name(group_path: &str) -> &str {
    group_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Extract `quantities` from `file` into the group at `group_path`.
pub fn extract_file(
    store: &Store,
    group_path: &str,
    file: &Path,
    quantities: &[String],
    verbose: bool,
) -> Result<Extraction> {
    let record = load_result_file(file)?;
    let name = group_name(group_path);
    let source = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut summary = Extraction::default();

    for quantity in quantities {
        let Some(value) = record.get(quantity) else {
            if verbose {
                let available: Vec<&String> = record.keys().collect();
                warn!(
                    quantity = %quantity,
                    file = %file.display(),
                    ?available,
                    "quantity not found in result file"
                );
            }
            summary.missing.push(quantity.clone());
            continue;
        };
        match update_group(store, group_path, quantity, value, name, &source) {
            Ok(Outcome::AlreadyPresent) => summary.existing.push(quantity.clone()),
            Ok(Outcome::Records(count)) => {
                debug!(quantity = %quantity, group = %group_path, count, "records written");
                summary.written.push(quantity.clone());
            }
            Ok(Outcome::Written) => summary.written.push(quantity.clone()),
            Err(e) => {
                warn!(quantity = %quantity, file = %file.display(), error = %e, "cannot store quantity");
                summary.failed.push(quantity.clone());
            }
        }
    }
    Ok(summary)
}

/// Store one quantity. Existing datasets are never touched; record quantities
/// are (re)written as group attributes.
pub fn update_group(
    store: &Store,
    group_path: &str,
    quantity: &str,
    value: &MatValue,
    group_name: &str,
    source: &str,
) -> Result<Outcome> {
    let dataset = zarr::node_path(&[group_path, quantity]);
    if zarr::node_exists(store, &dataset) {
        debug!(dataset = %dataset, "already present, skipping");
        return Ok(Outcome::AlreadyPresent);
    }

    if let MatValue::Invalid(reason) = value {
        return Err(Error::Mat {
            path: PathBuf::from(source),
            message: format!("{quantity}: {reason}"),
        });
    }

    if records::is_record_quantity(quantity) {
        let entries = records::format_record(quantity, value)?;
        let count = entries.len();
        zarr::set_group_attributes(store, group_path, entries)?;
        return Ok(Outcome::Records(count));
    }

    let array = value.as_array().ok_or_else(|| {
        Error::Shape(format!("{quantity} is {}, not a numeric array", value.kind()))
    })?;
    let rank = array.ndim();
    let rule = harmonize::matching_rule(rank, quantity, group_name);
    let harmonized = harmonize::harmonize(array, quantity, group_name)?;
    let mut attrs = zarr::Attributes::new();
    attrs.insert("source".to_string(), json!(source));
    attrs.insert("harmonization_rule".to_string(), json!(rule));
    zarr::write_quantity_f16(store, &dataset, &harmonized, Some(attrs))?;
    Ok(Outcome::Written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mat::fixture::{self, Fx};
    use tracing_test::traced_test;

    fn four_d(dims: [usize; 4]) -> Fx {
        let n: usize = dims.iter().product();
        Fx::Double(dims.to_vec(), (0..n).map(|v| v as f64).collect())
    }

    fn setup(group: &[&str]) -> (tempfile::TempDir, Store, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = zarr::open_store(&dir.path().join("animal.zarr")).unwrap();
        zarr::ensure_layout(&store).unwrap();
        let mut parts = vec!["TENSORS"];
        parts.extend_from_slice(group);
        let path = zarr::ensure_group_path(&store, &parts).unwrap();
        (dir, store, path)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reg_fields_move_to_the_root() {
        let mut root = Record::new();
        root.insert("UPIV".into(), MatValue::Scalar(1.0));
        let mut reg = Record::new();
        reg.insert("UPIV".into(), MatValue::Scalar(2.0));
        reg.insert("xywh".into(), MatValue::Scalar(3.0));
        root.insert("REG".into(), MatValue::Record(reg));
        promote_record(&mut root, "REG");
        assert!(!root.contains_key("REG"));
        assert_eq!(root["UPIV"], MatValue::Scalar(2.0));
        assert_eq!(root["xywh"], MatValue::Scalar(3.0));
    }

    #[test]
    fn group_names() {
        assert_eq!(group_name("/TENSORS/AOA_1"), "AOA_1");
        assert_eq!(group_name("/TENSORS"), "TENSORS");
    }

    #[test]
    fn aoa_velocity_is_stored_unchanged() {
        let (dir, store, group) = setup(&["AOA_x"]);
        let file = dir.path().join("AOA_x.mat");
        fixture::write(&file, &[("EpsilonPIV", four_d([2, 3, 4, 5]))], true);
        let summary = extract_file(&store, &group, &file, &names(&["EpsilonPIV"]), true).unwrap();
        assert_eq!(summary.written, vec!["EpsilonPIV"]);
        let back = zarr::read_array_f16(&store, "/TENSORS/AOA_x/EpsilonPIV").unwrap();
        assert_eq!(back.shape(), &[2, 3, 4, 5]);
    }

    #[test]
    fn dba_velocity_gets_time_first() {
        let (dir, store, group) = setup(&["DBA_y"]);
        let file = dir.path().join("DBA_y.mat");
        fixture::write(&file, &[("EpsilonPIV", four_d([2, 3, 4, 5]))], false);
        extract_file(&store, &group, &file, &names(&["EpsilonPIV"]), true).unwrap();
        let back = zarr::read_array_f16(&store, "/TENSORS/DBA_y/EpsilonPIV").unwrap();
        assert_eq!(back.shape(), &[5, 2, 3, 4]);
        // Column-major source: element (a,b,c,t) holds a + 2b + 6c + 24t.
        assert_eq!(back[[1, 1, 2, 3]].to_f64(), 1.0 + 4.0 + 18.0 + 24.0);
    }

    #[test]
    #[traced_test]
    fn missing_quantity_warns_once_and_creates_nothing() {
        let (dir, store, group) = setup(&["AOA_1"]);
        let file = dir.path().join("f.mat");
        fixture::write(&file, &[("UPIV", four_d([2, 2, 2, 2]))], true);
        let summary =
            extract_file(&store, &group, &file, &names(&["UPIV", "OmegaPIV"]), true).unwrap();
        assert_eq!(summary.missing, vec!["OmegaPIV"]);
        assert!(!zarr::node_exists(&store, "/TENSORS/AOA_1/OmegaPIV"));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|l| l.contains("quantity not found"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one warning, saw {n}")),
            }
        });
    }

    #[test]
    fn reg_record_quantities_become_attributes() {
        let (dir, store, group) = setup(&["AOA_1"]);
        let file = dir.path().join("f.mat");
        fixture::write(
            &file,
            &[(
                "REG",
                Fx::Struct(vec![
                    ("xywh".into(), Fx::Double(vec![1, 4], vec![1.0, 2.0, 30.0, 40.0])),
                    ("Overlap".into(), Fx::Double(vec![1, 1], vec![0.5])),
                ]),
            )],
            true,
        );
        let summary =
            extract_file(&store, &group, &file, &names(&["xywh", "Overlap"]), true).unwrap();
        assert_eq!(summary.written.len(), 2);
        let attrs = zarr::group_attributes(&store, &group).unwrap();
        assert_eq!(attrs["boxWidth"], json!(30));
        assert_eq!(attrs["Overlap"], json!(0.5));
    }

    #[test]
    fn rerun_skips_existing_datasets() {
        let (dir, store, group) = setup(&["AOA_1"]);
        let file = dir.path().join("f.mat");
        fixture::write(&file, &[("UPIV", four_d([2, 2, 2, 2]))], true);
        let quantities = names(&["UPIV"]);
        extract_file(&store, &group, &file, &quantities, true).unwrap();
        let first = zarr::read_array_f16(&store, "/TENSORS/AOA_1/UPIV").unwrap();

        fixture::write(&file, &[("UPIV", Fx::Double(vec![2, 2, 2, 2], vec![9.0; 16]))], true);
        let summary = extract_file(&store, &group, &file, &quantities, true).unwrap();
        assert_eq!(summary.existing, vec!["UPIV"]);
        assert_eq!(zarr::read_array_f16(&store, "/TENSORS/AOA_1/UPIV").unwrap(), first);
    }

    #[test]
    fn truncated_payload_fails_and_creates_nothing() {
        let (dir, store, group) = setup(&["AOA_1"]);
        let file = dir.path().join("f.mat");
        fixture::write(
            &file,
            &[
                ("UPIV", Fx::Double(vec![2, 3, 2, 2], vec![1.0; 4])),
                ("EpsilonPIV", four_d([2, 2, 2, 2])),
            ],
            true,
        );
        let summary =
            extract_file(&store, &group, &file, &names(&["UPIV", "EpsilonPIV"]), true).unwrap();
        assert_eq!(summary.failed, vec!["UPIV"]);
        assert_eq!(summary.written, vec!["EpsilonPIV"]);
        assert!(!zarr::array_exists(&store, "/TENSORS/AOA_1/UPIV"));
    }

    #[test]
    fn corrupt_dimensions_fail_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.mat");
        let huge = i32::MAX as usize;
        fixture::write(&file, &[("UPIV", Fx::Cell(vec![huge; 3], vec![]))], true);
        assert!(matches!(load_result_file(&file), Err(Error::Mat { .. })));
    }

    #[test]
    fn low_rank_quantity_fails_without_stopping_others() {
        let (dir, store, group) = setup(&["AOA_1"]);
        let file = dir.path().join("f.mat");
        fixture::write(
            &file,
            &[
                ("OmegaPIV", Fx::Double(vec![1, 3], vec![1.0, 2.0, 3.0])),
                ("UPIV", four_d([2, 2, 2, 2])),
            ],
            false,
        );
        let summary =
            extract_file(&store, &group, &file, &names(&["OmegaPIV", "UPIV"]), false).unwrap();
        assert_eq!(summary.failed, vec!["OmegaPIV"]);
        assert_eq!(summary.written, vec!["UPIV"]);
    }
}
