//! Results-folder traversal.
//!
//! The averages-over-time folder holds one result file per analysed region,
//! possibly nested in sub-folders. The directory tree is mirrored as groups
//! under `TENSORS`.

use glob::Pattern;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::extract;
use crate::zarr::{self, Store};

/// A result file and its parent directories relative to the walk root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    pub path: PathBuf,
    pub groups: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    pub visited: usize,
    pub excluded: usize,
    pub failed: usize,
}

/// The single entry of `sap_folder` whose name starts with `prefix`.
pub fn find_results_folder(sap_folder: &Path, prefix: &str) -> Result<PathBuf> {
    let pattern = Pattern::new(&format!("{}*", Pattern::escape(prefix)))?;
    let entries = fs::read_dir(sap_folder).map_err(|e| {
        Error::MissingInput(format!("cannot read {}: {e}", sap_folder.display()))
    })?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if pattern.matches(&entry.file_name().to_string_lossy()) {
            found.push(entry.path());
        }
    }
    found.sort();
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(Error::MissingInput(format!(
            "no {prefix}* folder in {}",
            sap_folder.display()
        ))),
        _ => Err(Error::AmbiguousInput(format!(
            "expected a single {prefix}* folder, found {found:?}"
        ))),
    }
}

/// Every file below `root` ending with `extension`, sorted by path, plus the
/// number left out because their name contains `exclude`.
pub fn scan_results(root: &Path, extension: &str, exclude: &str) -> Result<(Vec<ResultFile>, usize)> {
    let mut files = Vec::new();
    let mut excluded = 0;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(extension) {
            continue;
        }
        if !exclude.is_empty() && name.contains(exclude) {
            excluded += 1;
            continue;
        }
        let groups = entry
            .path()
            .parent()
            .and_then(|dir| dir.strip_prefix(root).ok())
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        files.push(ResultFile {
            path: entry.into_path(),
            groups,
        });
    }
    Ok((files, excluded))
}

/// Call `visit` once per result file. A failing visit is logged and counted;
/// the walk goes on.
pub fn walk_results(
    root: &Path,
    extension: &str,
    exclude: &str,
    progress: impl Fn(f64, &str),
    mut visit: impl FnMut(&ResultFile) -> Result<()>,
) -> Result<WalkSummary> {
    let (files, excluded) = scan_results(root, extension, exclude)?;
    let total = files.len();
    let mut summary = WalkSummary {
        excluded,
        ..WalkSummary::default()
    };
    for (i, file) in files.iter().enumerate() {
        summary.visited += 1;
        if let Err(e) = visit(file) {
            warn!(file = %file.path.display(), error = %e, "skipping result file");
            summary.failed += 1;
        }
        progress(
            (i + 1) as f64 / total as f64,
            &format!("Extracting results {}/{}", i + 1, total),
        );
    }
    Ok(summary)
}

/// Extract the results folder of `sap_folder` into `TENSORS`.
pub fn extract_results_folder(
    store: &Store,
    sap_folder: &Path,
    settings: &Settings,
    progress: impl Fn(f64, &str),
) -> Result<WalkSummary> {
    let results = find_results_folder(sap_folder, &settings.results_prefix)?;
    info!(folder = %results.display(), "extracting results");
    zarr::ensure_layout(store)?;
    let summary = walk_results(
        &results,
        &settings.result_extension,
        &settings.exclude_marker,
        progress,
        |file| {
            let mut parts = vec!["TENSORS"];
            parts.extend(file.groups.iter().map(String::as_str));
            let group = zarr::ensure_group_path(store, &parts)?;
            let done = extract::extract_file(
                store,
                &group,
                &file.path,
                &settings.quantities,
                settings.verbose,
            )?;
            info!(
                group = %group,
                written = done.written.len(),
                existing = done.existing.len(),
                missing = done.missing.len(),
                failed = done.failed.len(),
                "result file processed"
            );
            Ok(())
        },
    )?;
    info!(
        visited = summary.visited,
        excluded = summary.excluded,
        failed = summary.failed,
        "results folder done"
    );
    Ok(summary)
}
