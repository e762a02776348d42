//! Project conversion: image stacks into `IMAGE`, analysis results into
//! `TENSORS`.
//!
//! A project folder `P` named `N` is laid out as
//!
//! ```text
//! P/*.tif                    raw frames
//! P/SEG_N/results_N/seg*.png segmentation outlines
//! P/SEG_N/roi_N/roi*.png     region masks
//! P/SAP_N/AOT*/...           averages-over-time result files
//! ```

use clap::Args;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::frames;
use crate::walk::{self, WalkSummary};
use crate::zarr::{self, Store};

#[derive(Args, Clone, Debug)]
pub struct ProjectArgs {
    /// Project folder; its name is the specimen name
    #[arg(long)]
    pub project: String,
    /// Store directory (default: the project folder)
    #[arg(long)]
    pub output: Option<String>,
    /// Settings file (TOML)
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ImageOptions {
    /// Directory receiving the numbered raw frames (default: the store root)
    #[arg(long)]
    pub frames_dir: Option<String>,
    /// Do not export raw frames as numbered TIFFs
    #[arg(long)]
    pub no_export: bool,
}

#[derive(Args, Clone, Debug)]
pub struct TensorOptions {
    /// Comma-separated quantities, replacing the configured list
    #[arg(long)]
    pub quantities: Option<String>,
    /// Do not warn about quantities missing from result files
    #[arg(long)]
    pub quiet_missing: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ImagesArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    #[command(flatten)]
    pub images: ImageOptions,
}

#[derive(Args, Clone, Debug)]
pub struct TensorsArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    #[command(flatten)]
    pub tensors: TensorOptions,
}

#[derive(Args, Clone, Debug)]
pub struct ZarrifyArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    #[command(flatten)]
    pub images: ImageOptions,
    #[command(flatten)]
    pub tensors: TensorOptions,
}

/// Folder conventions of one project.
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub name: String,
    pub store_dir: PathBuf,
}

impl Project {
    pub fn new(dir: &Path, output: Option<&Path>) -> Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::MissingInput(format!("{} has no folder name", dir.display())))?;
        if !dir.is_dir() {
            return Err(Error::MissingInput(format!(
                "project folder {} not found",
                dir.display()
            )));
        }
        Ok(Project {
            dir: dir.to_path_buf(),
            name,
            store_dir: output.unwrap_or(dir).to_path_buf(),
        })
    }

    fn from_args(args: &ProjectArgs) -> Result<Self> {
        Self::new(Path::new(&args.project), args.output.as_deref().map(Path::new))
    }

    pub fn seg_dir(&self) -> PathBuf {
        self.dir.join(format!("SEG_{}", self.name))
    }

    pub fn outlines_dir(&self) -> PathBuf {
        self.seg_dir().join(format!("results_{}", self.name))
    }

    pub fn masks_dir(&self) -> PathBuf {
        self.seg_dir().join(format!("roi_{}", self.name))
    }

    pub fn sap_dir(&self) -> PathBuf {
        self.dir.join(format!("SAP_{}", self.name))
    }

    /// Base name of exported frames: the store folder name.
    pub fn store_name(&self) -> String {
        self.store_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Datasets written by one image pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub written: Vec<String>,
    pub exported_frames: usize,
}

fn settings_for(project: &ProjectArgs) -> Result<Settings> {
    Settings::load_or_default(project.config.as_deref().map(Path::new))
}

fn apply_tensor_options(settings: Settings, options: &TensorOptions) -> Settings {
    let mut settings = settings.with_quantities(options.quantities.as_deref());
    if options.quiet_missing {
        settings.verbose = false;
    }
    settings
}

/// Map a sub-step's `[0, 1]` progress into `[lo, hi]` of the caller's.
fn scaled<'a>(progress: &'a impl Fn(f64, &str), lo: f64, hi: f64) -> impl Fn(f64, &str) + 'a {
    move |p, msg| progress(lo + p * (hi - lo), msg)
}

/// Load frames from `dir` into `IMAGE/<dataset>` unless it already exists.
/// Returns the loaded stack when a dataset was written.
fn store_frames(
    store: &Store,
    dataset: &str,
    dir: &Path,
    pattern: &str,
    progress: impl Fn(f64, &str),
) -> Result<Option<ndarray::Array3<u8>>> {
    let path = zarr::node_path(&["IMAGE", dataset]);
    if zarr::array_exists(store, &path) {
        info!(dataset = %path, "already present, skipping");
        return Ok(None);
    }
    if !dir.is_dir() {
        warn!(dataset = %path, dir = %dir.display(), "frame folder not found");
        return Ok(None);
    }
    let Some(stack) = frames::load_stack(dir, pattern, progress)?.stack else {
        warn!(dataset = %path, dir = %dir.display(), pattern, "no frames found");
        return Ok(None);
    };
    zarr::write_stack_u8(store, &path, &stack, None)?;
    info!(dataset = %path, shape = ?stack.shape(), "stack written");
    Ok(Some(stack))
}

/// Fill `IMAGE/raw`, `IMAGE/outlines` and `IMAGE/masks`. Newly written raw
/// frames are also exported as numbered TIFFs to `export_dir`.
pub fn store_images(
    store: &Store,
    project: &Project,
    settings: &Settings,
    export_dir: Option<&Path>,
    progress: impl Fn(f64, &str),
) -> Result<ImageSummary> {
    zarr::ensure_layout(store)?;
    let mut summary = ImageSummary::default();

    let raw_path = zarr::node_path(&["IMAGE", "raw"]);
    if zarr::array_exists(store, &raw_path) {
        info!(dataset = %raw_path, "already present, skipping");
    } else {
        let loaded = frames::load_stack(&project.dir, &settings.raw_pattern, scaled(&progress, 0.0, 0.4))?;
        let Some(raw) = loaded.stack else {
            warn!(dir = %project.dir.display(), pattern = %settings.raw_pattern, "no raw frames, skipping images");
            return Ok(summary);
        };
        zarr::write_stack_u8(store, &raw_path, &raw, None)?;
        info!(dataset = %raw_path, shape = ?raw.shape(), "stack written");
        summary.written.push(raw_path);
        if let Some(dir) = export_dir {
            let files = frames::save_stack(dir, &project.store_name(), &raw, scaled(&progress, 0.4, 0.6))?;
            summary.exported_frames = files.len();
        }
    }

    let others = [
        ("outlines", project.outlines_dir(), &settings.outlines_pattern, 0.6, 0.8),
        ("masks", project.masks_dir(), &settings.masks_pattern, 0.8, 1.0),
    ];
    for (dataset, dir, pattern, lo, hi) in others {
        if store_frames(store, dataset, &dir, pattern, scaled(&progress, lo, hi))?.is_some() {
            summary.written.push(zarr::node_path(&["IMAGE", dataset]));
        }
    }
    progress(1.0, "Images done");
    Ok(summary)
}

/// Extract the project's results folder into `TENSORS`.
pub fn store_tensors(
    store: &Store,
    project: &Project,
    settings: &Settings,
    progress: impl Fn(f64, &str),
) -> Result<WalkSummary> {
    walk::extract_results_folder(store, &project.sap_dir(), settings, progress)
}

fn export_dir_for(project: &Project, options: &ImageOptions) -> Option<PathBuf> {
    if options.no_export {
        return None;
    }
    Some(
        options
            .frames_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| project.store_dir.clone()),
    )
}

pub fn run_images(args: ImagesArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let project = Project::from_args(&args.project)?;
    let settings = settings_for(&args.project)?;
    let store = zarr::open_store(&project.store_dir)?;
    let export = export_dir_for(&project, &args.images);
    store_images(&store, &project, &settings, export.as_deref(), progress)?;
    Ok(())
}

pub fn run_tensors(args: TensorsArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let project = Project::from_args(&args.project)?;
    let settings = apply_tensor_options(settings_for(&args.project)?, &args.tensors);
    let store = zarr::open_store(&project.store_dir)?;
    store_tensors(&store, &project, &settings, progress)?;
    Ok(())
}

/// Images first, then tensors, into one store.
pub fn run(args: ZarrifyArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let project = Project::from_args(&args.project)?;
    let settings = apply_tensor_options(settings_for(&args.project)?, &args.tensors);
    let store = zarr::open_store(&project.store_dir)?;
    info!(project = %project.dir.display(), store = %project.store_dir.display(), "converting");

    let export = export_dir_for(&project, &args.images);
    store_images(&store, &project, &settings, export.as_deref(), scaled(&progress, 0.0, 0.5))?;
    let summary = store_tensors(&store, &project, &settings, scaled(&progress, 0.5, 1.0))?;
    progress(
        1.0,
        &format!(
            "Wrote {} ({} result files, {} failed)",
            project.store_dir.display(),
            summary.visited,
            summary.failed
        ),
    );
    Ok(())
}
