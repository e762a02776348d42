mod config;
mod error;
mod extract;
mod frames;
mod harmonize;
mod landmarks;
mod mat;
mod records;
mod walk;
mod zarr;
mod zarrify;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "zarrify",
    about = "zarrify CLI: tissue-mechanics images, tensors and landmarks into a Zarr store"
)]
struct Cli {
    /// Debug logging
    #[arg(long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Warnings and errors only
    #[arg(long, global = true)]
    quiet: bool,
    /// Show a progress bar instead of JSON progress lines
    #[arg(long, global = true)]
    progress_bar: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Images, then tensors
    Zarrify(zarrify::ZarrifyArgs),
    /// Raw frames, outlines and masks into IMAGE
    Images(zarrify::ImagesArgs),
    /// Result files into TENSORS
    Tensors(zarrify::TensorsArgs),
    /// Landmark attributes on the store root
    #[command(subcommand)]
    Landmarks(LandmarkCommands),
    /// Print shape and value range of a dataset as JSON
    Inspect(InspectArgs),
}

#[derive(Args, Clone)]
struct InspectArgs {
    /// Store directory
    #[arg(long)]
    store: String,
    /// Dataset path, e.g. /TENSORS/UPIV
    #[arg(long)]
    path: String,
}

#[derive(Subcommand)]
enum LandmarkCommands {
    /// Create missing landmark sets with NaN points
    Init(LandmarkInitArgs),
    /// Write landmark sets as text files for space registration
    Export(LandmarkExportArgs),
}

#[derive(Args, Clone)]
struct LandmarkInitArgs {
    /// Store directory
    #[arg(long)]
    store: String,
}

#[derive(Args, Clone)]
struct LandmarkExportArgs {
    /// Store directory
    #[arg(long)]
    store: String,
    /// Project folder receiving SAP_<name>/spaceReg_<name>_999
    #[arg(long)]
    project: String,
    /// Specimen name (default: project folder name)
    #[arg(long)]
    name: Option<String>,
}

fn progress(prog: f64, msg: &str) {
    let _ = writeln!(
        io::stderr(),
        "{}",
        serde_json::json!({"progress": prog, "message": msg})
    );
    let _ = io::stderr().flush();
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_landmarks(command: LandmarkCommands) -> error::Result<()> {
    match command {
        LandmarkCommands::Init(args) => {
            let store = zarr::open_store(Path::new(&args.store))?;
            let created = landmarks::init_landmarks(&store)?;
            info!(?created, "landmarks initialised");
        }
        LandmarkCommands::Export(args) => {
            let store = zarr::open_store(Path::new(&args.store))?;
            let project = Path::new(&args.project);
            let name = match args.name {
                Some(name) => name,
                None => project
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        error::Error::MissingInput(format!("{} has no folder name", project.display()))
                    })?,
            };
            landmarks::export_landmarks(&store, project, &name)?;
        }
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> error::Result<()> {
    let store = zarr::open_store(Path::new(&args.store))?;
    let (dtype, shape, values): (&str, Vec<usize>, Vec<f64>) =
        match zarr::read_array_u8(&store, &args.path) {
            Ok(a) => ("uint8", a.shape().to_vec(), a.iter().map(|&v| f64::from(v)).collect()),
            Err(_) => {
                let a = zarr::read_array_f16(&store, &args.path)?;
                ("float16", a.shape().to_vec(), a.iter().map(|v| v.to_f64()).collect())
            }
        };
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let min = finite.clone().fold(f64::INFINITY, f64::min);
    let max = finite.fold(f64::NEG_INFINITY, f64::max);
    let attrs = zarr::open_array(&store, &args.path)?.attributes().clone();
    println!(
        "{}",
        serde_json::json!({
            "path": args.path,
            "dtype": dtype,
            "shape": shape,
            "min": min.is_finite().then_some(min),
            "max": max.is_finite().then_some(max),
            "attributes": attrs,
        })
    );
    Ok(())
}

fn dispatch(command: Commands, progress: impl Fn(f64, &str)) -> error::Result<()> {
    match command {
        Commands::Zarrify(args) => zarrify::run(args, progress),
        Commands::Images(args) => zarrify::run_images(args, progress),
        Commands::Tensors(args) => zarrify::run_tensors(args, progress),
        Commands::Landmarks(command) => run_landmarks(command),
        Commands::Inspect(args) => run_inspect(args),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if cli.progress_bar {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {percent:>3}% {msg}")?
                .progress_chars("#>-"),
        );
        let result = dispatch(cli.command, |prog, msg| {
            bar.set_position((prog.clamp(0.0, 1.0) * 1000.0) as u64);
            bar.set_message(msg.to_string());
        });
        bar.finish_and_clear();
        result?;
    } else {
        dispatch(cli.command, progress)?;
    }
    Ok(())
}
