use std::path::PathBuf;

use clap::Parser;
use snafu::{Report, ResultExt, Snafu, Whatever};
use tracing::{error, info, Level};

use atlas_segmentation::errors::{SegmentationError, VolumeIoError};
use atlas_segmentation::io::{load_atlas_library, read_volume, write_segmentation};
use atlas_segmentation::registration::RegistrationMethod;
use atlas_segmentation::settings::SettingsError;
use atlas_segmentation::{CardiacSegmenter, Settings};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid settings: {}", source))]
    Settings {
        #[snafu(source(from(SettingsError, Box::new)))]
        source: Box<SettingsError>,
    },

    #[snafu(display("Error reading {}: {}", path.display(), source))]
    ReadInput {
        path: PathBuf,
        #[snafu(source(from(VolumeIoError, Box::new)))]
        source: Box<VolumeIoError>,
    },

    #[snafu(display("Error loading atlases: {}", source))]
    LoadAtlases {
        #[snafu(source(from(VolumeIoError, Box::new)))]
        source: Box<VolumeIoError>,
    },

    #[snafu(display("Segmentation failed: {}", source))]
    Segmentation {
        #[snafu(source(from(SegmentationError, Box::new)))]
        source: Box<SegmentationError>,
    },

    #[snafu(display("Error writing results to {}: {}", path.display(), source))]
    WriteOutput {
        path: PathBuf,
        #[snafu(source(from(VolumeIoError, Box::new)))]
        source: Box<VolumeIoError>,
    },
}

#[derive(Parser, Debug)]
#[command(author = "Scott Chase Waggener", version = env!("CARGO_PKG_VERSION"), about = "Segment cardiac structures in a CT volume by multi-atlas registration and label fusion", long_about = None)]
struct Args {
    #[arg(help = "Target CT volume (NIfTI)")]
    image: PathBuf,

    #[arg(help = "Output directory for the structure volumes")]
    output: PathBuf,

    #[arg(
        help = "JSON settings file. Defaults to the cardiac settings",
        long = "settings",
        short = 's'
    )]
    settings: Option<PathBuf>,

    #[arg(
        help = "Directory containing the atlases, overriding the settings",
        long = "atlas-path",
        short = 'a'
    )]
    atlas_path: Option<PathBuf>,

    #[arg(
        help = "Initial registration method, overriding the settings",
        long = "initial-reg",
        short = 'r',
        value_parser = clap::value_parser!(RegistrationMethod),
    )]
    initial_reg: Option<RegistrationMethod>,

    #[arg(
        help = "Number of worker threads, overriding the settings",
        long = "threads",
        short = 't'
    )]
    threads: Option<usize>,

    #[arg(
        help = "Also write the fused probability of every structure",
        long = "probabilities",
        short = 'p',
        default_value_t = false
    )]
    probabilities: bool,

    #[arg(
        help = "Enable verbose logging",
        long = "verbose",
        short = 'v',
        default_value_t = false,
        conflicts_with = "debug"
    )]
    verbose: bool,

    #[arg(help = "Enable debug logging", long = "debug", default_value_t = false)]
    debug: bool,
}

fn main() {
    let args = Args::parse();
    let level = if args.debug {
        Level::DEBUG
    } else if args.verbose {
        Level::INFO
    } else {
        Level::ERROR
    };

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    run(args).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-1);
    });
}

/// Settings from the file (or the defaults) with the command line overrides applied
fn load_settings(args: &Args) -> Result<Settings, Error> {
    let mut settings = match &args.settings {
        Some(path) => Settings::from_json_file(path).context(SettingsSnafu)?,
        None => Settings::default(),
    };
    if let Some(atlas_path) = &args.atlas_path {
        settings.atlas.atlas_path = atlas_path.clone();
    }
    if let Some(method) = args.initial_reg {
        settings.initial_reg.initial_reg = method;
    }
    if let Some(threads) = args.threads {
        settings.deformable.ncores = threads;
    }
    Ok(settings)
}

fn run(args: Args) -> Result<(), Error> {
    let settings = load_settings(&args)?;
    let segmenter = CardiacSegmenter::new(settings).context(SegmentationSnafu)?;

    info!("Reading target {}", args.image.display());
    let target = read_volume(&args.image).context(ReadInputSnafu { path: &args.image })?;
    let library =
        load_atlas_library(&segmenter.settings().atlas, args.verbose || args.debug)
            .context(LoadAtlasesSnafu)?;

    let segmentation = segmenter
        .segment(&target, library)
        .context(SegmentationSnafu)?;
    for dropped in &segmentation.dropped {
        info!("Dropped atlas {}", dropped);
    }

    let written = write_segmentation(&args.output, &segmentation, args.probabilities)
        .context(WriteOutputSnafu { path: &args.output })?;
    info!("Wrote {} files to {}", written.len(), args.output.display());
    Ok(())
}
