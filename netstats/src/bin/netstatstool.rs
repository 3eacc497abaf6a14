use std::{
    io::{self, Write},
    path::PathBuf,
};

use clap::Parser;
use netstats::config::{self, Config};
use netstats_core::{
    dump::IndentingWriter,
    platform::{SystemClock, TrustedTime},
    recorder::{self, load_segments},
    rotator::{self, FileRotator},
    service::{PREFIX_DEV, PREFIX_UID, PREFIX_UID_TAG, PREFIX_XT},
    settings::{DimensionConfig, Settings},
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// directory holding the recorder segments
    #[clap(long)]
    dir: PathBuf,

    /// recorder to inspect: dev, xt, uid or uid_tag
    #[clap(long, default_value = PREFIX_XT)]
    prefix: String,

    /// print the compact checkin form
    #[clap(long)]
    checkin: bool,

    /// load every segment instead of only the last `hours`
    #[clap(long)]
    full: bool,

    /// window to load and report on, ending now
    #[clap(long, default_value_t = 24)]
    hours: u32,

    /// daemon configuration to take bucket durations from
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Segment directory {0:?} does not exist")]
    MissingDir(PathBuf),
    #[error("Unknown recorder prefix {0:?}")]
    UnknownPrefix(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Rotator(#[from] rotator::Error),
    #[error(transparent)]
    Recorder(#[from] recorder::Error),
}

fn dimension(settings: &Settings, prefix: &str) -> Result<DimensionConfig, Error> {
    match prefix {
        PREFIX_DEV => Ok(settings.dev),
        PREFIX_XT => Ok(settings.xt),
        PREFIX_UID => Ok(settings.uid),
        PREFIX_UID_TAG => Ok(settings.uid_tag),
        other => Err(Error::UnknownPrefix(other.to_string())),
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    if !args.dir.is_dir() {
        error!("Segment directory {} does not exist", args.dir.display());
        return Err(Error::MissingDir(args.dir));
    }
    let settings = match &args.config {
        Some(path) => Config::from_path(path)?.settings,
        None => Settings::default(),
    };
    let dimension = dimension(&settings, &args.prefix)?;

    let now = SystemClock::new().current_time_millis();
    let window = i64::from(args.hours) * HOUR_MS;
    let range = if args.full {
        i64::MIN..i64::MAX
    } else {
        now.saturating_sub(window)..now
    };

    let rotator = FileRotator::new(
        &args.dir,
        &args.prefix,
        dimension.rotate_age_ms(),
        dimension.delete_age_ms(),
    )?;
    let collection = load_segments(&rotator, dimension.bucket_duration_ms(), range.clone())?;
    info!(
        prefix = args.prefix,
        entries = collection.len(),
        bytes = collection.total_bytes(),
        "loaded segments"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.checkin {
        collection.dump_checkin(&mut out, range)?;
    } else {
        let mut out = IndentingWriter::new(&mut out);
        collection.dump(&mut out)?;
    }
    out.flush()?;
    Ok(())
}
