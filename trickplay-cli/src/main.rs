//! trickplay: drive and inspect the trickplay sample cache.
//!
//! `simulate` pushes a synthetic program through a live or recording
//! buffer; `inspect` prints what a recording directory holds.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use trickplay_cache::storage::{files, index_path};
use trickplay_cache::{
    recording_duration_us, BufferMode, RecordingStorageManager, SegmentKey, StorageManager,
};

mod config;
mod logging;
mod simulate;

use config::{load_config, resolve_config_path, ConfigFile};
use simulate::SimulateOptions;

/// trickplay - disk-backed sample cache driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a synthetic audio/video program through a sample buffer
    Simulate {
        /// Buffer mode
        #[arg(short, long, value_enum, default_value = "live")]
        mode: Mode,

        /// Cache directory (overrides [storage] dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Program length in seconds
        #[arg(short = 't', long, default_value = "60")]
        duration: u64,

        /// Video bitrate in kbit/s
        #[arg(long, default_value = "8000")]
        video_kbps: u64,

        /// Pace writes to the sample timestamps
        #[arg(long)]
        realtime: bool,

        /// Read only after writing ends, from the oldest cached position
        #[arg(long)]
        replay: bool,

        /// Segment length in microseconds (overrides [cache])
        #[arg(long)]
        chunk_us: Option<i64>,

        /// Trickplay cache cap in bytes (overrides [storage])
        #[arg(long)]
        max_cache_bytes: Option<u64>,
    },

    /// Print the tracks, duration and segment index of a recording
    Inspect {
        /// Recording directory
        dir: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Live,
    Record,
}

impl From<Mode> for BufferMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Live => BufferMode::Live,
            Mode::Record => BufferMode::Record,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.clone());
    let mut file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file.
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    match args.command {
        Command::Simulate {
            mode,
            dir,
            duration,
            video_kbps,
            realtime,
            replay,
            chunk_us,
            max_cache_bytes,
        } => {
            if let Some(chunk_us) = chunk_us {
                file_config.cache.chunk_duration_us = chunk_us;
            }
            if max_cache_bytes.is_some() {
                file_config.storage.max_cache_bytes = max_cache_bytes;
            }
            if file_config.cache.chunk_duration_us <= 0 {
                return Err("chunk duration must be positive".into());
            }
            let dir = dir
                .or_else(|| file_config.storage.dir.as_ref().map(PathBuf::from))
                .ok_or("no cache directory: pass --dir or set [storage] dir")?;

            let options = SimulateOptions {
                mode: mode.into(),
                dir,
                duration_secs: duration,
                video_kbps,
                realtime,
                replay_from_start: replay,
            };
            let cache_config = file_config.cache.clone();
            let summary = match simulate::run(options, cache_config, &file_config.storage) {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Simulation failed: {}", e);
                    return Err(e);
                }
            };

            info!("Simulation finished in {:?}", summary.elapsed);
            println!("written:   video {} / audio {}", summary.written[0], summary.written[1]);
            println!("read:      video {} / audio {}", summary.read[0], summary.read[1]);
            println!("segments:  {}", summary.segments);
            println!("cached:    {} bytes", summary.cache_bytes);
            println!("evictions: {}", summary.evictions);
            if summary.disk_too_slow {
                println!("disk too slow: trickplay disabled");
            }
            if let Some(duration_us) = summary.recorded_duration_us {
                println!("recorded:  {:.3}s", duration_us as f64 / 1_000_000.0);
            }
        }
        Command::Inspect { dir } => inspect(&dir)?,
    }

    Ok(())
}

fn inspect(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let storage = RecordingStorageManager::new(dir);
    let mut found = false;

    for is_audio in [false, true] {
        let track = match storage.read_track_info(is_audio)? {
            Some(track) => track,
            None => continue,
        };
        found = true;
        let format = &track.format;
        println!("track {} ({})", track.track_id, format.mime_type);
        if let (Some(w), Some(h)) = (format.width, format.height) {
            println!("  size:        {}x{}", w, h);
        }
        if let (Some(c), Some(r)) = (format.channel_count, format.sample_rate) {
            println!("  audio:       {} ch @ {} Hz", c, r);
        }
        println!("  codec data:  {} blobs", format.codec_config.len());
        if let Some(duration_us) = format.duration_us {
            println!("  duration:    {:.3}s", duration_us as f64 / 1_000_000.0);
        }

        let starts = match files::read_index_file(&index_path(dir, &track.track_id)) {
            Ok(starts) => starts,
            Err(e) => {
                println!("  index:       unreadable ({})", e);
                continue;
            }
        };
        let bytes: u64 = starts
            .iter()
            .filter_map(|start| {
                let key = SegmentKey::new(track.track_id.as_str(), *start);
                std::fs::metadata(dir.join(key.file_name())).ok()
            })
            .map(|m| m.len())
            .sum();
        match (starts.first(), starts.last()) {
            (Some(first), Some(last)) => println!(
                "  segments:    {} ({}us .. {}us, {} bytes)",
                starts.len(),
                first,
                last,
                bytes
            ),
            _ => println!("  segments:    none"),
        }
    }

    if !found {
        return Err(format!("no recording metadata in {}", dir.display()).into());
    }
    if let Some(duration_us) = recording_duration_us(&storage)? {
        println!("recording duration: {:.3}s", duration_us as f64 / 1_000_000.0);
    }
    Ok(())
}
