use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use avshelf::config::Config;
use avshelf::faces::{FaceScorer, OnnxScorer};
use avshelf::logging::{self, LogTarget};
use avshelf::media::MediaDecoder;
use avshelf::pipeline::Pipeline;
use avshelf::tasks::Shutdown;

/// Command line overrides on top of the config file.
#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    media_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    workers: Option<usize>,
    once: bool,
    log_stderr: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("avshelf {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--once" | "-1" => parsed.once = true,
            "--log-stderr" => parsed.log_stderr = true,
            "--config" | "-c" | "--port" | "--path" | "--db" | "--conc" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: {} requires an argument", flag);
                    std::process::exit(1);
                };
                i += 1;
                match flag {
                    "--port" => parsed.port = Some(parse_number(flag, value)),
                    "--conc" => parsed.workers = Some(parse_number(flag, value)),
                    "--path" => parsed.media_path = Some(PathBuf::from(value)),
                    "--db" => parsed.db_path = Some(PathBuf::from(value)),
                    _ => parsed.config_path = Some(PathBuf::from(value)),
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", flag);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    match value.parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: {} expects a number, got {:?}", flag, value);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"avshelf - index and enrich an audiovisual library

USAGE:
    avshelf [OPTIONS]

OPTIONS:
    --path PATH         Media root to index (default: .)
    --db PATH           Catalogue database, relative to the media root (default: info.db)
    --conc N            Number of probe workers (default: 2)
    --port N            Port of the browse front-end sharing the catalogue (default: 8080)
    --config, -c PATH   Path to config file
    --once, -1          Run one ingest pass and one enrichment round, then exit
    --log-stderr        Log to stderr instead of journald or the log file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    AVSHELF_CONFIG      Path to config file (overrides default location)
    AVSHELF_LOG         Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/avshelf/config.toml"#
    );
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(path) = &args.media_path {
        config.media_path = path.clone();
    }
    if let Some(db) = &args.db_path {
        config.db_path = db.clone();
    }
    if let Some(workers) = args.workers {
        config.dispatch.workers = workers;
    }
    Ok(config)
}

#[cfg(feature = "ffmpeg")]
fn build_decoder() -> Result<Arc<dyn MediaDecoder>> {
    let decoder = avshelf::media::FfmpegDecoder::new().context("Failed to initialise FFmpeg")?;
    Ok(Arc::new(decoder))
}

#[cfg(not(feature = "ffmpeg"))]
fn build_decoder() -> Result<Arc<dyn MediaDecoder>> {
    anyhow::bail!("avshelf was built without the ffmpeg feature")
}

fn build_scorer(config: &Config) -> Option<Arc<dyn FaceScorer>> {
    if !config.scorer.enabled {
        tracing::info!("Face scoring disabled in config");
        return None;
    }
    match OnnxScorer::new(&config.scorer) {
        Ok(scorer) => Some(Arc::new(scorer)),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "Face scorer unavailable, continuing without it");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let target = if args.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::System {
            log_dir: Some(Config::config_dir().join("logs")),
        }
    };
    let _ = logging::init(target);

    let config = load_config(&args)?;
    tracing::info!(
        media = %config.media_path.display(),
        db = %config.resolved_db_path().display(),
        workers = config.dispatch.workers,
        port = config.port,
        "avshelf starting"
    );

    let decoder = build_decoder()?;
    let scorer = build_scorer(&config);
    let shutdown = Shutdown::new();
    let pipeline = Arc::new(Pipeline::new(config, decoder, scorer, shutdown.clone())?);

    let once = args.once;
    let mut worker = {
        let pipeline = Arc::clone(&pipeline);
        tokio::task::spawn_blocking(move || pipeline.run(once))
    };

    let finished = tokio::select! {
        joined = &mut worker => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            tracing::info!("Interrupt received, shutting down");
            shutdown.trigger();
            worker.await
        }
    };
    let result = joined.context("Pipeline task failed")?;

    match &result {
        Ok(()) => tracing::info!("avshelf stopped"),
        Err(e) => tracing::error!(error = %format!("{:#}", e), "avshelf stopped with an error"),
    }
    result
}
