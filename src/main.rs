//! plughost CLI - scan, inspect and render VST3 plugins

mod commands;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plughost_engine::HostConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "plughost", version)]
#[command(about = "Command-line VST3 plugin host", long_about = None)]
struct Cli {
    /// Host configuration file (TOML); defaults to $PLUGHOST_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log lifecycle details
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Processing sample rate in Hz
    #[arg(long, global = true)]
    sample_rate: Option<f64>,

    /// Maximum frames per process call
    #[arg(long, global = true)]
    block_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List plugins in the given directories, or the standard locations
    Scan {
        dirs: Vec<PathBuf>,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a plugin and print its buses, parameters and editor support
    Probe { bundle: PathBuf },

    /// Process silence (plus an optional note) and report the peak level
    Render {
        bundle: PathBuf,

        /// Total frames to render
        #[arg(short, long, default_value = "48000")]
        frames: usize,

        /// Write the stereo output to this WAV file
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Send a note-on at the start and a note-off halfway through
        #[arg(short, long)]
        note: Option<u8>,
    },

    /// Save or restore plugin state blobs
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Write the plugin's current state to FILE
    Save { bundle: PathBuf, file: PathBuf },
    /// Restore FILE into a freshly loaded plugin
    Load { bundle: PathBuf, file: PathBuf },
}

fn load_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = HostConfig::load(path).map_err(anyhow::Error::msg)?;
            config
                .apply_overrides(|key| std::env::var(key).ok())
                .map_err(anyhow::Error::msg)?;
            config
        }
        None => HostConfig::from_env().map_err(anyhow::Error::msg)?,
    };
    if let Some(rate) = cli.sample_rate {
        config.sample_rate = rate;
    }
    if let Some(frames) = cli.block_size {
        config.max_block_size = frames;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = load_config(&cli).context("Invalid host configuration")?;
    let host = plughost_engine::Vst3Host::new(config);

    match cli.command {
        Commands::Scan { dirs, json } => commands::scan(&host, &dirs, json),
        Commands::Probe { bundle } => commands::probe(&host, &bundle),
        Commands::Render {
            bundle,
            frames,
            out,
            note,
        } => commands::render(&host, &bundle, frames, out.as_deref(), note),
        Commands::State { action } => match action {
            StateAction::Save { bundle, file } => commands::save_state(&host, &bundle, &file),
            StateAction::Load { bundle, file } => commands::load_state(&host, &bundle, &file),
        },
    }
}
