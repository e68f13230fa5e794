//! Command-line arguments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML config file (SKETCHFORGE_* variables and flags override it)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a sketch, repairing errors until it builds
    Build {
        /// Path to the .ino file
        sketch: PathBuf,

        /// Board name or FQBN
        #[arg(long, short)]
        board: String,

        /// Upload after a successful build
        #[arg(long, default_value_t = false)]
        upload: bool,

        /// Serial port to upload to (skips auto-detection)
        #[arg(long)]
        port: Option<String>,

        /// Compile attempts per run (overrides SKETCHFORGE_MAX_ATTEMPTS)
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Extra library dependency, `Name` or `Name@version`; repeatable
        #[arg(long = "lib")]
        libraries: Vec<String>,

        /// Session log file (overrides [session] log_path)
        #[arg(long)]
        session_log: Option<PathBuf>,
    },

    /// List serial ports, optionally only those plausible for a board
    Ports {
        #[arg(long, short)]
        board: Option<String>,
    },

    /// List supported boards
    Boards,

    /// Print a persisted session log
    Replay {
        log: PathBuf,

        /// Only entries recorded at this source revision
        #[arg(long)]
        revision: Option<u32>,
    },
}
