use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "meshforge")]
#[command(author, version, about = "3D model validation, repair and slicing service")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and job workers
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of pipeline workers (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Process a single model file locally and print the job status as JSON
    Run {
        /// Model file to process
        #[arg(required = true)]
        input: PathBuf,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file and pipeline layout
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
