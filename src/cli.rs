use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Local semantic image search", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build or update the index of a directory
    Index {
        /// Directory to index (defaults to root_dir from config)
        #[clap(short, long)]
        root: Option<PathBuf>,

        /// Discard the existing index and build it again from scratch
        #[clap(long, default_value = "false")]
        rebuild: bool,
    },

    /// Find images matching a text description
    Search {
        /// What to look for, e.g. "a dog on a beach"
        query: String,

        /// Number of results (defaults to index.top_k from config)
        #[clap(short, long)]
        k: Option<usize>,

        /// Minimum similarity in [-1.0, 1.0]
        #[clap(short, long, allow_hyphen_values = true)]
        threshold: Option<f32>,

        #[clap(short, long)]
        root: Option<PathBuf>,
    },

    /// Index a directory, keep it updated, and answer queries read from stdin
    Watch {
        #[clap(short, long)]
        root: Option<PathBuf>,
    },

    /// Show what is indexed for a directory
    Status {
        #[clap(short, long)]
        root: Option<PathBuf>,
    },

    /// Print the index directory used for a root
    Locate {
        root: PathBuf,
    },
}
