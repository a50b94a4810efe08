use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relief")]
#[command(about = "Inspect and maintain the local worksite sync state")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to sync settings JSON
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List worksites waiting to upload
    Pending {
        /// Number of worksites to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the change log of a worksite
    Changes {
        /// Local worksite id
        worksite_id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List changes that exceeded the retry limit
    Stalled {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Make a stalled change eligible for upload again
    Retry {
        /// Change id
        change_id: i64,
    },
    /// List cached worksites of an incident
    Worksites {
        /// Incident id
        incident_id: i64,
        /// Number of worksites to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Number of worksites to skip
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show incident pull cursors
    Params {
        /// Only this incident
        incident_id: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show incident pull statistics
    Stats {
        /// Only this incident
        incident_id: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop an incident's cached worksites, cursors and stats
    Reset {
        /// Incident id
        incident_id: i64,
    },
    /// Print the effective sync settings
    Settings,
}
