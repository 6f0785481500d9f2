//! CLI definitions using clap.

use crate::model::RecordType;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// Passport Sync - clinical observation sync from OpenMRS to the patient portal
#[derive(Parser, Debug)]
#[command(name = "psync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Portal database path (default: ~/.passport-sync/data/passport.db)
    #[arg(long, global = true, env = "PSYNC_DB")]
    pub db: Option<PathBuf>,

    /// Settings file (default: ~/.passport-sync/config.json)
    #[arg(long, global = true, env = "PSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Actor name for the audit trail of manual changes
    #[arg(long, global = true, env = "PSYNC_ACTOR")]
    pub actor: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the portal database and a default settings file
    Init {
        /// Recreate an existing database
        #[arg(long)]
        force: bool,
    },

    /// Poll the source until interrupted (Ctrl-C)
    Run {
        /// Start from the beginning of the source history when no cursor exists
        #[arg(long)]
        full_history: bool,
    },

    /// Run one sync cycle now
    Sync {
        /// Start from the beginning of the source history when no cursor exists
        #[arg(long)]
        full_history: bool,
    },

    /// Show cursor, cumulative counters and store counts
    Status {
        /// Number of recent cycles to show
        #[arg(long, default_value_t = 5)]
        runs: u32,
    },

    /// Portal patient register
    Patient {
        #[command(subcommand)]
        command: PatientCommands,
    },

    /// Identity link inspection and repair
    Link {
        #[command(subcommand)]
        command: LinkCommands,
    },

    /// List a patient's synced records
    Records {
        /// Patient ID
        patient_id: String,

        /// Only records of this type (condition, medication, test, visit)
        #[arg(long = "type", short = 't')]
        record_type: Option<RecordType>,

        /// Maximum records to show
        #[arg(long, short = 'n', default_value_t = 50)]
        limit: u32,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

// ============================================================================
// Patient Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum PatientCommands {
    /// List patients
    List {
        /// Include inactive patients
        #[arg(long)]
        all: bool,

        /// Maximum patients to show
        #[arg(long, short = 'n', default_value_t = 100)]
        limit: u32,
    },

    /// Register a patient
    Add {
        /// Display name
        name: String,

        /// National ID or other stable identifier
        #[arg(long)]
        external_id: Option<String>,
    },

    /// Change a patient's display name
    Rename {
        /// Patient ID
        id: String,

        /// New display name
        name: String,
    },

    /// Exclude a patient from name matching
    Deactivate {
        /// Patient ID
        id: String,
    },

    /// Make an inactive patient matchable again
    Activate {
        /// Patient ID
        id: String,
    },
}

// ============================================================================
// Link Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Show one subject's link and history, or list links
    Show {
        /// Source subject ID
        subject: Option<String>,

        /// Only links to this patient
        #[arg(long)]
        patient: Option<String>,
    },

    /// Pin a subject to a patient, replacing any existing link
    Set {
        /// Source subject ID
        subject: String,

        /// Patient ID
        patient_id: String,
    },

    /// Remove a subject's link so the next sync resolves it again
    Remove {
        /// Source subject ID
        subject: String,
    },
}
