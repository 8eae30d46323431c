pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "postes", about = "Capture utility pole records offline and sync them later")]
#[clap(version, author)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[clap(long, global = true)]
    pub json: bool,

    /// Log debug output to stderr
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in and store the session tokens
    #[clap(name = "login")]
    Login {
        /// Username (prompted when omitted)
        username: Option<String>,
    },

    /// Forget the stored session tokens
    #[clap(name = "logout")]
    Logout,

    /// List the cities known to the server
    #[clap(name = "cities")]
    Cities,

    /// List the neighborhoods of a city
    #[clap(name = "bairros")]
    Bairros {
        /// City id as printed by `postes cities`
        city_id: i64,
    },

    /// Capture a new pole record
    #[clap(name = "add")]
    Add(AddArgs),

    /// List records waiting to be synced
    #[clap(name = "ls")]
    Pending,

    /// List records moved to the dead letter after repeated rejections
    #[clap(name = "failed")]
    Failed,

    /// Put a dead-lettered record back in the queue
    #[clap(name = "requeue")]
    Requeue {
        /// Local record id
        id: i64,
    },

    /// Show queue counts and session state
    #[clap(name = "status")]
    Status,

    /// Replay pending records now
    #[clap(name = "sync")]
    Sync,

    /// Commands against records already on the server
    #[clap(subcommand, name = "remote")]
    Remote(RemoteCommands),
}

#[derive(Args)]
pub struct AddArgs {
    /// City name
    #[clap(long)]
    pub city: String,

    /// Neighborhood name
    #[clap(long)]
    pub bairro: String,

    /// Latitude of the GPS fix (WGS84)
    #[clap(long, requires = "lon", allow_negative_numbers = true, conflicts_with_all = ["zone", "easting", "northing"])]
    pub lat: Option<f64>,

    /// Longitude of the GPS fix (WGS84)
    #[clap(long, requires = "lat", allow_negative_numbers = true)]
    pub lon: Option<f64>,

    /// UTM zone number, when entering projected coordinates directly
    #[clap(long, requires_all = ["easting", "northing"])]
    pub zone: Option<i64>,

    /// UTM easting in meters
    #[clap(long)]
    pub easting: Option<f64>,

    /// UTM northing in meters
    #[clap(long)]
    pub northing: Option<f64>,

    /// Free text observations
    #[clap(long)]
    pub notes: Option<String>,

    /// Photo to attach; resized and stored locally until delivered
    #[clap(long)]
    pub photo: Option<PathBuf>,

    /// Queue the record without checking whether the server answers
    #[clap(long)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum RemoteCommands {
    /// List records stored on the server
    #[clap(name = "ls")]
    List,

    /// Delete a record from the server
    #[clap(name = "rm")]
    Remove {
        /// Server-side record id
        id: i64,
    },
}
