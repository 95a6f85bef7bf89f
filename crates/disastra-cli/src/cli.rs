//! Command-line interface definitions and parsing

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Directory holding the durable outbox
    #[arg(short, long, global = true)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a message in the outbox for delivery on the next run
    Submit {
        #[command(subcommand)]
        message: SubmitMessage,
    },
    /// List outbox entries and their delivery state
    Outbox {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a loopback mesh and drain the outbox through it
    Simulate {
        /// Number of nodes, including this one
        #[arg(short, long)]
        nodes: Option<usize>,
        /// How long to run, in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Send attempts to fail with NotReady before the radio cooperates
        #[arg(long)]
        not_ready: Option<usize>,
    },
}

#[derive(Subcommand)]
pub enum SubmitMessage {
    /// Raise an SOS
    Sos(SosArgs),
    /// Add details to an earlier SOS
    Update {
        /// Id of the SOS this update belongs to
        #[arg(long)]
        sos: String,
        #[arg(long, default_value = "")]
        people: String,
        #[arg(long, default_value = "")]
        supplies: String,
        #[arg(long, default_value = "")]
        info: String,
    },
    /// Mark the sender of an earlier SOS as safe
    Safe {
        #[arg(long)]
        sos: String,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Acknowledge a message as a responder
    Ack {
        /// Id of the acknowledged message
        #[arg(long)]
        target: String,
        #[arg(long)]
        responder: String,
        #[arg(long, default_value = "")]
        note: String,
    },
}

#[derive(Args)]
pub struct SosArgs {
    /// trapped, medical, fire, unsafe or free text
    #[arg(short = 't', long = "type", default_value = "trapped")]
    pub emergency_type: String,
    #[arg(long, requires = "longitude", allow_negative_numbers = true)]
    pub latitude: Option<f64>,
    #[arg(long, requires = "latitude", allow_negative_numbers = true)]
    pub longitude: Option<f64>,
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub altitude: f64,
    /// Remaining battery, in percent
    #[arg(long)]
    pub battery: Option<u8>,
    #[arg(long, default_value = "")]
    pub note: String,
}
