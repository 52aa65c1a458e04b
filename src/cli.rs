use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command used when none is given and the prompt is left empty.
pub const DEFAULT_COMMAND: &str = "uptime && df -h";

/// Map a guest exit code onto a process exit status. Codes the OS would
/// truncate or reinterpret become 1.
pub fn process_exit_code(guest_code: i32) -> i32 {
    if (0..=255).contains(&guest_code) {
        guest_code
    } else {
        1
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "vguest",
    about = "Run commands and read files inside vSphere guests via VMware Tools"
)]
pub struct Cli {
    /// Path to the .env file with connection settings
    #[arg(long, default_value = ".env")]
    pub env_file: PathBuf,

    /// Skip TLS certificate verification (self-signed lab hosts)
    #[arg(long)]
    pub insecure: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the result as a single JSON object
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a shell command in the guest and print its output
    Exec {
        /// VM name (prompted for when omitted)
        #[arg(long)]
        vm: Option<String>,

        /// Seconds to wait for the command to finish
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        /// Command to run; joined with spaces
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print a text file from the guest
    Cat {
        /// VM name
        #[arg(long)]
        vm: String,

        /// Keep at most this many lines
        #[arg(long, default_value_t = crate::reader::DEFAULT_MAX_LINES)]
        max_lines: usize,

        /// Absolute path inside the guest
        path: String,
    },
}
