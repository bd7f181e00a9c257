//! FIDO Assert CLI - drive get-assertion races against simulated authenticators.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use fido_assert_core::ProtocolVersion;
use tracing_subscriber::EnvFilter;

mod commands;
mod device_spec;
mod exit_codes;
mod utils;

use exit_codes::ExitCode;

#[derive(Parser)]
#[command(name = "fido-assert")]
#[command(author, version, about = "FIDO get-assertion race driver", long_about = None)]
#[command(after_help = "Exit codes:
  0    Assertion obtained
  64   Usage error
  65   No eligible device (no authenticator holds an allowed credential)
  69   All devices failed
  75   Race deadline exceeded
  130  Cancelled
  1    Other error")]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress human-readable output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// When to colorize output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorChoice,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UvArg {
    Required,
    Preferred,
    Discouraged,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProtocolArg {
    Modern,
    Legacy,
}

impl From<ProtocolArg> for ProtocolVersion {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Modern => ProtocolVersion::Modern,
            ProtocolArg::Legacy => ProtocolVersion::Legacy,
        }
    }
}

/// Request parameters shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct RequestArgs {
    /// Relying party id
    #[arg(long, default_value = "example.com")]
    pub rp_id: String,

    /// Client data hash (64 hex characters); zeroes if omitted
    #[arg(long, value_name = "HEX")]
    pub client_data_hash: Option<String>,

    /// Allowed credential id (hex), repeatable; none means resident credentials
    #[arg(long = "credential", value_name = "HEX")]
    pub credentials: Vec<String>,

    /// User verification requirement
    #[arg(long, value_enum, default_value = "preferred")]
    pub uv: UvArg,
}

#[derive(Subcommand)]
enum Commands {
    /// Race simulated devices for one assertion
    Race {
        #[command(flatten)]
        request: RequestArgs,

        /// Simulated device: NAME=KIND[:OUTCOME[@MS]]...
        /// (KIND: modern, legacy, unreachable; OUTCOME: success, timeout,
        /// unsupported, invalid, mismatch, transport, empty, io)
        #[arg(long = "device", value_name = "SPEC")]
        devices: Vec<String>,

        /// Aggregate race deadline in seconds (overrides FIDO_RACE_DEADLINE_SECS)
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Transport error retries per device (overrides FIDO_TRANSPORT_RETRIES)
        #[arg(long)]
        retries: Option<u32>,

        /// Cancel the race after this many milliseconds
        #[arg(long, value_name = "MS")]
        cancel_after_ms: Option<u64>,

        /// Print the assertion as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the wire frames a request encodes to
    Encode {
        #[command(flatten)]
        request: RequestArgs,

        /// Wire protocol
        #[arg(long, value_enum, default_value = "modern")]
        protocol: ProtocolArg,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(colored::control::SHOULD_COLORIZE.should_colorize())
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                exit_codes::USAGE_ERROR
            } else {
                exit_codes::SUCCESS
            };
            let _ = e.print();
            return std::process::ExitCode::from(code as u8);
        }
    };

    match cli.color {
        ColorChoice::Always => colored::control::set_override(true),
        ColorChoice::Never => colored::control::set_override(false),
        ColorChoice::Auto => {}
    }
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Race {
            request,
            devices,
            deadline_secs,
            retries,
            cancel_after_ms,
            json,
        } => {
            commands::race::execute(commands::race::RaceArgs {
                request,
                devices,
                deadline_secs,
                retries,
                cancel_after_ms,
                json,
                quiet: cli.quiet,
            })
            .await
        }
        Commands::Encode { request, protocol } => {
            commands::encode::execute(request, protocol, cli.quiet)
        }
    };

    let exit = match result {
        Ok(()) => ExitCode::success(),
        Err(e) => ExitCode::from_anyhow(&e),
    };
    if let Some(message) = &exit.message {
        eprintln!("{} {}", "Error:".red().bold(), message);
    }
    std::process::ExitCode::from(exit.code as u8)
}
