//! satctl — send commands to satproc services and print their responses.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "satctl")]
#[command(about = "satctl — command-line client for satproc services")]
#[command(version = satproc_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a command to a service and print the response
    Send {
        /// Command name (see `satctl list`)
        #[arg(short = 'c', long, conflicts_with = "number")]
        command: Option<String>,

        /// Command number instead of a name
        #[arg(short = 'n', long)]
        number: Option<u32>,

        /// Destination service name or UDP port
        #[arg(short = 'p', long = "proc")]
        proc: String,

        /// DNS name or IP address of the machine to receive the command
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Output format for response data
        #[arg(short = 'f', long, default_value = "human", value_parser = ["human", "kvp", "csv"])]
        format: String,

        /// How long to wait for the response, in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Command parameters as key=value pairs
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// List the known commands
    List,

    /// Show the parameters a command accepts
    Describe {
        /// Command name
        name: String,
    },

    /// List the registered result codes
    Errors,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Send {
            command,
            number,
            proc,
            host,
            format,
            timeout_ms,
            params,
        } => commands::send(commands::SendArgs {
            command,
            number,
            proc,
            host,
            format,
            timeout_ms,
            params,
        }),
        Commands::List => commands::list(),
        Commands::Describe { name } => commands::describe(&name),
        Commands::Errors => commands::errors(),
    };

    std::process::exit(code);
}
