use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use toolfleet::mcp_client::config;
use toolfleet::{BlockingMcpClient, ClientOptions};

/// Sample tool names printed per server by `check`.
const CHECK_SAMPLE: usize = 5;

/// toolfleet - call tools on stdio MCP servers declared in a YAML registry
#[derive(Parser, Debug)]
#[command(name = "toolfleet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Call tools on stdio MCP servers declared in a YAML registry", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Server registry path (defaults to $TOOLFLEET_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for mcp.log (defaults to the user data dir)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Call one tool and print the result as JSON
    Call {
        /// Server name from the registry
        #[arg(long)]
        server: String,

        /// Tool name
        #[arg(long)]
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Seconds to wait for the response
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Print the tools a server advertises
    Tools {
        /// Server name from the registry
        #[arg(long)]
        server: String,
    },

    /// Start every configured server and report what it offers
    Check,

    /// List configured server names
    Servers,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = cli.log_dir.clone().unwrap_or_else(toolfleet::default_log_dir);
    if let Err(e) = toolfleet::init_tracing(&log_dir) {
        eprintln!("warning: logging disabled ({}): {e}", log_dir.display());
    }

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Run the selected command and return the process exit status.
fn run(cli: Cli) -> Result<u8> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    // Arguments are validated before any server is touched.
    let params = match &cli.command {
        Commands::Call { params, .. } => match serde_json::from_str::<Value>(params) {
            Ok(value) => Some(value),
            Err(e) => {
                eprintln!("error: --params is not valid JSON: {e}");
                return Ok(2);
            }
        },
        _ => None,
    };

    let client = BlockingMcpClient::from_config_file(&config_path, ClientOptions::default())
        .with_context(|| format!("loading server registry {}", config_path.display()))?;

    match cli.command {
        Commands::Call {
            server,
            tool,
            timeout,
            ..
        } => {
            let result = client.call(
                &server,
                &tool,
                params.unwrap_or_else(|| json!({})),
                Duration::from_secs(timeout),
            )?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.ok { 0 } else { 1 })
        }
        Commands::Tools { server } => {
            let tools = client
                .list_tools(&server)
                .with_context(|| format!("listing tools of '{server}'"))?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
            Ok(0)
        }
        Commands::Check => Ok(check(&client)),
        Commands::Servers => {
            for name in client.configured_servers() {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

/// Start each server in turn and print its tool count with a few sample names.
fn check(client: &BlockingMcpClient) -> u8 {
    let mut failed = false;
    for name in client.configured_servers() {
        match client.list_tools(&name) {
            Ok(tools) => {
                let sample: Vec<&str> = tools
                    .iter()
                    .take(CHECK_SAMPLE)
                    .map(|t| t.name.as_str())
                    .collect();
                println!("{name}: {} tools [{}]", tools.len(), sample.join(", "));
            }
            Err(e) => {
                failed = true;
                println!("{name}: error: {e}");
            }
        }
    }
    u8::from(failed)
}
