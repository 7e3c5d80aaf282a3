//! sessionctl: operator CLI for sessiond.
//!
//! Every subcommand is one request to the daemon socket. Response data is
//! printed as pretty JSON on stdout; daemon errors go to stderr and exit 1.
//!
//! ## Subcommands
//!
//! - `restore`: run the auto-restore hook for an identity
//! - `save` / `end`: create, refresh or remove a stored session
//! - `health`, `stats`, `collections`, `ping`: store diagnostics

mod client;
mod logging;

use clap::{Parser, Subcommand};
use fs_err as fs;
use serde_json::{json, Value};
use sessiond_protocol::Method;
use std::io::Read;

#[derive(Parser)]
#[command(name = "sessionctl")]
#[command(about = "Inspect and manage sessiond sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an identity the way the request pipeline does
    Restore {
        /// Identity key; omit to resolve an anonymous request
        #[arg(value_name = "IDENTITY")]
        identity: Option<String>,
    },

    /// Store or refresh the session for an identity
    Save {
        #[arg(value_name = "IDENTITY")]
        identity: String,

        /// Session payload; `-` reads stdin, `@path` reads a file
        #[arg(long)]
        payload: String,
    },

    /// End the stored session for an identity
    End {
        #[arg(value_name = "IDENTITY")]
        identity: String,
    },

    /// Daemon and store health
    Health,

    /// Store size and counts
    Stats,

    /// Collections in the session store
    Collections,

    /// Round-trip the daemon and the store
    Ping,
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    let result = request_for(cli.command)
        .and_then(|(method, params)| client::call(method, params));

    match result {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                tracing::error!(error = %err, "Failed to render response");
                std::process::exit(1);
            }
        },
        Err(err) => {
            tracing::error!(error = %err, "sessionctl request failed");
            eprintln!("sessionctl: {}", err);
            std::process::exit(1);
        }
    }
}

fn request_for(command: Commands) -> Result<(Method, Option<Value>), String> {
    let request = match command {
        Commands::Restore { identity } => (
            Method::AutoRestore,
            identity.map(|identity| json!({ "identity_key": identity })),
        ),
        Commands::Save { identity, payload } => (
            Method::SaveSession,
            Some(json!({
                "identity_key": identity,
                "payload": read_payload(&payload)?,
            })),
        ),
        Commands::End { identity } => (
            Method::EndSession,
            Some(json!({ "identity_key": identity })),
        ),
        Commands::Health => (Method::GetHealth, None),
        Commands::Stats => (Method::GetStoreStats, None),
        Commands::Collections => (Method::ListCollections, None),
        Commands::Ping => (Method::Ping, None),
    };
    Ok(request)
}

fn read_payload(arg: &str) -> Result<String, String> {
    if arg == "-" {
        let mut payload = String::new();
        std::io::stdin()
            .read_to_string(&mut payload)
            .map_err(|err| format!("Failed to read payload from stdin: {}", err))?;
        return Ok(payload.trim_end_matches('\n').to_string());
    }
    if let Some(path) = arg.strip_prefix('@') {
        return fs::read_to_string(path)
            .map(|payload| payload.trim_end_matches('\n').to_string())
            .map_err(|err| format!("Failed to read payload file: {}", err));
    }
    Ok(arg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_without_identity_sends_no_params() {
        let (method, params) = request_for(Commands::Restore { identity: None }).unwrap();
        assert_eq!(method, Method::AutoRestore);
        assert_eq!(params, None);
    }

    #[test]
    fn save_reads_payload_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("payload.txt");
        std::fs::write(&path, "tok123\n").unwrap();

        let (method, params) = request_for(Commands::Save {
            identity: "alice".to_string(),
            payload: format!("@{}", path.display()),
        })
        .unwrap();
        assert_eq!(method, Method::SaveSession);
        assert_eq!(
            params,
            Some(json!({ "identity_key": "alice", "payload": "tok123" }))
        );
    }

    #[test]
    fn missing_payload_file_is_an_error() {
        let err = read_payload("@/nonexistent/sessionctl-payload").unwrap_err();
        assert!(err.starts_with("Failed to read payload file"), "{err}");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["sessionctl", "save", "bob", "--payload", "tok"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Save { ref identity, ref payload } if identity == "bob" && payload == "tok"
        ));

        let cli = Cli::try_parse_from(["sessionctl", "restore"]).unwrap();
        assert!(matches!(cli.command, Commands::Restore { identity: None }));
    }
}
