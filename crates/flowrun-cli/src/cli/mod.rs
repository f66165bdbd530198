//! CLI command definitions and dispatch for the `flowrun` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod display;
pub mod loader;
pub mod run;
pub mod serve;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

/// Run and schedule declarative workflows.
#[derive(Parser)]
#[command(name = "flowrun", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a flow file.
    Validate {
        /// Path to a YAML or JSON flow definition.
        file: PathBuf,

        /// Directory of other flows that subprocess steps may reference.
        #[arg(long)]
        flows: Option<PathBuf>,
    },

    /// Execute a flow once with the simulated agent and print the result.
    Run {
        /// Path to a YAML or JSON flow definition.
        file: PathBuf,

        /// Flow input as key=value. Values are parsed as JSON, falling back to a string.
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,

        /// Directory of other flows that subprocess steps may reference.
        #[arg(long)]
        flows: Option<PathBuf>,

        /// Engine config file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Give up waiting for the execution after this many seconds.
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// Register a directory of flows and run their schedules until Ctrl+C.
    Serve {
        /// Directory of YAML/JSON flow definitions.
        #[arg(long)]
        flows: PathBuf,

        /// SQLite database URL (defaults to $FLOWRUN_DATA_DIR/flowrun.db).
        #[arg(long, env = "FLOWRUN_DATABASE_URL")]
        db: Option<String>,

        /// Engine config file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Parse a `key=value` flow input.
pub fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty input name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input_values() {
        assert_eq!(parse_input("n=3").unwrap(), ("n".into(), json!(3)));
        assert_eq!(parse_input("tags=[\"a\"]").unwrap(), ("tags".into(), json!(["a"])));
        assert_eq!(parse_input("name=Ada").unwrap(), ("name".into(), json!("Ada")));
        assert_eq!(parse_input("eq=a=b").unwrap(), ("eq".into(), json!("a=b")));
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=1").is_err());
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "flowrun", "-v", "run", "flow.yaml", "-i", "x=1", "--input", "y=two", "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(cli.json);
        match cli.command {
            Commands::Run { inputs, timeout_secs, .. } => {
                assert_eq!(inputs.len(), 2);
                assert_eq!(timeout_secs, 300);
            }
            _ => panic!("expected run"),
        }
    }
}
