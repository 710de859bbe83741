//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Run actions for clients of a portal fixture
//! - `show-config`: Show configuration discovery information
//! - `init-config`: Write a default user configuration file

use crate::action::ActionInput;
use crate::portal::TaxTypeId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig { config_override: Option<PathBuf> },
    InitConfig,
}

#[derive(Debug)]
pub struct RunConfig {
    pub fixture: PathBuf,
    /// Empty means every client of the fixture
    pub client_ids: Vec<String>,
    pub action_ids: Vec<String>,
    pub input: ActionInput,
    pub config_override: Option<PathBuf>,
    pub output: Option<PathBuf>,
    /// Extra retry runs while retryable failures remain
    pub retries: u32,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "portal-runner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runs bulk retrieval actions against a tax portal for many clients")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run actions for a set of clients
    Run {
        /// Portal fixture (JSON) providing clients and their data
        #[arg(short = 'f', long = "fixture")]
        fixture: PathBuf,
        /// Client to process (repeatable, default: all clients)
        #[arg(long = "client", value_name = "ID")]
        clients: Vec<String>,
        /// Action to run (repeatable)
        #[arg(short = 'a', long = "action", value_name = "ID", required = true)]
        actions: Vec<String>,
        /// Start of the date range (dd/mm/yyyy)
        #[arg(long = "from")]
        from: Option<String>,
        /// End of the date range (dd/mm/yyyy)
        #[arg(long = "to")]
        to: Option<String>,
        /// Restrict return history to these tax types
        #[arg(long = "tax-type", value_name = "TAX_TYPE")]
        tax_types: Vec<String>,
        /// Receipt numbers for payment receipts (comma separated)
        #[arg(long = "item-ids", value_delimiter = ',')]
        item_ids: Vec<String>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Write merged outputs as JSON to this file
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Retry failed work up to this many times
        #[arg(long = "retries", default_value_t = 0)]
        retries: u32,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show configuration discovery information
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Create a default configuration file in the user config directory
    InitConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                fixture,
                clients,
                actions,
                from,
                to,
                tax_types,
                item_ids,
                config,
                output,
                retries,
                verbose,
            }) => {
                if actions.is_empty() {
                    return Err("At least one --action is required".to_string());
                }

                let input = ActionInput {
                    from_date: from.clone(),
                    to_date: to.clone(),
                    tax_types: non_empty(tax_types)
                        .map(|t| t.iter().map(|s| TaxTypeId::new(s.as_str())).collect()),
                    item_ids: non_empty(item_ids).map(<[String]>::to_vec),
                    ..ActionInput::default()
                };

                Ok(ExecutionMode::Run(RunConfig {
                    fixture: fixture.clone(),
                    client_ids: clients.clone(),
                    action_ids: actions.clone(),
                    input,
                    config_override: config.clone(),
                    output: output.clone(),
                    retries: *retries,
                    verbose: *verbose,
                }))
            }
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            Some(Commands::InitConfig) => Ok(ExecutionMode::InitConfig),
            None => Err(
                "No command specified. Use 'portal-runner --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}

fn non_empty(values: &[String]) -> Option<&[String]> {
    if values.iter().all(|v| v.trim().is_empty()) {
        None
    } else {
        Some(values)
    }
}
