//! Command line interface definition

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "maestro",
    about = "Natural-language command execution engine",
    version
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a natural language command
    Execute {
        /// The command, in plain language
        utterance: String,

        /// Show the plan without executing it
        #[arg(long)]
        dry_run: bool,

        /// Explain the plan and ask before executing
        #[arg(long)]
        explain: bool,

        /// Force the iterative plan-act-observe loop
        #[arg(long)]
        iterative: bool,

        /// Skip iterative detection and run one-shot
        #[arg(long, conflicts_with = "iterative")]
        force_oneshot: bool,
    },

    /// Undo recorded actions
    Rollback {
        /// Roll back the last N actions of the most recent transaction
        #[arg(long, value_name = "N")]
        last: Option<usize>,

        /// Roll back a whole transaction by id
        #[arg(long, value_name = "ID", conflicts_with = "last")]
        transaction: Option<String>,

        /// Restore files from a named checkpoint
        #[arg(long, value_name = "NAME", conflicts_with_all = ["last", "transaction"])]
        checkpoint: Option<String>,

        /// Show the rollback plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show engine status: cache, router, metrics, recent transactions
    Status,

    /// Explain past executions
    Explain {
        /// "last", "history", or a number of recent commands
        #[arg(default_value = "last")]
        target: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_flags() {
        let cli = Cli::try_parse_from(["maestro", "execute", "list files", "--dry-run"]).unwrap();
        match cli.command {
            Command::Execute {
                utterance, dry_run, ..
            } => {
                assert_eq!(utterance, "list files");
                assert!(dry_run);
            }
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn test_iterative_conflicts_with_force_oneshot() {
        assert!(Cli::try_parse_from([
            "maestro",
            "execute",
            "x",
            "--iterative",
            "--force-oneshot"
        ])
        .is_err());
    }

    #[test]
    fn test_rollback_modes_exclusive() {
        assert!(Cli::try_parse_from([
            "maestro",
            "rollback",
            "--last",
            "2",
            "--transaction",
            "abc"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["maestro", "rollback", "--last", "3"]).unwrap();
        match cli.command {
            Command::Rollback { last, .. } => assert_eq!(last, Some(3)),
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn test_explain_defaults_to_last() {
        let cli = Cli::try_parse_from(["maestro", "explain"]).unwrap();
        match cli.command {
            Command::Explain { target } => assert_eq!(target, "last"),
            _ => panic!("expected explain"),
        }
    }
}
