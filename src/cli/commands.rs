//! Command handlers
//!
//! Each handler returns the process exit code: 0 success, 1 execution
//! failure, 2 translation failure, 3 sandbox violation, 4 user abort,
//! 5 max iterations reached.

use tracing::warn;

use crate::brain::patterns::PatternDetector;
use crate::cli::args::Command;
use crate::execution::cancel::CancelReason;
use crate::cli::output;
use crate::core::config::MaestroConfig;
use crate::memory::rollback::RollbackEngine;
use crate::memory::semantic;
use crate::orchestrator::{ExecuteOptions, Orchestrator, Outcome};
use crate::providers;

pub async fn handle_command(command: Command, config: MaestroConfig) -> i32 {
    match dispatch(command, config).await {
        Ok(code) => code,
        Err(err) => {
            output::print_error(&err.to_string());
            err.exit_code()
        }
    }
}

async fn dispatch(
    command: Command,
    config: MaestroConfig,
) -> crate::core::error::Result<i32> {
    match command {
        Command::Execute {
            utterance,
            dry_run,
            explain,
            iterative,
            force_oneshot,
        } => {
            let oracle = providers::from_config(&config.llm);
            let orchestrator = Orchestrator::new(config, oracle)?;

            // Ctrl-C aborts at the next iteration boundary; in-flight
            // steps finish or time out.
            let cancel = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel(CancelReason::UserRequested);
                }
            });

            let outcome = orchestrator
                .execute(
                    &utterance,
                    ExecuteOptions {
                        dry_run,
                        explain,
                        iterative,
                        force_oneshot,
                    },
                )
                .await?;

            if let Outcome::DryRun { plan } = outcome {
                println!("{}", plan);
            }
            Ok(0)
        }

        Command::Rollback {
            last,
            transaction,
            checkpoint,
            dry_run,
        } => {
            let oracle = providers::from_config(&config.llm);
            let orchestrator = Orchestrator::new(config, oracle)?;
            let engine = RollbackEngine::new(orchestrator.tracker(), orchestrator.sandbox());

            let report = if let Some(name) = checkpoint {
                engine.restore_checkpoint(&name, dry_run).await?
            } else if let Some(id) = transaction {
                engine.rollback_transaction(&id, dry_run).await?
            } else {
                engine.rollback_last_n(last.unwrap_or(1), dry_run).await?
            };

            for line in &report.plan {
                println!("  {}", line);
            }
            for warning in &report.warnings {
                output::print_warning(warning);
            }
            for error in &report.errors {
                output::print_error(error);
            }

            if report.dry_run {
                output::print_dim("Dry run, nothing was changed");
                Ok(0)
            } else if report.success {
                output::print_success(&format!(
                    "Rolled back {} action(s), restored {} file(s)",
                    report.actions_rolled_back, report.files_restored
                ));
                Ok(0)
            } else {
                output::print_error("Rollback completed partially");
                Ok(1)
            }
        }

        Command::Status => {
            let oracle = providers::from_config(&config.llm);
            let orchestrator = Orchestrator::new(config, oracle)?;
            println!("{}", orchestrator.status_report().await);
            Ok(0)
        }

        Command::Explain { target } => {
            let oracle = providers::from_config(&config.llm);
            let orchestrator = Orchestrator::new(config, oracle)?;
            explain(&orchestrator, &target);
            Ok(0)
        }
    }
}

fn explain(orchestrator: &Orchestrator, target: &str) {
    let history = orchestrator.history();

    match target {
        "last" => match history.recent(1).first() {
            Some(record) => {
                println!("Last command: {}", record.user_input);
                println!("  goal: {}", record.goal);
                println!("  tools: {}", record.tools.join(", "));
                println!("  success: {}", record.success);
                println!("  at: {}", record.timestamp);

                let all = history.load();
                let similar = semantic::find_similar(&all, &record.user_input, 4);
                // The most recent match is the record itself.
                if similar.len() > 1 {
                    println!("  similar past commands:");
                    for past in similar.iter().skip(1) {
                        println!("    {} ({})", past.user_input, past.timestamp);
                    }
                }
            }
            None => println!("No command history yet"),
        },
        "history" => {
            let records = history.recent(10);
            if records.is_empty() {
                println!("No command history yet");
                return;
            }
            for record in &records {
                let marker = if record.success { "ok" } else { "failed" };
                println!("  [{}] {} ({})", marker, record.user_input, record.timestamp);
            }

            let patterns = PatternDetector::new().detect(&history.load());
            if !patterns.is_empty() {
                println!("\nDetected patterns:");
                for pattern in patterns.iter().take(5) {
                    println!(
                        "  {} (confidence {:.0}%, seen {} times)",
                        pattern.description,
                        pattern.confidence * 100.0,
                        pattern.occurrences
                    );
                }
                if let Err(e) = persist_patterns(orchestrator, &patterns) {
                    warn!(error = %e, "failed to persist patterns");
                }
            }
        }
        n => match n.parse::<usize>() {
            Ok(count) => {
                for record in history.recent(count) {
                    let marker = if record.success { "ok" } else { "failed" };
                    println!("  [{}] {} ({})", marker, record.user_input, record.timestamp);
                }
            }
            Err(_) => output::print_error("expected 'last', 'history', or a number"),
        },
    }
}

fn persist_patterns(
    orchestrator: &Orchestrator,
    patterns: &[crate::brain::patterns::DetectedPattern],
) -> crate::core::error::Result<()> {
    let path = orchestrator.state_root().join("patterns.json");
    let json = serde_json::to_string_pretty(patterns)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::Cli;
    use clap::Parser;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> MaestroConfig {
        let mut config = MaestroConfig::default();
        config.state_root = dir.path().join("state");
        config.llm.provider = "scripted".to_string();
        config.feedback.prompts_enabled = false;
        config
    }

    #[tokio::test]
    async fn test_status_runs_clean() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from(["maestro", "status"]).unwrap();
        let code = handle_command(cli.command, test_config(&dir)).await;
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_rollback_without_transactions_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from(["maestro", "rollback", "--last", "1"]).unwrap();
        let code = handle_command(cli.command, test_config(&dir)).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_explain_empty_history() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from(["maestro", "explain", "history"]).unwrap();
        let code = handle_command(cli.command, test_config(&dir)).await;
        assert_eq!(code, 0);
    }
}
