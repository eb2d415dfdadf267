//! Command line interface

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::application::AppContext;
use crate::domain::account::AccountCredential;
use crate::domain::repositories::{AccountRepository, KeywordStatRepository, RecordRepository};
use crate::infrastructure::config::SettingsChange;
use crate::infrastructure::export::export_to_file;

#[derive(Debug, Parser)]
#[command(name = "xiaoba-crawler", version, about = "Scheduled multi-account report monitor")]
pub struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(long, global = true, env = "XIAOBA_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Run a single cycle over every enabled account
    Once,
    /// Crawl one account right now, enabled or not
    TestAccount { username: String },
    /// Manage monitored accounts
    #[command(subcommand)]
    Accounts(AccountsCommand),
    /// Print stored records as JSON
    Records(RecordsArgs),
    /// Print global keyword totals as JSON
    Keywords,
    /// Write stored records to a CSV file
    Export(ExportArgs),
    /// Print the crawler status summary
    Status,
    /// Show or change the saved configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration, environment overrides included
    Show,
    /// Change scheduler and crawl settings in the config file
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    pub target_url: Option<String>,
    #[arg(long)]
    pub interval_secs: Option<u64>,
    #[arg(long)]
    pub max_sessions: Option<usize>,
    #[arg(long)]
    pub session_timeout_secs: Option<u64>,
    #[arg(long)]
    pub headless: Option<bool>,
    /// Comma separated anomaly keywords, replacing the current list
    #[arg(long, value_delimiter = ',')]
    pub keywords: Option<Vec<String>>,
}

impl From<ConfigSetArgs> for SettingsChange {
    fn from(args: ConfigSetArgs) -> Self {
        Self {
            target_url: args.target_url,
            cycle_interval_secs: args.interval_secs,
            max_concurrent_sessions: args.max_sessions,
            session_timeout_secs: args.session_timeout_secs,
            headless: args.headless,
            keywords: args.keywords,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum AccountsCommand {
    Add {
        username: String,
        #[arg(long, env = "XIAOBA_ACCOUNT_SECRET", hide_env_values = true)]
        secret: String,
        /// Register the account without scheduling it
        #[arg(long)]
        disabled: bool,
    },
    List,
    Remove { username: String },
    Enable { username: String },
    Disable { username: String },
}

#[derive(Debug, Args)]
pub struct RecordsArgs {
    #[arg(long)]
    pub account: Option<String>,
    #[arg(long, default_value_t = 100)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    pub path: PathBuf,
    #[arg(long)]
    pub account: Option<String>,
}

/// Parse the process arguments and run the chosen command
pub async fn run() -> Result<()> {
    execute(Cli::parse()).await
}

pub async fn execute(cli: Cli) -> Result<()> {
    let ctx = AppContext::bootstrap(cli.config).await?;
    let result = dispatch(&ctx, cli.command).await;
    ctx.shutdown().await;
    result
}

async fn dispatch(ctx: &AppContext, command: Command) -> Result<()> {
    match command {
        Command::Run => {
            ctx.orchestrator.start()?;
            info!("scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
            ctx.orchestrator.stop().await?;
            Ok(())
        }
        Command::Once => print_json(&ctx.orchestrator.run_cycle().await?),
        Command::TestAccount { username } => print_json(&ctx.orchestrator.test_account(&username).await?),
        Command::Accounts(command) => accounts(ctx, command).await,
        Command::Records(args) => {
            let records = ctx.records.find_all(args.account.as_deref()).await?;
            let shown: Vec<_> = records.into_iter().take(args.limit).collect();
            print_json(&shown)
        }
        Command::Keywords => print_json(&ctx.keyword_stats.find_all().await?),
        Command::Export(args) => {
            let records = ctx.records.find_all(args.account.as_deref()).await?;
            export_to_file(&args.path, &records, ctx.config.logging.utc_offset_hours).await?;
            println!("exported {} records to {}", records.len(), args.path.display());
            Ok(())
        }
        Command::Status => print_json(&ctx.orchestrator.status().await?),
        Command::Config(ConfigCommand::Show) => print_json(&ctx.config),
        Command::Config(ConfigCommand::Set(args)) => {
            let change = SettingsChange::from(args);
            if change.is_empty() {
                bail!("nothing to change, pass at least one setting");
            }
            let saved = ctx.update_settings(&change).await?;
            println!("saved to {}", ctx.config_manager.config_path().display());
            print_json(&saved)
        }
    }
}

async fn accounts(ctx: &AppContext, command: AccountsCommand) -> Result<()> {
    match command {
        AccountsCommand::Add { username, secret, disabled } => {
            let username = username.trim();
            if username.is_empty() || secret.is_empty() {
                bail!("username and secret must not be empty");
            }
            let mut account = AccountCredential::new(username, secret);
            account.enabled = !disabled;
            ctx.accounts
                .create(&account)
                .await
                .with_context(|| format!("Failed to add account '{username}'"))?;
            println!("added {username}");
        }
        AccountsCommand::List => print_json(&ctx.accounts.find_all().await?)?,
        AccountsCommand::Remove { username } => {
            if !ctx.accounts.delete(&username).await? {
                bail!("account '{username}' does not exist");
            }
            ctx.orchestrator.registry().forget(&username);
            println!("removed {username}");
        }
        AccountsCommand::Enable { username } => set_enabled(ctx, &username, true).await?,
        AccountsCommand::Disable { username } => set_enabled(ctx, &username, false).await?,
    }
    Ok(())
}

async fn set_enabled(ctx: &AppContext, username: &str, enabled: bool) -> Result<()> {
    if !ctx.accounts.set_enabled(username, enabled).await? {
        bail!("account '{username}' does not exist");
    }
    println!("{username} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_account_and_export_commands() -> Result<()> {
        let cli = Cli::try_parse_from(["xiaoba-crawler", "accounts", "add", "KR666", "--secret", "pw", "--disabled"])?;
        assert!(matches!(
            cli.command,
            Command::Accounts(AccountsCommand::Add { ref username, disabled: true, .. }) if username == "KR666"
        ));

        let cli = Cli::try_parse_from(["xiaoba-crawler", "--config", "/tmp/c.json", "export", "out.csv", "--account", "KR666"])?;
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(cli.command, Command::Export(ExportArgs { ref account, .. }) if account.as_deref() == Some("KR666")));
        Ok(())
    }

    #[test]
    fn config_set_maps_onto_a_settings_change() -> Result<()> {
        let cli = Cli::try_parse_from([
            "xiaoba-crawler", "config", "set", "--interval-secs", "30", "--headless", "false", "--keywords", "掉线,维护",
        ])?;
        let Command::Config(ConfigCommand::Set(args)) = cli.command else {
            bail!("expected config set");
        };
        let change = SettingsChange::from(args);
        assert_eq!(change.cycle_interval_secs, Some(30));
        assert_eq!(change.headless, Some(false));
        assert_eq!(change.keywords, Some(vec!["掉线".to_string(), "维护".to_string()]));
        assert!(change.max_concurrent_sessions.is_none());
        Ok(())
    }

    #[test]
    fn records_limit_defaults_to_one_hundred() -> Result<()> {
        let cli = Cli::try_parse_from(["xiaoba-crawler", "records"])?;
        assert!(matches!(cli.command, Command::Records(RecordsArgs { limit: 100, account: None })));
        Ok(())
    }
}
