use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Secrets;

#[derive(Parser, Debug)]
#[command(
    name = "labprov",
    about = "Restore booked lab machines, rotate credentials and hand out VPN access"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "labprov.toml")]
    pub config: PathBuf,

    /// Enable debug output on the terminal
    #[arg(short, long)]
    pub verbose: bool,

    /// Write the run log here instead of the per-run file in the data dir
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Do not write a log file
    #[arg(long, conflicts_with = "log_file")]
    pub no_log_file: bool,

    #[command(flatten)]
    pub secrets: SecretArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Credentials taken from the environment, never from the config file.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SecretArgs {
    #[arg(long, env = "OPNSENSE_API_KEY", hide_env_values = true, hide = true)]
    pub opnsense_api_key: Option<String>,

    #[arg(long, env = "OPNSENSE_API_SECRET", hide_env_values = true, hide = true)]
    pub opnsense_api_secret: Option<String>,

    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true, hide = true)]
    pub smtp_password: Option<String>,

    /// Google service account key (overrides calendar.service_account_path)
    #[arg(long, env = "SERVICE_ACCOUNT_PATH")]
    pub service_account_path: Option<PathBuf>,
}

impl From<SecretArgs> for Secrets {
    fn from(args: SecretArgs) -> Self {
        Secrets {
            opnsense_api_key: args.opnsense_api_key,
            opnsense_api_secret: args.opnsense_api_secret,
            smtp_password: args.smtp_password,
            service_account_path: args.service_account_path,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one provisioning pass for the bookings active right now
    Run,

    /// Show every machine's snapshot tree
    Inventory,

    /// Load and validate the configuration, then exit
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["labprov", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("labprov.toml"));
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Command::Check));
    }

    #[test]
    fn log_file_and_no_log_file_conflict() {
        let res = Cli::try_parse_from(["labprov", "--log-file", "x.log", "--no-log-file", "run"]);
        assert!(res.is_err());
    }

    #[test]
    fn subcommand_required() {
        assert!(Cli::try_parse_from(["labprov"]).is_err());
    }

    #[test]
    fn secrets_convert() {
        let secrets: Secrets = SecretArgs {
            smtp_password: Some("pw".into()),
            ..SecretArgs::default()
        }
        .into();
        assert_eq!(secrets.smtp_password.as_deref(), Some("pw"));
        assert!(secrets.opnsense_api_key.is_none());
    }
}
