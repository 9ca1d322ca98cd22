use crate::models::account::Plan;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::{env, str::FromStr};

const MIB: i64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub blob_dir: String,
    /// Base of public image URLs, e.g. `https://img.example.com`.
    pub base_url: String,
    pub log_dir: String,
    pub log_prefix: String,
    pub trial_retention_days: i64,
    pub purge_after_days: i64,
    pub max_file_bytes_trial: i64,
    pub max_file_bytes_paid: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image storage API with quotas, rate limits and lifecycle jobs")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where image payloads are stored (overrides IMAGE_VAULT_BLOB_DIR)
    #[arg(long)]
    pub blob_dir: Option<String>,

    /// Database URL (overrides IMAGE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Run one lifecycle pass: expire trial images and purge deleted ones
    Cleanup {
        /// Report candidates without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Attribute one day of CDN traffic to accounts
    Bandwidth {
        /// Day to process (YYYY-MM-DD); defaults to two days ago
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Move an account to another plan tier
    Plan {
        /// API key identifying the account
        #[arg(long)]
        api_key: String,
        /// trial, starter or pro
        #[arg(long)]
        plan: Plan,
    },
}

/// What the process should do once configured.
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    Migrate,
    Serve,
    Cleanup { dry_run: bool },
    Bandwidth { date: Option<NaiveDate> },
    SetPlan { api_key: String, plan: Plan },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        let cfg = Self::resolve(&args, |name| env::var(name))?;
        Ok((cfg, args.run_mode()))
    }

    /// Merge `args` over the variables returned by `lookup` over defaults.
    pub fn resolve(
        args: &Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        let text = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let env_port: u16 = parse_var(&lookup, "IMAGE_VAULT_PORT", 3000)?;

        Ok(Self {
            host: match &args.host {
                Some(host) => host.clone(),
                None => text("IMAGE_VAULT_HOST", "0.0.0.0")?,
            },
            port: args.port.unwrap_or(env_port),
            database_url: match &args.database_url {
                Some(url) => url.clone(),
                None => text("IMAGE_VAULT_DATABASE_URL", "sqlite://./data/meta/image_vault.db")?,
            },
            blob_dir: match &args.blob_dir {
                Some(dir) => dir.clone(),
                None => text("IMAGE_VAULT_BLOB_DIR", "./data/images")?,
            },
            base_url: text("IMAGE_VAULT_BASE_URL", "http://localhost:3000")?,
            log_dir: text("IMAGE_VAULT_LOG_DIR", "./data/cdn-logs")?,
            log_prefix: text("IMAGE_VAULT_LOG_PREFIX", "")?,
            trial_retention_days: parse_var(&lookup, "IMAGE_VAULT_TRIAL_RETENTION_DAYS", 7)?,
            purge_after_days: parse_var(&lookup, "IMAGE_VAULT_PURGE_AFTER_DAYS", 30)?,
            max_file_bytes_trial: parse_var(&lookup, "IMAGE_VAULT_MAX_FILE_BYTES_TRIAL", 10 * MIB)?,
            max_file_bytes_paid: parse_var(&lookup, "IMAGE_VAULT_MAX_FILE_BYTES_PAID", 100 * MIB)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Args {
    pub fn run_mode(&self) -> RunMode {
        if self.migrate {
            return RunMode::Migrate;
        }
        match &self.command {
            None | Some(Command::Serve) => RunMode::Serve,
            Some(Command::Cleanup { dry_run }) => RunMode::Cleanup { dry_run: *dry_run },
            Some(Command::Bandwidth { date }) => RunMode::Bandwidth { date: *date },
            Some(Command::Plan { api_key, plan }) => RunMode::SetPlan {
                api_key: api_key.clone(),
                plan: *plan,
            },
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::resolve(&Args::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.trial_retention_days, 7);
        assert_eq!(cfg.purge_after_days, 30);
        assert_eq!(cfg.max_file_bytes_trial, 10 * MIB);
        assert_eq!(cfg.max_file_bytes_paid, 100 * MIB);
    }

    #[test]
    fn test_flags_override_environment() {
        let args = Args {
            port: Some(8080),
            blob_dir: Some("/srv/images".into()),
            ..Default::default()
        };
        let cfg = AppConfig::resolve(
            &args,
            lookup(&[
                ("IMAGE_VAULT_PORT", "9000"),
                ("IMAGE_VAULT_HOST", "127.0.0.1"),
                ("IMAGE_VAULT_BLOB_DIR", "/tmp/ignored"),
                ("IMAGE_VAULT_TRIAL_RETENTION_DAYS", "3"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.blob_dir, "/srv/images");
        assert_eq!(cfg.trial_retention_days, 3);
    }

    #[test]
    fn test_malformed_number_names_the_variable() {
        let err = AppConfig::resolve(&Args::default(), lookup(&[("IMAGE_VAULT_PORT", "eighty")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("IMAGE_VAULT_PORT"));
    }

    #[test]
    fn test_run_modes() {
        let parse = |argv: &[&str]| Args::try_parse_from(argv).unwrap().run_mode();
        assert_eq!(parse(&["image-vault"]), RunMode::Serve);
        assert_eq!(parse(&["image-vault", "--migrate"]), RunMode::Migrate);
        assert_eq!(
            parse(&["image-vault", "cleanup", "--dry-run"]),
            RunMode::Cleanup { dry_run: true }
        );
        assert_eq!(
            parse(&["image-vault", "bandwidth", "--date", "2026-10-17"]),
            RunMode::Bandwidth {
                date: NaiveDate::from_ymd_opt(2026, 10, 17)
            }
        );
        assert_eq!(
            parse(&["image-vault", "plan", "--api-key", "k", "--plan", "pro"]),
            RunMode::SetPlan {
                api_key: "k".into(),
                plan: Plan::Pro
            }
        );
        assert!(Args::try_parse_from(["image-vault", "plan", "--api-key", "k", "--plan", "gold"]).is_err());
    }
}
