use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};
use uuid::Uuid;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub container_name: String,
    pub public_url: String,
    pub signing_key: String,
    pub max_chunk_bytes: usize,
    pub lock_stale_secs: u64,
    pub notifier_poll_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable chunked file sharing service")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_SHARE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_SHARE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding staged blocks and committed files (overrides CHUNK_SHARE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNK_SHARE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Container files are committed into (overrides CHUNK_SHARE_CONTAINER)
    #[arg(long)]
    pub container_name: Option<String>,

    /// Base URL used when handing out download links (overrides CHUNK_SHARE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Largest accepted chunk in bytes (overrides CHUNK_SHARE_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over the environment, which wins over defaults.
    fn merge(args: Args) -> Result<Self> {
        let env_host = env::var("CHUNK_SHARE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CHUNK_SHARE_PORT", 3000u16)?;
        let env_storage =
            env::var("CHUNK_SHARE_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("CHUNK_SHARE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunk_share.db".into());
        let env_container =
            env::var("CHUNK_SHARE_CONTAINER").unwrap_or_else(|_| "snappshare".into());
        let env_max_chunk = env_parse("CHUNK_SHARE_MAX_CHUNK_BYTES", 100 * 1024 * 1024usize)?;

        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let env_public = env::var("CHUNK_SHARE_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let signing_key = match env::var("CHUNK_SHARE_SIGNING_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                tracing::warn!(
                    "CHUNK_SHARE_SIGNING_KEY not set; download links will not survive a restart"
                );
                Uuid::new_v4().simple().to_string()
            }
        };

        Ok(Self {
            host,
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            container_name: args.container_name.unwrap_or(env_container),
            public_url: args.public_url.unwrap_or(env_public),
            signing_key,
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
            lock_stale_secs: env_parse("CHUNK_SHARE_LOCK_STALE_SECS", 300u64)?,
            notifier_poll_secs: env_parse("CHUNK_SHARE_NOTIFIER_POLL_SECS", 10u64)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `name`, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_defaults() {
        let args = Args {
            port: Some(8081),
            container_name: Some("shares".into()),
            ..Args::default()
        };
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.container_name, "shares");
        assert!(!cfg.signing_key.is_empty());
    }

    #[test]
    fn missing_variables_use_the_default() {
        assert_eq!(env_parse("CHUNK_SHARE_TEST_UNSET_VAR", 42u32).unwrap(), 42);
    }
}
