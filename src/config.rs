use crate::services::archive::DEFAULT_CHUNK_SIZE;
use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub media_root: String,
    pub database_url: String,
    /// Zone used when rendering timestamps in metadata documents and archives.
    pub time_zone: Tz,
    /// Read size used when streaming files into archives.
    pub chunk_size: usize,
    /// Bearer token that identifies staff. `None` locks every staff route.
    pub staff_token: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Donor accession portal")]
pub struct Args {
    /// Host to bind to (overrides PORTAL_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORTAL_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for uploads and generated documents (overrides PORTAL_MEDIA_ROOT)
    #[arg(long)]
    pub media_root: Option<String>,

    /// Database URL (overrides PORTAL_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// IANA time zone name, e.g. America/Chicago (overrides PORTAL_TIME_ZONE)
    #[arg(long)]
    pub time_zone: Option<String>,

    /// Archive read chunk size in bytes (overrides PORTAL_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Staff bearer token (overrides PORTAL_STAFF_TOKEN)
    #[arg(long)]
    pub staff_token: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge CLI values over environment lookups. CLI wins.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let var = |key: &str| -> Result<Option<String>> {
            match lookup(key) {
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        // --- Environment fallback ---
        let env_host = var("PORTAL_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match var("PORTAL_PORT")? {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing PORTAL_PORT value `{}`", value))?,
            None => 3000,
        };
        let env_media = var("PORTAL_MEDIA_ROOT")?.unwrap_or_else(|| "./data/media".into());
        let env_db = var("PORTAL_DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/portal.db".into());
        let env_tz = var("PORTAL_TIME_ZONE")?.unwrap_or_else(|| "UTC".into());
        let env_chunk = match var("PORTAL_CHUNK_SIZE")? {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("parsing PORTAL_CHUNK_SIZE value `{}`", value))?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let env_token = var("PORTAL_STAFF_TOKEN")?;

        // --- Merge ---
        let tz_name = args.time_zone.unwrap_or(env_tz);
        let time_zone = Tz::from_str(&tz_name)
            .map_err(|err| anyhow::anyhow!("unknown time zone `{}`: {}", tz_name, err))?;

        let chunk_size = args.chunk_size.unwrap_or(env_chunk);
        if chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            media_root: args.media_root.unwrap_or(env_media),
            database_url: args.database_url.unwrap_or(env_db),
            time_zone,
            chunk_size,
            staff_token: args
                .staff_token
                .or(env_token)
                .filter(|token| !token.is_empty()),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
