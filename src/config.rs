use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

use crate::{
    backend::RetryPolicy, models::credentials::Credentials,
    services::gateway_service::GatewaySettings,
};

const ENV_PREFIX: &str = "OBJECT_GATEWAY_";

/// Which storage backend the gateway forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    S3,
    /// In-process store; contents are lost on exit.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub backend: BackendKind,
    pub s3: S3Settings,
    pub list_page_size: i32,
    pub max_payload_bytes: usize,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
}

/// Everything the S3 client factory needs.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub public_base_url: Option<String>,
    /// Static credentials; `None` defers to the SDK's provider chain.
    pub credentials: Option<Credentials>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object storage gateway for content-management hosts")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Upload ledger database URL (overrides OBJECT_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend (overrides OBJECT_GATEWAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Bucket name (overrides OBJECT_GATEWAY_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Bucket region (overrides OBJECT_GATEWAY_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Custom S3 endpoint, e.g. a MinIO server (overrides OBJECT_GATEWAY_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Base for public object URLs (overrides OBJECT_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over variables resolved through `lookup` over defaults.
    pub fn from_args(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, bool)> {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|value| !value.trim().is_empty())
        };

        // --- Environment fallback ---
        let env_host = var("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&var, "PORT", 3000u16)?;
        let env_db = var("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/object_gateway.db".into());
        let env_backend = match var("BACKEND") {
            Some(value) => BackendKind::from_str(value.trim(), true).map_err(|err| {
                anyhow::anyhow!("parsing {}BACKEND value `{}`: {}", ENV_PREFIX, value, err)
            })?,
            None => BackendKind::S3,
        };

        // --- Merge ---
        let backend = args.backend.unwrap_or(env_backend);
        let bucket = match (args.bucket.or_else(|| var("BUCKET")), backend) {
            (Some(bucket), _) => bucket,
            (None, BackendKind::Memory) => "memory".into(),
            (None, BackendKind::S3) => {
                bail!("a bucket is required for the s3 backend (--bucket or {}BUCKET)", ENV_PREFIX)
            }
        };
        let credentials = match (var("ACCESS_KEY"), var("SECRET_KEY")) {
            (Some(access), Some(secret)) => Some(Credentials::new(access, secret)),
            (None, None) => None,
            _ => bail!(
                "{0}ACCESS_KEY and {0}SECRET_KEY must be set together",
                ENV_PREFIX
            ),
        };

        let s3 = S3Settings {
            bucket,
            region: args
                .region
                .or_else(|| var("REGION"))
                .unwrap_or_else(|| "us-east-1".into()),
            endpoint: args.endpoint.or_else(|| var("ENDPOINT")),
            force_path_style: parse_var(&var, "FORCE_PATH_STYLE", false)?,
            public_base_url: args.public_base_url.or_else(|| var("PUBLIC_BASE_URL")),
            credentials,
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            backend,
            s3,
            list_page_size: parse_var(&var, "LIST_PAGE_SIZE", 1000i32)?.clamp(1, 1000),
            max_payload_bytes: parse_var(&var, "MAX_PAYLOAD_BYTES", 100 * 1024 * 1024usize)?,
            session_ttl: Duration::from_secs(parse_var(&var, "SESSION_TTL_SECS", 86_400u64)?),
            sweep_interval: Duration::from_secs(
                parse_var(&var, "SWEEP_INTERVAL_SECS", 300u64)?.max(1),
            ),
            retry: RetryPolicy {
                max_retries: parse_var(&var, "MAX_RETRIES", 3u32)?,
                initial_delay: Duration::from_millis(parse_var(&var, "RETRY_DELAY_MS", 100u64)?),
            },
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            list_page_size: self.list_page_size,
            max_payload_bytes: self.max_payload_bytes,
            retry: self.retry,
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, value)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["object-gateway"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_for_memory_backend() {
        let (cfg, migrate) = AppConfig::from_args(args(&["--backend", "memory"]), env_of(&[]))
            .unwrap();
        assert!(!migrate);
        assert_eq!(cfg.backend, BackendKind::Memory);
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.s3.bucket, "memory");
        assert_eq!(cfg.s3.region, "us-east-1");
        assert_eq!(cfg.list_page_size, 1000);
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert!(cfg.s3.credentials.is_none());
    }

    #[test]
    fn cli_overrides_environment() {
        let env = env_of(&[
            ("OBJECT_GATEWAY_PORT", "8080"),
            ("OBJECT_GATEWAY_BUCKET", "from-env"),
            ("OBJECT_GATEWAY_REGION", "eu-central-1"),
        ]);
        let (cfg, migrate) =
            AppConfig::from_args(args(&["--port", "9000", "--bucket", "cli", "--migrate"]), env)
                .unwrap();
        assert!(migrate);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.s3.bucket, "cli");
        assert_eq!(cfg.s3.region, "eu-central-1");
        assert_eq!(cfg.backend, BackendKind::S3);
    }

    #[test]
    fn s3_backend_requires_bucket() {
        let err = AppConfig::from_args(args(&[]), env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let env = env_of(&[
            ("OBJECT_GATEWAY_BUCKET", "assets"),
            ("OBJECT_GATEWAY_ACCESS_KEY", "AKID"),
        ]);
        assert!(AppConfig::from_args(args(&[]), env).is_err());

        let env = env_of(&[
            ("OBJECT_GATEWAY_BUCKET", "assets"),
            ("OBJECT_GATEWAY_ACCESS_KEY", "AKID"),
            ("OBJECT_GATEWAY_SECRET_KEY", "shh"),
        ]);
        let (cfg, _) = AppConfig::from_args(args(&[]), env).unwrap();
        assert_eq!(cfg.s3.credentials.unwrap().access_key(), "AKID");
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let env = env_of(&[
            ("OBJECT_GATEWAY_BUCKET", "assets"),
            ("OBJECT_GATEWAY_PORT", "eighty"),
        ]);
        let err = AppConfig::from_args(args(&[]), env).unwrap_err();
        assert!(err.to_string().contains("OBJECT_GATEWAY_PORT"));
    }

    #[test]
    fn tuning_values_are_read_and_bounded() {
        let env = env_of(&[
            ("OBJECT_GATEWAY_BACKEND", "memory"),
            ("OBJECT_GATEWAY_LIST_PAGE_SIZE", "5000"),
            ("OBJECT_GATEWAY_FORCE_PATH_STYLE", "true"),
            ("OBJECT_GATEWAY_MAX_RETRIES", "0"),
            ("OBJECT_GATEWAY_SWEEP_INTERVAL_SECS", "0"),
        ]);
        let (cfg, _) = AppConfig::from_args(args(&[]), env).unwrap();
        assert_eq!(cfg.list_page_size, 1000);
        assert!(cfg.s3.force_path_style);
        assert_eq!(cfg.retry.max_retries, 0);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
        assert_eq!(cfg.gateway_settings().list_page_size, 1000);
    }
}
