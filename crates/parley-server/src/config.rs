use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::warn;

use parley_gateway::dispatcher::DEFAULT_BROADCAST_CAPACITY;
use parley_gateway::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use parley_gateway::presence::PresenceMode;
use parley_types::policy::{HierarchyPolicy, OpenPolicy, RolePolicy};

const DEV_SECRET: &str = "dev-secret-change-me";

/// Process configuration, read once at startup from `PARLEY_*` variables.
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub frontend_url: Option<String>,
    pub handshake_timeout: Duration,
    pub broadcast_capacity: usize,
    pub presence_mode: PresenceMode,
    pub role_policy: Arc<dyn RolePolicy>,
    pub token_ttl: chrono::Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = var("PARLEY_JWT_SECRET", DEV_SECRET);
        if jwt_secret == DEV_SECRET {
            warn!("PARLEY_JWT_SECRET is unset, using the development secret");
        }

        let host = var("PARLEY_HOST", "0.0.0.0");
        let port: u16 = var("PARLEY_PORT", "3000").parse().context("PARLEY_PORT")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let handshake_timeout = match get("PARLEY_HANDSHAKE_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().context("PARLEY_HANDSHAKE_TIMEOUT_SECS")?),
            None => DEFAULT_HANDSHAKE_TIMEOUT,
        };

        let broadcast_capacity = match get("PARLEY_BROADCAST_CAPACITY") {
            Some(raw) => raw.parse().context("PARLEY_BROADCAST_CAPACITY")?,
            None => DEFAULT_BROADCAST_CAPACITY,
        };
        if broadcast_capacity == 0 {
            bail!("PARLEY_BROADCAST_CAPACITY must be greater than zero");
        }

        let presence_mode = match get("PARLEY_PRESENCE_MODE") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => PresenceMode::default(),
        };

        let role_policy = parse_role_policy(&var("PARLEY_ROLE_POLICY", "hierarchy"))?;

        let ttl_hours: i64 = var("PARLEY_TOKEN_TTL_HOURS", "24")
            .parse()
            .context("PARLEY_TOKEN_TTL_HOURS")?;

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(var("PARLEY_DB_PATH", "parley.db")),
            addr,
            frontend_url: get("PARLEY_FRONTEND_URL").filter(|url| !url.is_empty()),
            handshake_timeout,
            broadcast_capacity,
            presence_mode,
            role_policy,
            token_ttl: chrono::Duration::hours(ttl_hours),
        })
    }
}

fn parse_role_policy(raw: &str) -> anyhow::Result<Arc<dyn RolePolicy>> {
    match raw.to_ascii_lowercase().as_str() {
        "hierarchy" => Ok(Arc::new(HierarchyPolicy)),
        "open" => Ok(Arc::new(OpenPolicy)),
        other => bail!("unknown PARLEY_ROLE_POLICY '{}' (expected hierarchy or open)", other),
    }
}
