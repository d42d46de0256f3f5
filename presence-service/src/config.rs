//! Configuration types and CLI/environment parsing for the presence service.
//!
//! Concrete binaries flatten [`PresenceServiceConfig`] into their own CLI
//! struct with `#[clap(flatten)]`.

use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

const MIN_SECRET_LEN: usize = 32;

/// The configuration for the presence service core.
///
/// Configurable via environment variables or command line arguments using
/// `clap`. Call [`PresenceServiceConfig::assert_secrets_are_sane`] during
/// startup; the process should refuse to start if it fails.
#[derive(Parser, Debug)]
pub struct PresenceServiceConfig {
    /// The signing secret for session tokens. Must be at least 32 bytes.
    #[clap(long, env = "JWT_SECRET")]
    pub jwt_secret: SecretString,

    /// The HMAC key used to hash client addresses before storage. Must be
    /// at least 32 bytes.
    #[clap(long, env = "IP_HASH_SECRET")]
    pub ip_hash_secret: SecretString,

    /// The Postgres connection string.
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: SecretString,

    /// Max connections the Store Adapter's pool may open.
    #[clap(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "5")]
    pub database_max_connections: u32,

    /// The port the websocket/HTTP listener binds to.
    #[clap(long, env = "WS_PORT", default_value = "3001")]
    pub ws_port: u16,

    /// Comma-separated list of allowed origins; consulted only outside
    /// development mode.
    #[clap(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Whether this process is running in development mode (all origins
    /// pass the gateway's upgrade check).
    #[clap(long, env = "PRESENCE_DEV_MODE")]
    pub dev_mode: bool,

    /// How long an issued session token stays valid.
    #[clap(
        long,
        env = "SESSION_TOKEN_LIFETIME",
        default_value = "24h",
        value_parser = humantime::parse_duration
    )]
    pub session_token_lifetime: Duration,

    /// Heartbeat-timeout sweeper tick interval.
    #[clap(
        long,
        env = "HEARTBEAT_SWEEP_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_sweep_interval: Duration,

    /// A socket is timed out once its last heartbeat is older than this.
    #[clap(
        long,
        env = "HEARTBEAT_TIMEOUT",
        default_value = "90s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_timeout: Duration,

    /// Stale-session sweeper tick interval.
    #[clap(
        long,
        env = "STALE_SESSION_SWEEP_INTERVAL",
        default_value = "5min",
        value_parser = humantime::parse_duration
    )]
    pub stale_session_sweep_interval: Duration,

    /// A session is reaped once every one of its presences is idle for
    /// longer than this.
    #[clap(
        long,
        env = "STALE_SESSION_MAX_IDLE",
        default_value = "24h",
        value_parser = humantime::parse_duration
    )]
    pub stale_session_max_idle: Duration,
}

impl PresenceServiceConfig {
    /// Asserts that the secret-bearing fields meet the minimum length
    /// requirement. Intended to be called once at startup; the hosting
    /// binary should refuse to start if this fails.
    pub fn assert_secrets_are_sane(&self) -> eyre::Result<()> {
        use secrecy::ExposeSecret as _;
        if self.jwt_secret.expose_secret().len() < MIN_SECRET_LEN {
            eyre::bail!("JWT_SECRET must be at least {MIN_SECRET_LEN} bytes");
        }
        if self.ip_hash_secret.expose_secret().len() < MIN_SECRET_LEN {
            eyre::bail!("IP_HASH_SECRET must be at least {MIN_SECRET_LEN} bytes");
        }
        Ok(())
    }
}
