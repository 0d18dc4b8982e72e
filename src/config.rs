use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

/// Accepted AES key sizes in bytes (AES-128, AES-192, AES-256).
pub const VALID_KEY_SIZES: [usize; 3] = [16, 24, 32];
/// Largest node id that fits the generator's 10-bit node field.
pub const MAX_NODE_ID: u16 = 1023;

/// Argon2id cost parameters embedded into every new password hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Argon2Settings {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for Argon2Settings {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 3,
            parallelism: 2,
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The URL of the Redis server.
    pub redis_url: String,
    /// The symmetric key used to seal bearer tokens.
    pub app_secret: Zeroizing<Vec<u8>>,
    /// Prefix of every session key in the cache store.
    pub session_namespace: String,
    /// How long a session lives after login.
    pub session_ttl: Duration,
    /// Node discriminator for the id generator.
    pub node_id: u16,
    /// Upper bound for a single cache-store round trip.
    pub store_timeout: Duration,
    /// Upper bound for a whole request.
    pub request_timeout: Duration,
    pub argon2: Argon2Settings,
    /// Failed logins allowed per username inside `login_window`.
    pub login_max_attempts: u64,
    pub login_window: Duration,
    /// The address the HTTP server binds to.
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// Fails when a required variable is absent or any value is out of range.
    pub fn from_env() -> Result<Self> {
        let mut secret = env::var("APP_SECRET")
            .context("APP_SECRET must be set (16, 24 or 32 bytes)")?;
        let app_secret = Zeroizing::new(secret.as_bytes().to_vec());
        secret.zeroize();
        validate_key_len(app_secret.len())?;

        let node_id: u16 = parse_or("NODE_ID", 1)?;
        if node_id > MAX_NODE_ID {
            anyhow::bail!("NODE_ID must be between 0 and {}", MAX_NODE_ID);
        }

        let argon2 = Argon2Settings {
            memory_kib: parse_or("ARGON2_MEMORY_KIB", Argon2Settings::default().memory_kib)?,
            iterations: parse_or("ARGON2_ITERATIONS", Argon2Settings::default().iterations)?,
            parallelism: parse_or("ARGON2_PARALLELISM", Argon2Settings::default().parallelism)?,
        };
        argon2::Params::new(argon2.memory_kib, argon2.iterations, argon2.parallelism, None)
            .map_err(|e| anyhow::anyhow!("Invalid Argon2 parameters: {}", e))?;

        let session_ttl_hours: u64 = parse_or("SESSION_TTL_HOURS", 24)?;
        let store_timeout_secs: u64 = parse_or("STORE_TIMEOUT_SECS", 3)?;
        let request_timeout_secs: u64 = parse_or("REQUEST_TIMEOUT_SECS", 30)?;
        let login_window_secs: u64 = parse_or("LOGIN_WINDOW_SECS", 900)?;
        if session_ttl_hours == 0 || store_timeout_secs == 0 || request_timeout_secs == 0 || login_window_secs == 0 {
            anyhow::bail!("Durations must be greater than zero");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .context("REDIS_URL must be set")?,
            app_secret,
            session_namespace: env::var("SESSION_NAMESPACE")
                .unwrap_or_else(|_| "ecampus".to_string()),
            session_ttl: Duration::from_secs(session_ttl_hours * 3600),
            node_id,
            store_timeout: Duration::from_secs(store_timeout_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            argon2,
            login_max_attempts: parse_or("LOGIN_MAX_ATTEMPTS", 5)?,
            login_window: Duration::from_secs(login_window_secs),
            bind_addr: parse_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
        })
    }
}

/// Rejects key lengths AES-GCM cannot use as-is.
pub fn validate_key_len(len: usize) -> Result<()> {
    if !VALID_KEY_SIZES.contains(&len) {
        anyhow::bail!("APP_SECRET must be exactly 16, 24 or 32 bytes (got {})", len);
    }
    Ok(())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
