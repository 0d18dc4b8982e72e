use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::config::Config;
use crate::crypto::{password::PasswordHasher, token::TokenCodec};
use crate::error::Result;
use crate::id::IdGenerator;
use crate::repositories::{
    login_attempts::{LoginAttempts, RedisLoginAttempts},
    session::{RedisSessionStore, SessionStore},
    user::{PgUserRepository, UserRepository},
};
use crate::services::auth::SessionAuthority;

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Config,
    /// Login, token validation and logout.
    pub authority: Arc<SessionAuthority>,
    /// Failed-login counters behind the login throttle.
    pub attempts: Arc<dyn LoginAttempts>,
}

impl AppState {
    /// Creates a new `AppState` over PostgreSQL and Redis.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = crate::db::create_pool(&config.database_url)?;
        crate::db::ping(&db).await?;
        tracing::info!("✅ PostgreSQL Pool initialized with deadpool-postgres");

        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client).await?;
        let _: String = redis::cmd("PING").query_async(&mut redis.clone()).await?;
        tracing::info!("✅ Redis Connection Manager initialized");

        let users = Arc::new(PgUserRepository::new(db));
        let sessions = Arc::new(RedisSessionStore::new(
            redis.clone(),
            config.session_namespace.clone(),
            config.store_timeout,
        ));
        let attempts = Arc::new(RedisLoginAttempts::new(
            redis,
            config.session_namespace.clone(),
            config.store_timeout,
        ));

        Self::from_parts(config, users, sessions, attempts)
    }

    /// Wires an `AppState` from already-built stores.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    /// * `users` - The user repository.
    /// * `sessions` - The session store.
    /// * `attempts` - The failed-login counters.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub fn from_parts(
        config: &Config,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionStore>,
        attempts: Arc<dyn LoginAttempts>,
    ) -> Result<Self> {
        let ids = Arc::new(IdGenerator::new(config.node_id)?);
        tracing::info!("✅ ID generator initialized (node {})", ids.node());

        let codec = TokenCodec::new(&config.app_secret)?;
        tracing::info!("✅ Token codec initialized (AES-{})", config.app_secret.len() * 8);

        let authority = SessionAuthority::new(
            users,
            sessions,
            ids,
            codec,
            PasswordHasher::new(config.argon2),
            config.session_ttl,
        )?;

        Ok(AppState {
            config: config.clone(),
            authority: Arc::new(authority),
            attempts,
        })
    }
}
