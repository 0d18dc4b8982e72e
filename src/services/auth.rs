use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::{
    crypto::{password::PasswordHasher, token::TokenCodec},
    error::{AppError, Result},
    id::IdGenerator,
    models::{
        session::{ClientInfo, Identity, SessionRecord},
        user::{NewUser, Role, User},
    },
    repositories::{session::SessionStore, user::UserRepository},
};

/// Login input: one of `username` / `email` plus the password.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: String,
}

impl Credentials {
    /// The login name to look up; username wins when both are given.
    pub fn login(&self) -> Option<&str> {
        [self.username.as_deref(), self.email.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// Registration input after payload validation.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub major: Option<String>,
    pub year: Option<i32>,
}

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub user_id: i64,
    pub session_id: i64,
}

/// Issues, validates and revokes session tokens.
///
/// Holds no per-request state; a session exists exactly as long as its
/// record exists in the session store.
pub struct SessionAuthority {
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionStore>,
    ids: Arc<IdGenerator>,
    codec: TokenCodec,
    hasher: PasswordHasher,
    session_ttl: Duration,
    /// Verified against when the login name is unknown, so both paths pay
    /// for one key derivation.
    dummy_hash: String,
}

impl SessionAuthority {
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionStore>,
        ids: Arc<IdGenerator>,
        codec: TokenCodec,
        hasher: PasswordHasher,
        session_ttl: Duration,
    ) -> Result<Self> {
        let dummy_hash = hasher.hash("ecampus-timing-equaliser")?;
        Ok(Self {
            users,
            sessions,
            ids,
            codec,
            hasher,
            session_ttl,
            dummy_hash,
        })
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Hashes a password off the async workers.
    pub async fn hash_password(&self, password: &str) -> Result<String> {
        let hasher = self.hasher.clone();
        let password = Zeroizing::new(password.to_string());
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AppError::Internal(format!("Hash task failed: {}", e)))?
    }

    /// Verifies a password off the async workers.
    ///
    /// A malformed stored hash is logged and counts as a mismatch.
    async fn verify_password(&self, password: &str, stored: &str) -> Result<bool> {
        let hasher = self.hasher.clone();
        let password = Zeroizing::new(password.to_string());
        let stored = stored.to_string();
        let outcome = tokio::task::spawn_blocking(move || hasher.verify(&password, &stored))
            .await
            .map_err(|e| AppError::Internal(format!("Verify task failed: {}", e)))?;

        match outcome {
            Ok(matched) => Ok(matched),
            Err(e) => {
                tracing::error!("Stored password hash rejected: {}", e);
                Ok(false)
            }
        }
    }

    /// Creates an account with a fresh snowflake id.
    pub async fn register(&self, registration: Registration) -> Result<User> {
        tracing::debug!("📝 Registering user: {}", registration.username);
        let password_hash = self.hash_password(&registration.password).await?;

        let user = self
            .users
            .create(NewUser {
                id: self.ids.next(),
                name: registration.name,
                username: registration.username,
                email: registration.email,
                password_hash,
                role: registration.role,
                major: registration.major,
                year: registration.year,
            })
            .await?;

        tracing::info!("✅ User created with ID: {}", user.id);
        Ok(user)
    }

    /// Checks credentials and opens a new session.
    ///
    /// Unknown login, deleted account and wrong password are all
    /// [`AppError::InvalidCredentials`].
    pub async fn login(&self, credentials: &Credentials, client: ClientInfo) -> Result<IssuedSession> {
        let login = credentials
            .login()
            .ok_or_else(|| AppError::Validation("Username or email is required".to_string()))?;
        if credentials.password.is_empty() {
            return Err(AppError::Validation("Password is required".to_string()));
        }

        let user = match self.users.find_by_login(login).await? {
            Some(user) => user,
            None => {
                self.verify_password(&credentials.password, &self.dummy_hash).await?;
                return Err(AppError::InvalidCredentials);
            }
        };

        if !self.verify_password(&credentials.password, &user.password).await? {
            return Err(AppError::InvalidCredentials);
        }

        let session_id = self.ids.next();
        let token = self.codec.encrypt(user.id, session_id)?;

        let record = SessionRecord::new(&user, session_id, client, Utc::now());
        self.sessions.put(&record, self.session_ttl).await?;

        tracing::info!("✅ User logged in: {} (session {})", user.id, session_id);
        Ok(IssuedSession {
            token,
            user_id: user.id,
            session_id,
        })
    }

    /// Resolves a bearer token to the caller's identity.
    ///
    /// Undecodable tokens and missing or expired sessions are both
    /// [`AppError::Unauthorized`]; store failures stay server errors.
    pub async fn authenticate(&self, token: &str) -> Result<Identity> {
        let claims = self.codec.decrypt(token).map_err(|_| {
            tracing::warn!("Token rejected");
            AppError::Unauthorized
        })?;

        let record = self
            .sessions
            .get(claims.user_id, claims.session_id)
            .await?
            .ok_or_else(|| {
                tracing::debug!("No live session for user {}", claims.user_id);
                AppError::Unauthorized
            })?;

        Ok(Identity::from(record))
    }

    /// Ends the session behind `token`. Idempotent; an undecodable token is
    /// already logged out.
    pub async fn logout(&self, token: &str) -> Result<()> {
        let Ok(claims) = self.codec.decrypt(token) else {
            tracing::debug!("Logout with undecodable token ignored");
            return Ok(());
        };

        self.sessions.delete(claims.user_id, claims.session_id).await?;
        tracing::info!("👋 Session {} closed for user {}", claims.session_id, claims.user_id);
        Ok(())
    }

    /// Replaces the caller's password after re-checking the current one.
    pub async fn change_password(&self, identity: &Identity, old_password: &str, new_password: &str) -> Result<()> {
        let user = self
            .users
            .find_by_id(identity.user_id)
            .await?
            .ok_or(AppError::Unauthorized)?;

        if !self.verify_password(old_password, &user.password).await? {
            return Err(AppError::InvalidCredentials);
        }

        let new_hash = self.hash_password(new_password).await?;
        self.users.update_password(user.id, &new_hash).await?;

        tracing::info!("✅ Password changed for user: {}", user.id);
        Ok(())
    }

    /// Looks up an active user.
    pub async fn find_user(&self, id: i64) -> Result<User> {
        self.users.find_by_id(id).await?.ok_or(AppError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Argon2Settings;
    use crate::repositories::{session::MemorySessionStore, user::MemoryUserRepository};

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct Fixture {
        authority: SessionAuthority,
        users: Arc<MemoryUserRepository>,
        sessions: Arc<MemorySessionStore>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemoryUserRepository::new());
        let sessions = Arc::new(MemorySessionStore::new("test"));
        let authority = SessionAuthority::new(
            users.clone(),
            sessions.clone(),
            Arc::new(IdGenerator::new(1).unwrap()),
            TokenCodec::new(KEY).unwrap(),
            PasswordHasher::new(Argon2Settings {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
            }),
            Duration::from_secs(24 * 3600),
        )
        .unwrap();
        Fixture { authority, users, sessions }
    }

    async fn register_alice(authority: &SessionAuthority) -> User {
        authority
            .register(Registration {
                name: "Alice".into(),
                username: "alice".into(),
                email: "alice@campus.test".into(),
                password: "correct-horse".into(),
                role: Role::Student,
                major: Some("Sistem Informasi".into()),
                year: Some(2022),
            })
            .await
            .unwrap()
    }

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials {
            username: Some(username.into()),
            email: None,
            password: password.into(),
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            ip: "10.1.2.3".into(),
            user_agent: "tests".into(),
        }
    }

    #[tokio::test]
    async fn login_authenticate_logout() {
        let f = fixture();
        let alice = register_alice(&f.authority).await;

        let issued = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();
        assert!(!issued.token.is_empty());
        assert_eq!(issued.user_id, alice.id);

        let identity = f.authority.authenticate(&issued.token).await.unwrap();
        assert_eq!(identity.user_id, alice.id);
        assert_eq!(identity.session_id, issued.session_id);
        assert_eq!(identity.session.ip, "10.1.2.3");
        assert_eq!(identity.session.major.as_deref(), Some("Sistem Informasi"));

        f.authority.logout(&issued.token).await.unwrap();
        assert!(matches!(
            f.authority.authenticate(&issued.token).await,
            Err(AppError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn login_by_email() {
        let f = fixture();
        register_alice(&f.authority).await;
        let creds = Credentials {
            username: None,
            email: Some("alice@campus.test".into()),
            password: "correct-horse".into(),
        };
        assert!(f.authority.login(&creds, client()).await.is_ok());
    }

    #[tokio::test]
    async fn bad_credentials_look_the_same() {
        let f = fixture();
        let alice = register_alice(&f.authority).await;

        let wrong = f.authority.login(&creds("alice", "wrong-pass"), client()).await;
        let unknown = f.authority.login(&creds("mallory", "correct-horse"), client()).await;
        f.users.soft_delete(alice.id).await;
        let deleted = f.authority.login(&creds("alice", "correct-horse"), client()).await;

        for outcome in [wrong, unknown, deleted] {
            assert!(matches!(outcome, Err(AppError::InvalidCredentials)));
        }
        assert_eq!(f.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn missing_fields_are_validation_errors() {
        let f = fixture();
        for c in [
            Credentials { username: None, email: None, password: "x".into() },
            Credentials { username: Some("  ".into()), email: None, password: "x".into() },
            creds("alice", ""),
        ] {
            assert!(matches!(
                f.authority.login(&c, client()).await,
                Err(AppError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn every_login_gets_its_own_session() {
        let f = fixture();
        register_alice(&f.authority).await;
        let a = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();
        let b = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(f.sessions.len().await, 2);

        f.authority.logout(&a.token).await.unwrap();
        assert!(f.authority.authenticate(&b.token).await.is_ok());
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let f = fixture();
        register_alice(&f.authority).await;
        let issued = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();

        assert!(f.authority.logout(&issued.token).await.is_ok());
        assert!(f.authority.logout(&issued.token).await.is_ok());
        assert!(f.authority.logout("garbage").await.is_ok());
    }

    #[tokio::test]
    async fn evicted_session_equals_never_created() {
        let f = fixture();
        register_alice(&f.authority).await;
        let issued = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();
        f.sessions.evict(issued.user_id, issued.session_id).await;

        let forged = TokenCodec::new(KEY).unwrap().encrypt(issued.user_id, 42).unwrap();
        let evicted = f.authority.authenticate(&issued.token).await.unwrap_err();
        let never = f.authority.authenticate(&forged).await.unwrap_err();
        assert!(matches!(evicted, AppError::Unauthorized));
        assert!(matches!(never, AppError::Unauthorized));
    }

    #[tokio::test(start_paused = true)]
    async fn session_expires_after_ttl() {
        let f = fixture();
        register_alice(&f.authority).await;
        let issued = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();

        tokio::time::advance(Duration::from_secs(24 * 3600 - 1)).await;
        assert!(f.authority.authenticate(&issued.token).await.is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            f.authority.authenticate(&issued.token).await,
            Err(AppError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn token_from_another_key_is_unauthorized() {
        let f = fixture();
        register_alice(&f.authority).await;
        let issued = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();
        let foreign = TokenCodec::new(b"fedcba9876543210")
            .unwrap()
            .encrypt(issued.user_id, issued.session_id)
            .unwrap();
        assert!(matches!(
            f.authority.authenticate(&foreign).await,
            Err(AppError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn change_password_requires_current_one() {
        let f = fixture();
        register_alice(&f.authority).await;
        let issued = f.authority.login(&creds("alice", "correct-horse"), client()).await.unwrap();
        let identity = f.authority.authenticate(&issued.token).await.unwrap();

        assert!(matches!(
            f.authority.change_password(&identity, "nope", "battery-staple").await,
            Err(AppError::InvalidCredentials)
        ));
        f.authority
            .change_password(&identity, "correct-horse", "battery-staple")
            .await
            .unwrap();

        assert!(f.authority.login(&creds("alice", "correct-horse"), client()).await.is_err());
        assert!(f.authority.login(&creds("alice", "battery-staple"), client()).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let f = fixture();
        register_alice(&f.authority).await;
        let err = f
            .authority
            .register(Registration {
                name: "Other".into(),
                username: "alice".into(),
                email: "other@campus.test".into(),
                password: "whatever-123".into(),
                role: Role::Student,
                major: None,
                year: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
