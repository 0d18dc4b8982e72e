use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use tokio::sync::RwLock;
use tokio_postgres::{error::SqlState, Row};

use crate::{
    error::{AppError, Result},
    models::user::{NewUser, User},
};

const USER_COLUMNS: &str =
    "id, name, username, email, password, role, major, year, created_at, updated_at, deleted_at";

/// Persistent user accounts.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Finds an active user whose username or email equals `login`.
    async fn find_by_login(&self, login: &str) -> Result<Option<User>>;

    /// Finds an active user by id.
    async fn find_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Inserts a user. Duplicate username or email is [`AppError::Conflict`].
    async fn create(&self, user: NewUser) -> Result<User>;

    /// Replaces the stored password hash.
    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()>;
}

/// A helper function to map a `tokio_postgres::Row` to a `User`.
fn row_to_user(row: &Row) -> Result<User> {
    fn col<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, name: &str) -> Result<T> {
        row.try_get(name)
            .map_err(|e| AppError::Internal(format!("Column {}: {}", name, e)))
    }

    Ok(User {
        id: col(row, "id")?,
        name: col(row, "name")?,
        username: col(row, "username")?,
        email: col(row, "email")?,
        password: col(row, "password")?,
        role: col(row, "role")?,
        major: col(row, "major")?,
        year: col(row, "year")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        deleted_at: col(row, "deleted_at")?,
    })
}

/// `UserRepository` over the PostgreSQL pool.
#[derive(Clone)]
pub struct PgUserRepository {
    pool: Pool,
}

impl PgUserRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(&format!(
                "SELECT {} FROM users WHERE (username = $1 OR email = $1) AND deleted_at IS NULL",
                USER_COLUMNS
            ))
            .await?;
        let row = client.query_opt(&stmt, &[&login]).await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(&format!(
                "SELECT {} FROM users WHERE id = $1 AND deleted_at IS NULL",
                USER_COLUMNS
            ))
            .await?;
        let row = client.query_opt(&stmt, &[&id]).await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn create(&self, user: NewUser) -> Result<User> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(&format!(
                r#"
                INSERT INTO users (id, name, username, email, password, role, major, year)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {}
                "#,
                USER_COLUMNS
            ))
            .await?;
        let row = client
            .query_one(
                &stmt,
                &[
                    &user.id,
                    &user.name,
                    &user.username,
                    &user.email,
                    &user.password_hash,
                    &user.role,
                    &user.major,
                    &user.year,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                    AppError::Conflict("Username or email already exists".to_string())
                } else {
                    AppError::from(e)
                }
            })?;
        row_to_user(&row)
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE users
                SET password = $1, updated_at = NOW()
                WHERE id = $2 AND deleted_at IS NULL
                "#,
            )
            .await?;
        let updated = client.execute(&stmt, &[&password_hash, &id]).await?;
        if updated == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}

/// In-process `UserRepository` for tests and local runs without PostgreSQL.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<Vec<User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a user deleted, the way an admin soft-delete would.
    pub async fn soft_delete(&self, id: i64) {
        let mut users = self.users.write().await;
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.deleted_at = Some(Utc::now());
        }
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_login(&self, login: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .find(|u| u.is_active() && (u.username == login || u.email == login))
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.iter().find(|u| u.is_active() && u.id == id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<User> {
        let mut users = self.users.write().await;
        if users
            .iter()
            .any(|u| u.username == user.username || u.email == user.email)
        {
            return Err(AppError::Conflict(
                "Username or email already exists".to_string(),
            ));
        }
        let now = Utc::now();
        let created = User {
            id: user.id,
            name: user.name,
            username: user.username,
            email: user.email,
            password: user.password_hash,
            role: user.role,
            major: user.major,
            year: user.year,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        users.push(created.clone());
        Ok(created)
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.is_active() && u.id == id)
            .ok_or(AppError::NotFound)?;
        user.password = password_hash.to_string();
        user.updated_at = Utc::now();
        Ok(())
    }
}
