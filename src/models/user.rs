use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of account roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "lowercase")]
#[postgres(name = "user_role")]
pub enum Role {
    #[postgres(name = "admin")]
    Admin,
    /// Older clients send `lecture`.
    #[serde(alias = "lecture")]
    #[postgres(name = "lecturer")]
    Lecturer,
    #[postgres(name = "student")]
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Lecturer => "lecturer",
            Role::Student => "student",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Student
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "lecturer" | "lecture" => Ok(Role::Lecturer),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Represents a user in the system.
#[derive(Clone, Debug)]
pub struct User {
    /// Snowflake id.
    pub id: i64,
    /// The user's full name.
    pub name: String,
    /// The user's username.
    pub username: String,
    /// The user's email address.
    pub email: String,
    /// Argon2 PHC string.
    pub password: String,
    pub role: Role,
    pub major: Option<String>,
    pub year: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the account was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Fields needed to insert a user.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub major: Option<String>,
    pub year: Option<i32>,
}

/// What other users may see of an account.
#[derive(Debug, Clone, Serialize)]
pub struct PublicProfile {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub major: Option<String>,
    pub year: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for PublicProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            major: user.major.clone(),
            year: user.year,
            created_at: user.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_accepts_legacy_spelling() {
        assert_eq!("lecture".parse::<Role>().unwrap(), Role::Lecturer);
        assert_eq!("Lecturer".parse::<Role>().unwrap(), Role::Lecturer);
        assert_eq!("ADMIN".parse::<Role>().unwrap(), Role::Admin);
        assert!("dean".parse::<Role>().is_err());
    }

    #[test]
    fn role_round_trips_through_display() {
        for role in [Role::Admin, Role::Lecturer, Role::Student] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
    }
}
