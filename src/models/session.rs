use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::user::{Role, User};

/// Where a login came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

/// Server-side state of one login, stored as a cache-store hash.
///
/// The profile fields are denormalised so protected handlers can answer
/// without a second database round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub user_id: i64,
    pub session_id: i64,
    pub username: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub major: Option<String>,
    pub year: Option<i32>,
    pub ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(user: &User, session_id: i64, client: ClientInfo, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            session_id,
            username: user.username.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            major: user.major.clone(),
            year: user.year,
            ip: client.ip,
            user_agent: client.user_agent,
            created_at,
        }
    }

    /// Flattens the record into hash fields. Absent optionals are omitted.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("user_id", self.user_id.to_string()),
            ("session_id", self.session_id.to_string()),
            ("username", self.username.clone()),
            ("email", self.email.clone()),
            ("name", self.name.clone()),
            ("role", self.role.to_string()),
            ("ip", self.ip.clone()),
            ("user_agent", self.user_agent.clone()),
            ("created_at", self.created_at.timestamp().to_string()),
        ];
        if let Some(major) = &self.major {
            fields.push(("major", major.clone()));
        }
        if let Some(year) = self.year {
            fields.push(("year", year.to_string()));
        }
        fields
    }

    /// Rebuilds a record from hash fields.
    ///
    /// Returns `None` when a required field is missing or unparseable.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get = |name: &str| fields.get(name).cloned();
        Some(Self {
            user_id: get("user_id")?.parse().ok()?,
            session_id: get("session_id")?.parse().ok()?,
            username: get("username")?,
            email: get("email").unwrap_or_default(),
            name: get("name").unwrap_or_default(),
            role: get("role")?.parse().ok()?,
            major: get("major"),
            year: match get("year") {
                Some(y) => Some(y.parse().ok()?),
                None => None,
            },
            ip: get("ip").unwrap_or_default(),
            user_agent: get("user_agent").unwrap_or_default(),
            created_at: Utc
                .timestamp_opt(get("created_at")?.parse().ok()?, 0)
                .single()?,
        })
    }
}

/// The authenticated caller, attached to the request by the auth middleware
/// and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub session_id: i64,
    pub username: String,
    pub role: Role,
    pub session: SessionRecord,
}

impl From<SessionRecord> for Identity {
    fn from(session: SessionRecord) -> Self {
        Self {
            user_id: session.user_id,
            session_id: session.session_id,
            username: session.username.clone(),
            role: session.role,
            session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            user_id: 11,
            session_id: 22,
            username: "alice".into(),
            email: "alice@campus.test".into(),
            name: "Alice".into(),
            role: Role::Lecturer,
            major: Some("Teknik Informatika".into()),
            year: Some(2021),
            ip: "10.0.0.1".into(),
            user_agent: "curl/8".into(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn fields_rebuild_the_record() {
        let rec = record();
        assert_eq!(SessionRecord::from_fields(&as_map(rec.to_fields())), Some(rec));

        let bare = SessionRecord { major: None, year: None, ..record() };
        let map = as_map(bare.to_fields());
        assert!(!map.contains_key("major"));
        assert_eq!(SessionRecord::from_fields(&map), Some(bare));
    }

    #[test]
    fn missing_required_field_is_none() {
        for field in ["user_id", "session_id", "username", "role", "created_at"] {
            let mut map = as_map(record().to_fields());
            map.remove(field);
            assert!(SessionRecord::from_fields(&map).is_none(), "{}", field);
        }
        assert!(SessionRecord::from_fields(&HashMap::new()).is_none());
    }

    #[test]
    fn identity_mirrors_record() {
        let id = Identity::from(record());
        assert_eq!(id.user_id, 11);
        assert_eq!(id.session_id, 22);
        assert_eq!(id.role, Role::Lecturer);
    }
}
