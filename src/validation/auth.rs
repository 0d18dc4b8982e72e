use garde::Validate;
use serde::Deserialize;

use crate::{
    error::{AppError, Result},
    models::user::Role,
};

/// The request payload for self-service registration. Always creates a
/// student; any `role` in the body is ignored.
#[derive(Deserialize, Debug, Validate)]
pub struct RegisterRequest {
    #[garde(length(min = 1, max = 255), custom(not_blank))]
    pub name: String,
    #[garde(length(min = 3, max = 255), custom(username_charset))]
    pub username: String,
    #[garde(email, length(max = 255))]
    pub email: String,
    #[garde(length(min = 8, max = 128))]
    pub password: String,
    #[garde(length(max = 255))]
    pub major: Option<String>,
    #[garde(range(min = 1900, max = 2100))]
    pub year: Option<i32>,
}

/// The request payload for an admin creating an account with a chosen role.
#[derive(Deserialize, Debug, Validate)]
pub struct CreateUserRequest {
    #[serde(flatten)]
    #[garde(dive)]
    pub account: RegisterRequest,
    #[serde(default)]
    #[garde(skip)]
    pub role: Role,
}

/// The request payload for changing a user's password.
#[derive(Deserialize, Debug, Validate)]
pub struct ChangePasswordRequest {
    #[garde(length(min = 1))]
    pub old_password: String,
    #[garde(length(min = 8, max = 128))]
    pub new_password: String,
}

fn not_blank(value: &str, _: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("cannot be blank"));
    }
    Ok(())
}

fn username_charset(value: &str, _: &()) -> garde::Result {
    if !value.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(garde::Error::new(
            "can only contain letters, numbers, dots, underscores, and hyphens",
        ));
    }
    Ok(())
}

/// Runs the derived rules and maps the report to [`AppError::Validation`].
///
/// # Arguments
///
/// * `payload` - The deserialized request body.
///
/// # Returns
///
/// A `Result<()>` indicating whether the payload is valid.
pub fn validate_payload<T: Validate<Context = ()>>(payload: &T) -> Result<()> {
    payload
        .validate()
        .map_err(|report| AppError::Validation(report.to_string().trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register() -> RegisterRequest {
        RegisterRequest {
            name: "Alice".into(),
            username: "alice".into(),
            email: "alice@campus.test".into(),
            password: "correct-horse".into(),
            major: None,
            year: Some(2022),
        }
    }

    #[test]
    fn accepts_valid_registration() {
        assert!(validate_payload(&register()).is_ok());
    }

    #[test]
    fn rejects_bad_fields() {
        let cases = [
            RegisterRequest { username: "al".into(), ..register() },
            RegisterRequest { username: "al ice".into(), ..register() },
            RegisterRequest { email: "not-an-email".into(), ..register() },
            RegisterRequest { password: "short".into(), ..register() },
            RegisterRequest { name: "   ".into(), ..register() },
            RegisterRequest { year: Some(1200), ..register() },
        ];
        for case in cases {
            assert!(
                matches!(validate_payload(&case), Err(AppError::Validation(_))),
                "{:?}",
                case
            );
        }
    }

    #[test]
    fn admin_payload_carries_role() {
        let req: CreateUserRequest = sonic_rs::from_str(
            r#"{"name":"A","username":"abc","email":"a@b.test","password":"12345678","role":"lecture"}"#,
        )
        .unwrap();
        assert_eq!(req.role, Role::Lecturer);
        assert_eq!(req.account.username, "abc");

        let req: CreateUserRequest = sonic_rs::from_str(
            r#"{"name":"A","username":"abc","email":"a@b.test","password":"12345678"}"#,
        )
        .unwrap();
        assert_eq!(req.role, Role::Student);
    }

    #[test]
    fn admin_payload_validates_the_account() {
        let req = CreateUserRequest {
            account: RegisterRequest { email: "nope".into(), ..register() },
            role: Role::Admin,
        };
        assert!(matches!(validate_payload(&req), Err(AppError::Validation(_))));
    }

    #[test]
    fn new_password_length_is_checked() {
        let req = ChangePasswordRequest {
            old_password: "old".into(),
            new_password: "tiny".into(),
        };
        assert!(validate_payload(&req).is_err());
    }
}
