//! Client-side session model

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Profile snapshot kept alongside the tokens so the UI can render the
/// signed-in user without a round trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Role or account type (student, instructor, admin, ...)
    #[serde(default, alias = "accountType")]
    pub role: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Authoritative client-side authentication state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Short-lived bearer token attached to authorized requests
    pub access_token: Option<String>,
    /// Long-lived token only ever sent to the refresh endpoint
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
    /// Program the learner is enrolled through
    pub program_type: Option<String>,
}

impl Session {
    /// Session established by a successful login or signup
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            ..Self::default()
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_program_type(mut self, program_type: impl Into<String>) -> Self {
        self.program_type = Some(program_type.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    /// Whether any session field is still set
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.user.is_none()
            && self.program_type.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_accepts_numeric_id_and_account_type() {
        let profile: UserProfile = serde_json::from_value(json!({
            "id": 42,
            "name": "Ada",
            "email": "ada@example.com",
            "accountType": "instructor"
        }))
        .unwrap();

        assert_eq!(profile.id, "42");
        assert_eq!(profile.role.as_deref(), Some("instructor"));
        assert!(profile.avatar.is_none());
    }

    #[test]
    fn test_profile_rejects_object_id() {
        let result = serde_json::from_value::<UserProfile>(json!({ "id": { "oid": 1 } }));
        assert!(result.is_err());
    }

    #[test]
    fn test_authenticated_tracks_access_token() {
        let session = Session::default();
        assert!(!session.is_authenticated());
        assert!(session.is_empty());

        let session = Session::new("abc").with_refresh_token("def");
        assert!(session.is_authenticated());
        assert!(!session.is_empty());
    }
}
