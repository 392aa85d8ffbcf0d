use derive_more::{Display, From, Into};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Authenticated session identifier (opaque, unguessable).
///
/// Issued once a caller has a team-scoped parent credential. Carries no
/// authorization meaning by itself; the record it keys does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// Temporary identifier for a pending team selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SelectionId(pub String);

/// Canonical team identifier (e.g. `backend-team`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct TeamName(pub String);

impl TeamName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TeamName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// JWK key identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct KeyId(pub String);

/// How a flow was started. Only shapes responses; never grants anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOrigin {
    /// Browser flow started at `/auth/login`.
    Interactive,
    /// CLI / build-tool flow started at `/cli/start`.
    Headless,
}

impl FlowOrigin {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Interactive => "browser_pkce",
            Self::Headless => "cli_pkce",
        }
    }
}

/// Copy a secret without going through `Clone` on the wrapper.
pub(crate) fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_from_string() {
        let id = SessionId::from("sess-abc".to_string());
        assert_eq!(id.to_string(), "sess-abc");
    }

    #[test]
    fn team_name_serde_is_transparent() {
        let team = TeamName::from("backend-team");
        let json = serde_json::to_string(&team).unwrap();
        assert_eq!(json, "\"backend-team\"");
        let parsed: TeamName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, team);
    }

    #[test]
    fn origin_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FlowOrigin::Headless).unwrap(),
            "\"headless\""
        );
        assert_eq!(FlowOrigin::Interactive.label(), "browser_pkce");
    }

    #[test]
    fn newtypes_prevent_mixing() {
        fn takes_session_id(_: &SessionId) {}
        fn takes_selection_id(_: &SelectionId) {}

        let session = SessionId::from("id".to_string());
        let selection = SelectionId::from("id".to_string());

        takes_session_id(&session);
        takes_selection_id(&selection);
        // takes_session_id(&selection);  // Compile error!
    }
}
