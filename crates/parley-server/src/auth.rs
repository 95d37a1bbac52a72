//! Identity resolution for the connection handshake.
//!
//! Identity is asserted by the client and accepted optimistically: any
//! non-blank user id is trusted. Real credential checks belong to an
//! upstream session layer.

use std::collections::HashSet;

use parley_core::ids::UserId;
use serde::{Deserialize, Serialize};

const MAX_USER_ID_LEN: usize = 128;

/// Claims sent by the client in the `auth` event.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthParams {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// May call `diagnostic:*` events.
    pub operator: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("missing user id")]
    MissingUserId,
    #[error("user id is too long")]
    UserIdTooLong,
}

pub struct Authenticator {
    operators: HashSet<String>,
}

impl Authenticator {
    pub fn new(operator_user_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            operators: operator_user_ids.into_iter().collect(),
        }
    }

    pub fn authenticate(&self, params: &AuthParams) -> Result<Identity, AuthRejection> {
        let user_id = params
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(AuthRejection::MissingUserId)?;
        if user_id.len() > MAX_USER_ID_LEN {
            return Err(AuthRejection::UserIdTooLong);
        }

        let username = params
            .username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from);

        Ok(Identity {
            user_id: UserId::from_raw(user_id),
            username,
            operator: self.operators.contains(user_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(user_id: Option<&str>, username: Option<&str>) -> AuthParams {
        AuthParams {
            user_id: user_id.map(String::from),
            username: username.map(String::from),
        }
    }

    #[test]
    fn accepts_any_present_user_id() {
        let auth = Authenticator::new(Vec::new());
        let identity = auth.authenticate(&params(Some(" u-1 "), Some("ada"))).unwrap();
        assert_eq!(identity.user_id.as_str(), "u-1");
        assert_eq!(identity.username.as_deref(), Some("ada"));
        assert!(!identity.operator);
    }

    #[test]
    fn rejects_missing_or_blank_user_id() {
        let auth = Authenticator::new(Vec::new());
        assert_eq!(auth.authenticate(&params(None, Some("ada"))), Err(AuthRejection::MissingUserId));
        assert_eq!(auth.authenticate(&params(Some("   "), None)), Err(AuthRejection::MissingUserId));
    }

    #[test]
    fn rejects_oversized_user_id() {
        let auth = Authenticator::new(Vec::new());
        let long = "x".repeat(MAX_USER_ID_LEN + 1);
        assert_eq!(auth.authenticate(&params(Some(&long), None)), Err(AuthRejection::UserIdTooLong));
    }

    #[test]
    fn operators_are_flagged() {
        let auth = Authenticator::new(vec!["ops".to_string()]);
        assert!(auth.authenticate(&params(Some("ops"), None)).unwrap().operator);
        assert!(!auth.authenticate(&params(Some("ops2"), None)).unwrap().operator);
    }
}
