use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Membership role within an organization. Only the ordering matters:
/// `User < ReadWrite < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    ReadWrite,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::User, Role::ReadWrite, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::ReadWrite => "READWRITE",
            Role::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Role::User),
            "READWRITE" => Ok(Role::ReadWrite),
            "ADMIN" => Ok(Role::Admin),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Who is asking, on behalf of which organization, with what role.
///
/// Immutable once built: fields are private and there are no setters. A refreshed
/// view (for example after a role change) is a new value bound in a new scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantContext {
    organization_id: String,
    organization_slug: String,
    user_id: String,
    user_role: Role,
    request_id: String,
    created_at: DateTime<Utc>,
}

impl TenantContext {
    pub fn new(
        organization_id: impl Into<String>,
        organization_slug: impl Into<String>,
        user_id: impl Into<String>,
        user_role: Role,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            organization_slug: organization_slug.into(),
            user_id: user_id.into(),
            user_role,
            request_id: request_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn organization_slug(&self) -> &str {
        &self.organization_slug
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_role(&self) -> Role {
        self.user_role
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the context was built; clock skew clamps to zero
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    #[cfg(test)]
    pub(crate) fn backdate(mut self, by: chrono::Duration) -> Self {
        self.created_at = self.created_at - by;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::User < Role::ReadWrite);
        assert!(Role::ReadWrite < Role::Admin);
        assert_eq!(Role::ALL.iter().max(), Some(&Role::Admin));
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("readwrite".parse::<Role>().unwrap(), Role::ReadWrite);
        assert_eq!(" ADMIN ".parse::<Role>().unwrap(), Role::Admin);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_uppercase() {
        assert_eq!(serde_json::to_value(Role::ReadWrite).unwrap(), serde_json::json!("READWRITE"));
    }

    #[test]
    fn context_age_grows() {
        let ctx = TenantContext::new("org-1", "acme", "u1", Role::User, "req-1")
            .backdate(chrono::Duration::seconds(90));
        assert!(ctx.age() >= Duration::from_secs(90));
        assert_eq!(ctx.organization_slug(), "acme");
    }
}
