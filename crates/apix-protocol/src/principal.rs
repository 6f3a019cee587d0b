use serde::{Deserialize, Serialize};

/// A verified caller identity bound to exactly one tenant.
///
/// `user_id` is absent for service-to-service contexts. The `org_id` here
/// is the only source of tenant identity a downstream component may trust;
/// it must never be taken from a request body or WS frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub org_id: String,
    pub org_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn is_service(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Claims carried by a bearer token, as issued by the external IdentityStore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject -- the user id, absent for service tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub org_id: String,
    pub org_slug: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

impl From<TokenClaims> for Principal {
    fn from(claims: TokenClaims) -> Self {
        Principal {
            org_id: claims.org_id,
            org_slug: claims.org_slug,
            user_id: claims.sub,
            roles: claims.roles,
            permissions: claims.permissions,
        }
    }
}
