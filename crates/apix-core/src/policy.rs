use crate::error::{CoreError, CoreResult};
use apix_protocol::{Principal, TokenClaims};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

/// Derives an authoritative `Principal` from incoming credentials and
/// enforces it uniformly (§4.1). Every downstream component accepts a
/// `Principal` and never reads raw credentials; `org_id` inside it is the
/// only source of tenant identity.
pub struct PolicyEngine {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl PolicyEngine {
    pub fn new(signing_secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        PolicyEngine {
            decoding_key: DecodingKey::from_secret(signing_secret.as_bytes()),
            validation,
        }
    }

    /// Verify a bearer token and derive a `Principal` from its claims.
    /// Credential sources (b)-(d) in §4.1 (resumption cookie, subdomain
    /// routing, explicit org/user headers) are handled by the transport
    /// layer before this call; this is the bearer-token path (a).
    pub fn build_context(&self, bearer_token: &str) -> CoreResult<Principal> {
        let data = decode::<TokenClaims>(bearer_token, &self.decoding_key, &self.validation)
            .map_err(|e| CoreError::Auth(e.to_string()))?;
        Ok(Principal::from(data.claims))
    }

    /// Build a `Principal` for a service caller from explicit org/user
    /// headers, bypassing token verification (§4.1 credential source d).
    pub fn build_service_context(
        &self,
        org_id: &str,
        org_slug: &str,
        user_id: Option<&str>,
    ) -> Principal {
        Principal {
            org_id: org_id.to_owned(),
            org_slug: org_slug.to_owned(),
            user_id: user_id.map(str::to_owned),
            roles: Vec::new(),
            permissions: Vec::new(),
        }
    }

    /// Reverify tenant existence and membership; used on session resume.
    /// Tenant/user existence is delegated to an external `MetadataStore`
    /// (out of scope, §1), so this only checks the shape of the principal
    /// itself -- a non-empty `org_id`.
    pub fn validate(&self, principal: &Principal) -> CoreResult<()> {
        if principal.org_id.is_empty() {
            return Err(CoreError::Auth("principal carries no org_id".into()));
        }
        Ok(())
    }

    /// `true` iff `permissions` grants `resource_type:action`, honoring the
    /// `resource_type:*` and `*:*` wildcard forms. An `admin` role always
    /// short-circuits to allow.
    pub fn allow(&self, principal: &Principal, action: &str, resource_type: &str) -> bool {
        if principal.roles.iter().any(|r| r == "admin") {
            return true;
        }
        let needed = format!("{resource_type}:{action}");
        let wildcard_resource = format!("{resource_type}:*");
        principal
            .permissions
            .iter()
            .any(|p| p == &needed || p == &wildcard_resource || p == "*:*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn claims(org_id: &str, exp_offset_secs: i64) -> TokenClaims {
        let now = chrono::Utc::now().timestamp();
        TokenClaims {
            sub: Some("user-1".into()),
            org_id: org_id.into(),
            org_slug: "acme".into(),
            roles: vec!["member".into()],
            permissions: vec!["channel:read".into()],
            iat: now,
            exp: now + exp_offset_secs,
        }
    }

    fn token_for(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn build_context_accepts_a_validly_signed_unexpired_token() {
        let engine = PolicyEngine::new("shh");
        let claims = claims("org1", 3600);
        let token = token_for(&claims, "shh");
        let principal = engine.build_context(&token).unwrap();
        assert_eq!(principal.org_id, "org1");
        assert_eq!(principal.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn build_context_rejects_wrong_signing_secret() {
        let engine = PolicyEngine::new("shh");
        let claims = claims("org1", 3600);
        let token = token_for(&claims, "other-secret");
        assert!(engine.build_context(&token).is_err());
    }

    #[test]
    fn allow_grants_exact_resource_action_match() {
        let engine = PolicyEngine::new("shh");
        let principal = Principal {
            org_id: "org1".into(),
            org_slug: "acme".into(),
            user_id: Some("u1".into()),
            roles: vec![],
            permissions: vec!["subscription:create".into()],
        };
        assert!(engine.allow(&principal, "create", "subscription"));
        assert!(!engine.allow(&principal, "delete", "subscription"));
    }

    #[test]
    fn allow_honors_wildcard_forms_and_admin_role() {
        let engine = PolicyEngine::new("shh");
        let wildcard_resource = Principal {
            org_id: "org1".into(),
            org_slug: "acme".into(),
            user_id: None,
            roles: vec![],
            permissions: vec!["endpoint:*".into()],
        };
        assert!(engine.allow(&wildcard_resource, "delete", "endpoint"));
        assert!(!engine.allow(&wildcard_resource, "delete", "subscription"));

        let admin = Principal {
            org_id: "org1".into(),
            org_slug: "acme".into(),
            user_id: None,
            roles: vec!["admin".into()],
            permissions: vec![],
        };
        assert!(engine.allow(&admin, "delete", "anything"));
    }
}
