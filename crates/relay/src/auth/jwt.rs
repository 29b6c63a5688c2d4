use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::{AuthError, TokenVerifier, VerifiedClaims, VerifyFuture, WorkspaceRole};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    workspace_id: Uuid,
    role: WorkspaceRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diagram_id: Option<Uuid>,
    iat: i64,
    exp: i64,
}

/// HS256 access tokens scoped to a workspace and optionally one diagram.
#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        role: WorkspaceRole,
        diagram_id: Option<Uuid>,
    ) -> anyhow::Result<String> {
        self.issue_token_at(user_id, workspace_id, role, diagram_id, current_unix_timestamp()?)
    }

    pub(crate) fn issue_token_at(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        role: WorkspaceRole,
        diagram_id: Option<Uuid>,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            workspace_id,
            role,
            diagram_id,
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn validate_token(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(error.to_string()),
            })?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| {
            AuthError::Invalid(format!("access token subject '{}' is not a UUID", claims.sub))
        })?;

        Ok(VerifiedClaims {
            user_id,
            workspace_id: claims.workspace_id,
            role: claims.role,
            diagram_id: claims.diagram_id,
        })
    }
}

impl TokenVerifier for JwtAccessTokenService {
    fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a> {
        Box::pin(async move { self.validate_token(token) })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtAccessTokenService, ACCESS_TOKEN_TTL_SECONDS};
    use crate::auth::{AuthError, TokenVerifier, WorkspaceRole};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;
    use uuid::Uuid;

    const TEST_SECRET: &str = "erdsync_test_secret_that_is_definitely_long_enough";

    fn service() -> JwtAccessTokenService {
        JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize")
    }

    #[test]
    fn short_secrets_are_refused() {
        assert!(JwtAccessTokenService::new("short").is_err());
    }

    #[tokio::test]
    async fn issues_and_verifies_diagram_scoped_tokens() {
        let service = service();
        let user_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        let diagram_id = Uuid::new_v4();

        let token = service
            .issue_token(user_id, workspace_id, WorkspaceRole::Editor, Some(diagram_id))
            .expect("token should be issued");
        let claims = service.verify(&token).await.expect("token should verify");

        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.workspace_id, workspace_id);
        assert_eq!(claims.role, WorkspaceRole::Editor);
        assert_eq!(claims.diagram_id, Some(diagram_id));
    }

    #[test]
    fn rejects_tampered_tokens() {
        let service = service();
        let token = service
            .issue_token(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Owner, None)
            .expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(matches!(service.validate_token(&tampered), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn expired_tokens_report_expiry() {
        let service = service();
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token = service
            .issue_token_at(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Viewer, None, issued_at)
            .expect("token should be issued");

        assert_eq!(service.validate_token(&token), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_tokens_with_invalid_subject_claim() {
        #[derive(Serialize)]
        struct InvalidSubjectClaims {
            sub: &'static str,
            workspace_id: Uuid,
            role: &'static str,
            iat: i64,
            exp: i64,
        }

        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims = InvalidSubjectClaims {
            sub: "not-a-uuid",
            workspace_id: Uuid::new_v4(),
            role: "editor",
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECONDS,
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(matches!(service().validate_token(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn only_owners_and_editors_can_edit() {
        assert!(WorkspaceRole::Owner.can_edit());
        assert!(WorkspaceRole::Editor.can_edit());
        assert!(!WorkspaceRole::Commenter.can_edit());
        assert!(!WorkspaceRole::Viewer.can_edit());
    }
}
