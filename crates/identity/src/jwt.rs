//! JWT issuance and validation for API access.

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username).
    pub sub: String,
    /// Resolved authority strings at issue time.
    pub authorities: Vec<String>,
    /// Issued at timestamp.
    pub iat: i64,
    /// Expiration timestamp.
    pub exp: i64,
}

impl Claims {
    /// Create new claims for a subject.
    pub fn new(subject: impl Into<String>, authorities: Vec<String>, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: subject.into(),
            authorities,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
        }
    }

    /// A token is expired from its expiry instant onward, not after it.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }

    /// Check whether the claims carry a given authority.
    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.iter().any(|a| a == authority)
    }

    /// Check whether the claims carry any of the given authorities.
    pub fn has_any_authority(&self, required: &[&str]) -> bool {
        required.iter().any(|a| self.has_authority(a))
    }
}

/// Configuration for JWT authentication.
#[derive(Clone)]
pub struct JwtConfig {
    /// Secret key for signing tokens.
    pub secret: String,
    /// Access token lifetime in seconds.
    pub access_ttl_secs: i64,
    /// Refresh token lifetime in seconds.
    pub refresh_ttl_secs: i64,
    /// Refresh token lifetime when the client asked to be remembered.
    pub remember_me_ttl_secs: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "development-secret-change-in-production".to_string(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 604_800,
            remember_me_ttl_secs: 2_592_000,
        }
    }
}

impl JwtConfig {
    /// Load from environment, falling back to development defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let secret = match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!("JWT_SECRET not set, using insecure development secret");
                defaults.secret
            }
        };

        Self {
            secret,
            access_ttl_secs: env_i64("JWT_ACCESS_TTL_SECS", defaults.access_ttl_secs),
            refresh_ttl_secs: env_i64("JWT_REFRESH_TTL_SECS", defaults.refresh_ttl_secs),
            remember_me_ttl_secs: env_i64(
                "JWT_REMEMBER_ME_TTL_SECS",
                defaults.remember_me_ttl_secs,
            ),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// JWT authentication handler.
pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: JwtConfig,
    validation: Validation,
}

impl JwtAuth {
    /// Create a new JWT authenticator.
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        let validation = Validation::default();

        Self {
            encoding_key,
            decoding_key,
            config,
            validation,
        }
    }

    /// Issue a short-lived access token carrying the resolved authorities.
    pub fn issue_access_token(&self, subject: &str, authorities: Vec<String>) -> Result<String> {
        let claims = Claims::new(subject, authorities, self.config.access_ttl_secs);
        self.encode_claims(&claims)
    }

    /// Issue a refresh token. `remember_me` selects the long-lived tier.
    pub fn issue_refresh_token(
        &self,
        subject: &str,
        authorities: Vec<String>,
        remember_me: bool,
    ) -> Result<String> {
        let ttl = if remember_me {
            self.config.remember_me_ttl_secs
        } else {
            self.config.refresh_ttl_secs
        };
        let claims = Claims::new(subject, authorities, ttl);
        self.encode_claims(&claims)
    }

    /// Encode prepared claims into a signed token.
    pub fn encode_claims(&self, claims: &Claims) -> Result<String> {
        let token = encode(&Header::default(), claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Validate signature and expiry and return the claims.
    ///
    /// The decoder applies its default leeway, so expiry is re-checked here
    /// against the exact expiration instant.
    pub fn decode(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        let claims = token_data.claims;
        if claims.is_expired_at(Utc::now().timestamp()) {
            return Err(anyhow!("Token is expired"));
        }
        Ok(claims)
    }

    /// Check a token against an expected subject. Fails closed: any decode
    /// failure, expiry, or subject mismatch yields `false`.
    pub fn is_valid(&self, token: &str, expected_subject: &str) -> bool {
        match self.decode(token) {
            Ok(claims) => claims.sub == expected_subject,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected token");
                false
            }
        }
    }

    /// Pull the subject out of a token after full validation.
    pub fn extract_subject(&self, token: &str) -> Result<String> {
        Ok(self.decode(token)?.sub)
    }

    /// Access token lifetime advertised to clients.
    pub fn access_ttl_secs(&self) -> i64 {
        self.config.access_ttl_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_auth() -> JwtAuth {
        JwtAuth::new(JwtConfig {
            secret: "test-secret-key-12345".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_issue_and_decode_access_token() {
        let auth = create_test_auth();

        let token = auth
            .issue_access_token("alice", vec!["ROLE_USER".to_string()])
            .unwrap();
        let claims = auth.decode(&token).unwrap();

        assert_eq!(claims.sub, "alice");
        assert!(claims.has_authority("ROLE_USER"));
        assert!(!claims.has_authority("ROLE_ADMIN"));
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_token_expired_exactly_at_expiry() {
        let claims = Claims::new("alice", vec![], 0);
        assert!(claims.is_expired_at(claims.exp));
        assert!(claims.is_expired_at(claims.exp + 1));
        assert!(!claims.is_expired_at(claims.exp - 1));
    }

    #[test]
    fn test_decode_rejects_expired_despite_leeway() {
        let auth = create_test_auth();

        // Zero-lifetime token: the decoder's leeway alone would accept it.
        let claims = Claims::new("alice", vec![], 0);
        let token = auth.encode_claims(&claims).unwrap();

        assert!(auth.decode(&token).is_err());
        assert!(!auth.is_valid(&token, "alice"));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = create_test_auth();

        let token = auth.issue_access_token("alice", vec![]).unwrap();
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });

        assert!(auth.decode(&tampered).is_err());
        assert!(!auth.is_valid(&tampered, "alice"));
    }

    #[test]
    fn test_subject_mismatch_rejected() {
        let auth = create_test_auth();

        let token = auth.issue_access_token("alice", vec![]).unwrap();
        assert!(auth.is_valid(&token, "alice"));
        assert!(!auth.is_valid(&token, "bob"));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let auth = create_test_auth();

        assert!(auth.decode("not-a-token").is_err());
        assert!(auth.extract_subject("not-a-token").is_err());
        assert!(!auth.is_valid("not-a-token", "alice"));
    }

    #[test]
    fn test_remember_me_extends_refresh_expiry() {
        let auth = create_test_auth();

        let standard = auth.issue_refresh_token("alice", vec![], false).unwrap();
        let extended = auth.issue_refresh_token("alice", vec![], true).unwrap();

        let standard_claims = auth.decode(&standard).unwrap();
        let extended_claims = auth.decode(&extended).unwrap();
        assert!(extended_claims.exp > standard_claims.exp);
    }

    #[test]
    fn test_any_authority_check() {
        let claims = Claims::new("alice", vec!["USER_READ".to_string()], 900);
        assert!(claims.has_any_authority(&["SYSTEM_MANAGE", "USER_READ"]));
        assert!(!claims.has_any_authority(&["SYSTEM_MANAGE", "USER_DELETE"]));
    }
}
