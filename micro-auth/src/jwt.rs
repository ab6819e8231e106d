use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tracing::{debug, warn};

use crate::error::AuthError;

/// JWT validation parameters.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub allowed_algorithms: Vec<Algorithm>,
    /// When set, `iss` must match.
    pub issuer: Option<String>,
    /// When set, `aud` must match; otherwise audience is not validated.
    pub audience: Option<String>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        JwtConfig {
            allowed_algorithms: vec![Algorithm::HS256],
            issuer: None,
            audience: None,
        }
    }
}

/// Validates JWT tokens against a configured secret or public key and
/// returns the raw claims.
pub struct JwtValidator {
    key: DecodingKey,
    config: JwtConfig,
}

impl JwtValidator {
    /// Shared-secret validator (HS family).
    pub fn from_secret(secret: &[u8], config: JwtConfig) -> Self {
        JwtValidator {
            key: DecodingKey::from_secret(secret),
            config,
        }
    }

    /// Public-key validator (RS/ES family), PEM input.
    pub fn from_rsa_pem(pem: &[u8], mut config: JwtConfig) -> Result<Self, AuthError> {
        if config.allowed_algorithms == vec![Algorithm::HS256] {
            config.allowed_algorithms = vec![Algorithm::RS256];
        }
        Ok(JwtValidator {
            key: DecodingKey::from_rsa_pem(pem)
                .map_err(|e| AuthError::InvalidToken(e.to_string()))?,
            config,
        })
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    /// Validate signature and standard claims (`exp`, `nbf`, optional
    /// `iss`/`aud`), returning the claims as a JSON value.
    pub fn validate(&self, token: &str) -> Result<serde_json::Value, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("failed to decode header: {e}")))?;

        if self.config.allowed_algorithms.is_empty() {
            return Err(AuthError::ValidationFailed(
                "no allowed JWT algorithms configured".into(),
            ));
        }
        if !self.config.allowed_algorithms.contains(&header.alg) {
            return Err(AuthError::ValidationFailed(format!(
                "disallowed JWT algorithm: {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.algorithms = self.config.allowed_algorithms.clone();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let data = decode::<serde_json::Value>(token, &self.key, &validation).map_err(|e| {
            let err = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    AuthError::ValidationFailed("invalid issuer".into())
                }
                jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    AuthError::ValidationFailed("invalid audience".into())
                }
                _ => AuthError::InvalidToken(e.to_string()),
            };
            warn!(error = %err, "jwt validation failed");
            err
        })?;

        let sub = data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        debug!(sub = %sub, "jwt validated");
        Ok(data.claims)
    }
}

/// Pull a bearer token out of an `Authorization` header value.
pub fn bearer_token(header_value: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(AuthError::InvalidAuthScheme)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::InvalidAuthScheme);
    }
    Ok(token.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    fn token_with(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    #[test]
    fn valid_token_returns_claims() {
        let token = token_with(serde_json::json!({
            "sub": "u-1",
            "preferred_username": "ada",
            "roles": ["admin"],
            "exp": now() + 60,
        }));
        let validator = JwtValidator::from_secret(SECRET, JwtConfig::default());
        let claims = validator.validate(&token).unwrap();
        assert_eq!(claims["sub"], "u-1");
        assert_eq!(claims["roles"][0], "admin");
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token_with(serde_json::json!({"sub": "u-1", "exp": now() - 600}));
        let validator = JwtValidator::from_secret(SECRET, JwtConfig::default());
        match validator.validate(&token) {
            Err(AuthError::TokenExpired) => {}
            other => panic!("expected expiry, got {other:?}"),
        }
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token_with(serde_json::json!({"sub": "u-1", "exp": now() + 60}));
        let validator = JwtValidator::from_secret(b"other-secret", JwtConfig::default());
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn issuer_is_pinned_when_configured() {
        let token = token_with(serde_json::json!({
            "sub": "u-1",
            "iss": "https://issuer.example",
            "exp": now() + 60,
        }));
        let validator = JwtValidator::from_secret(
            SECRET,
            JwtConfig {
                issuer: Some("https://issuer.example".into()),
                ..Default::default()
            },
        );
        assert!(validator.validate(&token).is_ok());

        let validator = JwtValidator::from_secret(
            SECRET,
            JwtConfig {
                issuer: Some("https://other.example".into()),
                ..Default::default()
            },
        );
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token("bearer abc").unwrap(), "abc");
        assert!(bearer_token("Basic abc").is_err());
        assert!(bearer_token("Bearer").is_err());
    }
}
