//! DT-007: HMAC-bound confirmation tokens.
//!
//! A token is `base64url(claims).base64url(mac)` where `claims` is the
//! canonical JSON of [`TokenClaims`] and `mac` is HMAC-SHA256 over those
//! exact bytes. Validation is stateless beyond the signing secret, so a
//! token minted before a restart still validates within its TTL.

use crate::core::error::{FilterError, FilterErrorCode};
use crate::core::types::ResolutionStatus;
use crate::tripwire::hasher;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Shortest accepted signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

pub const DEFAULT_TTL_SECONDS: u64 = 600;

/// Secret misconfiguration. Surfaced at startup, never per request.
#[derive(Debug, thiserror::Error)]
pub enum TokenConfigError {
    #[error("token secret: environment variable {0} is not set")]
    MissingSecret(String),

    #[error("token secret must be at least {min} bytes, got {len}")]
    SecretTooShort { len: usize, min: usize },

    #[error("token ttl must be > 0")]
    ZeroTtl,
}

/// Everything a token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBinding {
    pub session_id: String,
    pub schema_signature: String,
    pub dict_version: String,
    pub resolved_spec_hash: String,
    pub status: ResolutionStatus,
}

/// Signed payload: the binding plus an absolute expiry (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(flatten)]
    pub binding: TokenBinding,
    pub expires_at: u64,
}

impl TokenClaims {
    fn canonical_bytes(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "session_id": self.binding.session_id,
            "schema_signature": self.binding.schema_signature,
            "dict_version": self.binding.dict_version,
            "resolved_spec_hash": self.binding.resolved_spec_hash,
            "status": self.binding.status.as_str(),
            "expires_at": self.expires_at,
        });
        hasher::canonical_json(&value).into_bytes()
    }
}

/// Mints and validates tokens under one secret.
#[derive(Clone)]
pub struct TokenService {
    secret: SecretString,
    ttl_seconds: u64,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

fn invalid(message: impl Into<String>) -> FilterError {
    FilterError::new(FilterErrorCode::TokenInvalidOrExpired, message)
}

impl TokenService {
    pub fn new(secret: SecretString, ttl_seconds: u64) -> Result<Self, TokenConfigError> {
        let len = secret.expose_secret().len();
        if len < MIN_SECRET_LEN {
            return Err(TokenConfigError::SecretTooShort {
                len,
                min: MIN_SECRET_LEN,
            });
        }
        if ttl_seconds == 0 {
            return Err(TokenConfigError::ZeroTtl);
        }
        Ok(Self {
            secret,
            ttl_seconds,
        })
    }

    /// Read the secret from `var`. Fails fast when unset or short.
    pub fn from_env(var: &str, ttl_seconds: u64) -> Result<Self, TokenConfigError> {
        let secret =
            std::env::var(var).map_err(|_| TokenConfigError::MissingSecret(var.to_string()))?;
        Self::new(SecretString::from(secret), ttl_seconds)
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    fn compute_mac(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Mint a token for `binding`, expiring `ttl_seconds` after `now`.
    pub fn mint(&self, binding: &TokenBinding, now: u64) -> String {
        let claims = TokenClaims {
            binding: binding.clone(),
            expires_at: now.saturating_add(self.ttl_seconds),
        };
        let payload = claims.canonical_bytes();
        let mac = self.compute_mac(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac)
        )
    }

    /// Check MAC, expiry, then every bound field against `expected`.
    ///
    /// Spec-hash mismatch is reported separately from other binding
    /// failures so a substituted spec is distinguishable in audit.
    pub fn validate(
        &self,
        token: &str,
        expected: &TokenBinding,
        now: u64,
    ) -> Result<TokenClaims, FilterError> {
        let (payload_b64, mac_b64) = token
            .split_once('.')
            .ok_or_else(|| invalid("malformed token"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| invalid("malformed token payload"))?;
        let presented = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| invalid("malformed token signature"))?;

        let computed = self.compute_mac(&payload);
        if !bool::from(computed.ct_eq(&presented)) {
            tracing::warn!("confirmation token signature mismatch");
            return Err(invalid("token signature is invalid"));
        }

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| invalid("malformed token claims"))?;

        if now > claims.expires_at {
            return Err(invalid("token has expired"));
        }
        let bound = &claims.binding;
        if bound.session_id != expected.session_id {
            return Err(invalid("token was issued to a different session"));
        }
        if bound.schema_signature != expected.schema_signature {
            return Err(invalid("token was issued against a different schema"));
        }
        if bound.dict_version != expected.dict_version {
            return Err(invalid(format!(
                "token was issued under dictionary {}, current is {}",
                bound.dict_version, expected.dict_version
            )));
        }
        if bound.resolved_spec_hash != expected.resolved_spec_hash {
            return Err(FilterError::new(
                FilterErrorCode::TokenHashMismatch,
                "token does not match the submitted spec",
            ));
        }
        if bound.status != expected.status {
            return Err(FilterError::new(
                FilterErrorCode::ConfirmationRequired,
                format!(
                    "token certifies a {} result, expected {}",
                    bound.status, expected.status
                ),
            ));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn service() -> TokenService {
        TokenService::new(SecretString::from(SECRET), 600).unwrap()
    }

    fn binding() -> TokenBinding {
        TokenBinding {
            session_id: "sess-1".into(),
            schema_signature: "sha256:schema".into(),
            dict_version: "canonical_dict_v1".into(),
            resolved_spec_hash: "sha256:spec".into(),
            status: ResolutionStatus::NeedsConfirmation,
        }
    }

    #[test]
    fn test_dt007_short_secret_rejected() {
        let err = TokenService::new(SecretString::from("short"), 600).unwrap_err();
        assert!(matches!(err, TokenConfigError::SecretTooShort { len: 5, .. }));
        assert!(matches!(
            TokenService::new(SecretString::from(SECRET), 0),
            Err(TokenConfigError::ZeroTtl)
        ));
    }

    #[test]
    fn test_dt007_from_env_missing() {
        let err = TokenService::from_env("DETENT_TEST_SECRET_THAT_IS_NEVER_SET", 600).unwrap_err();
        assert!(matches!(err, TokenConfigError::MissingSecret(_)));
    }

    #[test]
    fn test_dt007_mint_validate() {
        let svc = service();
        let tok = svc.mint(&binding(), 1_000);
        let claims = svc.validate(&tok, &binding(), 1_000).unwrap();
        assert_eq!(claims.expires_at, 1_600);
        assert!(svc.validate(&tok, &binding(), 1_600).is_ok());
    }

    #[test]
    fn test_dt007_survives_restart() {
        let tok = service().mint(&binding(), 1_000);
        let restarted = service();
        assert!(restarted.validate(&tok, &binding(), 1_200).is_ok());
    }

    #[test]
    fn test_dt007_expired() {
        let svc = service();
        let tok = svc.mint(&binding(), 1_000);
        let err = svc.validate(&tok, &binding(), 1_601).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::TokenInvalidOrExpired);
    }

    #[test]
    fn test_dt007_binding_mismatches() {
        let svc = service();
        let tok = svc.mint(&binding(), 1_000);

        let mut other = binding();
        other.session_id = "sess-2".into();
        assert_eq!(
            svc.validate(&tok, &other, 1_000).unwrap_err().code,
            FilterErrorCode::TokenInvalidOrExpired
        );

        let mut other = binding();
        other.schema_signature = "sha256:other".into();
        assert_eq!(
            svc.validate(&tok, &other, 1_000).unwrap_err().code,
            FilterErrorCode::TokenInvalidOrExpired
        );

        let mut other = binding();
        other.dict_version = "canonical_dict_v2".into();
        assert_eq!(
            svc.validate(&tok, &other, 1_000).unwrap_err().code,
            FilterErrorCode::TokenInvalidOrExpired
        );

        let mut other = binding();
        other.resolved_spec_hash = "sha256:substituted".into();
        assert_eq!(
            svc.validate(&tok, &other, 1_000).unwrap_err().code,
            FilterErrorCode::TokenHashMismatch
        );

        let mut other = binding();
        other.status = ResolutionStatus::Resolved;
        assert_eq!(
            svc.validate(&tok, &other, 1_000).unwrap_err().code,
            FilterErrorCode::ConfirmationRequired
        );
    }

    #[test]
    fn test_dt007_tampered_payload() {
        let svc = service();
        let tok = svc.mint(&binding(), 1_000);
        let (_, mac) = tok.split_once('.').unwrap();
        let mut forged = binding();
        forged.session_id = "attacker".into();
        let forged_claims = TokenClaims {
            binding: forged.clone(),
            expires_at: 99_999,
        };
        let forged_tok = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(forged_claims.canonical_bytes()),
            mac
        );
        let err = svc.validate(&forged_tok, &forged, 1_000).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::TokenInvalidOrExpired);
    }

    #[test]
    fn test_dt007_other_secret() {
        let tok = service().mint(&binding(), 1_000);
        let other =
            TokenService::new(SecretString::from("ffffffffffffffffffffffffffffffff"), 600).unwrap();
        assert!(other.validate(&tok, &binding(), 1_000).is_err());
    }

    #[test]
    fn test_dt007_garbage() {
        let svc = service();
        for t in ["", "abc", "a.b", "!!!.???"] {
            assert_eq!(
                svc.validate(t, &binding(), 0).unwrap_err().code,
                FilterErrorCode::TokenInvalidOrExpired
            );
        }
    }
}
