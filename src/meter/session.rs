//! Signed, short-lived session tokens.
//!
//! Format: `base64url(claims_json) "." base64url(hmac_sha256(first_segment))`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use super::store_types::Role;
use crate::error::{MeterError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct SessionSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("key", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionSigner {
    pub fn new(secret: &str, ttl: Duration) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(MeterError::invalid("session secret must not be empty"));
        }
        if !ttl.is_positive() {
            return Err(MeterError::invalid("session ttl must be positive"));
        }
        Ok(Self {
            key: secret.as_bytes().to_vec(),
            ttl,
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|err| MeterError::Internal {
            message: format!("invalid session hmac key: {err}"),
        })
    }

    pub fn issue(&self, account_id: &str, role: Role, now: OffsetDateTime) -> Result<String> {
        let claims = SessionClaims {
            sub: account_id.to_string(),
            role,
            iat: now.unix_timestamp(),
            exp: (now + self.ttl).unix_timestamp(),
        };
        let payload = serde_json::to_vec(&claims).map_err(|err| MeterError::Internal {
            message: format!("encode session claims: {err}"),
        })?;
        let body = URL_SAFE_NO_PAD.encode(payload);

        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{body}.{signature}"))
    }

    /// Checks the signature before looking at the claims, then the expiry.
    pub fn verify(&self, token: &str, now: OffsetDateTime) -> Result<SessionClaims> {
        let invalid = |reason: &str| MeterError::CredentialInvalid {
            reason: reason.to_string(),
        };
        let (body, signature) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| invalid("malformed session token"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| invalid("malformed session signature"))?;

        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| invalid("bad session signature"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| invalid("malformed session claims"))?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| invalid("malformed session claims"))?;

        if claims.exp <= now.unix_timestamp() {
            return Err(MeterError::CredentialExpired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn signer() -> SessionSigner {
        SessionSigner::new("test-secret", Duration::days(7)).expect("signer")
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let signer = signer();
        let now = datetime!(2026-03-01 12:00 UTC);
        let token = signer.issue("acc-1", Role::Admin, now).expect("issue");

        let claims = signer
            .verify(&token, now + Duration::days(6))
            .expect("valid");
        assert_eq!(claims.sub, "acc-1");
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.exp - claims.iat, 7 * 24 * 60 * 60);

        let err = signer
            .verify(&token, now + Duration::days(7))
            .expect_err("expired");
        assert!(matches!(err, MeterError::CredentialExpired));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let signer = signer();
        let now = datetime!(2026-03-01 12:00 UTC);
        let token = signer.issue("acc-1", Role::Normal, now).expect("issue");
        let (_, signature) = token.split_once('.').expect("two segments");

        let forged_claims = SessionClaims {
            sub: "acc-2".to_string(),
            role: Role::Admin,
            iat: now.unix_timestamp(),
            exp: now.unix_timestamp() + 3600,
        };
        let forged_body =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).expect("json"));
        let forged = format!("{forged_body}.{signature}");

        let err = signer.verify(&forged, now).expect_err("forged");
        assert!(matches!(err, MeterError::CredentialInvalid { .. }));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let now = datetime!(2026-03-01 12:00 UTC);
        let other = SessionSigner::new("other-secret", Duration::days(7)).expect("signer");
        let token = other.issue("acc-1", Role::Normal, now).expect("issue");
        assert!(matches!(
            signer().verify(&token, now),
            Err(MeterError::CredentialInvalid { .. })
        ));
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        let now = datetime!(2026-03-01 12:00 UTC);
        for token in ["", "no-dot", "abc.!!!", ".", "e30.AAAA"] {
            assert!(
                matches!(
                    signer().verify(token, now),
                    Err(MeterError::CredentialInvalid { .. })
                ),
                "token {token:?} should be invalid"
            );
        }
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(SessionSigner::new("  ", Duration::days(1)).is_err());
    }
}
