use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::context::UserIdentity;
use crate::error::TokenError;

type HmacSha256 = Hmac<sha2::Sha256>;

/// Claims carried by a user token minted by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTokenClaims {
    pub user: UserIdentity,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl UserTokenClaims {
    pub fn new(user: UserIdentity, ttl: Duration) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            user,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    /// Returns `Ok(())` if token has not yet expired.
    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), TokenError> {
        if now > self.expires_at {
            Err(TokenError::Expired)
        } else {
            Ok(())
        }
    }
}

/// Mints and verifies `<payload>.<mac>` tokens, both parts URL-safe base64,
/// the MAC being HMAC-SHA256 over the encoded payload.
#[derive(Clone)]
pub struct UserTokenSigner {
    secret: Arc<[u8]>,
}

impl std::fmt::Debug for UserTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTokenSigner").finish_non_exhaustive()
    }
}

impl UserTokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    pub fn mint(&self, claims: &UserTokenClaims) -> Result<String, TokenError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes())?.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<UserTokenClaims, TokenError> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    pub fn verify_at(&self, token: &str, now: OffsetDateTime) -> Result<UserTokenClaims, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD.decode(signature)?;
        self.mac(payload.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| TokenError::Signature)?;
        let claims: UserTokenClaims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload)?)?;
        claims.ensure_not_expired(now)?;
        Ok(claims)
    }

    fn mac(&self, payload: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Key)?;
        mac.update(payload);
        Ok(mac)
    }
}
