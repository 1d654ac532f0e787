//! Short-lived session credentials.
//!
//! A credential binds one session id to an expiry:
//! `v1.<expires_unix_secs>.<hex hmac-sha256(secret, "<session_id>\n<expires>")>`.
//! Issuance belongs to whatever authenticates users upstream of the gateway;
//! the gateway only verifies. `parley token` mints one for development.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::RejectReason;
use crate::util::now_epoch_secs;

type HmacSha256 = Hmac<Sha256>;

const CREDENTIAL_VERSION: &str = "v1";
const MAX_SESSION_ID_LEN: usize = 128;

/// Query parameters of `GET /api/voice/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub session_id: Option<String>,
    pub token: Option<String>,
}

pub struct CredentialAuthority {
    secret: Vec<u8>,
    ttl: Duration,
}

impl CredentialAuthority {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    /// Random per-process secret. Credentials die with the process.
    pub fn ephemeral(ttl: Duration) -> Self {
        let mut secret = Vec::with_capacity(32);
        secret.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        secret.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self { secret, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, session_id: &str) -> anyhow::Result<String> {
        self.issue_at(session_id, now_epoch_secs())
    }

    pub fn issue_at(&self, session_id: &str, now_secs: u64) -> anyhow::Result<String> {
        let expires = now_secs.saturating_add(self.ttl.as_secs());
        let signature = self
            .keyed(session_id, expires)
            .map_err(|e| anyhow::anyhow!("Invalid credential secret: {e}"))?
            .finalize()
            .into_bytes();
        Ok(format!(
            "{CREDENTIAL_VERSION}.{expires}.{}",
            hex::encode(signature)
        ))
    }

    pub fn verify(&self, session_id: &str, credential: &str) -> Result<(), RejectReason> {
        self.verify_at(session_id, credential, now_epoch_secs())
    }

    pub fn verify_at(
        &self,
        session_id: &str,
        credential: &str,
        now_secs: u64,
    ) -> Result<(), RejectReason> {
        let mut parts = credential.splitn(3, '.');
        let (Some(CREDENTIAL_VERSION), Some(expires), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RejectReason::InvalidCredential);
        };
        let Ok(expires) = expires.parse::<u64>() else {
            return Err(RejectReason::InvalidCredential);
        };
        let Ok(signature) = hex::decode(signature) else {
            return Err(RejectReason::InvalidCredential);
        };
        let Ok(mac) = self.keyed(session_id, expires) else {
            return Err(RejectReason::InvalidCredential);
        };

        // Constant-time comparison
        if mac.verify_slice(&signature).is_err() {
            return Err(RejectReason::InvalidCredential);
        }
        if expires <= now_secs {
            return Err(RejectReason::ExpiredCredential);
        }
        // minted under a longer ttl than this gateway allows
        if expires - now_secs > self.ttl.as_secs() {
            return Err(RejectReason::InvalidCredential);
        }
        Ok(())
    }

    fn keyed(
        &self,
        session_id: &str,
        expires: u64,
    ) -> Result<HmacSha256, hmac::digest::InvalidLength> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)?;
        mac.update(session_id.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}

/// Session ids are 1–128 chars of `[A-Za-z0-9_-]`.
pub fn validate_session_id(session_id: &str) -> Result<(), RejectReason> {
    let well_formed = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(RejectReason::MalformedSessionId)
    }
}

/// Check connect parameters before the upgrade. Returns the session id.
pub fn authorize(
    authority: &CredentialAuthority,
    params: &ConnectParams,
) -> Result<String, RejectReason> {
    let session_id = params
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(RejectReason::MissingSessionId)?;
    validate_session_id(session_id)?;

    let credential = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(RejectReason::MissingCredential)?;
    authority.verify(session_id, credential)?;

    Ok(session_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn authority() -> CredentialAuthority {
        CredentialAuthority::new("test-secret-0123456789", Duration::from_secs(300))
    }

    #[test]
    fn issued_credential_verifies_for_its_session_only() {
        let auth = authority();
        let token = auth.issue_at("meeting-1", NOW).unwrap();
        assert!(token.starts_with("v1."));
        assert_eq!(auth.verify_at("meeting-1", &token, NOW + 10), Ok(()));
        assert_eq!(
            auth.verify_at("meeting-2", &token, NOW + 10),
            Err(RejectReason::InvalidCredential)
        );
    }

    #[test]
    fn expired_credential_is_rejected() {
        let auth = authority();
        let token = auth.issue_at("meeting-1", NOW).unwrap();
        assert_eq!(
            auth.verify_at("meeting-1", &token, NOW + 300),
            Err(RejectReason::ExpiredCredential)
        );
    }

    #[test]
    fn tampered_or_garbage_credentials_are_invalid() {
        let auth = authority();
        let token = auth.issue_at("meeting-1", NOW).unwrap();

        // push the expiry out without re-signing
        let forged = token.replacen(&(NOW + 300).to_string(), &(NOW + 299).to_string(), 1);
        for bad in [
            forged.as_str(),
            "",
            "v1",
            "v1.abc.00",
            "v2.1.00",
            "v1.1700000300.zz",
        ] {
            assert_eq!(
                auth.verify_at("meeting-1", bad, NOW),
                Err(RejectReason::InvalidCredential),
                "{bad}"
            );
        }
    }

    #[test]
    fn other_secret_cannot_forge() {
        let other = CredentialAuthority::new("another-secret-987654", Duration::from_secs(300));
        let token = other.issue_at("meeting-1", NOW).unwrap();
        assert_eq!(
            authority().verify_at("meeting-1", &token, NOW),
            Err(RejectReason::InvalidCredential)
        );
    }

    #[test]
    fn ttl_longer_than_allowed_is_invalid() {
        let generous = CredentialAuthority::new("test-secret-0123456789", Duration::from_secs(3600));
        let token = generous.issue_at("meeting-1", NOW).unwrap();
        assert_eq!(
            authority().verify_at("meeting-1", &token, NOW),
            Err(RejectReason::InvalidCredential)
        );
    }

    #[test]
    fn ephemeral_authorities_do_not_share_secrets() {
        let a = CredentialAuthority::ephemeral(Duration::from_secs(60));
        let b = CredentialAuthority::ephemeral(Duration::from_secs(60));
        let token = a.issue("s1").unwrap();
        assert!(a.verify("s1", &token).is_ok());
        assert!(b.verify("s1", &token).is_err());
    }

    #[test]
    fn session_id_shape() {
        assert!(validate_session_id("abc-DEF_123").is_ok());
        assert!(validate_session_id(&"a".repeat(128)).is_ok());
        for bad in ["", "has space", "slash/id", "dot.id", "ünïcode"] {
            assert_eq!(
                validate_session_id(bad),
                Err(RejectReason::MalformedSessionId)
            );
        }
        assert!(validate_session_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn authorize_checks_params_in_order() {
        let auth = authority();
        let params = |sid: Option<&str>, token: Option<&str>| ConnectParams {
            session_id: sid.map(str::to_string),
            token: token.map(str::to_string),
        };

        assert_eq!(
            authorize(&auth, &params(None, Some("x"))),
            Err(RejectReason::MissingSessionId)
        );
        assert_eq!(
            authorize(&auth, &params(Some("bad id"), Some("x"))),
            Err(RejectReason::MalformedSessionId)
        );
        assert_eq!(
            authorize(&auth, &params(Some("s1"), None)),
            Err(RejectReason::MissingCredential)
        );
        assert_eq!(
            authorize(&auth, &params(Some("s1"), Some(""))),
            Err(RejectReason::MissingCredential)
        );

        let token = auth.issue("s1").unwrap();
        assert_eq!(
            authorize(&auth, &params(Some("s1"), Some(&token))),
            Ok("s1".to_string())
        );
    }
}
