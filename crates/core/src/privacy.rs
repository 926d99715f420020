//! IP minimization and user identity derivation.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::event::{UserInput, UserKind};
use crate::policy::IpStorageMode;

/// Used when IP hashing is requested without a configured salt
pub const FALLBACK_IP_SALT: &str = "default-ip-salt";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrivacyError {
    #[error("STABLE_ID_SALT is required to hash stable user IDs")]
    StableIdSaltMissing,
}

/// `hex(sha256("<salt>:<value>"))`
pub fn hash_with_salt(value: &str, salt: &str) -> String {
    hex::encode(Sha256::digest(format!("{salt}:{value}").as_bytes()))
}

/// First address of a forwarded chain, without the IPv4-mapped IPv6 prefix.
pub fn normalize_ip(raw: Option<&str>) -> Option<String> {
    let first = raw?.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.strip_prefix("::ffff:").unwrap_or(first).to_string())
}

fn ipv4_octets(ip: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = ip.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

/// IPv4 address as a big-endian integer; `None` for anything else
pub fn ipv4_to_u32(ip: &str) -> Option<u32> {
    ipv4_octets(ip).map(u32::from_be_bytes)
}

/// `a.b.c.0/24` for a well-formed IPv4 address
pub fn mask_ipv4_24(ip: &str) -> Option<String> {
    let [a, b, c, _] = ipv4_octets(ip)?;
    Some(format!("{a}.{b}.{c}.0/24"))
}

/// Stored IP fields after applying the site's storage mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedIp {
    pub masked: Option<String>,
    pub hashed: Option<String>,
}

pub fn process_ip(raw: Option<&str>, mode: IpStorageMode, hash_salt: &str) -> ProcessedIp {
    let Some(ip) = normalize_ip(raw) else {
        return ProcessedIp::default();
    };

    match mode {
        IpStorageMode::None => ProcessedIp::default(),
        IpStorageMode::Mask24 => ProcessedIp {
            masked: mask_ipv4_24(&ip),
            hashed: None,
        },
        IpStorageMode::Hash => {
            let salt = if hash_salt.is_empty() {
                FALLBACK_IP_SALT
            } else {
                hash_salt
            };
            ProcessedIp {
                masked: None,
                hashed: Some(hash_with_salt(&ip, salt)),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub kind: UserKind,
    /// `stable:<hash>` or `anon:<session id>`
    pub user_id: String,
    pub stable_id_hash: Option<String>,
}

/// Derive the stored identity of an event.
///
/// Only an authenticated, non-empty stable id produces a stable identity; it is
/// hashed with `stable_id_salt`, which must then be non-empty.
pub fn build_user_identity(
    user: Option<&UserInput>,
    stable_id_salt: &str,
    session_id: &str,
) -> Result<UserIdentity, PrivacyError> {
    let stable_id = user
        .filter(|u| u.is_authenticated == Some(true))
        .and_then(|u| u.stable_user_id.as_deref())
        .filter(|id| !id.is_empty());

    let offered = user
        .and_then(|u| u.stable_user_id.as_deref())
        .is_some_and(|id| !id.is_empty());
    if offered && stable_id.is_none() {
        debug!(session_id, "stable_user_id ignored without is_authenticated=true");
    }

    if let Some(stable_id) = stable_id {
        if stable_id_salt.is_empty() {
            return Err(PrivacyError::StableIdSaltMissing);
        }
        let hash = hash_with_salt(stable_id, stable_id_salt);
        return Ok(UserIdentity {
            kind: UserKind::Stable,
            user_id: format!("stable:{hash}"),
            stable_id_hash: Some(hash),
        });
    }

    Ok(UserIdentity {
        kind: UserKind::Anonymous,
        user_id: format!("anon:{session_id}"),
        stable_id_hash: None,
    })
}
