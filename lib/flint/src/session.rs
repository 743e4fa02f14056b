use crate::crypto;
use crate::time::timestamp_secs;
use crate::PlayerId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;
use serde::{de, Deserializer};
use serde_derive::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use std::ops::Deref;

const SESSION_KEY_SIZE: usize = 32;

/// Privilege level attached to an authenticated caller. Method gating compares levels by order,
/// so `Server` passes every check a `User` passes.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    Guest = 0,
    User = 1,
    Server = 2,
    Admin = 3,
}

impl Role {
    #[inline]
    pub fn from_u8(raw: u8) -> Option<Role> {
        match raw {
            0 => Some(Role::Guest),
            1 => Some(Role::User),
            2 => Some(Role::Server),
            3 => Some(Role::Admin),
            _ => None,
        }
    }
}

/// 256 bit session capability key.
#[derive(Serialize, Deserialize, Clone)]
pub struct SessionKey(
    #[serde(
        serialize_with = "crate::encoding::base64::serialize",
        deserialize_with = "deserialize_b64_key"
    )]
    [u8; SESSION_KEY_SIZE],
);

#[inline]
fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<[u8; SESSION_KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = <&str as serde::Deserialize>::deserialize(deserializer)?;
    let decoded = base64::decode(encoded).map_err(de::Error::custom)?;

    if decoded.len() != SESSION_KEY_SIZE {
        return Err(de::Error::custom("session key must decode to 32 bytes"));
    }

    let mut key = [0u8; SESSION_KEY_SIZE];
    key.copy_from_slice(&decoded);

    Ok(key)
}

impl SessionKey {
    pub const SIZE: usize = SESSION_KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> SessionKey {
        SessionKey(key)
    }

    /// Generates a fresh key from the csprng.
    #[inline]
    pub fn generate() -> SessionKey {
        let mut key = [0u8; Self::SIZE];
        crypto::random_bytes(&mut key);
        SessionKey(key)
    }

    /// Short log-safe identifier for the key.
    #[inline]
    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.0)
    }
}

impl Deref for SessionKey {
    type Target = [u8; SessionKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; SessionKey::SIZE] {
        &self.0
    }
}

/// A short lived capability tying a player to a role.
#[derive(Clone)]
pub struct RpcSession {
    pub player_id: PlayerId,
    pub player_name: String,
    pub key: SessionKey,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl RpcSession {
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Session registry. Writes are serialized through the owning service actor; readers get clones.
pub struct SessionStore {
    sessions: HashMap<PlayerId, RpcSession>,
    default_duration_secs: u64,
}

impl SessionStore {
    #[inline]
    pub fn new(default_duration_secs: u64) -> SessionStore {
        SessionStore {
            sessions: HashMap::new(),
            default_duration_secs,
        }
    }

    /// Creates (or replaces) the session for a player. Returns a clone of the stored record.
    pub fn create(
        &mut self,
        player_id: PlayerId,
        player_name: String,
        role: Role,
        duration_override_secs: Option<u64>,
    ) -> RpcSession {
        let now = Utc::now();
        let duration = duration_override_secs.unwrap_or(self.default_duration_secs);

        let session = RpcSession {
            player_id: player_id.clone(),
            player_name,
            key: SessionKey::generate(),
            role,
            created_at: now,
            expires_at: now + Duration::seconds(duration as i64),
            last_activity_at: now,
        };

        self.sessions.insert(player_id, session.clone());
        session
    }

    /// Validates an offered key against the stored key in constant time. Expired sessions never
    /// validate regardless of key contents.
    pub fn validate_key(&self, player_id: &str, offered: &[u8]) -> bool {
        match self.sessions.get(player_id) {
            Some(session) => {
                crypto::constant_time_eq(&session.key[..], offered) && !session.is_expired(Utc::now())
            }
            None => false,
        }
    }

    #[inline]
    pub fn get(&self, player_id: &str) -> Option<&RpcSession> {
        self.sessions.get(player_id)
    }

    /// Refreshes the activity timestamp, returning false for unknown sessions.
    pub fn touch(&mut self, player_id: &str) -> bool {
        match self.sessions.get_mut(player_id) {
            Some(session) => {
                session.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn revoke(&mut self, player_id: &str) -> bool {
        self.sessions.remove(player_id).is_some()
    }

    /// Drops expired sessions, returning how many were evicted.
    pub fn sweep(&mut self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();

        self.sessions.retain(|_, session| !session.is_expired(now));

        before - self.sessions.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Sealed session ticket. The silo encrypts the session under the cluster secret; any server
/// holding the secret can admit the caller without a directory round trip.
///
/// Wire layout: `[u64 nonce][u64 expires][u16 cipher len][cipher]`, all integers big endian.
/// The expiry is bound into the AEAD additional data, so tampering with the clear copy fails
/// decryption.
pub struct SessionTicket {
    pub player_id: PlayerId,
    pub player_name: String,
    pub role: Role,
    pub expires: u64,
    pub key: SessionKey,
}

impl SessionTicket {
    const MAX_SIZE: usize = 1024;

    pub fn from_session(session: &RpcSession) -> SessionTicket {
        SessionTicket {
            player_id: session.player_id.clone(),
            player_name: session.player_name.clone(),
            role: session.role,
            expires: session.expires_at.timestamp() as u64,
            key: session.key.clone(),
        }
    }

    /// Encrypts the ticket under the cluster secret.
    pub fn seal(&self, secret: &SessionKey) -> Vec<u8> {
        let mut plain = Vec::with_capacity(128);

        plain
            .write_u16::<BigEndian>(self.player_id.len() as u16)
            .expect("Error writing ticket");
        plain.extend_from_slice(self.player_id.as_bytes());
        plain
            .write_u16::<BigEndian>(self.player_name.len() as u16)
            .expect("Error writing ticket");
        plain.extend_from_slice(self.player_name.as_bytes());
        plain.write_u8(self.role as u8).expect("Error writing ticket");
        plain.extend_from_slice(&self.key[..]);

        let mut nonce_bytes = [0u8; 8];
        crypto::random_bytes(&mut nonce_bytes);
        let nonce = u64::from_be_bytes(nonce_bytes);

        let additional_data = Self::additional_data(self.expires);
        let cipher = crypto::seal(&plain, &additional_data, nonce, secret);

        let mut sealed = Vec::with_capacity(cipher.len() + 18);
        sealed.write_u64::<BigEndian>(nonce).expect("Error writing ticket");
        sealed
            .write_u64::<BigEndian>(self.expires)
            .expect("Error writing ticket");
        sealed
            .write_u16::<BigEndian>(cipher.len() as u16)
            .expect("Error writing ticket");
        sealed.extend_from_slice(&cipher);

        sealed
    }

    /// Decrypts and validates a sealed ticket. Returns `None` for malformed, forged or
    /// expired tickets.
    pub fn open(sealed: &[u8], secret: &SessionKey) -> Option<SessionTicket> {
        if sealed.len() > Self::MAX_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(sealed);

        let nonce = cursor.read_u64::<BigEndian>().ok()?;
        let expires = cursor.read_u64::<BigEndian>().ok()?;
        let cipher_len = cursor.read_u16::<BigEndian>().ok()? as usize;

        let mut cipher = vec![0u8; cipher_len];
        cursor.read_exact(&mut cipher).ok()?;

        if expires <= timestamp_secs() {
            return None;
        }

        let additional_data = Self::additional_data(expires);
        let plain = crypto::open(&cipher, &additional_data, nonce, secret)?;
        let mut plain = Cursor::new(plain.as_slice());

        let id_len = plain.read_u16::<BigEndian>().ok()? as usize;
        let mut id_bytes = vec![0u8; id_len];
        plain.read_exact(&mut id_bytes).ok()?;

        let name_len = plain.read_u16::<BigEndian>().ok()? as usize;
        let mut name_bytes = vec![0u8; name_len];
        plain.read_exact(&mut name_bytes).ok()?;

        let role = Role::from_u8(plain.read_u8().ok()?)?;

        let mut key = [0u8; SessionKey::SIZE];
        plain.read_exact(&mut key).ok()?;

        Some(SessionTicket {
            player_id: String::from_utf8(id_bytes).ok()?,
            player_name: String::from_utf8(name_bytes).ok()?,
            role,
            expires,
            key: SessionKey::new(key),
        })
    }

    #[inline]
    fn additional_data(expires: u64) -> [u8; 15] {
        let mut additional_data = [0u8; 15];
        {
            let mut slice = &mut additional_data[..];
            slice.write_all(b"ticket").expect("Error writing ticket aed");
            slice.write_u8(crate::PROTOCOL_VERSION).expect("Error writing ticket aed");
            slice.write_u64::<BigEndian>(expires).expect("Error writing ticket aed");
        }

        additional_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(3600)
    }

    #[test]
    fn test_create_and_validate() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, None);

        assert!(sessions.validate_key("p1", &session.key[..]));
        assert!(!sessions.validate_key("p1", &[0u8; 32]));
        assert!(!sessions.validate_key("p2", &session.key[..]));
    }

    #[test]
    fn test_expired_session_never_validates() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, Some(0));

        assert!(!sessions.validate_key("p1", &session.key[..]));
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let mut sessions = store();
        sessions.create("p1".into(), "Alice".into(), Role::User, Some(0));
        sessions.create("p2".into(), "Bob".into(), Role::User, None);

        assert_eq!(sessions.sweep(), 1);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.get("p2").is_some());
    }

    #[test]
    fn test_revoke() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, None);

        assert!(sessions.revoke("p1"));
        assert!(!sessions.revoke("p1"));
        assert!(!sessions.validate_key("p1", &session.key[..]));
    }

    #[test]
    fn test_ticket_roundtrip() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, None);
        let secret = SessionKey::generate();

        let sealed = SessionTicket::from_session(&session).seal(&secret);
        let ticket = SessionTicket::open(&sealed, &secret).unwrap();

        assert_eq!(ticket.player_id, "p1");
        assert_eq!(ticket.player_name, "Alice");
        assert_eq!(ticket.role, Role::User);
        assert_eq!(&ticket.key[..], &session.key[..]);
    }

    #[test]
    fn test_ticket_rejects_wrong_secret() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, None);

        let sealed = SessionTicket::from_session(&session).seal(&SessionKey::generate());

        assert!(SessionTicket::open(&sealed, &SessionKey::generate()).is_none());
    }

    #[test]
    fn test_ticket_rejects_tampered_expiry() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, None);
        let secret = SessionKey::generate();

        let mut sealed = SessionTicket::from_session(&session).seal(&secret);
        // Push the clear expiry far into the future
        sealed[8..16].copy_from_slice(&u64::max_value().to_be_bytes());

        assert!(SessionTicket::open(&sealed, &secret).is_none());
    }

    #[test]
    fn test_ticket_rejects_expired() {
        let mut sessions = store();
        let session = sessions.create("p1".into(), "Alice".into(), Role::User, Some(0));
        let secret = SessionKey::generate();

        let sealed = SessionTicket::from_session(&session).seal(&secret);

        assert!(SessionTicket::open(&sealed, &secret).is_none());
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin > Role::Server);
        assert!(Role::Server > Role::User);
        assert!(Role::User > Role::Guest);
        assert_eq!(Role::from_u8(2), Some(Role::Server));
        assert_eq!(Role::from_u8(9), None);
    }
}
