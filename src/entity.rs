use std::sync::Arc;
use std::{fmt, str::FromStr};

use rand::RngCore;
use sha3::{Digest, Sha3_256};

pub type EntityId = String;

pub mod prefix {
    pub const GUILD_ID: &str = "gd";
    pub const SESSION_ID: &str = "ss";
}

const HASH_OUTPUT_BYTES: usize = 16;
const SESSION_ID_BYTES: usize = 10;

/// Generates a new random entity ID with prefix and length (in bytes).
pub fn new_random_id(prefix: &str, length: usize) -> EntityId {
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    encode_with_prefix(prefix, &bytes)
}

pub fn new_hashed_id(prefix: &str, input: &str) -> EntityId {
    let mut hasher = Sha3_256::default();
    hasher.update(input.as_bytes());
    let full_hash = hasher.finalize();
    encode_with_prefix(prefix, &full_hash[..HASH_OUTPUT_BYTES])
}

/// Decodes the base58-encoded part of the ID into raw bytes.
pub fn decode_id(id: &str) -> Option<Vec<u8>> {
    id.split_once('_')
        .and_then(|(_, encoded)| bs58::decode(encoded).into_vec().ok())
}

/// Returns the prefix part (before `_`) of the ID.
pub fn get_prefix(id: &str) -> Option<&str> {
    id.split_once('_').map(|(prefix, _)| prefix)
}

fn encode_with_prefix(prefix: &str, bytes: &[u8]) -> EntityId {
    let encoded = bs58::encode(bytes).into_string();
    format!("{}_{}", prefix, encoded)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdValidationError {
    #[error("ID exceeds maximum length of {0} characters")]
    TooLong(usize),
    #[error("ID contains invalid characters")]
    InvalidCharacters,
    #[error("ID is empty")]
    Empty,
}

pub fn validate_id_string(s: &str, max_len: usize) -> Result<(), IdValidationError> {
    if s.is_empty() {
        return Err(IdValidationError::Empty);
    }
    if s.len() > max_len {
        return Err(IdValidationError::TooLong(max_len));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(IdValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Tenant identifier. The external form is whatever the chat platform hands us
/// (a snowflake, a slug); the internal form is a stable hashed id used in logs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuildId {
    external: Arc<str>,
    internal: Arc<EntityId>,
}

impl GuildId {
    const MAX_LEN: usize = 64;

    pub fn new(external: &str) -> Result<Self, IdValidationError> {
        validate_id_string(external, Self::MAX_LEN)?;
        let internal = Arc::new(new_hashed_id(prefix::GUILD_ID, external));
        Ok(Self {
            external: Arc::from(external),
            internal,
        })
    }

    pub fn external(&self) -> &str {
        &self.external
    }

    pub fn internal(&self) -> &str {
        &self.internal
    }
}

impl FromStr for GuildId {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for GuildId {
    type Error = IdValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.external)
    }
}

impl fmt::Debug for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuildId")
            .field("external", &&*self.external)
            .field("internal", &*self.internal)
            .finish()
    }
}

/// Opaque reference to the voice channel a session should connect to.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VoiceTarget(Arc<str>);

impl VoiceTarget {
    const MAX_LEN: usize = 64;

    pub fn new(id: &str) -> Result<Self, IdValidationError> {
        validate_id_string(id, Self::MAX_LEN)?;
        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VoiceTarget {
    type Err = IdValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for VoiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for VoiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VoiceTarget").field(&&*self.0).finish()
    }
}

/// Identifies one playback session of a guild, from connect to teardown.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<EntityId>);

impl SessionId {
    pub fn new() -> Self {
        Self(Arc::new(new_random_id(prefix::SESSION_ID, SESSION_ID_BYTES)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionId").field(&*self.0).finish()
    }
}
