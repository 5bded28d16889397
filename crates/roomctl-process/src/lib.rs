use rand::Rng;

pub const GENERATED_ROOM_ID_LEN: usize = 8;

const MAX_ROOM_ID_LEN: usize = 64;

/// Logical room key. One managed client process per room.
///
/// Ids end up inside a `--room_id=` flag, so only ASCII alphanumerics, `-` and `_`
/// are accepted from callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRoomId {
    #[error("room_number must be non-empty")]
    Empty,
    #[error("room_number must be at most {} characters", MAX_ROOM_ID_LEN)]
    TooLong,
    #[error("room_number may only contain ASCII letters, digits, '-' and '_'")]
    BadChar,
}

impl RoomId {
    /// Random 8-digit numeric id. Uniqueness is not checked here; the registry
    /// rejects duplicates.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..GENERATED_ROOM_ID_LEN)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, InvalidRoomId> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InvalidRoomId::Empty);
        }
        if raw.len() > MAX_ROOM_ID_LEN {
            return Err(InvalidRoomId::TooLong);
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidRoomId::BadChar);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Running,
    Terminating,
    Stopped,
}

/// Point-in-time view of one registered room.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoomStatus {
    #[serde(rename = "room_number")]
    pub room_id: RoomId,
    pub state: RoomState,
    pub pid: Option<u32>,
    pub command_line: Vec<String>,
    pub started_at_unix_ms: u64,
}
