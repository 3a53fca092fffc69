//! `gamestore`: identity, character, and ranking storage.
//!
//! Consumers see the [`Store`] trait only; [`memory::MemoryStore`] is the
//! in-process implementation the binaries ship with. Character blobs are kept
//! exactly as the game sends them; layout rules live in `dispelproto`.

pub mod memory;

use chrono::DateTime;
use chrono::Utc;

use dispelproto::character::INVENTORY_LEN;
use dispelproto::character::SPELLS_LEN;
use dispelproto::character::STATS_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub character_id: i64,
    pub user_id: i64,
    pub character_name: String,
    pub stats: [u8; STATS_LEN],
    pub inventory: Option<[u8; INVENTORY_LEN]>,
    pub spells: Option<[u8; SPELLS_LEN]>,
}

impl Character {
    /// Class byte out of the packed stats record.
    pub fn class_type(&self) -> u8 {
        self.stats[24]
    }

    /// Score field out of the packed stats record, the ranking sort key.
    pub fn score_points(&self) -> u32 {
        u32::from_le_bytes([self.stats[20], self.stats[21], self.stats[22], self.stats[23]])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingRow {
    pub rank: u32,
    pub points: u32,
    pub username: String,
    pub character_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    AlreadyExists,
    /// Covers unknown user and wrong password alike; callers must not be able
    /// to tell which.
    InvalidCredentials,
    Invalid(&'static str),
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "not found"),
            StoreError::AlreadyExists => write!(f, "already exists"),
            StoreError::InvalidCredentials => write!(f, "invalid credentials"),
            StoreError::Invalid(s) => write!(f, "invalid: {s}"),
            StoreError::Internal(s) => write!(f, "internal: {s}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Typed operations the rest of the system consumes.
#[allow(async_fn_in_trait)]
pub trait Store: Send + Sync {
    async fn create_user(&self, username: &str, password: &str) -> Result<User>;
    async fn authenticate_user(&self, username: &str, password: &str) -> Result<User>;
    async fn get_user(&self, user_id: i64) -> Result<User>;

    async fn list_characters(&self, user_id: i64) -> Result<Vec<Character>>;
    async fn get_character(&self, user_id: i64, character_name: &str) -> Result<Character>;
    async fn create_character(
        &self,
        user_id: i64,
        character_name: &str,
        stats: [u8; STATS_LEN],
    ) -> Result<Character>;
    async fn delete_character(&self, user_id: i64, character_name: &str) -> Result<()>;
    async fn put_stats(
        &self,
        user_id: i64,
        character_name: &str,
        stats: [u8; STATS_LEN],
    ) -> Result<()>;
    async fn put_inventory(
        &self,
        user_id: i64,
        character_name: &str,
        inventory: [u8; INVENTORY_LEN],
    ) -> Result<()>;
    async fn put_spells(
        &self,
        user_id: i64,
        character_name: &str,
        spells: [u8; SPELLS_LEN],
    ) -> Result<()>;

    /// One ranking page for a class, ordered by score descending, plus the
    /// requesting player's own row.
    async fn ranking(
        &self,
        class_type: u8,
        offset: u32,
        username: &str,
        character_name: &str,
    ) -> Result<(Vec<RankingRow>, RankingRow)>;
}
