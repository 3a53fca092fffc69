//! In-memory store. Backs single-host deployments and every test.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use dispelproto::character::INVENTORY_LEN;
use dispelproto::character::SPELLS_LEN;
use dispelproto::character::STATS_LEN;

use crate::Character;
use crate::RankingRow;
use crate::Result;
use crate::Store;
use crate::StoreError;
use crate::User;

const RANKING_PAGE: usize = 10;

#[derive(Default)]
struct Inner {
    users: HashMap<i64, User>,
    user_ids_by_name: HashMap<String, i64>,
    characters: HashMap<i64, Character>,
    next_user_id: i64,
    next_character_id: i64,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    bcrypt_cost: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_user_id: 1,
                next_character_id: 1,
                ..Inner::default()
            }),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Low-cost hashing for tests; bcrypt at the default cost dominates test
    /// wall time otherwise.
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// Seed a demo account (`archer`/`test`) with one level-1 archer so a
    /// fresh install can reach the in-game lobby without a registration step.
    pub async fn seed_demo(&self) -> Result<()> {
        let user = self.create_user("archer", "test").await?;
        let mut stats = [0u8; STATS_LEN];
        stats[0] = 30; // strength
        stats[2] = 40; // agility
        stats[4] = 20; // wisdom
        stats[6] = 30; // constitution
        stats[8] = 50; // hp
        stats[10] = 25; // mp
        stats[24] = 1; // class: archer
        stats[40] = 1; // level
        self.create_character(user.user_id, "archer", stats).await?;
        info!(user = %user.username, "seeded demo account");
        Ok(())
    }

    fn not_alphanumeric(s: &str) -> bool {
        s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

impl Store for MemoryStore {
    async fn create_user(&self, username: &str, password: &str) -> Result<User> {
        if Self::not_alphanumeric(username) {
            return Err(StoreError::Invalid("username must be alphanumeric"));
        }
        let password_hash = bcrypt::hash(password, self.bcrypt_cost)
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut inner = self.inner.write().await;
        if inner.user_ids_by_name.contains_key(username) {
            return Err(StoreError::AlreadyExists);
        }
        let user_id = inner.next_user_id;
        inner.next_user_id += 1;
        let user = User {
            user_id,
            username: username.to_owned(),
            password_hash,
            created_at: Utc::now(),
        };
        inner.user_ids_by_name.insert(username.to_owned(), user_id);
        inner.users.insert(user_id, user.clone());
        Ok(user)
    }

    async fn authenticate_user(&self, username: &str, password: &str) -> Result<User> {
        let user = {
            let inner = self.inner.read().await;
            let id = inner
                .user_ids_by_name
                .get(username)
                .ok_or(StoreError::InvalidCredentials)?;
            inner
                .users
                .get(id)
                .cloned()
                .ok_or(StoreError::InvalidCredentials)?
        };
        let ok = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if !ok {
            return Err(StoreError::InvalidCredentials);
        }
        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> Result<User> {
        self.inner
            .read()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_characters(&self, user_id: i64) -> Result<Vec<Character>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Character> = inner
            .characters
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.character_id);
        Ok(out)
    }

    async fn get_character(&self, user_id: i64, character_name: &str) -> Result<Character> {
        let inner = self.inner.read().await;
        inner
            .characters
            .values()
            .find(|c| c.user_id == user_id && c.character_name == character_name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_character(
        &self,
        user_id: i64,
        character_name: &str,
        stats: [u8; STATS_LEN],
    ) -> Result<Character> {
        if character_name.is_empty() {
            return Err(StoreError::Invalid("character name must not be empty"));
        }
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }
        if inner
            .characters
            .values()
            .any(|c| c.user_id == user_id && c.character_name == character_name)
        {
            return Err(StoreError::AlreadyExists);
        }
        let character_id = inner.next_character_id;
        inner.next_character_id += 1;
        let character = Character {
            character_id,
            user_id,
            character_name: character_name.to_owned(),
            stats,
            inventory: None,
            spells: None,
        };
        inner.characters.insert(character_id, character.clone());
        Ok(character)
    }

    async fn delete_character(&self, user_id: i64, character_name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let id = inner
            .characters
            .values()
            .find(|c| c.user_id == user_id && c.character_name == character_name)
            .map(|c| c.character_id)
            .ok_or(StoreError::NotFound)?;
        inner.characters.remove(&id);
        Ok(())
    }

    async fn put_stats(
        &self,
        user_id: i64,
        character_name: &str,
        stats: [u8; STATS_LEN],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let character = inner
            .characters
            .values_mut()
            .find(|c| c.user_id == user_id && c.character_name == character_name)
            .ok_or(StoreError::NotFound)?;
        character.stats = stats;
        Ok(())
    }

    async fn put_inventory(
        &self,
        user_id: i64,
        character_name: &str,
        inventory: [u8; INVENTORY_LEN],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let character = inner
            .characters
            .values_mut()
            .find(|c| c.user_id == user_id && c.character_name == character_name)
            .ok_or(StoreError::NotFound)?;
        character.inventory = Some(inventory);
        Ok(())
    }

    async fn put_spells(
        &self,
        user_id: i64,
        character_name: &str,
        spells: [u8; SPELLS_LEN],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let character = inner
            .characters
            .values_mut()
            .find(|c| c.user_id == user_id && c.character_name == character_name)
            .ok_or(StoreError::NotFound)?;
        character.spells = Some(spells);
        Ok(())
    }

    async fn ranking(
        &self,
        class_type: u8,
        offset: u32,
        username: &str,
        character_name: &str,
    ) -> Result<(Vec<RankingRow>, RankingRow)> {
        let inner = self.inner.read().await;

        let mut board: Vec<(&Character, &User)> = inner
            .characters
            .values()
            .filter(|c| c.class_type() == class_type)
            .filter_map(|c| inner.users.get(&c.user_id).map(|u| (c, u)))
            .collect();
        // highest score first; ties settle by oldest character
        board.sort_by(|(a, _), (b, _)| {
            b.score_points()
                .cmp(&a.score_points())
                .then(a.character_id.cmp(&b.character_id))
        });

        let row = |idx: usize, c: &Character, u: &User| RankingRow {
            rank: (idx + 1) as u32,
            points: c.score_points(),
            username: u.username.clone(),
            character_name: c.character_name.clone(),
        };

        let players = board
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(RANKING_PAGE)
            .map(|(i, (c, u))| row(i, c, u))
            .collect();

        let current = board
            .iter()
            .enumerate()
            .find(|(_, (c, u))| u.username == username && c.character_name == character_name)
            .map(|(i, (c, u))| row(i, c, u))
            .unwrap_or(RankingRow {
                rank: 0,
                points: 0,
                username: username.to_owned(),
                character_name: character_name.to_owned(),
            });

        Ok((players, current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new().with_bcrypt_cost(4)
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_alike() {
        let s = store();
        s.create_user("archer", "test").await.unwrap();

        let bad_pass = s.authenticate_user("archer", "nope").await.unwrap_err();
        let no_user = s.authenticate_user("ghost", "nope").await.unwrap_err();
        assert_eq!(bad_pass, StoreError::InvalidCredentials);
        assert_eq!(no_user, StoreError::InvalidCredentials);
    }

    #[tokio::test]
    async fn usernames_are_unique_and_alphanumeric() {
        let s = store();
        s.create_user("archer", "test").await.unwrap();
        assert_eq!(
            s.create_user("archer", "other").await.unwrap_err(),
            StoreError::AlreadyExists
        );
        assert!(matches!(
            s.create_user("bad name", "x").await.unwrap_err(),
            StoreError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn character_names_unique_per_user() {
        let s = store();
        let u = s.create_user("archer", "test").await.unwrap();
        let v = s.create_user("mage", "test").await.unwrap();
        s.create_character(u.user_id, "hero", [0; STATS_LEN])
            .await
            .unwrap();
        assert_eq!(
            s.create_character(u.user_id, "hero", [0; STATS_LEN])
                .await
                .unwrap_err(),
            StoreError::AlreadyExists
        );
        // a different user may reuse the name
        s.create_character(v.user_id, "hero", [0; STATS_LEN])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn blob_updates_land_on_the_right_character() {
        let s = store();
        let u = s.create_user("archer", "test").await.unwrap();
        s.create_character(u.user_id, "hero", [0; STATS_LEN])
            .await
            .unwrap();

        s.put_inventory(u.user_id, "hero", [3; INVENTORY_LEN])
            .await
            .unwrap();
        s.put_spells(u.user_id, "hero", [1; SPELLS_LEN]).await.unwrap();

        let c = s.get_character(u.user_id, "hero").await.unwrap();
        assert_eq!(c.inventory, Some([3; INVENTORY_LEN]));
        assert_eq!(c.spells, Some([1; SPELLS_LEN]));
        assert_eq!(
            s.put_spells(u.user_id, "ghost", [1; SPELLS_LEN])
                .await
                .unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn ranking_orders_by_score_and_finds_current_player() {
        let s = store();
        let u = s.create_user("archer", "test").await.unwrap();
        for (name, score) in [("low", 10u32), ("high", 90), ("mid", 50)] {
            let mut stats = [0u8; STATS_LEN];
            stats[24] = 1;
            stats[20..24].copy_from_slice(&score.to_le_bytes());
            s.create_character(u.user_id, name, stats).await.unwrap();
        }

        let (page, me) = s.ranking(1, 0, "archer", "mid").await.unwrap();
        let names: Vec<&str> = page.iter().map(|r| r.character_name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
        assert_eq!(page[0].rank, 1);
        assert_eq!(me.rank, 2);
        assert_eq!(me.points, 50);

        // other classes do not appear
        let (empty, _) = s.ranking(2, 0, "archer", "mid").await.unwrap();
        assert!(empty.is_empty());
    }
}
