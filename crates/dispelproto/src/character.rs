//! Character blobs: the 56-byte packed stats record, the 207-byte inventory
//! and the 43-byte spell book. Layouts are bit-exact contracts with the game
//! client; every offset here was pinned against captured frames.

use crate::ProtoError;

pub const STATS_LEN: usize = 56;
pub const INVENTORY_LEN: usize = 207;
pub const SPELLS_LEN: usize = 43;

/// Spell slots 0..=40 are visible in-game; the client renders a zero there as
/// a corrupt entry, so the server rewrites zeros to one before sending.
pub const KNOWN_SPELL_SLOTS: usize = 41;

pub const BACKPACK_CELLS: usize = 63;
pub const BELT_CELLS: usize = 6;

/// One worn-equipment set, bytes 27..=37 of the stats blob in this order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Equipment {
    pub legs: u8,
    pub torso: u8,
    pub hands: u8,
    pub boots: u8,
    pub full_armour: u8,
    pub emblem: u8,
    pub helmet: u8,
    pub secondary_weapon: u8,
    pub primary_weapon: u8,
    pub shield: u8,
    pub unknown: u8,
}

/// The 56-byte character stats record.
///
/// Little-endian fixed offsets:
/// 0 strength, 2 agility, 4 wisdom, 6 constitution, 8 hp, 10 mp (all u16),
/// 12 xp, 16 money, 20 score (all u32), 24 class, 25 skin, 26 hair,
/// 27..=37 equipment, 38 unused, 39 gender, 40 level, then u16 proficiencies
/// at 41 edged, 43 blunted, 45 archery, 47 polearms, 49 wizardry,
/// 51..=55 reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacterStats {
    pub strength: u16,
    pub agility: u16,
    pub wisdom: u16,
    pub constitution: u16,
    pub health_points: u16,
    pub magic_points: u16,
    pub experience_points: u32,
    pub money: u32,
    pub score_points: u32,
    pub class_type: u8,
    pub skin_carnation: u8,
    pub hair_style: u8,
    pub equipment: Equipment,
    pub gender: u8,
    pub level: u8,
    pub edged_weapons: u16,
    pub blunted_weapons: u16,
    pub archery: u16,
    pub polearms: u16,
    pub wizardry: u16,
}

impl CharacterStats {
    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        if b.len() != STATS_LEN {
            return Err(ProtoError::TooShort {
                need: STATS_LEN,
                got: b.len(),
            });
        }
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);

        Ok(Self {
            strength: u16_at(0),
            agility: u16_at(2),
            wisdom: u16_at(4),
            constitution: u16_at(6),
            health_points: u16_at(8),
            magic_points: u16_at(10),
            experience_points: u32_at(12),
            money: u32_at(16),
            score_points: u32_at(20),
            class_type: b[24],
            skin_carnation: b[25],
            hair_style: b[26],
            equipment: Equipment {
                legs: b[27],
                torso: b[28],
                hands: b[29],
                boots: b[30],
                full_armour: b[31],
                emblem: b[32],
                helmet: b[33],
                secondary_weapon: b[34],
                primary_weapon: b[35],
                shield: b[36],
                unknown: b[37],
            },
            gender: b[39],
            level: b[40],
            edged_weapons: u16_at(41),
            blunted_weapons: u16_at(43),
            archery: u16_at(45),
            polearms: u16_at(47),
            wizardry: u16_at(49),
        })
    }

    pub fn serialize(&self) -> [u8; STATS_LEN] {
        let mut b = [0u8; STATS_LEN];
        b[0..2].copy_from_slice(&self.strength.to_le_bytes());
        b[2..4].copy_from_slice(&self.agility.to_le_bytes());
        b[4..6].copy_from_slice(&self.wisdom.to_le_bytes());
        b[6..8].copy_from_slice(&self.constitution.to_le_bytes());
        b[8..10].copy_from_slice(&self.health_points.to_le_bytes());
        b[10..12].copy_from_slice(&self.magic_points.to_le_bytes());
        b[12..16].copy_from_slice(&self.experience_points.to_le_bytes());
        b[16..20].copy_from_slice(&self.money.to_le_bytes());
        b[20..24].copy_from_slice(&self.score_points.to_le_bytes());
        b[24] = self.class_type;
        b[25] = self.skin_carnation;
        b[26] = self.hair_style;
        b[27] = self.equipment.legs;
        b[28] = self.equipment.torso;
        b[29] = self.equipment.hands;
        b[30] = self.equipment.boots;
        b[31] = self.equipment.full_armour;
        b[32] = self.equipment.emblem;
        b[33] = self.equipment.helmet;
        b[34] = self.equipment.secondary_weapon;
        b[35] = self.equipment.primary_weapon;
        b[36] = self.equipment.shield;
        b[37] = self.equipment.unknown;
        b[39] = self.gender;
        b[40] = self.level;
        b[41..43].copy_from_slice(&self.edged_weapons.to_le_bytes());
        b[43..45].copy_from_slice(&self.blunted_weapons.to_le_bytes());
        b[45..47].copy_from_slice(&self.archery.to_le_bytes());
        b[47..49].copy_from_slice(&self.polearms.to_le_bytes());
        b[49..51].copy_from_slice(&self.wizardry.to_le_bytes());
        b
    }
}

/// One inventory cell: item type, item id within the type, and state flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventoryCell {
    pub type_id: u8,
    pub item_id: u8,
    pub flags: u8,
}

/// The 207-byte inventory blob: 63 backpack cells then 6 belt cells, each 3
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub backpack: [InventoryCell; BACKPACK_CELLS],
    pub belt: [InventoryCell; BELT_CELLS],
}

impl Inventory {
    pub fn parse(b: &[u8]) -> Result<Self, ProtoError> {
        if b.len() != INVENTORY_LEN {
            return Err(ProtoError::TooShort {
                need: INVENTORY_LEN,
                got: b.len(),
            });
        }
        let cell = |i: usize| InventoryCell {
            type_id: b[i],
            item_id: b[i + 1],
            flags: b[i + 2],
        };
        let mut backpack = [InventoryCell::default(); BACKPACK_CELLS];
        for (n, slot) in backpack.iter_mut().enumerate() {
            *slot = cell(n * 3);
        }
        let mut belt = [InventoryCell::default(); BELT_CELLS];
        for (n, slot) in belt.iter_mut().enumerate() {
            *slot = cell((BACKPACK_CELLS + n) * 3);
        }
        Ok(Self { backpack, belt })
    }

    pub fn serialize(&self) -> [u8; INVENTORY_LEN] {
        let mut b = [0u8; INVENTORY_LEN];
        for (n, slot) in self.backpack.iter().chain(self.belt.iter()).enumerate() {
            b[n * 3] = slot.type_id;
            b[n * 3 + 1] = slot.item_id;
            b[n * 3 + 2] = slot.flags;
        }
        b
    }
}

/// Rewrite zeros to one in the known-spell positions. Operates in place on a
/// blob already validated to be 43 bytes.
pub fn normalize_spells(spells: &mut [u8]) {
    for slot in spells.iter_mut().take(KNOWN_SPELL_SLOTS) {
        if *slot == 0 {
            *slot = 1;
        }
    }
}

pub fn validate_spells(b: &[u8]) -> Result<(), ProtoError> {
    if b.len() != SPELLS_LEN {
        return Err(ProtoError::TooShort {
            need: SPELLS_LEN,
            got: b.len(),
        });
    }
    Ok(())
}
