use serde::{Deserialize, Serialize};

/// World-space position. The server clamps `z` to terrain; clients send
/// whatever their local prediction produced.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Planar distance. Gameplay range checks ignore height.
    pub fn dist2d(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatBlock {
    #[serde(rename = "str")]
    pub strength: i32,
    #[serde(rename = "int")]
    pub intellect: i32,
    #[serde(rename = "dex")]
    pub dexterity: i32,
    #[serde(rename = "vit")]
    pub vitality: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedStats {
    pub atk: i32,
    pub matk: i32,
    pub def: i32,
    pub attack_speed: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipSlotKey {
    Weapon,
    Armor,
    Helmet,
    Boots,
    Gloves,
    Ring,
    Necklace,
}

impl EquipSlotKey {
    pub fn all() -> &'static [EquipSlotKey] {
        &[
            EquipSlotKey::Weapon,
            EquipSlotKey::Armor,
            EquipSlotKey::Helmet,
            EquipSlotKey::Boots,
            EquipSlotKey::Gloves,
            EquipSlotKey::Ring,
            EquipSlotKey::Necklace,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EquipSlotKey::Weapon => "weapon",
            EquipSlotKey::Armor => "armor",
            EquipSlotKey::Helmet => "helmet",
            EquipSlotKey::Boots => "boots",
            EquipSlotKey::Gloves => "gloves",
            EquipSlotKey::Ring => "ring",
            EquipSlotKey::Necklace => "necklace",
        }
    }
}

/// Which base stat a status point can be spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseStatKey {
    Str,
    Int,
    Dex,
    Vit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSummary {
    pub id: u64,
    pub name: String,
    pub race: String,
    pub class: String,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterView {
    pub id: u64,
    pub name: String,
    pub race: String,
    pub class: String,
    pub level: u32,
    pub experience: u64,
    pub status_points: u32,
    pub health: i32,
    pub max_health: i32,
    pub mana: i32,
    pub max_mana: i32,
    pub base_stats: StatBlock,
    pub stats: DerivedStats,
    pub position: Position,
    pub is_dead: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub player_id: String,
    pub name: String,
    pub class: String,
    pub level: u32,
    pub position: Position,
    pub health: i32,
    pub max_health: i32,
    pub mana: i32,
    pub max_mana: i32,
    pub is_dead: bool,
    pub is_moving: bool,
    pub in_combat: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonsterSnapshot {
    pub monster_id: u64,
    pub template_id: u32,
    pub name: String,
    pub level: u32,
    pub position: Position,
    pub health: i32,
    pub max_health: i32,
    pub is_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_player_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInstanceView {
    pub instance_id: u64,
    pub template_id: u32,
    pub name: String,
    pub item_type: String,
    pub quantity: u32,
    pub slot: i32,
    pub is_equipped: bool,
}

/// Equipment slot references. `None` means the slot is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentView {
    pub weapon: Option<u64>,
    pub armor: Option<u64>,
    pub helmet: Option<u64>,
    pub boots: Option<u64>,
    pub gloves: Option<u64>,
    pub ring: Option<u64>,
    pub necklace: Option<u64>,
}

impl EquipmentView {
    pub fn get(&self, slot: EquipSlotKey) -> Option<u64> {
        match slot {
            EquipSlotKey::Weapon => self.weapon,
            EquipSlotKey::Armor => self.armor,
            EquipSlotKey::Helmet => self.helmet,
            EquipSlotKey::Boots => self.boots,
            EquipSlotKey::Gloves => self.gloves,
            EquipSlotKey::Ring => self.ring,
            EquipSlotKey::Necklace => self.necklace,
        }
    }

    pub fn set(&mut self, slot: EquipSlotKey, v: Option<u64>) {
        match slot {
            EquipSlotKey::Weapon => self.weapon = v,
            EquipSlotKey::Armor => self.armor = v,
            EquipSlotKey::Helmet => self.helmet = v,
            EquipSlotKey::Boots => self.boots = v,
            EquipSlotKey::Gloves => self.gloves = v,
            EquipSlotKey::Ring => self.ring = v,
            EquipSlotKey::Necklace => self.necklace = v,
        }
    }

    /// Iterate the occupied slots.
    pub fn occupied(&self) -> impl Iterator<Item = (EquipSlotKey, u64)> + '_ {
        EquipSlotKey::all()
            .iter()
            .filter_map(|s| self.get(*s).map(|id| (*s, id)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryView {
    pub max_slots: u32,
    pub gold: u64,
    pub equipment: EquipmentView,
    pub items: Vec<ItemInstanceView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedSkillView {
    pub skill_id: u32,
    pub name: String,
    pub level: u32,
    pub max_level: u32,
    pub slot_number: u8,
    pub cooldown: f32,
    pub mana_cost: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillTemplateView {
    pub id: u32,
    pub name: String,
    pub skill_type: String,
    pub damage_type: String,
    pub target_type: String,
    pub required_level: u32,
    pub max_level: u32,
    pub mana_cost: i32,
    pub health_cost: i32,
    pub cooldown: f32,
    pub cast_time: f32,
    pub range: f32,
    pub area_radius: f32,
}

/// One affected target inside a skill resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillTargetReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monster_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damage: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healing: Option<i32>,
    pub critical: bool,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillUseReport {
    pub skill_id: u32,
    pub skill_name: String,
    pub caster_id: String,
    pub targets: Vec<SkillTargetReport>,
    pub mana_cost: i32,
    pub health_cost: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LootItemView {
    pub template_id: u32,
    pub name: String,
    pub quantity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_block_uses_short_keys() {
        let s = StatBlock {
            strength: 5,
            intellect: 1,
            dexterity: 3,
            vitality: 4,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["str"], 5);
        assert_eq!(v["vit"], 4);
    }

    #[test]
    fn dist2d_ignores_height() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 100.0);
        assert!((a.dist2d(&b) - 5.0).abs() < f32::EPSILON);
    }
}
