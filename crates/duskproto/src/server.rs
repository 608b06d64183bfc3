use serde::{Deserialize, Serialize};

use crate::types::{
    BaseStatKey, CharacterSummary, CharacterView, DerivedStats, EquipSlotKey, EquipmentView,
    InventoryView, LearnedSkillView, LootItemView, MonsterSnapshot, PlayerSnapshot, Position,
    SkillTemplateView, SkillUseReport, StatBlock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkillFailReason {
    PlayerDead,
    SkillNotLearned,
    SkillNotFound,
    Cooldown,
    InvalidLevel,
    NoMana,
    NoHealth,
    OutOfRange,
    ExecutionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemFailReason {
    HpFull,
    MpFull,
    OnCooldown,
    NotFound,
    NotConsumable,
    NotEquipment,
    LevelTooLow,
    ClassMismatch,
    AlreadyEquipped,
    ItemEquipped,
    InventoryFull,
    QuantityInsufficient,
    SlotEmpty,
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub account_id: u64,
    pub characters: Vec<CharacterSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    Pong,
    Error {
        message: String,
    },

    // Account / character-select phase.
    LoginResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<LoginData>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RegisterResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CharacterList {
        characters: Vec<CharacterSummary>,
    },
    CreateCharacterResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        character: Option<CharacterSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SelectCharacterResponse {
        success: bool,
        character: CharacterView,
        player_id: String,
        all_players: Vec<PlayerSnapshot>,
        all_monsters: Vec<MonsterSnapshot>,
        inventory: InventoryView,
    },

    // Movement.
    MoveAccepted {
        target_position: Position,
    },

    // Combat.
    AttackStarted {
        player_id: String,
        monster_id: u64,
    },
    PlayerAttack {
        player_id: String,
        monster_id: u64,
        damage: i32,
        critical: bool,
        monster_health: i32,
    },
    CombatResult {
        attacker: String,
        target_player_id: String,
        damage: i32,
        critical: bool,
        health: i32,
    },
    PlayerDeath {
        player_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        killer_monster_id: Option<u64>,
    },
    PlayerRespawn {
        player_id: String,
        position: Position,
        health: i32,
        mana: i32,
    },
    RespawnResponse {
        position: Position,
        health: i32,
        mana: i32,
    },
    LevelUp {
        player_id: String,
        level: u32,
        max_health: i32,
        max_mana: i32,
        status_points: u32,
        new_stats: DerivedStats,
    },
    LootReceived {
        monster_id: u64,
        gold: u64,
        items: Vec<LootItemView>,
    },

    // Skills.
    SkillUsed {
        result: SkillUseReport,
    },
    SkillUseFailed {
        skill_id: u32,
        reason: SkillFailReason,
    },
    SkillLearned {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill_id: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        slot_number: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SkillLeveledUp {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill_id: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_level: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_points: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SkillsResponse {
        skills: Vec<LearnedSkillView>,
    },
    SkillListResponse {
        skills: Vec<SkillTemplateView>,
    },

    // Inventory.
    InventoryResponse {
        success: bool,
        inventory: InventoryView,
    },
    ItemUsed {
        player_id: String,
        instance_id: u64,
        health: i32,
        max_health: i32,
        mana: i32,
        max_mana: i32,
        remaining_quantity: u32,
    },
    ItemUseFailed {
        reason: ItemFailReason,
        message: String,
    },
    ItemEquipped {
        player_id: String,
        instance_id: u64,
        new_stats: DerivedStats,
        equipment: EquipmentView,
    },
    ItemUnequipped {
        player_id: String,
        new_stats: DerivedStats,
        equipment: EquipmentView,
        slot: EquipSlotKey,
    },
    ItemDropped {
        player_id: String,
        instance_id: u64,
        quantity: u32,
    },

    // Stats.
    StatusPointAdded {
        player_id: String,
        stat: BaseStatKey,
        status_points: u32,
        new_stats: DerivedStats,
    },
    PlayerStatsUpdate {
        player_id: String,
        health: i32,
        max_health: i32,
        mana: i32,
        max_mana: i32,
    },
    StatsResponse {
        character: CharacterView,
        base_stats: StatBlock,
        stats: DerivedStats,
        status_points: u32,
    },

    // World.
    WorldState {
        timestamp: u64,
        players: Vec<PlayerSnapshot>,
        monsters: Vec<MonsterSnapshot>,
    },
    PlayerJoined {
        player: PlayerSnapshot,
    },
    PlayerDisconnected {
        player_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_screaming_snake() {
        let v = serde_json::to_value(SkillFailReason::SkillNotLearned).unwrap();
        assert_eq!(v, "SKILL_NOT_LEARNED");
        let v = serde_json::to_value(ItemFailReason::HpFull).unwrap();
        assert_eq!(v, "HP_FULL");
    }

    #[test]
    fn skill_use_failed_shape() {
        let m = ServerMsg::SkillUseFailed {
            skill_id: 9,
            reason: SkillFailReason::Cooldown,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "skillUseFailed");
        assert_eq!(v["skillId"], 9);
        assert_eq!(v["reason"], "COOLDOWN");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let m = ServerMsg::LoginResponse {
            success: false,
            data: None,
            message: Some("bad credentials".to_string()),
        };
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("data").is_none());
        assert_eq!(v["message"], "bad credentials");
    }
}
