use serde::{Deserialize, Serialize};

use crate::types::{BaseStatKey, EquipSlotKey, Position};

/// Inbound message type tags, in the order the session state machine meets
/// them. `decode_client` consults this before deserializing so an unknown
/// tag can be logged and dropped instead of failing the session.
pub const KNOWN_TYPES: &[&str] = &[
    "ping",
    "login",
    "register",
    "listCharacters",
    "createCharacter",
    "selectCharacter",
    "moveRequest",
    "attackMonster",
    "useSkill",
    "cancelCast",
    "learnSkill",
    "levelUpSkill",
    "getSkills",
    "getSkillList",
    "getInventory",
    "useItem",
    "equipItem",
    "unequipItem",
    "dropItem",
    "respawn",
    "addStatusPoint",
    "getCharacterStats",
];

pub fn is_known_type(tag: &str) -> bool {
    KNOWN_TYPES.iter().any(|t| *t == tag)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    Ping,
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
    },
    ListCharacters,
    CreateCharacter {
        name: String,
        race: String,
        class: String,
    },
    SelectCharacter {
        character_id: u64,
    },
    MoveRequest {
        target_position: Position,
    },
    AttackMonster {
        monster_id: u64,
    },
    UseSkill {
        skill_id: u32,
        #[serde(default)]
        slot_number: Option<u8>,
        #[serde(default)]
        target_id: Option<u64>,
        #[serde(default)]
        target_type: Option<String>,
        #[serde(default)]
        target_position: Option<Position>,
    },
    CancelCast,
    LearnSkill {
        skill_id: u32,
        slot_number: u8,
    },
    LevelUpSkill {
        skill_id: u32,
    },
    GetSkills,
    GetSkillList,
    GetInventory,
    UseItem {
        instance_id: u64,
    },
    EquipItem {
        instance_id: u64,
    },
    UnequipItem {
        slot: EquipSlotKey,
    },
    DropItem {
        instance_id: u64,
        quantity: u32,
    },
    Respawn,
    AddStatusPoint {
        stat: BaseStatKey,
    },
    GetCharacterStats,
}

impl ClientMsg {
    /// Tag string for logging.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ClientMsg::Ping => "ping",
            ClientMsg::Login { .. } => "login",
            ClientMsg::Register { .. } => "register",
            ClientMsg::ListCharacters => "listCharacters",
            ClientMsg::CreateCharacter { .. } => "createCharacter",
            ClientMsg::SelectCharacter { .. } => "selectCharacter",
            ClientMsg::MoveRequest { .. } => "moveRequest",
            ClientMsg::AttackMonster { .. } => "attackMonster",
            ClientMsg::UseSkill { .. } => "useSkill",
            ClientMsg::CancelCast => "cancelCast",
            ClientMsg::LearnSkill { .. } => "learnSkill",
            ClientMsg::LevelUpSkill { .. } => "levelUpSkill",
            ClientMsg::GetSkills => "getSkills",
            ClientMsg::GetSkillList => "getSkillList",
            ClientMsg::GetInventory => "getInventory",
            ClientMsg::UseItem { .. } => "useItem",
            ClientMsg::EquipItem { .. } => "equipItem",
            ClientMsg::UnequipItem { .. } => "unequipItem",
            ClientMsg::DropItem { .. } => "dropItem",
            ClientMsg::Respawn => "respawn",
            ClientMsg::AddStatusPoint { .. } => "addStatusPoint",
            ClientMsg::GetCharacterStats => "getCharacterStats",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_match_type_tags() {
        // Every tag the serde codec accepts must be in KNOWN_TYPES, else
        // decode_client would misreport it as unknown.
        let probe = [
            ClientMsg::Ping,
            ClientMsg::ListCharacters,
            ClientMsg::CancelCast,
            ClientMsg::GetSkills,
            ClientMsg::GetSkillList,
            ClientMsg::GetInventory,
            ClientMsg::Respawn,
            ClientMsg::GetCharacterStats,
        ];
        for m in probe {
            assert!(is_known_type(m.type_tag()), "missing {}", m.type_tag());
        }
        assert_eq!(KNOWN_TYPES.len(), 22);
    }

    #[test]
    fn move_request_parses_position() {
        let m: ClientMsg = serde_json::from_str(
            r#"{"type":"moveRequest","targetPosition":{"x":1.0,"y":2.0,"z":0.5}}"#,
        )
        .unwrap();
        let ClientMsg::MoveRequest { target_position } = m else {
            panic!("wrong variant");
        };
        assert_eq!(target_position.x, 1.0);
        assert_eq!(target_position.z, 0.5);
    }

    #[test]
    fn use_skill_optional_fields_default() {
        let m: ClientMsg =
            serde_json::from_str(r#"{"type":"useSkill","skillId":3}"#).unwrap();
        let ClientMsg::UseSkill {
            skill_id,
            target_id,
            target_position,
            ..
        } = m
        else {
            panic!("wrong variant");
        };
        assert_eq!(skill_id, 3);
        assert!(target_id.is_none());
        assert!(target_position.is_none());
    }

    #[test]
    fn unequip_takes_slot_keys() {
        let m: ClientMsg =
            serde_json::from_str(r#"{"type":"unequipItem","slot":"helmet"}"#).unwrap();
        assert!(matches!(
            m,
            ClientMsg::UnequipItem {
                slot: EquipSlotKey::Helmet
            }
        ));
    }
}
