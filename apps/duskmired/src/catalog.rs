use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use duskproto::types::{EquipSlotKey, Position, StatBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Consumable,
    Equipment,
    Material,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Consumable => "consumable",
            ItemType::Equipment => "equipment",
            ItemType::Material => "material",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectTarget {
    Health,
    Mana,
}

impl EffectTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectTarget::Health => "health",
            EffectTarget::Mana => "mana",
        }
    }
}

/// Flat bonuses granted by an equipped item. Base-stat bonuses feed the
/// stat derivation; atk/matk/def/attack_speed apply after it.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct StatBonuses {
    pub base: StatBlock,
    pub atk: i32,
    pub matk: i32,
    pub def: i32,
    pub attack_speed: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemTemplate {
    pub id: u32,
    pub name: String,
    pub item_type: ItemType,
    #[serde(default = "one")]
    pub max_stack: u32,
    #[serde(default)]
    pub required_level: u32,
    #[serde(default)]
    pub required_class: Option<String>,
    #[serde(default)]
    pub slot: Option<EquipSlotKey>,
    #[serde(default)]
    pub bonuses: StatBonuses,
    #[serde(default)]
    pub effect_target: Option<EffectTarget>,
    #[serde(default)]
    pub effect_value: i32,
}

fn one() -> u32 {
    1
}

fn default_attack_range() -> f32 {
    2.0
}

fn default_spawn_count() -> u32 {
    3
}

fn default_movement_speed() -> f32 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonsterTemplate {
    pub id: u32,
    pub name: String,
    pub level: u32,
    pub max_health: i32,
    pub attack_power: i32,
    pub defense: i32,
    pub experience_reward: u64,
    /// Attacks per second.
    pub attack_speed: f32,
    pub movement_speed: f32,
    #[serde(default = "default_attack_range")]
    pub attack_range: f32,
    pub aggro_range: f32,
    pub spawn_center: Position,
    pub spawn_radius: f32,
    pub respawn_time_s: f32,
    pub loot_table: u32,
    /// Live instances kept in the world for this template.
    #[serde(default = "default_spawn_count")]
    pub spawn_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LootDrop {
    pub template_id: u32,
    /// Probability in [0, 1].
    pub chance: f32,
    pub qty_min: u32,
    pub qty_max: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LootTable {
    pub id: u32,
    pub gold_min: u64,
    pub gold_max: u64,
    #[serde(default)]
    pub drops: Vec<LootDrop>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillType {
    Active,
    Passive,
    Buff,
}

impl SkillType {
    pub fn as_str(self) -> &'static str {
        match self {
            SkillType::Active => "active",
            SkillType::Passive => "passive",
            SkillType::Buff => "buff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageType {
    Physical,
    Magical,
    True,
    #[serde(rename = "none")]
    NoDamage,
}

impl DamageType {
    pub fn as_str(self) -> &'static str {
        match self {
            DamageType::Physical => "physical",
            DamageType::Magical => "magical",
            DamageType::True => "true",
            DamageType::NoDamage => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Enemy,
    #[serde(rename = "self")]
    SelfCast,
    Ally,
    Area,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetType::Enemy => "enemy",
            TargetType::SelfCast => "self",
            TargetType::Ally => "ally",
            TargetType::Area => "area",
        }
    }
}

/// One row per skill level, 1-based.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SkillLevelRow {
    pub base_damage: i32,
    pub base_healing: i32,
    pub damage_multiplier: f32,
    pub crit_chance_bonus: f32,
    pub status_point_cost: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillEffectKind {
    StatBuff,
    Dot,
    Stun,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillEffectDef {
    pub kind: SkillEffectKind,
    #[serde(default)]
    pub target_stat: Option<String>,
    #[serde(default)]
    pub value: i32,
    pub duration_s: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillTemplate {
    pub id: u32,
    pub name: String,
    pub skill_type: SkillType,
    pub damage_type: DamageType,
    pub target_type: TargetType,
    #[serde(default)]
    pub required_level: u32,
    #[serde(default)]
    pub required_class: Option<String>,
    pub max_level: u32,
    #[serde(default)]
    pub mana_cost: i32,
    #[serde(default)]
    pub health_cost: i32,
    #[serde(default)]
    pub cooldown_s: f32,
    #[serde(default)]
    pub cast_time_s: f32,
    #[serde(default)]
    pub range: f32,
    #[serde(default)]
    pub area_radius: f32,
    pub levels: Vec<SkillLevelRow>,
    #[serde(default)]
    pub effects: Vec<SkillEffectDef>,
}

impl SkillTemplate {
    /// Row for a 1-based skill level.
    pub fn level_row(&self, level: u32) -> Option<&SkillLevelRow> {
        if level == 0 {
            return None;
        }
        self.levels.get((level - 1) as usize)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StarterItem {
    pub template_id: u32,
    pub quantity: u32,
}

/// Per-class balance table. Derived stats are a pure function of these
/// coefficients, the character's base stats and equipment bonuses; see
/// `items::recalculate_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassTemplate {
    pub name: String,
    pub base_stats: StatBlock,
    pub base_health: i32,
    pub base_mana: i32,
    pub health_per_vit: i32,
    pub health_per_level: i32,
    pub mana_per_int: i32,
    pub mana_per_level: i32,
    pub atk_per_str: f32,
    pub matk_per_int: f32,
    pub def_per_vit: f32,
    pub base_attack_speed: f32,
    pub attack_speed_per_dex: f32,
    pub status_points_per_level: u32,
    pub attack_range: f32,
    #[serde(default = "default_movement_speed")]
    pub movement_speed: f32,
    #[serde(default)]
    pub starter_items: Vec<StarterItem>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct XpScaleRow {
    /// Applies when `player_level - monster_level >= min_level_diff`.
    pub min_level_diff: i32,
    pub multiplier: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XpTable {
    /// Sorted ascending by `min_level_diff`; the last matching row wins.
    pub scale: Vec<XpScaleRow>,
    /// `curve[level - 1]` is the XP needed to leave that level.
    pub curve: Vec<u64>,
}

impl XpTable {
    pub fn xp_to_next(&self, level: u32) -> u64 {
        if level == 0 {
            return u64::MAX;
        }
        match self.curve.get((level - 1) as usize) {
            Some(v) => *v,
            // Off the end of the authored curve: keep growing quadratically
            // from the last authored value so high levels stay reachable.
            None => {
                let last = self.curve.last().copied().unwrap_or(100);
                let over = level as u64 - self.curve.len() as u64;
                last.saturating_add(last / 4 * over * over)
            }
        }
    }

    pub fn scaled_reward(&self, player_level: u32, monster_level: u32, base: u64) -> u64 {
        let diff = player_level as i32 - monster_level as i32;
        let mut mult = 1.0f32;
        for row in &self.scale {
            if diff >= row.min_level_diff {
                mult = row.multiplier;
            }
        }
        (base as f64 * mult as f64).round() as u64
    }
}

/// Uniform-grid heightmap. `heights` is row-major, `width * height` cells of
/// `cell_size` world units starting at `(origin_x, origin_y)`.
#[derive(Debug, Clone, Deserialize)]
pub struct Terrain {
    pub origin_x: f32,
    pub origin_y: f32,
    pub cell_size: f32,
    pub width: u32,
    pub height: u32,
    pub heights: Vec<f32>,
}

impl Terrain {
    pub fn max_x(&self) -> f32 {
        self.origin_x + self.cell_size * self.width.saturating_sub(1) as f32
    }

    pub fn max_y(&self) -> f32 {
        self.origin_y + self.cell_size * self.height.saturating_sub(1) as f32
    }

    pub fn height_at(&self, x: f32, y: f32) -> f32 {
        let cx = ((x - self.origin_x) / self.cell_size).round();
        let cy = ((y - self.origin_y) / self.cell_size).round();
        let cx = (cx.max(0.0) as u32).min(self.width.saturating_sub(1));
        let cy = (cy.max(0.0) as u32).min(self.height.saturating_sub(1));
        self.heights
            .get((cy * self.width + cx) as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Clamp a position into the playable area and snap `z` to the ground.
    pub fn clamp(&self, pos: Position) -> Position {
        let x = pos.x.clamp(self.origin_x, self.max_x());
        let y = pos.y.clamp(self.origin_y, self.max_y());
        Position::new(x, y, self.height_at(x, y))
    }
}

/// All static game data, loaded once at boot and shared immutably.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub items: HashMap<u32, ItemTemplate>,
    pub monsters: HashMap<u32, MonsterTemplate>,
    pub skills: HashMap<u32, SkillTemplate>,
    pub loot: HashMap<u32, LootTable>,
    pub classes: HashMap<String, ClassTemplate>,
    pub races: Vec<String>,
    pub xp: XpTable,
    pub terrain: Terrain,
}

impl Catalog {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let items: Vec<ItemTemplate> = load_json(dir, "items.json")?;
        let monsters: Vec<MonsterTemplate> = load_json(dir, "monsters.json")?;
        let skills: Vec<SkillTemplate> = load_json(dir, "skills.json")?;
        let loot: Vec<LootTable> = load_json(dir, "loot_tables.json")?;
        let classes: Vec<ClassTemplate> = load_json(dir, "classes.json")?;
        let races: Vec<String> = load_json(dir, "races.json")?;
        let xp: XpTable = load_json(dir, "xp.json")?;
        let terrain: Terrain = load_json(dir, "terrain.json")?;

        let cat = Self {
            items: items.into_iter().map(|t| (t.id, t)).collect(),
            monsters: monsters.into_iter().map(|t| (t.id, t)).collect(),
            skills: skills.into_iter().map(|t| (t.id, t)).collect(),
            loot: loot.into_iter().map(|t| (t.id, t)).collect(),
            classes: classes.into_iter().map(|t| (t.name.clone(), t)).collect(),
            races,
            xp,
            terrain,
        };
        cat.validate()?;
        Ok(cat)
    }

    /// Cross-reference check so a bad content drop fails at boot, not at
    /// the first kill.
    fn validate(&self) -> anyhow::Result<()> {
        if self.terrain.heights.len() != (self.terrain.width * self.terrain.height) as usize {
            bail!(
                "terrain heights: expected {} cells, got {}",
                self.terrain.width * self.terrain.height,
                self.terrain.heights.len()
            );
        }
        for m in self.monsters.values() {
            if !self.loot.contains_key(&m.loot_table) {
                bail!("monster {} references missing loot table {}", m.id, m.loot_table);
            }
        }
        for t in self.loot.values() {
            if t.gold_min > t.gold_max {
                bail!("loot table {}: gold_min > gold_max", t.id);
            }
            for d in &t.drops {
                if !self.items.contains_key(&d.template_id) {
                    bail!("loot table {} references missing item {}", t.id, d.template_id);
                }
                if d.qty_min > d.qty_max || d.qty_min == 0 {
                    bail!("loot table {}: bad quantity range for item {}", t.id, d.template_id);
                }
            }
        }
        for s in self.skills.values() {
            if s.levels.is_empty() || s.levels.len() != s.max_level as usize {
                bail!("skill {}: {} level rows for max_level {}", s.id, s.levels.len(), s.max_level);
            }
        }
        for c in self.classes.values() {
            for si in &c.starter_items {
                if !self.items.contains_key(&si.template_id) {
                    bail!("class {}: starter item {} missing", c.name, si.template_id);
                }
            }
        }
        for it in self.items.values() {
            if it.item_type == ItemType::Equipment && it.slot.is_none() {
                bail!("item {}: equipment without a slot", it.id);
            }
            if it.item_type == ItemType::Equipment && it.max_stack != 1 {
                bail!("item {}: equipment must not stack", it.id);
            }
            if it.max_stack == 0 {
                bail!("item {}: max_stack 0", it.id);
            }
        }
        Ok(())
    }

    pub fn item(&self, id: u32) -> Option<&ItemTemplate> {
        self.items.get(&id)
    }

    pub fn monster(&self, id: u32) -> Option<&MonsterTemplate> {
        self.monsters.get(&id)
    }

    pub fn skill(&self, id: u32) -> Option<&SkillTemplate> {
        self.skills.get(&id)
    }

    pub fn class(&self, name: &str) -> Option<&ClassTemplate> {
        self.classes.get(name)
    }

    pub fn race_exists(&self, name: &str) -> bool {
        self.races.iter().any(|r| r == name)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(dir: &Path, file: &str) -> anyhow::Result<T> {
    let path = dir.join(file);
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("read content file {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse content file {}", path.display()))
}

#[cfg(test)]
pub fn fixture() -> Catalog {
    let potion = ItemTemplate {
        id: 1,
        name: "minor healing potion".to_string(),
        item_type: ItemType::Consumable,
        max_stack: 20,
        required_level: 0,
        required_class: None,
        slot: None,
        bonuses: StatBonuses::default(),
        effect_target: Some(EffectTarget::Health),
        effect_value: 25,
    };
    let mana_potion = ItemTemplate {
        id: 2,
        name: "minor mana potion".to_string(),
        item_type: ItemType::Consumable,
        max_stack: 20,
        required_level: 0,
        required_class: None,
        slot: None,
        bonuses: StatBonuses::default(),
        effect_target: Some(EffectTarget::Mana),
        effect_value: 20,
    };
    let sword = ItemTemplate {
        id: 10,
        name: "worn shortsword".to_string(),
        item_type: ItemType::Equipment,
        max_stack: 1,
        required_level: 1,
        required_class: None,
        slot: Some(EquipSlotKey::Weapon),
        bonuses: StatBonuses {
            base: StatBlock {
                strength: 2,
                ..StatBlock::default()
            },
            atk: 5,
            ..StatBonuses::default()
        },
        effect_target: None,
        effect_value: 0,
    };
    let helmet = ItemTemplate {
        id: 11,
        name: "cracked helmet".to_string(),
        item_type: ItemType::Equipment,
        max_stack: 1,
        required_level: 1,
        required_class: None,
        slot: Some(EquipSlotKey::Helmet),
        bonuses: StatBonuses {
            def: 3,
            ..StatBonuses::default()
        },
        effect_target: None,
        effect_value: 0,
    };
    let pelt = ItemTemplate {
        id: 20,
        name: "slime residue".to_string(),
        item_type: ItemType::Material,
        max_stack: 50,
        required_level: 0,
        required_class: None,
        slot: None,
        bonuses: StatBonuses::default(),
        effect_target: None,
        effect_value: 0,
    };

    let slime = MonsterTemplate {
        id: 1,
        name: "slime".to_string(),
        level: 1,
        max_health: 20,
        attack_power: 3,
        defense: 0,
        experience_reward: 10,
        attack_speed: 1.0,
        movement_speed: 2.0,
        attack_range: 1.5,
        aggro_range: 8.0,
        spawn_center: Position::new(10.0, 10.0, 0.0),
        spawn_radius: 5.0,
        respawn_time_s: 10.0,
        loot_table: 1,
        spawn_count: 3,
    };
    let wolf = MonsterTemplate {
        id: 2,
        name: "mire wolf".to_string(),
        level: 3,
        max_health: 60,
        attack_power: 8,
        defense: 5,
        experience_reward: 35,
        attack_speed: 1.2,
        movement_speed: 4.0,
        attack_range: 1.8,
        aggro_range: 12.0,
        spawn_center: Position::new(30.0, 30.0, 0.0),
        spawn_radius: 8.0,
        respawn_time_s: 20.0,
        loot_table: 2,
        spawn_count: 2,
    };

    let strike = SkillTemplate {
        id: 1,
        name: "Heavy Strike".to_string(),
        skill_type: SkillType::Active,
        damage_type: DamageType::Physical,
        target_type: TargetType::Enemy,
        required_level: 1,
        required_class: Some("warrior".to_string()),
        max_level: 3,
        mana_cost: 5,
        health_cost: 0,
        cooldown_s: 2.0,
        cast_time_s: 0.0,
        range: 3.0,
        area_radius: 0.0,
        levels: vec![
            SkillLevelRow {
                base_damage: 5,
                damage_multiplier: 1.2,
                crit_chance_bonus: 0.05,
                status_point_cost: 1,
                ..SkillLevelRow::default()
            },
            SkillLevelRow {
                base_damage: 9,
                damage_multiplier: 1.35,
                crit_chance_bonus: 0.05,
                status_point_cost: 2,
                ..SkillLevelRow::default()
            },
            SkillLevelRow {
                base_damage: 14,
                damage_multiplier: 1.5,
                crit_chance_bonus: 0.08,
                status_point_cost: 3,
                ..SkillLevelRow::default()
            },
        ],
        effects: Vec::new(),
    };
    let nova = SkillTemplate {
        id: 2,
        name: "Ember Nova".to_string(),
        skill_type: SkillType::Active,
        damage_type: DamageType::Magical,
        target_type: TargetType::Area,
        required_level: 1,
        required_class: None,
        max_level: 2,
        mana_cost: 12,
        health_cost: 0,
        cooldown_s: 5.0,
        cast_time_s: 0.0,
        range: 0.0,
        area_radius: 3.0,
        levels: vec![
            SkillLevelRow {
                base_damage: 8,
                damage_multiplier: 1.0,
                status_point_cost: 1,
                ..SkillLevelRow::default()
            },
            SkillLevelRow {
                base_damage: 14,
                damage_multiplier: 1.2,
                status_point_cost: 2,
                ..SkillLevelRow::default()
            },
        ],
        effects: Vec::new(),
    };
    let mend = SkillTemplate {
        id: 3,
        name: "Mend".to_string(),
        skill_type: SkillType::Active,
        damage_type: DamageType::NoDamage,
        target_type: TargetType::SelfCast,
        required_level: 1,
        required_class: None,
        max_level: 2,
        mana_cost: 8,
        health_cost: 0,
        cooldown_s: 4.0,
        cast_time_s: 0.0,
        range: 0.0,
        area_radius: 0.0,
        levels: vec![
            SkillLevelRow {
                base_healing: 15,
                damage_multiplier: 0.5,
                status_point_cost: 1,
                ..SkillLevelRow::default()
            },
            SkillLevelRow {
                base_healing: 25,
                damage_multiplier: 0.7,
                status_point_cost: 2,
                ..SkillLevelRow::default()
            },
        ],
        effects: Vec::new(),
    };
    let warcry = SkillTemplate {
        id: 4,
        name: "War Cry".to_string(),
        skill_type: SkillType::Buff,
        damage_type: DamageType::NoDamage,
        target_type: TargetType::SelfCast,
        required_level: 2,
        required_class: Some("warrior".to_string()),
        max_level: 1,
        mana_cost: 10,
        health_cost: 0,
        cooldown_s: 20.0,
        cast_time_s: 0.0,
        range: 0.0,
        area_radius: 0.0,
        levels: vec![SkillLevelRow {
            status_point_cost: 1,
            ..SkillLevelRow::default()
        }],
        effects: vec![SkillEffectDef {
            kind: SkillEffectKind::StatBuff,
            target_stat: Some("atk".to_string()),
            value: 10,
            duration_s: 10.0,
        }],
    };

    let warrior = ClassTemplate {
        name: "warrior".to_string(),
        base_stats: StatBlock {
            strength: 8,
            intellect: 2,
            dexterity: 4,
            vitality: 7,
        },
        base_health: 80,
        base_mana: 20,
        health_per_vit: 8,
        health_per_level: 12,
        mana_per_int: 4,
        mana_per_level: 3,
        atk_per_str: 2.0,
        matk_per_int: 1.0,
        def_per_vit: 1.5,
        base_attack_speed: 1.0,
        attack_speed_per_dex: 0.01,
        status_points_per_level: 5,
        attack_range: 2.0,
        movement_speed: 5.0,
        starter_items: vec![
            StarterItem {
                template_id: 10,
                quantity: 1,
            },
            StarterItem {
                template_id: 1,
                quantity: 5,
            },
        ],
    };
    let mage = ClassTemplate {
        name: "mage".to_string(),
        base_stats: StatBlock {
            strength: 2,
            intellect: 9,
            dexterity: 3,
            vitality: 4,
        },
        base_health: 50,
        base_mana: 60,
        health_per_vit: 6,
        health_per_level: 7,
        mana_per_int: 7,
        mana_per_level: 8,
        atk_per_str: 1.0,
        matk_per_int: 2.5,
        def_per_vit: 1.0,
        base_attack_speed: 0.9,
        attack_speed_per_dex: 0.008,
        status_points_per_level: 5,
        attack_range: 8.0,
        movement_speed: 5.0,
        starter_items: vec![StarterItem {
            template_id: 2,
            quantity: 5,
        }],
    };

    let xp = XpTable {
        scale: vec![
            XpScaleRow {
                min_level_diff: -100,
                multiplier: 1.5,
            },
            XpScaleRow {
                min_level_diff: -2,
                multiplier: 1.0,
            },
            XpScaleRow {
                min_level_diff: 3,
                multiplier: 0.5,
            },
            XpScaleRow {
                min_level_diff: 6,
                multiplier: 0.1,
            },
        ],
        curve: vec![100, 250, 500, 900, 1500],
    };

    let terrain = Terrain {
        origin_x: -100.0,
        origin_y: -100.0,
        cell_size: 10.0,
        width: 21,
        height: 21,
        heights: vec![0.0; 21 * 21],
    };

    let cat = Catalog {
        items: [potion, mana_potion, sword, helmet, pelt]
            .into_iter()
            .map(|t| (t.id, t))
            .collect(),
        monsters: [slime, wolf].into_iter().map(|t| (t.id, t)).collect(),
        skills: [strike, nova, mend, warcry]
            .into_iter()
            .map(|t| (t.id, t))
            .collect(),
        loot: [
            LootTable {
                id: 1,
                gold_min: 2,
                gold_max: 8,
                drops: vec![LootDrop {
                    template_id: 20,
                    chance: 0.8,
                    qty_min: 1,
                    qty_max: 2,
                }],
            },
            LootTable {
                id: 2,
                gold_min: 10,
                gold_max: 25,
                drops: vec![
                    LootDrop {
                        template_id: 1,
                        chance: 0.5,
                        qty_min: 1,
                        qty_max: 2,
                    },
                    LootDrop {
                        template_id: 11,
                        chance: 0.1,
                        qty_min: 1,
                        qty_max: 1,
                    },
                ],
            },
        ]
        .into_iter()
        .map(|t| (t.id, t))
        .collect(),
        classes: [warrior, mage]
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect(),
        races: vec!["human".to_string(), "elf".to_string(), "orc".to_string()],
        xp,
        terrain,
    };
    cat.validate().expect("fixture catalog is valid");
    cat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xp_scaling_picks_last_matching_row() {
        let cat = fixture();
        // Even fight.
        assert_eq!(cat.xp.scaled_reward(3, 3, 100), 100);
        // Low-level monster.
        assert_eq!(cat.xp.scaled_reward(8, 2, 100), 10);
        // Punching up.
        assert_eq!(cat.xp.scaled_reward(1, 5, 100), 150);
    }

    #[test]
    fn xp_curve_extends_past_authored_levels() {
        let cat = fixture();
        assert_eq!(cat.xp.xp_to_next(1), 100);
        assert_eq!(cat.xp.xp_to_next(5), 1500);
        assert!(cat.xp.xp_to_next(6) > 1500);
        assert!(cat.xp.xp_to_next(10) > cat.xp.xp_to_next(7));
    }

    #[test]
    fn terrain_clamps_out_of_bounds() {
        let cat = fixture();
        let p = cat.terrain.clamp(Position::new(5000.0, -5000.0, 99.0));
        assert_eq!(p.x, 100.0);
        assert_eq!(p.y, -100.0);
        assert_eq!(p.z, 0.0);
    }

    #[test]
    fn skill_level_rows_are_one_based() {
        let cat = fixture();
        let s = cat.skill(1).unwrap();
        assert!(s.level_row(0).is_none());
        assert_eq!(s.level_row(1).unwrap().base_damage, 5);
        assert_eq!(s.level_row(3).unwrap().base_damage, 14);
        assert!(s.level_row(4).is_none());
    }

    #[test]
    fn validate_rejects_dangling_loot_item() {
        let mut cat = fixture();
        cat.loot.get_mut(&1).unwrap().drops[0].template_id = 999;
        assert!(cat.validate().is_err());
    }
}
