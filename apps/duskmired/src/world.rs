use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use duskproto::server::ServerMsg;
use duskproto::types::{DerivedStats, MonsterSnapshot, PlayerSnapshot, Position, StatBlock};
use duskproto::SessionId;

use crate::catalog::{Catalog, EffectTarget, SkillEffectKind};
use crate::persist::{CharacterRec, InventoryRec, LearnedSkillRec, MonsterInstanceRec};
use crate::{combat, items, monsters, movement, skills};

pub type MonsterId = u64;

pub const TICK_MS: u64 = 50;
pub const BROADCAST_EVERY_TICKS: u64 = 4;
pub const SAVE_EVERY_TICKS: u64 = 100;

/// Deterministic world RNG (xorshift64*). Given the same seed and the same
/// message order, a tick produces the same results.
#[derive(Debug, Clone)]
pub struct Rng64 {
    state: u64,
}

impl Rng64 {
    pub fn from_seed(seed: u64) -> Self {
        let mut s = seed;
        if s == 0 {
            s = 0x9e37_79b9_7f4a_7c15;
        }
        Self { state: s }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        ((self.next_u64() >> 40) as f32) * (1.0 / (1u64 << 24) as f32)
    }

    pub fn roll_range_u64(&mut self, lo: u64, hi_inclusive: u64) -> u64 {
        debug_assert!(lo <= hi_inclusive);
        let span = hi_inclusive - lo + 1;
        lo + self.next_u64() % span
    }

    pub fn roll_range_u32(&mut self, lo: u32, hi_inclusive: u32) -> u32 {
        self.roll_range_u64(lo as u64, hi_inclusive as u64) as u32
    }
}

/// Outbound messages produced under the world lock and delivered after it
/// is released.
#[derive(Debug, Clone)]
pub enum Outbound {
    One(SessionId, ServerMsg),
    All(ServerMsg),
    Except(SessionId, ServerMsg),
}

/// A timed effect on a player or monster.
#[derive(Debug, Clone)]
pub struct ActiveEffect {
    pub id: u64,
    pub skill_id: u32,
    pub kind: SkillEffectKind,
    pub target_stat: Option<String>,
    pub value: i32,
    pub started_ms: u64,
    pub duration_ms: u64,
    pub last_dot_ms: u64,
    /// Session that applied the effect; damage-over-time kills credit it.
    pub source_session: Option<SessionId>,
}

impl ActiveEffect {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.started_ms + self.duration_ms
    }
}

/// A cast-time skill waiting for its resolve point. Costs are deducted at
/// resolution, so cancelling needs no refund bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingCast {
    pub skill_id: u32,
    pub target_id: Option<MonsterId>,
    pub target_position: Option<Position>,
    pub resolve_at_ms: u64,
}

#[derive(Debug)]
pub struct Player {
    pub session: SessionId,
    /// Monotonic join order; same-tick attack serialization uses it.
    pub join_seq: u64,
    pub character: CharacterRec,
    pub inventory: InventoryRec,
    pub skills: Vec<LearnedSkillRec>,
    pub derived: DerivedStats,
    /// Base stats with equipment bonuses folded in; crit formulas read these.
    pub eff_stats: StatBlock,
    pub target_position: Option<Position>,
    pub combat_target: Option<MonsterId>,
    pub last_attack_ms: u64,
    pub pending_cast: Option<PendingCast>,
    pub effects: Vec<ActiveEffect>,
    pub consumable_cd: HashMap<EffectTarget, u64>,
    pub stunned_until_ms: u64,
    // Movement-guard state: last server-accepted position and when.
    pub last_accepted_pos: Position,
    pub last_accepted_ms: u64,
    pub last_hp_regen_ms: u64,
    pub last_mana_regen_ms: u64,
}

impl Player {
    pub fn player_id(&self) -> String {
        self.session.player_tag()
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            player_id: self.player_id(),
            name: self.character.name.clone(),
            class: self.character.class.clone(),
            level: self.character.level,
            position: self.character.position,
            health: self.character.health,
            max_health: self.character.max_health,
            mana: self.character.mana,
            max_mana: self.character.max_mana,
            is_dead: self.character.is_dead,
            is_moving: self.target_position.is_some(),
            in_combat: self.combat_target.is_some(),
        }
    }
}

#[derive(Debug)]
pub struct Monster {
    pub id: MonsterId,
    pub template_id: u32,
    pub health: i32,
    pub position: Position,
    pub alive: bool,
    pub last_respawn_ms: u64,
    pub last_attack_ms: u64,
    pub target: Option<SessionId>,
    pub effects: Vec<ActiveEffect>,
    pub stunned_until_ms: u64,
    /// Set once per death inside the loot critical section.
    pub loot_rolled: bool,
}

impl Monster {
    pub fn from_record(rec: &MonsterInstanceRec) -> Self {
        Self {
            id: rec.id,
            template_id: rec.template_id,
            health: rec.current_health,
            position: rec.position,
            alive: rec.is_alive,
            last_respawn_ms: rec.last_respawn_ms,
            last_attack_ms: 0,
            target: None,
            effects: Vec::new(),
            stunned_until_ms: 0,
            loot_rolled: !rec.is_alive,
        }
    }

    pub fn to_record(&self) -> MonsterInstanceRec {
        MonsterInstanceRec {
            id: self.id,
            template_id: self.template_id,
            current_health: self.health,
            position: self.position,
            is_alive: self.alive,
            last_respawn_ms: self.last_respawn_ms,
        }
    }
}

/// A combat-log line queued under the world lock and written off it.
#[derive(Debug, Clone)]
pub struct CombatLogLine {
    pub attacker: String,
    pub target: String,
    pub damage: i32,
    pub critical: bool,
    pub skill_id: Option<u32>,
    pub killed: bool,
}

/// State changed inside a tick that should hit the store without waiting
/// for the periodic sweep (loot, XP). Drained by the tick driver.
#[derive(Debug, Default)]
pub struct DirtyState {
    pub characters: BTreeSet<u64>,
    pub inventories: BTreeSet<u64>,
}

impl DirtyState {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.inventories.is_empty()
    }
}

/// The authoritative game state. All mutation happens under one async
/// mutex: the tick loop holds it for a tick, message handlers for a
/// handler. Broadcast fan-out happens after release via the outbox.
pub struct World {
    pub catalog: Arc<Catalog>,
    pub players: BTreeMap<SessionId, Player>,
    pub monsters: BTreeMap<MonsterId, Monster>,
    loot_locks: HashMap<MonsterId, Arc<std::sync::Mutex<()>>>,
    pub rng: Rng64,
    pub now_ms: u64,
    pub tick_count: u64,
    next_join_seq: u64,
    next_effect_id: u64,
    outbox: Vec<Outbound>,
    pub combat_log: Vec<CombatLogLine>,
    pub dirty: DirtyState,
    /// Item instance ids pre-allocated from the store. Loot grants draw
    /// from here so the tick never waits on persistence; the driver refills
    /// the pool off the lock when it runs low.
    pub item_id_pool: std::ops::Range<u64>,
}

impl World {
    pub fn new(catalog: Arc<Catalog>, seed: u64) -> Self {
        Self {
            catalog,
            players: BTreeMap::new(),
            monsters: BTreeMap::new(),
            loot_locks: HashMap::new(),
            rng: Rng64::from_seed(seed),
            now_ms: 0,
            tick_count: 0,
            next_join_seq: 1,
            next_effect_id: 1,
            outbox: Vec::new(),
            combat_log: Vec::new(),
            dirty: DirtyState::default(),
            item_id_pool: 0..0,
        }
    }

    pub fn item_id_pool_low(&self) -> bool {
        self.item_id_pool.end.saturating_sub(self.item_id_pool.start) < 32
    }

    /// Build the monster registry from persisted rows.
    pub fn load_monsters(&mut self, records: &[MonsterInstanceRec]) {
        for rec in records {
            if self.catalog.monster(rec.template_id).is_none() {
                warn!(monster = rec.id, template = rec.template_id, "dropping instance with unknown template");
                continue;
            }
            self.monsters.insert(rec.id, Monster::from_record(rec));
        }
    }

    /// First boot: derive instances from the templates' spawn data.
    pub fn seed_monster_records(catalog: &Catalog, rng: &mut Rng64) -> Vec<MonsterInstanceRec> {
        let mut out = Vec::new();
        let mut next_id = 1u64;
        let mut templates: Vec<_> = catalog.monsters.values().collect();
        templates.sort_by_key(|t| t.id);
        for t in templates {
            for _ in 0..t.spawn_count {
                let pos = monsters::random_spawn_position(catalog, rng, t);
                out.push(MonsterInstanceRec {
                    id: next_id,
                    template_id: t.id,
                    current_health: t.max_health,
                    position: pos,
                    is_alive: true,
                    last_respawn_ms: 0,
                });
                next_id += 1;
            }
        }
        out
    }

    pub fn next_join_seq(&mut self) -> u64 {
        let s = self.next_join_seq;
        self.next_join_seq += 1;
        s
    }

    pub fn next_effect_id(&mut self) -> u64 {
        let id = self.next_effect_id;
        self.next_effect_id += 1;
        id
    }

    /// Per-monster loot lock; see `loot::resolve_monster_death`.
    pub fn loot_lock(&mut self, monster_id: MonsterId) -> Arc<std::sync::Mutex<()>> {
        self.loot_locks
            .entry(monster_id)
            .or_insert_with(|| Arc::new(std::sync::Mutex::new(())))
            .clone()
    }

    pub fn push(&mut self, out: Outbound) {
        self.outbox.push(out);
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_dirty(&mut self) -> DirtyState {
        std::mem::take(&mut self.dirty)
    }

    pub fn take_combat_log(&mut self) -> Vec<CombatLogLine> {
        std::mem::take(&mut self.combat_log)
    }

    /// Session ids in join order; combat serialization iterates this.
    pub fn sessions_by_join_order(&self) -> Vec<SessionId> {
        let mut v: Vec<(u64, SessionId)> = self
            .players
            .values()
            .map(|p| (p.join_seq, p.session))
            .collect();
        v.sort_unstable();
        v.into_iter().map(|(_, s)| s).collect()
    }

    pub fn player_snapshots(&self) -> Vec<PlayerSnapshot> {
        self.players.values().map(|p| p.snapshot()).collect()
    }

    pub fn monster_snapshots(&self) -> Vec<MonsterSnapshot> {
        self.monsters
            .values()
            .map(|m| {
                let t = self.catalog.monster(m.template_id);
                MonsterSnapshot {
                    monster_id: m.id,
                    template_id: m.template_id,
                    name: t.map(|t| t.name.clone()).unwrap_or_default(),
                    level: t.map(|t| t.level).unwrap_or(1),
                    position: m.position,
                    health: m.health,
                    max_health: t.map(|t| t.max_health).unwrap_or(m.health),
                    is_alive: m.alive,
                    target_player_id: m.target.map(|s| s.player_tag()),
                }
            })
            .collect()
    }

    pub fn monster_records(&self) -> Vec<MonsterInstanceRec> {
        self.monsters.values().map(|m| m.to_record()).collect()
    }

    /// One world step. Phases run in a fixed order; a failing phase is
    /// logged and skipped for this tick, never letting the loop die.
    pub fn tick(&mut self, dt_ms: u64) {
        self.now_ms = self.now_ms.saturating_add(dt_ms);
        self.tick_count += 1;
        let dt_s = dt_ms as f32 / 1000.0;

        if let Err(e) = movement::integrate(self, dt_s) {
            warn!(phase = "movement", err = %e, "tick phase failed");
        }
        if let Err(e) = combat::process_auto_combat(self) {
            warn!(phase = "combat", err = %e, "tick phase failed");
        }
        if let Err(e) = skills::resolve_pending_casts(self) {
            warn!(phase = "casts", err = %e, "tick phase failed");
        }
        if let Err(e) = monsters::update(self, dt_s) {
            warn!(phase = "monsters", err = %e, "tick phase failed");
        }
        if let Err(e) = skills::update_effects(self) {
            warn!(phase = "effects", err = %e, "tick phase failed");
        }
        self.regen_resources();

        if self.tick_count % BROADCAST_EVERY_TICKS == 0 {
            let msg = ServerMsg::WorldState {
                timestamp: self.now_ms,
                players: self.player_snapshots(),
                monsters: self.monster_snapshots(),
            };
            self.push(Outbound::All(msg));
        }
    }

    /// Slow out-of-combat regeneration.
    fn regen_resources(&mut self) {
        const MANA_REGEN_MS: u64 = 1500;
        const HP_REGEN_MS: u64 = 3000;

        let now = self.now_ms;
        for p in self.players.values_mut() {
            let c = &mut p.character;
            if c.is_dead {
                p.last_hp_regen_ms = now;
                p.last_mana_regen_ms = now;
                continue;
            }

            if c.mana < c.max_mana {
                let n = now.saturating_sub(p.last_mana_regen_ms) / MANA_REGEN_MS;
                if n > 0 {
                    c.mana = (c.mana + n as i32).min(c.max_mana);
                    p.last_mana_regen_ms = now;
                }
            } else {
                p.last_mana_regen_ms = now;
            }

            let in_combat = p.combat_target.is_some();
            if c.health < c.max_health && !in_combat {
                let n = now.saturating_sub(p.last_hp_regen_ms) / HP_REGEN_MS;
                if n > 0 {
                    c.health = (c.health + n as i32).min(c.max_health);
                    p.last_hp_regen_ms = now;
                }
            } else {
                p.last_hp_regen_ms = now;
            }
        }
    }

    /// Spawn a fresh runtime player from persisted rows.
    pub fn add_player(
        &mut self,
        session: SessionId,
        mut character: CharacterRec,
        inventory: InventoryRec,
        mut learned: Vec<LearnedSkillRec>,
    ) -> &Player {
        // Cooldowns are wall-clock relative to the previous process; reset.
        for s in &mut learned {
            s.last_used_ms = 0;
        }
        character.position = self.catalog.terrain.clamp(character.position);

        let join_seq = self.next_join_seq();
        let mut player = Player {
            session,
            join_seq,
            derived: DerivedStats::default(),
            eff_stats: StatBlock::default(),
            target_position: None,
            combat_target: None,
            last_attack_ms: 0,
            pending_cast: None,
            effects: Vec::new(),
            consumable_cd: HashMap::new(),
            stunned_until_ms: 0,
            last_accepted_pos: character.position,
            last_accepted_ms: self.now_ms,
            last_hp_regen_ms: self.now_ms,
            last_mana_regen_ms: self.now_ms,
            character,
            inventory,
            skills: learned,
        };
        items::refresh_derived(&mut player, &self.catalog);
        self.players.insert(session, player);
        self.players.get(&session).expect("just inserted")
    }

    pub fn remove_player(&mut self, session: SessionId) -> Option<Player> {
        // Monsters lose interest in a vanished player immediately.
        for m in self.monsters.values_mut() {
            if m.target == Some(session) {
                m.target = None;
            }
        }
        self.players.remove(&session)
    }
}
