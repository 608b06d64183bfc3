use anyhow::Context;

use duskproto::server::ServerMsg;
use duskproto::SessionId;

use crate::world::{CombatLogLine, MonsterId, Outbound, World};
use crate::{items, loot};

/// One resolved hit, before application.
#[derive(Debug, Clone, Copy)]
pub struct Strike {
    pub damage: i32,
    pub critical: bool,
}

/// Result of applying a strike to a monster.
#[derive(Debug, Clone, Copy)]
pub struct AppliedStrike {
    pub damage: i32,
    pub critical: bool,
    pub killed: bool,
    pub monster_health: i32,
}

pub fn crit_chance_physical(dexterity: i32) -> f32 {
    0.01 + 0.003 * dexterity as f32
}

pub fn crit_chance_magical(intellect: i32) -> f32 {
    0.05 + 0.002 * intellect as f32
}

pub fn clamp_crit(chance: f32) -> f32 {
    chance.clamp(0.0, 0.75)
}

/// Mitigation factor; never drops below 0.1 no matter the defense.
pub fn defense_reduction(def: i32) -> f32 {
    let def = def.max(0) as f32;
    (1.0 - def / (def + 100.0)).max(0.1)
}

pub fn roll_strike(rng: &mut crate::world::Rng64, raw: f32, crit_chance: f32, def: i32) -> Strike {
    let mut raw = raw;
    let critical = rng.next_f32() < clamp_crit(crit_chance);
    if critical {
        raw *= 1.5;
    }
    let damage = (raw * defense_reduction(def)).round() as i32;
    Strike {
        damage: damage.max(1),
        critical,
    }
}

fn attack_interval_ms(attack_speed: f32) -> u64 {
    if attack_speed <= 0.0 {
        return u64::MAX;
    }
    (1000.0 / attack_speed) as u64
}

/// Phase 2 of the tick: auto-attacks, serialized by session join order so
/// simultaneous strikes on one monster resolve deterministically and only
/// the killing blow takes the loot path.
pub fn process_auto_combat(world: &mut World) -> anyhow::Result<()> {
    for sid in world.sessions_by_join_order() {
        let Some(p) = world.players.get(&sid) else {
            continue;
        };
        let Some(mid) = p.combat_target else {
            continue;
        };
        if p.character.is_dead {
            continue;
        }

        let Some(m) = world.monsters.get(&mid) else {
            if let Some(p) = world.players.get_mut(&sid) {
                p.combat_target = None;
            }
            continue;
        };
        if !m.alive {
            if let Some(p) = world.players.get_mut(&sid) {
                p.combat_target = None;
            }
            continue;
        }

        let monster_pos = m.position;
        let class = world
            .catalog
            .class(&p.character.class)
            .with_context(|| format!("unknown class {}", p.character.class))?;
        let attack_range = class.attack_range;
        let dist = p.character.position.dist2d(&monster_pos);

        if dist <= attack_range {
            let interval = attack_interval_ms(p.derived.attack_speed);
            if world.now_ms < p.stunned_until_ms
                || world.now_ms.saturating_sub(p.last_attack_ms) < interval
            {
                continue;
            }
            let raw = p.derived.atk as f32;
            let crit = crit_chance_physical(p.eff_stats.dexterity);
            let applied = apply_player_strike(world, sid, mid, raw, crit, None);
            if let Some(p) = world.players.get_mut(&sid) {
                p.last_attack_ms = world.now_ms;
                if applied.is_some_and(|a| a.killed) {
                    p.combat_target = None;
                }
            }
        } else {
            // Out of range: close the gap.
            let clamped = world.catalog.terrain.clamp(monster_pos);
            if let Some(p) = world.players.get_mut(&sid) {
                p.target_position = Some(clamped);
            }
        }
    }
    Ok(())
}

/// Roll and apply one player-sourced strike against a monster.
///
/// The per-monster loot lock is taken before health can reach zero and is
/// held across the loot roll, so two kill paths for the same monster
/// serialize and loot rolls exactly once per death.
pub fn apply_player_strike(
    world: &mut World,
    attacker: SessionId,
    mid: MonsterId,
    raw: f32,
    crit_chance: f32,
    skill_id: Option<u32>,
) -> Option<AppliedStrike> {
    let def = {
        let m = world.monsters.get(&mid)?;
        if !m.alive {
            return None;
        }
        world.catalog.monster(m.template_id)?.defense
    };
    let strike = roll_strike(&mut world.rng, raw, crit_chance, def);
    apply_rolled_strike(world, attacker, mid, strike, skill_id)
}

/// Apply an already-rolled strike (skills roll their own crit bonuses).
pub fn apply_rolled_strike(
    world: &mut World,
    attacker: SessionId,
    mid: MonsterId,
    strike: Strike,
    skill_id: Option<u32>,
) -> Option<AppliedStrike> {
    let lock = world.loot_lock(mid);
    let guard = match lock.lock() {
        Ok(g) => g,
        Err(_) => {
            tracing::warn!(monster = mid, "loot lock poisoned; skipping strike");
            return None;
        }
    };

    let (killed, health) = {
        let m = world.monsters.get_mut(&mid)?;
        if !m.alive {
            return None;
        }
        m.health = (m.health - strike.damage).max(0);
        if m.health == 0 {
            m.alive = false;
            m.last_respawn_ms = world.now_ms;
            m.target = None;
            m.effects.clear();
            (true, 0)
        } else {
            (false, m.health)
        }
    };

    let attacker_tag = attacker.player_tag();
    world.combat_log.push(CombatLogLine {
        attacker: attacker_tag.clone(),
        target: format!("monster:{mid}"),
        damage: strike.damage,
        critical: strike.critical,
        skill_id,
        killed,
    });

    if skill_id.is_none() {
        world.push(Outbound::All(ServerMsg::PlayerAttack {
            player_id: attacker_tag,
            monster_id: mid,
            damage: strike.damage,
            critical: strike.critical,
            monster_health: health,
        }));
    }

    if killed {
        award_kill_experience(world, attacker, mid);
        loot::roll_and_grant(world, mid, attacker);
    }
    drop(guard);

    Some(AppliedStrike {
        damage: strike.damage,
        critical: strike.critical,
        killed,
        monster_health: health,
    })
}

fn award_kill_experience(world: &mut World, sid: SessionId, mid: MonsterId) {
    let Some((monster_level, base_reward)) = world
        .monsters
        .get(&mid)
        .and_then(|m| world.catalog.monster(m.template_id))
        .map(|t| (t.level, t.experience_reward))
    else {
        return;
    };
    let Some(player_level) = world.players.get(&sid).map(|p| p.character.level) else {
        return;
    };
    let xp = world.catalog.xp.scaled_reward(player_level, monster_level, base_reward);
    award_xp(world, sid, xp);
}

/// Grant XP and run level-ups. A level-up re-derives stats from the class
/// table and refills health and mana to the new maximums.
// TODO: split kill XP across party members once a party protocol exists.
pub fn award_xp(world: &mut World, sid: SessionId, xp: u64) {
    let catalog = world.catalog.clone();
    let Some(p) = world.players.get_mut(&sid) else {
        return;
    };
    let c = &mut p.character;
    c.experience = c.experience.saturating_add(xp);

    let mut leveled = false;
    let Some(class) = catalog.class(&c.class) else {
        return;
    };
    while c.experience >= catalog.xp.xp_to_next(c.level) {
        c.experience -= catalog.xp.xp_to_next(c.level);
        c.level += 1;
        c.status_points += class.status_points_per_level;
        leveled = true;
    }

    if leveled {
        items::refresh_derived(p, &catalog);
        p.character.health = p.character.max_health;
        p.character.mana = p.character.max_mana;

        let msg = ServerMsg::LevelUp {
            player_id: p.player_id(),
            level: p.character.level,
            max_health: p.character.max_health,
            max_mana: p.character.max_mana,
            status_points: p.character.status_points,
            new_stats: p.derived,
        };
        let char_id = p.character.id;
        world.push(Outbound::All(msg));
        world.dirty.characters.insert(char_id);
    } else {
        let char_id = p.character.id;
        world.dirty.characters.insert(char_id);
    }
}

/// Damage with no surviving source (a lingering effect after its caster
/// left). Death is resolved but no XP or loot is granted; the loot roll is
/// claimed so a later path cannot double-dip.
pub fn apply_anonymous_damage(world: &mut World, mid: MonsterId, damage: i32) {
    let lock = world.loot_lock(mid);
    let Ok(guard) = lock.lock() else {
        return;
    };
    if let Some(m) = world.monsters.get_mut(&mid) {
        if !m.alive {
            return;
        }
        m.health = (m.health - damage).max(0);
        if m.health == 0 {
            m.alive = false;
            m.last_respawn_ms = world.now_ms;
            m.target = None;
            m.effects.clear();
            m.loot_rolled = true;
        }
    }
    drop(guard);
}

/// A monster hit against a player, same formula from the other side.
pub fn monster_strike_player(world: &mut World, mid: MonsterId, sid: SessionId) {
    let Some((raw, _template_id)) = world
        .monsters
        .get(&mid)
        .filter(|m| m.alive)
        .and_then(|m| world.catalog.monster(m.template_id).map(|t| (t.attack_power as f32, t.id)))
    else {
        return;
    };
    let Some(def) = world
        .players
        .get(&sid)
        .filter(|p| !p.character.is_dead)
        .map(|p| p.derived.def)
    else {
        return;
    };

    // Monsters have no dexterity stat; they crit at the physical floor.
    let strike = roll_strike(&mut world.rng, raw, crit_chance_physical(0), def);

    let Some(p) = world.players.get_mut(&sid) else {
        return;
    };
    p.character.health = (p.character.health - strike.damage).max(0);
    let died = p.character.health == 0;
    if died {
        p.character.is_dead = true;
        p.combat_target = None;
        p.target_position = None;
        p.pending_cast = None;
    }
    let player_tag = p.player_id();
    let health = p.character.health;
    let char_id = p.character.id;

    world.combat_log.push(CombatLogLine {
        attacker: format!("monster:{mid}"),
        target: player_tag.clone(),
        damage: strike.damage,
        critical: strike.critical,
        skill_id: None,
        killed: died,
    });
    world.push(Outbound::All(ServerMsg::CombatResult {
        attacker: format!("monster:{mid}"),
        target_player_id: player_tag.clone(),
        damage: strike.damage,
        critical: strike.critical,
        health,
    }));

    if died {
        if let Some(m) = world.monsters.get_mut(&mid) {
            m.target = None;
        }
        world.push(Outbound::All(ServerMsg::PlayerDeath {
            player_id: player_tag,
            killer_monster_id: Some(mid),
        }));
        world.dirty.characters.insert(char_id);
    }
}
