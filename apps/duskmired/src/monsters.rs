use anyhow::Result;

use duskproto::types::Position;
use duskproto::SessionId;

use crate::catalog::{Catalog, MonsterTemplate};
use crate::combat;
use crate::world::{MonsterId, Rng64, World};

/// Uniform point in the spawn disc, clamped to terrain.
pub fn random_spawn_position(catalog: &Catalog, rng: &mut Rng64, t: &MonsterTemplate) -> Position {
    let angle = rng.next_f32() * std::f32::consts::TAU;
    let radius = t.spawn_radius * rng.next_f32().sqrt();
    catalog.terrain.clamp(Position::new(
        t.spawn_center.x + angle.cos() * radius,
        t.spawn_center.y + angle.sin() * radius,
        t.spawn_center.z,
    ))
}

fn attack_interval_ms(attack_speed: f32) -> u64 {
    if attack_speed <= 0.0 {
        return u64::MAX;
    }
    (1000.0 / attack_speed) as u64
}

/// Phase 3 of the tick: respawns, aggro acquisition, chase and attacks,
/// in monster-id order.
pub fn update(world: &mut World, dt_s: f32) -> Result<()> {
    let ids: Vec<MonsterId> = world.monsters.keys().copied().collect();
    for id in ids {
        step_monster(world, id, dt_s);
    }
    Ok(())
}

fn step_monster(world: &mut World, id: MonsterId, dt_s: f32) {
    let catalog = world.catalog.clone();
    let now = world.now_ms;

    let Some((template_id, alive, last_respawn_ms, target, pos, stunned_until, last_attack)) =
        world.monsters.get(&id).map(|m| {
            (
                m.template_id,
                m.alive,
                m.last_respawn_ms,
                m.target,
                m.position,
                m.stunned_until_ms,
                m.last_attack_ms,
            )
        })
    else {
        return;
    };
    let Some(t) = catalog.monster(template_id) else {
        return;
    };

    if !alive {
        let respawn_at = last_respawn_ms.saturating_add((t.respawn_time_s * 1000.0) as u64);
        if now >= respawn_at {
            let spawn = random_spawn_position(&catalog, &mut world.rng, t);
            if let Some(m) = world.monsters.get_mut(&id) {
                m.alive = true;
                m.health = t.max_health;
                m.position = spawn;
                m.target = None;
                m.loot_rolled = false;
                m.effects.clear();
                m.stunned_until_ms = 0;
            }
        }
        return;
    }

    // Validate or acquire a target.
    let target = match target {
        Some(sid) => {
            let still_valid = world
                .players
                .get(&sid)
                .is_some_and(|p| !p.character.is_dead);
            if still_valid {
                Some(sid)
            } else {
                if let Some(m) = world.monsters.get_mut(&id) {
                    m.target = None;
                }
                None
            }
        }
        None => None,
    };

    let target = match target {
        Some(sid) => Some(sid),
        None => {
            let acquired = acquire_target(world, &pos, t.aggro_range);
            if let Some(sid) = acquired {
                if let Some(m) = world.monsters.get_mut(&id) {
                    m.target = Some(sid);
                }
            }
            acquired
        }
    };

    let Some(sid) = target else {
        return;
    };
    let Some(player_pos) = world.players.get(&sid).map(|p| p.character.position) else {
        return;
    };

    let dist = pos.dist2d(&player_pos);
    if dist <= t.attack_range {
        if now < stunned_until {
            return;
        }
        if now.saturating_sub(last_attack) < attack_interval_ms(t.attack_speed) {
            return;
        }
        if let Some(m) = world.monsters.get_mut(&id) {
            m.last_attack_ms = now;
        }
        combat::monster_strike_player(world, id, sid);
    } else {
        // Chase.
        let step = t.movement_speed * dt_s;
        let next = if dist <= step {
            player_pos
        } else {
            let dx = (player_pos.x - pos.x) / dist;
            let dy = (player_pos.y - pos.y) / dist;
            Position::new(pos.x + dx * step, pos.y + dy * step, pos.z)
        };
        let next = catalog.terrain.clamp(next);
        if let Some(m) = world.monsters.get_mut(&id) {
            m.position = next;
        }
    }
}

/// Nearest living player inside the aggro radius; join order breaks ties
/// so the pick is deterministic.
fn acquire_target(world: &World, pos: &Position, aggro_range: f32) -> Option<SessionId> {
    let mut best: Option<(f32, SessionId)> = None;
    for sid in world.sessions_by_join_order() {
        let Some(p) = world.players.get(&sid) else {
            continue;
        };
        if p.character.is_dead {
            continue;
        }
        let d = pos.dist2d(&p.character.position);
        if d > aggro_range {
            continue;
        }
        if best.map_or(true, |(bd, _)| d < bd) {
            best = Some((d, sid));
        }
    }
    best.map(|(_, s)| s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testutil::spawn_world_with_player;
    use crate::world::TICK_MS;

    #[test]
    fn idle_monster_acquires_player_in_aggro_range() {
        let (mut world, sid) = spawn_world_with_player();
        let slime_pos = world.monsters.get(&1).unwrap().position;
        // Inside the fixture slime's 8u aggro range.
        world.players.get_mut(&sid).unwrap().character.position =
            Position::new(slime_pos.x + 5.0, slime_pos.y, 0.0);

        update(&mut world, TICK_MS as f32 / 1000.0).unwrap();
        assert_eq!(world.monsters.get(&1).unwrap().target, Some(sid));
    }

    #[test]
    fn aggro_clears_when_player_dies() {
        let (mut world, sid) = spawn_world_with_player();
        world.monsters.get_mut(&1).unwrap().target = Some(sid);
        world.players.get_mut(&sid).unwrap().character.is_dead = true;

        update(&mut world, TICK_MS as f32 / 1000.0).unwrap();
        assert!(world.monsters.get(&1).unwrap().target.is_none());
    }

    #[test]
    fn chase_closes_distance_without_teleporting() {
        let (mut world, sid) = spawn_world_with_player();
        let slime_pos = world.monsters.get(&1).unwrap().position;
        world.players.get_mut(&sid).unwrap().character.position =
            Position::new(slime_pos.x + 6.0, slime_pos.y, 0.0);

        let before = world.monsters.get(&1).unwrap().position;
        update(&mut world, 1.0).unwrap();
        let after = world.monsters.get(&1).unwrap().position;

        let player_pos = world.players.get(&sid).unwrap().character.position;
        let moved = before.dist2d(&after);
        // Fixture slime speed is 2 u/s.
        assert!(moved > 0.0 && moved <= 2.01, "moved {moved}");
        assert!(after.dist2d(&player_pos) < before.dist2d(&player_pos));
    }

    #[test]
    fn respawn_triggers_exactly_on_schedule() {
        let (mut world, _sid) = spawn_world_with_player();
        {
            let m = world.monsters.get_mut(&1).unwrap();
            m.alive = false;
            m.health = 0;
            m.last_respawn_ms = 1000;
            m.loot_rolled = true;
        }
        // Fixture slime respawn is 10s.
        world.now_ms = 1000 + 9_999;
        update(&mut world, 0.05).unwrap();
        assert!(!world.monsters.get(&1).unwrap().alive);

        world.now_ms = 1000 + 10_000;
        update(&mut world, 0.05).unwrap();
        let m = world.monsters.get(&1).unwrap();
        assert!(m.alive);
        assert_eq!(m.health, 20);
        assert!(!m.loot_rolled);
        let t = world.catalog.monster(1).unwrap();
        assert!(m.position.dist2d(&t.spawn_center) <= t.spawn_radius + 0.01);
    }
}
