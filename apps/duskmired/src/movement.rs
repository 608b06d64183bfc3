use anyhow::Result;
use tracing::warn;

use duskproto::types::Position;
use duskproto::SessionId;

use crate::world::World;

/// Hard ceiling on client-reported movement: 3x normal run speed.
pub const MAX_ALLOWED_SPEED: f32 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveOutcome {
    Accepted(Position),
    /// Speed check failed; the client gets no error, only the revert.
    Rejected,
    Dead,
}

/// Validate a client `moveRequest` against the last server-accepted
/// position. Strictly over the speed limit means the request is dropped,
/// the position reverted, and the violation logged; the threshold is never
/// disclosed to the client.
pub fn handle_move_request(world: &mut World, sid: SessionId, requested: Position) -> MoveOutcome {
    let clamped = world.catalog.terrain.clamp(requested);
    let now = world.now_ms;

    let Some(p) = world.players.get_mut(&sid) else {
        return MoveOutcome::Dead;
    };
    if p.character.is_dead {
        return MoveOutcome::Dead;
    }

    let dt_ms = now.saturating_sub(p.last_accepted_ms).max(1);
    let dist = p.last_accepted_pos.dist2d(&clamped);
    let speed = dist / (dt_ms as f32 / 1000.0);

    if speed > MAX_ALLOWED_SPEED {
        p.character.position = p.last_accepted_pos;
        p.target_position = None;
        warn!(
            player = %p.player_id(),
            speed,
            dist,
            dt_ms,
            "SPEED_HACK: move rejected"
        );
        return MoveOutcome::Rejected;
    }

    p.target_position = Some(clamped);
    p.last_accepted_pos = clamped;
    p.last_accepted_ms = now;
    // Starting to move aborts any cast in progress.
    p.pending_cast = None;
    MoveOutcome::Accepted(clamped)
}

/// Phase 1 of the tick: advance every moving player toward its target by
/// `movement_speed * dt` and commit the new position as last-accepted.
pub fn integrate(world: &mut World, dt_s: f32) -> Result<()> {
    let catalog = world.catalog.clone();
    let now = world.now_ms;

    for p in world.players.values_mut() {
        if p.character.is_dead {
            p.target_position = None;
            continue;
        }
        let Some(target) = p.target_position else {
            continue;
        };

        let speed = catalog
            .class(&p.character.class)
            .map(|c| c.movement_speed)
            .unwrap_or(5.0);
        let step = speed * dt_s;
        let pos = p.character.position;
        let dist = pos.dist2d(&target);

        let next = if dist <= step || dist <= f32::EPSILON {
            p.target_position = None;
            target
        } else {
            let dx = (target.x - pos.x) / dist;
            let dy = (target.y - pos.y) / dist;
            Position::new(pos.x + dx * step, pos.y + dy * step, pos.z)
        };

        let next = catalog.terrain.clamp(next);
        p.character.position = next;
        p.last_accepted_pos = next;
        p.last_accepted_ms = now;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testutil::spawn_world_with_player;
    use crate::world::TICK_MS;

    #[test]
    fn legal_move_is_accepted_and_integrated() {
        let (mut world, sid) = spawn_world_with_player();
        world.now_ms = 1000;

        let out = handle_move_request(&mut world, sid, Position::new(1.0, 0.0, 0.0));
        assert!(matches!(out, MoveOutcome::Accepted(_)));

        // One tick at 5 u/s covers 0.25u; a few ticks reach the target.
        for _ in 0..10 {
            integrate(&mut world, TICK_MS as f32 / 1000.0).unwrap();
        }
        let p = world.players.get(&sid).unwrap();
        assert!(p.target_position.is_none());
        assert!((p.character.position.x - 1.0).abs() < 1e-4);
    }

    #[test]
    fn speed_hack_reverts_to_last_accepted() {
        let (mut world, sid) = spawn_world_with_player();
        world.now_ms = 1000;

        // First hop: fine.
        let out = handle_move_request(&mut world, sid, Position::new(1.0, 0.0, 0.0));
        assert!(matches!(out, MoveOutcome::Accepted(_)));

        // 100 ms later, 10 units away: 100 u/s, rejected.
        world.now_ms = 1100;
        let out = handle_move_request(&mut world, sid, Position::new(11.0, 0.0, 0.0));
        assert_eq!(out, MoveOutcome::Rejected);

        let p = world.players.get(&sid).unwrap();
        assert_eq!(p.character.position.x, 1.0);
        assert!(p.target_position.is_none());
    }

    #[test]
    fn boundary_speed_is_still_legal() {
        let (mut world, sid) = spawn_world_with_player();
        world.now_ms = 1000;
        handle_move_request(&mut world, sid, Position::new(0.0, 0.0, 0.0));

        // Exactly 15 u/s over one second: not strictly greater, accepted.
        world.now_ms = 2000;
        let out = handle_move_request(&mut world, sid, Position::new(15.0, 0.0, 0.0));
        assert!(matches!(out, MoveOutcome::Accepted(_)));
    }

    #[test]
    fn dead_players_cannot_move() {
        let (mut world, sid) = spawn_world_with_player();
        world.players.get_mut(&sid).unwrap().character.is_dead = true;
        let out = handle_move_request(&mut world, sid, Position::new(1.0, 0.0, 0.0));
        assert_eq!(out, MoveOutcome::Dead);
    }

    #[test]
    fn targets_are_clamped_to_terrain() {
        let (mut world, sid) = spawn_world_with_player();
        world.now_ms = 1000;
        // Way out of bounds, but slow enough to pass the speed check:
        // the clamp pulls it to the map edge first.
        world.now_ms = 60_000;
        let out = handle_move_request(&mut world, sid, Position::new(9999.0, 0.0, 50.0));
        let MoveOutcome::Accepted(p) = out else {
            panic!("expected accept, got {out:?}");
        };
        assert_eq!(p.x, 100.0);
        assert_eq!(p.z, 0.0);
    }
}
