use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{info, warn};
use zeroize::Zeroize;

use duskio::{LineReader, LineWriter};
use duskproto::client::ClientMsg;
use duskproto::server::{LoginData, ServerMsg};
use duskproto::types::{CharacterSummary, CharacterView, Position};
use duskproto::{decode_client, encode_server, ProtoError, SessionId};

use crate::catalog::Catalog;
use crate::persist::{
    CharacterRec, CombatLogEntry, CreateAccountOutcome, CreateCharacterOutcome, StarterGrant,
    Store,
};
use crate::world::{Outbound, Player, World, SAVE_EVERY_TICKS, TICK_MS};
use crate::{items, movement, skills};

const OUTBOUND_QUEUE: usize = 256;
const ITEM_ID_REFILL: u64 = 256;

/// Everything a connection task needs; the world mutex is the world lock
/// of record.
pub struct Shared {
    pub catalog: Arc<Catalog>,
    pub store: Arc<Store>,
    pub world: Mutex<World>,
    pub sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    /// Set when the store was unreachable at boot; login and register are
    /// refused but catalog-only traffic still works.
    pub degraded: bool,
    pub read_timeout: Duration,
}

pub struct SessionHandle {
    tx: mpsc::Sender<Bytes>,
    kick: Arc<Notify>,
    in_world: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    CharacterSelect { account_id: u64 },
    InWorld { account_id: u64 },
}

pub async fn handle_conn(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    // 128 OS-random bits per connection; ids are unguessable and never
    // reused within a process lifetime for all practical purposes.
    let mut raw = [0u8; SessionId::LEN];
    getrandom::getrandom(&mut raw).expect("os rng");
    let session = SessionId(u128::from_be_bytes(raw));

    let (rd, wr) = stream.into_split();
    let mut reader = LineReader::new(rd);

    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        let mut lw = LineWriter::new(wr);
        while let Some(b) = rx.recv().await {
            if lw.write_line(&b[..]).await.is_err() {
                break;
            }
            if lw.flush().await.is_err() {
                break;
            }
        }
    });

    let kick = Arc::new(Notify::new());
    shared.sessions.lock().await.insert(
        session,
        SessionHandle {
            tx: tx.clone(),
            kick: kick.clone(),
            in_world: false,
        },
    );
    info!(peer = %peer, session = %session.player_tag(), "session opened");

    let mut phase = Phase::Unauthenticated;
    'conn: loop {
        tokio::select! {
            _ = kick.notified() => {
                break 'conn;
            }
            res = tokio::time::timeout(shared.read_timeout, reader.next_line()) => {
                let line = match res {
                    Err(_) => {
                        info!(session = %session.player_tag(), "read timeout; closing");
                        break 'conn;
                    }
                    Ok(Ok(None)) => break 'conn,
                    Ok(Err(e)) => {
                        info!(session = %session.player_tag(), err = %e, "read failed");
                        break 'conn;
                    }
                    Ok(Ok(Some(l))) => l,
                };
                if line.is_empty() {
                    continue;
                }

                let msg = match decode_client(&line) {
                    Ok(m) => m,
                    Err(ProtoError::UnknownType(t)) => {
                        // Unknown types are logged and dropped, not fatal.
                        warn!(session = %session.player_tag(), msg_type = %t, "unknown message type");
                        continue;
                    }
                    Err(e) => {
                        warn!(session = %session.player_tag(), err = %e, "bad message");
                        send_direct(&shared, session, &ServerMsg::Error {
                            message: "malformed message".to_string(),
                        })
                        .await;
                        continue;
                    }
                };

                let replies = dispatch(&shared, session, &mut phase, msg).await;
                for r in &replies {
                    send_direct(&shared, session, r).await;
                }
                flush_world_effects(&shared).await;
            }
        }
    }

    // Teardown: persist the character, drop the player, tell the world.
    shared.sessions.lock().await.remove(&session);
    let removed = {
        let mut world = shared.world.lock().await;
        world.remove_player(session)
    };
    if let Some(player) = removed {
        persist_player(&shared, &player).await;
        let msg = ServerMsg::PlayerDisconnected {
            player_id: player.player_id(),
        };
        deliver(&shared, vec![Outbound::All(msg)]).await;
        flush_world_effects(&shared).await;
        info!(session = %session.player_tag(), character = %player.character.name, "player left world");
    } else {
        info!(session = %session.player_tag(), "session closed before entering world");
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn persist_player(shared: &Shared, player: &Player) {
    if let Err(e) = shared.store.update_character(&player.character).await {
        warn!(err = %e, character = player.character.id, "character save on disconnect failed");
    }
    if let Err(e) = shared.store.save_inventory(&player.inventory).await {
        warn!(err = %e, character = player.character.id, "inventory save on disconnect failed");
    }
    if let Err(e) = shared
        .store
        .save_skills(player.character.id, &player.skills)
        .await
    {
        warn!(err = %e, character = player.character.id, "skills save on disconnect failed");
    }
}

/// Queue one message to one session, kicking it on overflow.
async fn send_direct(shared: &Shared, session: SessionId, msg: &ServerMsg) {
    let payload = Bytes::from(encode_server(msg));
    let mut kicked = false;
    {
        let sessions = shared.sessions.lock().await;
        if let Some(h) = sessions.get(&session) {
            if h.tx.try_send(payload).is_err() {
                kicked = true;
            }
        }
    }
    if kicked {
        kick_session(shared, session, "backpressure").await;
    }
}

async fn kick_session(shared: &Shared, session: SessionId, reason: &str) {
    warn!(session = %session.player_tag(), reason, "kicking session");
    if let Some(h) = shared.sessions.lock().await.remove(&session) {
        h.kick.notify_one();
    }
}

/// Fan the outbox out to sessions. Broadcast targets only in-world
/// sessions; queue overflow disconnects the slow session, not the server.
pub async fn deliver(shared: &Shared, outbox: Vec<Outbound>) {
    if outbox.is_empty() {
        return;
    }
    let mut kicked: Vec<SessionId> = Vec::new();
    {
        let sessions = shared.sessions.lock().await;
        for out in &outbox {
            match out {
                Outbound::One(sid, msg) => {
                    if let Some(h) = sessions.get(sid) {
                        if h.tx.try_send(Bytes::from(encode_server(msg))).is_err() {
                            kicked.push(*sid);
                        }
                    }
                }
                Outbound::All(msg) => {
                    let payload = Bytes::from(encode_server(msg));
                    for (sid, h) in sessions.iter() {
                        if !h.in_world {
                            continue;
                        }
                        if h.tx.try_send(payload.clone()).is_err() {
                            kicked.push(*sid);
                        }
                    }
                }
                Outbound::Except(skip, msg) => {
                    let payload = Bytes::from(encode_server(msg));
                    for (sid, h) in sessions.iter() {
                        if sid == skip || !h.in_world {
                            continue;
                        }
                        if h.tx.try_send(payload.clone()).is_err() {
                            kicked.push(*sid);
                        }
                    }
                }
            }
        }
    }
    kicked.sort_unstable();
    kicked.dedup();
    for sid in kicked {
        kick_session(shared, sid, "backpressure").await;
    }
}

/// Drain everything a handler or tick produced under the world lock:
/// outbound messages, combat-log lines, store-bound dirty state, and the
/// item-id pool refill.
pub async fn flush_world_effects(shared: &Shared) {
    let (outbox, logs, dirty, pool_low) = {
        let mut world = shared.world.lock().await;
        (
            world.take_outbox(),
            world.take_combat_log(),
            world.take_dirty(),
            world.item_id_pool_low(),
        )
    };

    deliver(shared, outbox).await;

    if !logs.is_empty() {
        let store = shared.store.clone();
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        tokio::task::spawn_blocking(move || {
            for l in logs {
                store.log_combat(&CombatLogEntry {
                    ts_unix_ms: now_ms,
                    attacker: &l.attacker,
                    target: &l.target,
                    damage: l.damage,
                    critical: l.critical,
                    skill_id: l.skill_id,
                    killed: l.killed,
                });
            }
        });
    }

    if !dirty.is_empty() {
        let (characters, inventories) = {
            let world = shared.world.lock().await;
            let mut chars = Vec::new();
            let mut invs = Vec::new();
            for p in world.players.values() {
                if dirty.characters.contains(&p.character.id) {
                    chars.push(p.character.clone());
                }
                if dirty.inventories.contains(&p.character.id) {
                    invs.push(p.inventory.clone());
                }
            }
            (chars, invs)
        };
        let store = shared.store.clone();
        tokio::spawn(async move {
            if !characters.is_empty() {
                if let Err(e) = store.update_characters_bulk(&characters).await {
                    warn!(err = %e, "dirty character save failed");
                }
            }
            for inv in inventories {
                if let Err(e) = store.save_inventory(&inv).await {
                    warn!(err = %e, character = inv.character_id, "dirty inventory save failed");
                }
            }
        });
    }

    if pool_low && !shared.degraded {
        match shared.store.allocate_item_ids(ITEM_ID_REFILL).await {
            Ok(range) => {
                shared.world.lock().await.item_id_pool = range;
            }
            Err(e) => warn!(err = %e, "item id pool refill failed"),
        }
    }
}

/// The world heartbeat: 20 Hz tick plus the 5-second persistence sweep.
/// The sweep snapshots under the lock and saves on a spawned task so the
/// tick cadence never waits on the store.
pub async fn run_world_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let sweep = {
            let mut world = shared.world.lock().await;
            world.tick(TICK_MS);
            if world.tick_count % SAVE_EVERY_TICKS == 0 {
                let characters: Vec<CharacterRec> =
                    world.players.values().map(|p| p.character.clone()).collect();
                let monsters = world.monster_records();
                Some((characters, monsters))
            } else {
                None
            }
        };

        flush_world_effects(&shared).await;

        if let Some((characters, monsters)) = sweep {
            let store = shared.store.clone();
            tokio::spawn(async move {
                if !characters.is_empty() {
                    if let Err(e) = store.update_characters_bulk(&characters).await {
                        warn!(err = %e, "periodic character save failed");
                    }
                }
                if let Err(e) = store.update_monster_instances(&monsters).await {
                    warn!(err = %e, "periodic monster save failed");
                }
            });
        }
    }
    info!("world loop stopped");
}

/// Persist every active character and monster synchronously; the shutdown
/// path calls this after the tick loop stops.
pub async fn final_persist(shared: &Shared) {
    let (players, monsters) = {
        let world = shared.world.lock().await;
        let players: Vec<(CharacterRec, crate::persist::InventoryRec, Vec<crate::persist::LearnedSkillRec>)> = world
            .players
            .values()
            .map(|p| (p.character.clone(), p.inventory.clone(), p.skills.clone()))
            .collect();
        (players, world.monster_records())
    };
    for (c, inv, sk) in players {
        if let Err(e) = shared.store.update_character(&c).await {
            warn!(err = %e, character = c.id, "final character save failed");
        }
        if let Err(e) = shared.store.save_inventory(&inv).await {
            warn!(err = %e, character = c.id, "final inventory save failed");
        }
        if let Err(e) = shared.store.save_skills(c.id, &sk).await {
            warn!(err = %e, character = c.id, "final skills save failed");
        }
    }
    if let Err(e) = shared.store.update_monster_instances(&monsters).await {
        warn!(err = %e, "final monster save failed");
    }
    info!("final persistence complete");
}

fn character_view(p: &Player) -> CharacterView {
    CharacterView {
        id: p.character.id,
        name: p.character.name.clone(),
        race: p.character.race.clone(),
        class: p.character.class.clone(),
        level: p.character.level,
        experience: p.character.experience,
        status_points: p.character.status_points,
        health: p.character.health,
        max_health: p.character.max_health,
        mana: p.character.mana,
        max_mana: p.character.max_mana,
        base_stats: p.character.base_stats,
        stats: p.derived,
        position: p.character.position,
        is_dead: p.character.is_dead,
    }
}

fn summary(c: &CharacterRec) -> CharacterSummary {
    CharacterSummary {
        id: c.id,
        name: c.name.clone(),
        race: c.race.clone(),
        class: c.class.clone(),
        level: c.level,
    }
}

fn err(message: &str) -> ServerMsg {
    ServerMsg::Error {
        message: message.to_string(),
    }
}

async fn dispatch(
    shared: &Arc<Shared>,
    session: SessionId,
    phase: &mut Phase,
    msg: ClientMsg,
) -> Vec<ServerMsg> {
    if matches!(msg, ClientMsg::Ping) {
        return vec![ServerMsg::Pong];
    }

    match *phase {
        Phase::Unauthenticated => dispatch_unauthenticated(shared, phase, msg).await,
        Phase::CharacterSelect { account_id } => {
            dispatch_character_select(shared, session, phase, account_id, msg).await
        }
        Phase::InWorld { .. } => dispatch_in_world(shared, session, msg).await,
    }
}

async fn dispatch_unauthenticated(
    shared: &Arc<Shared>,
    phase: &mut Phase,
    msg: ClientMsg,
) -> Vec<ServerMsg> {
    match msg {
        ClientMsg::Login {
            username,
            mut password,
        } => {
            if shared.degraded {
                password.zeroize();
                return vec![ServerMsg::LoginResponse {
                    success: false,
                    data: None,
                    message: Some("server is running without its store; try later".to_string()),
                }];
            }
            // The raw password never outlives the check and is never logged.
            let account_id = shared.store.validate_login(&username, &password).await;
            password.zeroize();
            if account_id == 0 {
                return vec![ServerMsg::LoginResponse {
                    success: false,
                    data: None,
                    message: Some("invalid credentials".to_string()),
                }];
            }
            let characters = shared
                .store
                .list_characters(account_id)
                .await
                .iter()
                .map(summary)
                .collect();
            *phase = Phase::CharacterSelect { account_id };
            vec![ServerMsg::LoginResponse {
                success: true,
                data: Some(LoginData {
                    account_id,
                    characters,
                }),
                message: None,
            }]
        }
        ClientMsg::Register {
            username,
            mut password,
        } => {
            if shared.degraded {
                password.zeroize();
                return vec![ServerMsg::RegisterResponse {
                    success: false,
                    message: Some("server is running without its store; try later".to_string()),
                }];
            }
            let outcome = shared.store.create_account(&username, &password).await;
            password.zeroize();
            match outcome {
                Ok(CreateAccountOutcome::Created(_)) => vec![ServerMsg::RegisterResponse {
                    success: true,
                    message: None,
                }],
                Ok(CreateAccountOutcome::Rejected(reason)) => vec![ServerMsg::RegisterResponse {
                    success: false,
                    message: Some(reason.to_string()),
                }],
                Err(e) => {
                    warn!(err = %e, "register failed");
                    vec![ServerMsg::RegisterResponse {
                        success: false,
                        message: Some("registration unavailable".to_string()),
                    }]
                }
            }
        }
        _ => vec![err("login required")],
    }
}

async fn dispatch_character_select(
    shared: &Arc<Shared>,
    session: SessionId,
    phase: &mut Phase,
    account_id: u64,
    msg: ClientMsg,
) -> Vec<ServerMsg> {
    match msg {
        ClientMsg::ListCharacters => {
            let characters = shared
                .store
                .list_characters(account_id)
                .await
                .iter()
                .map(summary)
                .collect();
            vec![ServerMsg::CharacterList { characters }]
        }
        ClientMsg::CreateCharacter { name, race, class } => {
            vec![create_character(shared, account_id, name, race, class).await]
        }
        ClientMsg::SelectCharacter { character_id } => {
            select_character(shared, session, phase, account_id, character_id).await
        }
        _ => vec![err("select a character first")],
    }
}

async fn create_character(
    shared: &Arc<Shared>,
    account_id: u64,
    name: String,
    race: String,
    class: String,
) -> ServerMsg {
    fn failure(message: &str) -> ServerMsg {
        ServerMsg::CreateCharacterResponse {
            success: false,
            character: None,
            message: Some(message.to_string()),
        }
    }

    let race = race.trim().to_ascii_lowercase();
    let class = class.trim().to_ascii_lowercase();
    if !shared.catalog.race_exists(&race) {
        return failure("unknown race");
    }
    let Some(ct) = shared.catalog.class(&class) else {
        return failure("unknown class");
    };

    let base_stats = ct.base_stats;
    let max_health = ct.base_health + base_stats.vitality * ct.health_per_vit;
    let max_mana = ct.base_mana + base_stats.intellect * ct.mana_per_int;
    let spawn = shared.catalog.terrain.clamp(Position::default());
    let rec = CharacterRec {
        id: 0,
        account_id,
        name: name.trim().to_string(),
        race,
        class: class.clone(),
        level: 1,
        experience: 0,
        status_points: 0,
        health: max_health,
        max_health,
        mana: max_mana,
        max_mana,
        base_stats,
        position: spawn,
        is_dead: false,
    };

    let starter: Vec<StarterGrant> = ct
        .starter_items
        .iter()
        .filter_map(|si| {
            shared.catalog.item(si.template_id).map(|t| StarterGrant {
                template_id: si.template_id,
                quantity: si.quantity,
                max_stack: t.max_stack,
            })
        })
        .collect();

    match shared.store.create_character(rec, &starter).await {
        Ok(CreateCharacterOutcome::Created(c)) => ServerMsg::CreateCharacterResponse {
            success: true,
            character: Some(summary(&c)),
            message: None,
        },
        Ok(CreateCharacterOutcome::Rejected(reason)) => failure(reason),
        Err(e) => {
            warn!(err = %e, "create character failed");
            failure("character creation unavailable")
        }
    }
}

async fn select_character(
    shared: &Arc<Shared>,
    session: SessionId,
    phase: &mut Phase,
    account_id: u64,
    character_id: u64,
) -> Vec<ServerMsg> {
    let Some(character) = shared.store.load_character(character_id).await else {
        return vec![err("no such character")];
    };
    if character.account_id != account_id {
        return vec![err("no such character")];
    }
    let inventory = shared
        .store
        .load_inventory(character_id)
        .await
        .unwrap_or_else(|| crate::persist::InventoryRec::new(character_id));
    let learned = shared.store.load_skills(character_id).await;

    let reply = {
        let mut world = shared.world.lock().await;
        // One session, one character; a re-select replaces the binding.
        world.remove_player(session);
        let player = world.add_player(session, character, inventory, learned);
        let view = character_view(player);
        let player_id = player.player_id();
        let inventory = items::inventory_view(&shared.catalog, &player.inventory);
        let joined = player.snapshot();

        let all_players = world.player_snapshots();
        let all_monsters = world.monster_snapshots();
        world.push(Outbound::Except(
            session,
            ServerMsg::PlayerJoined { player: joined },
        ));

        ServerMsg::SelectCharacterResponse {
            success: true,
            character: view,
            player_id,
            all_players,
            all_monsters,
            inventory,
        }
    };

    if let Some(h) = shared.sessions.lock().await.get_mut(&session) {
        h.in_world = true;
    }
    *phase = Phase::InWorld { account_id };
    vec![reply]
}

async fn dispatch_in_world(
    shared: &Arc<Shared>,
    session: SessionId,
    msg: ClientMsg,
) -> Vec<ServerMsg> {
    match msg {
        ClientMsg::MoveRequest { target_position } => {
            let mut world = shared.world.lock().await;
            match movement::handle_move_request(&mut world, session, target_position) {
                movement::MoveOutcome::Accepted(p) => {
                    vec![ServerMsg::MoveAccepted { target_position: p }]
                }
                // Anti-cheat rejections are silent on the wire.
                movement::MoveOutcome::Rejected => Vec::new(),
                movement::MoveOutcome::Dead => vec![err("you are dead")],
            }
        }
        ClientMsg::AttackMonster { monster_id } => {
            let mut world = shared.world.lock().await;
            let valid = world
                .monsters
                .get(&monster_id)
                .is_some_and(|m| m.alive);
            let Some(p) = world.players.get_mut(&session) else {
                return vec![err("no active character")];
            };
            if p.character.is_dead {
                return vec![err("you are dead")];
            }
            if !valid {
                return vec![err("no such monster")];
            }
            p.combat_target = Some(monster_id);
            let tag = p.player_id();
            world.push(Outbound::All(ServerMsg::AttackStarted {
                player_id: tag,
                monster_id,
            }));
            Vec::new()
        }
        ClientMsg::UseSkill {
            skill_id,
            target_id,
            target_position,
            ..
        } => {
            let mut world = shared.world.lock().await;
            let req = skills::UseRequest {
                skill_id,
                target_id,
                target_position,
            };
            match skills::use_skill(&mut world, session, req) {
                // The skillUsed event reaches the caller via broadcast.
                Ok(_) => Vec::new(),
                Err(reason) => vec![ServerMsg::SkillUseFailed { skill_id, reason }],
            }
        }
        ClientMsg::CancelCast => {
            let mut world = shared.world.lock().await;
            skills::cancel_cast(&mut world, session);
            Vec::new()
        }
        ClientMsg::LearnSkill {
            skill_id,
            slot_number,
        } => {
            let mut world = shared.world.lock().await;
            vec![skills::learn_skill(&mut world, &shared.store, session, skill_id, slot_number).await]
        }
        ClientMsg::LevelUpSkill { skill_id } => {
            let mut world = shared.world.lock().await;
            vec![skills::level_up_skill(&mut world, &shared.store, session, skill_id).await]
        }
        ClientMsg::GetSkills => {
            let world = shared.world.lock().await;
            vec![ServerMsg::SkillsResponse {
                skills: skills::learned_views(&world, session),
            }]
        }
        ClientMsg::GetSkillList => {
            let world = shared.world.lock().await;
            let class = world
                .players
                .get(&session)
                .map(|p| p.character.class.clone())
                .unwrap_or_default();
            vec![ServerMsg::SkillListResponse {
                skills: skills::template_views_for_class(&shared.catalog, &class),
            }]
        }
        ClientMsg::GetInventory => {
            let world = shared.world.lock().await;
            let Some(p) = world.players.get(&session) else {
                return vec![err("no active character")];
            };
            vec![ServerMsg::InventoryResponse {
                success: true,
                inventory: items::inventory_view(&shared.catalog, &p.inventory),
            }]
        }
        ClientMsg::UseItem { instance_id } => {
            item_mutation(shared, session, |world| {
                items::use_item(world, session, instance_id)
            })
            .await
        }
        ClientMsg::EquipItem { instance_id } => {
            item_mutation(shared, session, |world| {
                items::equip_item(world, session, instance_id)
            })
            .await
        }
        ClientMsg::UnequipItem { slot } => {
            item_mutation(shared, session, |world| {
                items::unequip_item(world, session, slot)
            })
            .await
        }
        ClientMsg::DropItem {
            instance_id,
            quantity,
        } => {
            item_mutation(shared, session, |world| {
                items::drop_item(world, session, instance_id, quantity)
            })
            .await
        }
        ClientMsg::Respawn => respawn(shared, session).await,
        ClientMsg::AddStatusPoint { stat } => {
            let reply = {
                let mut world = shared.world.lock().await;
                items::add_status_point(&mut world, session, stat)
            };
            match reply {
                Ok(msg) => {
                    persist_character_of(shared, session).await;
                    vec![msg]
                }
                Err(message) => vec![ServerMsg::Error { message }],
            }
        }
        ClientMsg::GetCharacterStats => {
            let world = shared.world.lock().await;
            let Some(p) = world.players.get(&session) else {
                return vec![err("no active character")];
            };
            vec![ServerMsg::StatsResponse {
                character: character_view(p),
                base_stats: p.character.base_stats,
                stats: p.derived,
                status_points: p.character.status_points,
            }]
        }
        ClientMsg::Ping => vec![ServerMsg::Pong],
        ClientMsg::Login { .. }
        | ClientMsg::Register { .. }
        | ClientMsg::ListCharacters
        | ClientMsg::CreateCharacter { .. }
        | ClientMsg::SelectCharacter { .. } => vec![err("already in world")],
    }
}

/// Run an inventory mutation, then persist character + inventory. A store
/// failure undoes the in-memory change and reports a plain error; the
/// client never sees the underlying cause.
async fn item_mutation<F>(shared: &Arc<Shared>, session: SessionId, op: F) -> Vec<ServerMsg>
where
    F: FnOnce(&mut World) -> Result<ServerMsg, (duskproto::server::ItemFailReason, String)>,
{
    let (result, snapshot) = {
        let mut world = shared.world.lock().await;
        let snapshot = world
            .players
            .get(&session)
            .map(|p| (p.character.clone(), p.inventory.clone()));
        (op(&mut world), snapshot)
    };

    match result {
        Err((reason, message)) => vec![ServerMsg::ItemUseFailed { reason, message }],
        Ok(reply) => {
            let persisted = {
                let (character, inventory) = {
                    let world = shared.world.lock().await;
                    let Some(p) = world.players.get(&session) else {
                        return vec![reply];
                    };
                    (p.character.clone(), p.inventory.clone())
                };
                match shared.store.update_character(&character).await {
                    Ok(()) => shared.store.save_inventory(&inventory).await,
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = persisted {
                warn!(err = %e, "item mutation persist failed; rolling back");
                let mut world = shared.world.lock().await;
                if let (Some(p), Some((character, inventory))) =
                    (world.players.get_mut(&session), snapshot)
                {
                    p.character = character;
                    p.inventory = inventory;
                    let catalog = world.catalog.clone();
                    if let Some(p) = world.players.get_mut(&session) {
                        items::refresh_derived(p, &catalog);
                    }
                }
                return vec![err("could not save; try again")];
            }
            vec![reply]
        }
    }
}

async fn persist_character_of(shared: &Arc<Shared>, session: SessionId) {
    let character = {
        let world = shared.world.lock().await;
        world.players.get(&session).map(|p| p.character.clone())
    };
    if let Some(c) = character {
        if let Err(e) = shared.store.update_character(&c).await {
            warn!(err = %e, character = c.id, "character save failed");
        }
    }
}

async fn respawn(shared: &Arc<Shared>, session: SessionId) -> Vec<ServerMsg> {
    let reply = {
        let mut world = shared.world.lock().await;
        let spawn = world.catalog.terrain.clamp(Position::default());
        let now = world.now_ms;
        let Some(p) = world.players.get_mut(&session) else {
            return vec![err("no active character")];
        };
        if !p.character.is_dead {
            return vec![err("you are not dead")];
        }
        p.character.is_dead = false;
        p.character.health = p.character.max_health;
        p.character.mana = p.character.max_mana;
        p.character.position = spawn;
        p.target_position = None;
        p.combat_target = None;
        p.pending_cast = None;
        p.last_accepted_pos = spawn;
        p.last_accepted_ms = now;

        let broadcast = ServerMsg::PlayerRespawn {
            player_id: p.player_id(),
            position: spawn,
            health: p.character.health,
            mana: p.character.mana,
        };
        let reply = ServerMsg::RespawnResponse {
            position: spawn,
            health: p.character.health,
            mana: p.character.mana,
        };
        world.push(Outbound::All(broadcast));
        reply
    };
    persist_character_of(shared, session).await;
    vec![reply]
}

#[cfg(test)]
pub mod testutil {
    use std::sync::Arc;

    use duskproto::types::{Position, StatBlock};
    use duskproto::SessionId;

    use crate::catalog;
    use crate::persist::{CharacterRec, InventoryRec, ItemInstanceRec, LearnedSkillRec};
    use crate::world::World;

    pub fn warrior_rec(id: u64, name: &str) -> CharacterRec {
        CharacterRec {
            id,
            account_id: 1,
            name: name.to_string(),
            race: "human".to_string(),
            class: "warrior".to_string(),
            level: 1,
            experience: 0,
            status_points: 0,
            // Maxima are overwritten by the derivation on spawn; seed the
            // currents high so they clamp to full.
            health: 9999,
            max_health: 9999,
            mana: 9999,
            max_mana: 9999,
            base_stats: StatBlock {
                strength: 8,
                intellect: 2,
                dexterity: 4,
                vitality: 7,
            },
            position: Position::default(),
            is_dead: false,
        }
    }

    /// Fixture world: catalog monsters seeded, one warrior in at (0,0,0)
    /// with starter potions and the first three fixture skills learned.
    pub fn spawn_world_with_player() -> (World, SessionId) {
        let cat = Arc::new(catalog::fixture());
        let mut world = World::new(cat.clone(), 42);
        let mut rng = crate::world::Rng64::from_seed(7);
        let recs = World::seed_monster_records(&cat, &mut rng);
        world.load_monsters(&recs);
        world.item_id_pool = 10_000..1_000_000;

        let sid = SessionId(0xA11CE);
        let character = warrior_rec(1, "Tester");
        let mut inventory = InventoryRec::new(1);
        inventory.items.push(ItemInstanceRec {
            instance_id: 100,
            template_id: 1,
            quantity: 5,
            slot: 0,
            is_equipped: false,
        });
        let learned = vec![
            LearnedSkillRec {
                character_id: 1,
                skill_id: 1,
                level: 1,
                slot_number: 1,
                last_used_ms: 0,
            },
            LearnedSkillRec {
                character_id: 1,
                skill_id: 2,
                level: 1,
                slot_number: 2,
                last_used_ms: 0,
            },
            LearnedSkillRec {
                character_id: 1,
                skill_id: 3,
                level: 1,
                slot_number: 3,
                last_used_ms: 0,
            },
        ];
        world.add_player(sid, character, inventory, learned);
        (world, sid)
    }

    /// Add an item instance straight into a player's bag; returns its id.
    pub fn give_item(world: &mut World, sid: SessionId, template_id: u32, quantity: u32) -> u64 {
        let instance_id = world.item_id_pool.next().expect("pool seeded");
        let p = world.players.get_mut(&sid).expect("player exists");
        let slot = p.inventory.free_slot().expect("bag has room");
        p.inventory.items.push(ItemInstanceRec {
            instance_id,
            template_id,
            quantity,
            slot,
            is_equipped: false,
        });
        instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{testutil::scratch_dir, StoreOptions};
    use crate::world::Rng64;

    async fn test_shared() -> Arc<Shared> {
        let catalog = Arc::new(crate::catalog::fixture());
        let store = Arc::new(
            Store::open_with(
                scratch_dir("gateway"),
                StoreOptions {
                    fail_delay: Duration::ZERO,
                },
            )
            .unwrap(),
        );
        let mut world = World::new(catalog.clone(), 42);
        let mut rng = Rng64::from_seed(7);
        let recs = World::seed_monster_records(&catalog, &mut rng);
        world.load_monsters(&recs);
        world.item_id_pool = 10_000..1_000_000;
        Arc::new(Shared {
            catalog,
            store,
            world: Mutex::new(world),
            sessions: Mutex::new(HashMap::new()),
            degraded: false,
            read_timeout: Duration::from_secs(120),
        })
    }

    #[tokio::test]
    async fn full_login_flow_reaches_the_world() {
        let shared = test_shared().await;
        let session = SessionId(1);
        let mut phase = Phase::Unauthenticated;

        // Gameplay before login is refused.
        let r = dispatch(&shared, session, &mut phase, ClientMsg::GetInventory).await;
        assert!(matches!(r[0], ServerMsg::Error { .. }));

        let r = dispatch(
            &shared,
            session,
            &mut phase,
            ClientMsg::Register {
                username: "alice".to_string(),
                password: "hunter7".to_string(),
            },
        )
        .await;
        assert!(matches!(r[0], ServerMsg::RegisterResponse { success: true, .. }));

        let r = dispatch(
            &shared,
            session,
            &mut phase,
            ClientMsg::Login {
                username: "alice".to_string(),
                password: "hunter7".to_string(),
            },
        )
        .await;
        let ServerMsg::LoginResponse {
            success: true,
            data: Some(ref data),
            ..
        } = r[0]
        else {
            panic!("login failed: {r:?}");
        };
        assert!(data.account_id > 0);
        assert!(data.characters.is_empty());
        assert!(matches!(phase, Phase::CharacterSelect { .. }));

        let r = dispatch(
            &shared,
            session,
            &mut phase,
            ClientMsg::CreateCharacter {
                name: "Aldric".to_string(),
                race: "human".to_string(),
                class: "warrior".to_string(),
            },
        )
        .await;
        let ServerMsg::CreateCharacterResponse {
            success: true,
            character: Some(ref c),
            ..
        } = r[0]
        else {
            panic!("create failed: {r:?}");
        };

        let r = dispatch(
            &shared,
            session,
            &mut phase,
            ClientMsg::SelectCharacter { character_id: c.id },
        )
        .await;
        let ServerMsg::SelectCharacterResponse {
            success: true,
            ref all_monsters,
            ref inventory,
            ..
        } = r[0]
        else {
            panic!("select failed: {r:?}");
        };
        assert_eq!(all_monsters.len(), 5);
        // Starter kit: sword + potions.
        assert_eq!(inventory.items.len(), 2);
        assert!(matches!(phase, Phase::InWorld { .. }));

        // The world now contains the player.
        let world = shared.world.lock().await;
        assert!(world.players.contains_key(&session));
    }

    #[tokio::test]
    async fn bad_login_stays_unauthenticated() {
        let shared = test_shared().await;
        let session = SessionId(2);
        let mut phase = Phase::Unauthenticated;

        let r = dispatch(
            &shared,
            session,
            &mut phase,
            ClientMsg::Login {
                username: "ghost".to_string(),
                password: "nope-99".to_string(),
            },
        )
        .await;
        assert!(matches!(
            r[0],
            ServerMsg::LoginResponse { success: false, .. }
        ));
        assert_eq!(phase, Phase::Unauthenticated);
    }

    #[tokio::test]
    async fn ping_works_in_any_phase() {
        let shared = test_shared().await;
        let mut phase = Phase::Unauthenticated;
        let r = dispatch(&shared, SessionId(3), &mut phase, ClientMsg::Ping).await;
        assert!(matches!(r[0], ServerMsg::Pong));
    }

    #[tokio::test]
    async fn attack_monster_starts_combat_and_broadcasts() {
        let shared = test_shared().await;
        let session = SessionId(4);
        enter_world(&shared, session, "Brienne").await;

        let mut phase = Phase::InWorld { account_id: 1 };
        let r = dispatch(
            &shared,
            session,
            &mut phase,
            ClientMsg::AttackMonster { monster_id: 1 },
        )
        .await;
        assert!(r.is_empty());

        let mut world = shared.world.lock().await;
        assert_eq!(world.players.get(&session).unwrap().combat_target, Some(1));
        let out = world.take_outbox();
        assert!(out
            .iter()
            .any(|o| matches!(o, Outbound::All(ServerMsg::AttackStarted { monster_id: 1, .. }))));
    }

    #[tokio::test]
    async fn respawn_restores_and_broadcasts() {
        let shared = test_shared().await;
        let session = SessionId(5);
        enter_world(&shared, session, "Cassia").await;

        {
            let mut world = shared.world.lock().await;
            let p = world.players.get_mut(&session).unwrap();
            p.character.is_dead = true;
            p.character.health = 0;
        }

        let mut phase = Phase::InWorld { account_id: 1 };
        let r = dispatch(&shared, session, &mut phase, ClientMsg::Respawn).await;
        let ServerMsg::RespawnResponse { health, .. } = r[0] else {
            panic!("expected respawnResponse: {r:?}");
        };
        assert!(health > 0);

        let mut world = shared.world.lock().await;
        let p = world.players.get(&session).unwrap();
        assert!(!p.character.is_dead);
        assert_eq!(p.character.health, p.character.max_health);
        let out = world.take_outbox();
        assert!(out
            .iter()
            .any(|o| matches!(o, Outbound::All(ServerMsg::PlayerRespawn { .. }))));
    }

    async fn enter_world(shared: &Arc<Shared>, session: SessionId, name: &str) {
        let mut phase = Phase::Unauthenticated;
        let user = name.to_ascii_lowercase();
        dispatch(
            shared,
            session,
            &mut phase,
            ClientMsg::Register {
                username: user.clone(),
                password: "hunter7".to_string(),
            },
        )
        .await;
        dispatch(
            shared,
            session,
            &mut phase,
            ClientMsg::Login {
                username: user,
                password: "hunter7".to_string(),
            },
        )
        .await;
        dispatch(
            shared,
            session,
            &mut phase,
            ClientMsg::CreateCharacter {
                name: name.to_string(),
                race: "human".to_string(),
                class: "warrior".to_string(),
            },
        )
        .await;
        let id = {
            let Phase::CharacterSelect { account_id } = phase else {
                panic!("not in character select");
            };
            shared.store.list_characters(account_id).await[0].id
        };
        dispatch(
            shared,
            session,
            &mut phase,
            ClientMsg::SelectCharacter { character_id: id },
        )
        .await;
        assert!(matches!(phase, Phase::InWorld { .. }));
    }
}
