use anyhow::Context;
use tracing::warn;

use duskproto::server::{ItemFailReason, ServerMsg};
use duskproto::types::{
    BaseStatKey, DerivedStats, EquipSlotKey, InventoryView, ItemInstanceView, StatBlock,
};
use duskproto::SessionId;

use crate::catalog::{Catalog, EffectTarget, ItemTemplate, ItemType, SkillEffectKind};
use crate::persist::{CharacterRec, InventoryRec, ItemInstanceRec};
use crate::world::{ActiveEffect, Outbound, Player, World};

/// Minimum spacing between consumable uses per effect target.
const CONSUMABLE_CD_MS: u64 = 1000;

pub struct Derivation {
    pub derived: DerivedStats,
    pub eff_stats: StatBlock,
    pub max_health: i32,
    pub max_mana: i32,
}

/// The canonical stat derivation. Nothing else in the server writes
/// derived stats or the health/mana maximums.
///
/// Order: class base -> equipment base-stat bonuses -> base-stat buffs ->
/// maximums and derived values -> equipment derived bonuses -> derived-stat
/// buffs.
pub fn derive_stats(
    catalog: &Catalog,
    character: &CharacterRec,
    inventory: &InventoryRec,
    effects: &[ActiveEffect],
) -> anyhow::Result<Derivation> {
    let class = catalog
        .class(&character.class)
        .with_context(|| format!("unknown class {}", character.class))?;

    let mut eff = character.base_stats;
    let mut item_atk = 0i32;
    let mut item_matk = 0i32;
    let mut item_def = 0i32;
    let mut item_aspd = 0.0f32;

    for (slot, instance_id) in inventory.equipment.occupied() {
        let Some(inst) = inventory.item(instance_id) else {
            continue;
        };
        if !inst.is_equipped {
            continue;
        }
        let Some(t) = catalog.item(inst.template_id) else {
            continue;
        };
        if t.slot != Some(slot) {
            continue;
        }
        eff.strength += t.bonuses.base.strength;
        eff.intellect += t.bonuses.base.intellect;
        eff.dexterity += t.bonuses.base.dexterity;
        eff.vitality += t.bonuses.base.vitality;
        item_atk += t.bonuses.atk;
        item_matk += t.bonuses.matk;
        item_def += t.bonuses.def;
        item_aspd += t.bonuses.attack_speed;
    }

    let mut buff_atk = 0i32;
    let mut buff_matk = 0i32;
    let mut buff_def = 0i32;
    let mut buff_aspd = 0.0f32;
    for e in effects {
        if e.kind != SkillEffectKind::StatBuff {
            continue;
        }
        match e.target_stat.as_deref() {
            Some("str") => eff.strength += e.value,
            Some("int") => eff.intellect += e.value,
            Some("dex") => eff.dexterity += e.value,
            Some("vit") => eff.vitality += e.value,
            Some("atk") => buff_atk += e.value,
            Some("matk") => buff_matk += e.value,
            Some("def") => buff_def += e.value,
            Some("attack_speed") => buff_aspd += e.value as f32 / 100.0,
            other => warn!(stat = ?other, skill = e.skill_id, "unknown buff stat"),
        }
    }

    let level_ups = character.level.saturating_sub(1) as i32;
    let max_health =
        class.base_health + eff.vitality * class.health_per_vit + level_ups * class.health_per_level;
    let max_mana =
        class.base_mana + eff.intellect * class.mana_per_int + level_ups * class.mana_per_level;

    let derived = DerivedStats {
        atk: (eff.strength as f32 * class.atk_per_str).round() as i32 + item_atk + buff_atk,
        matk: (eff.intellect as f32 * class.matk_per_int).round() as i32 + item_matk + buff_matk,
        def: (eff.vitality as f32 * class.def_per_vit).round() as i32 + item_def + buff_def,
        attack_speed: (class.base_attack_speed
            + eff.dexterity as f32 * class.attack_speed_per_dex
            + item_aspd
            + buff_aspd)
            .max(0.1),
    };

    Ok(Derivation {
        derived,
        eff_stats: eff,
        max_health: max_health.max(1),
        max_mana: max_mana.max(0),
    })
}

/// Recompute and store a player's derived stats; every equipment, level or
/// buff mutation funnels through here.
pub fn refresh_derived(player: &mut Player, catalog: &Catalog) {
    match derive_stats(catalog, &player.character, &player.inventory, &player.effects) {
        Ok(d) => {
            player.derived = d.derived;
            player.eff_stats = d.eff_stats;
            player.character.max_health = d.max_health;
            player.character.max_mana = d.max_mana;
            player.character.health = player.character.health.clamp(0, d.max_health);
            player.character.mana = player.character.mana.clamp(0, d.max_mana);
        }
        Err(e) => {
            warn!(player = %player.player_id(), err = %e, "stat derivation failed");
        }
    }
}

pub fn inventory_view(catalog: &Catalog, inv: &InventoryRec) -> InventoryView {
    InventoryView {
        max_slots: inv.max_slots,
        gold: inv.gold,
        equipment: inv.equipment,
        items: inv
            .items
            .iter()
            .map(|i| {
                let t = catalog.item(i.template_id);
                ItemInstanceView {
                    instance_id: i.instance_id,
                    template_id: i.template_id,
                    name: t.map(|t| t.name.clone()).unwrap_or_default(),
                    item_type: t.map(|t| t.item_type.as_str().to_string()).unwrap_or_default(),
                    quantity: i.quantity,
                    slot: i.slot,
                    is_equipped: i.is_equipped,
                }
            })
            .collect(),
    }
}

/// Stack loot into the inventory, filling existing stacks first, opening
/// new bag slots while both space and pre-allocated instance ids last.
/// Returns how much was actually added.
pub fn grant_loot(
    inv: &mut InventoryRec,
    template: &ItemTemplate,
    qty: u32,
    ids: &mut std::ops::Range<u64>,
) -> u32 {
    let mut remaining = qty;

    if template.max_stack > 1 {
        for inst in inv
            .items
            .iter_mut()
            .filter(|i| !i.is_equipped && i.template_id == template.id)
        {
            if remaining == 0 {
                break;
            }
            let room = template.max_stack.saturating_sub(inst.quantity);
            let add = room.min(remaining);
            inst.quantity += add;
            remaining -= add;
        }
    }

    while remaining > 0 {
        let Some(slot) = inv.free_slot() else {
            break;
        };
        let Some(instance_id) = ids.next() else {
            warn!(item = template.id, "item id pool exhausted; loot discarded");
            break;
        };
        let add = remaining.min(template.max_stack);
        inv.items.push(ItemInstanceRec {
            instance_id,
            template_id: template.id,
            quantity: add,
            slot,
            is_equipped: false,
        });
        remaining -= add;
    }

    qty - remaining
}

type ItemResult = Result<ServerMsg, (ItemFailReason, String)>;

fn fail(reason: ItemFailReason, msg: &str) -> ItemResult {
    Err((reason, msg.to_string()))
}

/// Consume one charge of a consumable: per-effect-target cooldown, full-bar
/// pre-checks, clamp-add, stack decrement, delete-at-zero.
pub fn use_item(world: &mut World, sid: SessionId, instance_id: u64) -> ItemResult {
    let catalog = world.catalog.clone();
    let now = world.now_ms;

    let Some(p) = world.players.get_mut(&sid) else {
        return fail(ItemFailReason::ExecutionError, "no active character");
    };
    if p.character.is_dead {
        return fail(ItemFailReason::ExecutionError, "dead characters cannot use items");
    }

    let Some(inst) = p.inventory.item(instance_id) else {
        return fail(ItemFailReason::NotFound, "no such item");
    };
    let Some(t) = catalog.item(inst.template_id) else {
        return fail(ItemFailReason::NotFound, "unknown item template");
    };
    if t.item_type != ItemType::Consumable {
        return fail(ItemFailReason::NotConsumable, "item cannot be used");
    }
    let Some(target) = t.effect_target else {
        return fail(ItemFailReason::NotConsumable, "item has no effect");
    };

    if let Some(last) = p.consumable_cd.get(&target) {
        if now.saturating_sub(*last) < CONSUMABLE_CD_MS {
            return fail(ItemFailReason::OnCooldown, "item effect is on cooldown");
        }
    }

    match target {
        EffectTarget::Health if p.character.health >= p.character.max_health => {
            return fail(ItemFailReason::HpFull, "health already full");
        }
        EffectTarget::Mana if p.character.mana >= p.character.max_mana => {
            return fail(ItemFailReason::MpFull, "mana already full");
        }
        _ => {}
    }

    match target {
        EffectTarget::Health => {
            p.character.health = (p.character.health + t.effect_value).min(p.character.max_health);
        }
        EffectTarget::Mana => {
            p.character.mana = (p.character.mana + t.effect_value).min(p.character.max_mana);
        }
    }
    p.consumable_cd.insert(target, now);

    let remaining = {
        let inst = p
            .inventory
            .item_mut(instance_id)
            .expect("instance checked above");
        inst.quantity -= 1;
        inst.quantity
    };
    if remaining == 0 {
        p.inventory.items.retain(|i| i.instance_id != instance_id);
    }

    let reply = ServerMsg::ItemUsed {
        player_id: p.player_id(),
        instance_id,
        health: p.character.health,
        max_health: p.character.max_health,
        mana: p.character.mana,
        max_mana: p.character.max_mana,
        remaining_quantity: remaining,
    };
    let update = ServerMsg::PlayerStatsUpdate {
        player_id: p.player_id(),
        health: p.character.health,
        max_health: p.character.max_health,
        mana: p.character.mana,
        max_mana: p.character.max_mana,
    };
    world.push(Outbound::All(update));
    Ok(reply)
}

pub fn equip_item(world: &mut World, sid: SessionId, instance_id: u64) -> ItemResult {
    let catalog = world.catalog.clone();
    let Some(p) = world.players.get_mut(&sid) else {
        return fail(ItemFailReason::ExecutionError, "no active character");
    };

    let Some(inst) = p.inventory.item(instance_id) else {
        return fail(ItemFailReason::NotFound, "no such item");
    };
    let Some(t) = catalog.item(inst.template_id) else {
        return fail(ItemFailReason::NotFound, "unknown item template");
    };
    if t.item_type != ItemType::Equipment {
        return fail(ItemFailReason::NotEquipment, "item cannot be equipped");
    }
    let Some(slot) = t.slot else {
        return fail(ItemFailReason::NotEquipment, "item has no equip slot");
    };
    if inst.is_equipped {
        return fail(ItemFailReason::AlreadyEquipped, "item is already equipped");
    }
    if p.character.level < t.required_level {
        return fail(ItemFailReason::LevelTooLow, "level too low for this item");
    }
    if let Some(req) = &t.required_class {
        if !req.eq_ignore_ascii_case(&p.character.class) {
            return fail(ItemFailReason::ClassMismatch, "class cannot use this item");
        }
    }

    // A swap never needs a free bag slot: equipping vacates exactly one
    // slot and the displaced occupant falls into it, so a full bag still
    // swaps cleanly. Only unequip is a net addition.
    let occupant = p.inventory.equipment.get(slot);

    // Equip the new item first; its bag slot is what the displaced item
    // falls back into.
    let freed_slot = {
        let inst = p
            .inventory
            .item_mut(instance_id)
            .expect("instance checked above");
        let s = inst.slot;
        inst.is_equipped = true;
        inst.slot = -1;
        s
    };
    if let Some(old_id) = occupant {
        match p.inventory.item_mut(old_id) {
            Some(old) => {
                old.is_equipped = false;
                old.slot = freed_slot;
            }
            None => {
                warn!(
                    player = %p.player_id(),
                    slot = slot.as_str(),
                    instance = old_id,
                    "equipment slot pointed at a missing instance; clearing"
                );
            }
        }
    }
    p.inventory.equipment.set(slot, Some(instance_id));

    refresh_derived(p, &catalog);
    Ok(ServerMsg::ItemEquipped {
        player_id: p.player_id(),
        instance_id,
        new_stats: p.derived,
        equipment: p.inventory.equipment,
    })
}

pub fn unequip_item(world: &mut World, sid: SessionId, slot: EquipSlotKey) -> ItemResult {
    let catalog = world.catalog.clone();
    let Some(p) = world.players.get_mut(&sid) else {
        return fail(ItemFailReason::ExecutionError, "no active character");
    };

    let Some(instance_id) = p.inventory.equipment.get(slot) else {
        return fail(ItemFailReason::SlotEmpty, "nothing equipped in that slot");
    };

    if p.inventory.item(instance_id).is_none() {
        // Stored state disagrees with itself. Repair rather than crash:
        // clear the reference, persist, report failure.
        warn!(
            player = %p.player_id(),
            slot = slot.as_str(),
            instance = instance_id,
            "inventory corruption: equipment reference without instance"
        );
        p.inventory.equipment.set(slot, None);
        refresh_derived(p, &catalog);
        let char_id = p.character.id;
        world.dirty.inventories.insert(char_id);
        return fail(ItemFailReason::ExecutionError, "inventory repaired; try again");
    }

    let Some(bag_slot) = p.inventory.free_slot() else {
        return fail(ItemFailReason::InventoryFull, "no free inventory slot");
    };

    let inst = p
        .inventory
        .item_mut(instance_id)
        .expect("instance checked above");
    inst.is_equipped = false;
    inst.slot = bag_slot;
    p.inventory.equipment.set(slot, None);

    refresh_derived(p, &catalog);
    Ok(ServerMsg::ItemUnequipped {
        player_id: p.player_id(),
        new_stats: p.derived,
        equipment: p.inventory.equipment,
        slot,
    })
}

pub fn drop_item(world: &mut World, sid: SessionId, instance_id: u64, quantity: u32) -> ItemResult {
    let Some(p) = world.players.get_mut(&sid) else {
        return fail(ItemFailReason::ExecutionError, "no active character");
    };
    if quantity == 0 {
        return fail(ItemFailReason::QuantityInsufficient, "nothing to drop");
    }

    let Some(inst) = p.inventory.item(instance_id) else {
        return fail(ItemFailReason::NotFound, "no such item");
    };
    if inst.is_equipped {
        return fail(ItemFailReason::ItemEquipped, "unequip the item first");
    }
    if inst.quantity < quantity {
        return fail(ItemFailReason::QuantityInsufficient, "not that many");
    }

    let remaining = {
        let inst = p
            .inventory
            .item_mut(instance_id)
            .expect("instance checked above");
        inst.quantity -= quantity;
        inst.quantity
    };
    if remaining == 0 {
        p.inventory.items.retain(|i| i.instance_id != instance_id);
    }

    Ok(ServerMsg::ItemDropped {
        player_id: p.player_id(),
        instance_id,
        quantity,
    })
}

pub fn add_status_point(world: &mut World, sid: SessionId, stat: BaseStatKey) -> Result<ServerMsg, String> {
    let catalog = world.catalog.clone();
    let Some(p) = world.players.get_mut(&sid) else {
        return Err("no active character".to_string());
    };
    if p.character.status_points == 0 {
        return Err("no status points available".to_string());
    }

    p.character.status_points -= 1;
    match stat {
        BaseStatKey::Str => p.character.base_stats.strength += 1,
        BaseStatKey::Int => p.character.base_stats.intellect += 1,
        BaseStatKey::Dex => p.character.base_stats.dexterity += 1,
        BaseStatKey::Vit => p.character.base_stats.vitality += 1,
    }
    refresh_derived(p, &catalog);

    Ok(ServerMsg::StatusPointAdded {
        player_id: p.player_id(),
        stat,
        status_points: p.character.status_points,
        new_stats: p.derived,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testutil::{give_item, spawn_world_with_player};

    #[test]
    fn equip_unequip_round_trips_stats_and_items() {
        let (mut world, sid) = spawn_world_with_player();
        let helmet_id = give_item(&mut world, sid, 11, 1);

        let (stats_before, items_before) = {
            let p = world.players.get(&sid).unwrap();
            (p.derived, sorted_ids(&p.inventory))
        };

        equip_item(&mut world, sid, helmet_id).unwrap();
        {
            let p = world.players.get(&sid).unwrap();
            assert_eq!(p.inventory.equipment.helmet, Some(helmet_id));
            assert_eq!(p.derived.def, stats_before.def + 3);
        }

        unequip_item(&mut world, sid, EquipSlotKey::Helmet).unwrap();
        let p = world.players.get(&sid).unwrap();
        assert_eq!(p.derived, stats_before);
        assert_eq!(sorted_ids(&p.inventory), items_before);
        assert!(p.inventory.equipment.helmet.is_none());
    }

    fn sorted_ids(inv: &InventoryRec) -> Vec<(u64, bool)> {
        let mut v: Vec<(u64, bool)> = inv.items.iter().map(|i| (i.instance_id, i.is_equipped)).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn equip_swaps_occupant_into_freed_bag_slot() {
        let (mut world, sid) = spawn_world_with_player();
        let sword_a = give_item(&mut world, sid, 10, 1);
        let sword_b = give_item(&mut world, sid, 10, 1);

        equip_item(&mut world, sid, sword_a).unwrap();
        equip_item(&mut world, sid, sword_b).unwrap();

        let p = world.players.get(&sid).unwrap();
        assert_eq!(p.inventory.equipment.weapon, Some(sword_b));
        let a = p.inventory.item(sword_a).unwrap();
        assert!(!a.is_equipped);
        assert!(a.slot >= 0);
    }

    #[test]
    fn swap_succeeds_with_bag_at_capacity() {
        let (mut world, sid) = spawn_world_with_player();
        let sword_a = give_item(&mut world, sid, 10, 1);
        equip_item(&mut world, sid, sword_a).unwrap();
        let sword_b = give_item(&mut world, sid, 10, 1);

        // Shrink the bag to exactly its current usage: no free slot left.
        {
            let p = world.players.get_mut(&sid).unwrap();
            p.inventory.max_slots = p.inventory.used_slots() as u32;
            assert!(p.inventory.free_slot().is_none());
        }

        // The swap is slot-neutral, so it must still go through.
        equip_item(&mut world, sid, sword_b).unwrap();

        let p = world.players.get(&sid).unwrap();
        assert_eq!(p.inventory.equipment.weapon, Some(sword_b));
        let a = p.inventory.item(sword_a).unwrap();
        assert!(!a.is_equipped);
        assert!(a.slot >= 0);
        assert!(p.inventory.used_slots() <= p.inventory.max_slots as usize);
    }

    #[test]
    fn potion_on_full_health_is_a_noop_with_hp_full() {
        let (mut world, sid) = spawn_world_with_player();
        let potion = {
            // Starter kit includes potions (template 1).
            let p = world.players.get(&sid).unwrap();
            p.inventory
                .items
                .iter()
                .find(|i| i.template_id == 1)
                .unwrap()
                .instance_id
        };
        let qty_before = world
            .players
            .get(&sid)
            .unwrap()
            .inventory
            .item(potion)
            .unwrap()
            .quantity;

        let err = use_item(&mut world, sid, potion).unwrap_err();
        assert_eq!(err.0, ItemFailReason::HpFull);

        let p = world.players.get(&sid).unwrap();
        assert_eq!(p.inventory.item(potion).unwrap().quantity, qty_before);
        assert_eq!(p.character.health, p.character.max_health);
    }

    #[test]
    fn potion_heals_clamped_and_respects_cooldown() {
        let (mut world, sid) = spawn_world_with_player();
        world.now_ms = 10_000;
        let potion = world
            .players
            .get(&sid)
            .unwrap()
            .inventory
            .items
            .iter()
            .find(|i| i.template_id == 1)
            .unwrap()
            .instance_id;

        {
            let p = world.players.get_mut(&sid).unwrap();
            p.character.health = p.character.max_health - 5;
        }
        let ServerMsg::ItemUsed {
            health,
            max_health,
            remaining_quantity,
            ..
        } = use_item(&mut world, sid, potion).unwrap()
        else {
            panic!("wrong reply");
        };
        // +25 clamps at max.
        assert_eq!(health, max_health);
        assert_eq!(remaining_quantity, 4);

        // Immediately again: same effect target is on cooldown.
        {
            let p = world.players.get_mut(&sid).unwrap();
            p.character.health -= 10;
        }
        let err = use_item(&mut world, sid, potion).unwrap_err();
        assert_eq!(err.0, ItemFailReason::OnCooldown);

        // After a second it works again.
        world.now_ms += 1000;
        assert!(use_item(&mut world, sid, potion).is_ok());
    }

    #[test]
    fn last_potion_charge_deletes_the_instance() {
        let (mut world, sid) = spawn_world_with_player();
        world.now_ms = 10_000;
        let potion = give_item(&mut world, sid, 2, 1); // one mana potion
        {
            let p = world.players.get_mut(&sid).unwrap();
            p.character.mana = 0;
        }
        let ServerMsg::ItemUsed {
            remaining_quantity, ..
        } = use_item(&mut world, sid, potion).unwrap()
        else {
            panic!("wrong reply");
        };
        assert_eq!(remaining_quantity, 0);
        assert!(world.players.get(&sid).unwrap().inventory.item(potion).is_none());
    }

    #[test]
    fn drop_rejects_equipped_and_overdraw() {
        let (mut world, sid) = spawn_world_with_player();
        let sword = give_item(&mut world, sid, 10, 1);
        equip_item(&mut world, sid, sword).unwrap();

        assert_eq!(
            drop_item(&mut world, sid, sword, 1).unwrap_err().0,
            ItemFailReason::ItemEquipped
        );

        let potion = world
            .players
            .get(&sid)
            .unwrap()
            .inventory
            .items
            .iter()
            .find(|i| i.template_id == 1)
            .unwrap()
            .instance_id;
        assert_eq!(
            drop_item(&mut world, sid, potion, 99).unwrap_err().0,
            ItemFailReason::QuantityInsufficient
        );
        assert!(drop_item(&mut world, sid, potion, 5).is_ok());
        assert!(world.players.get(&sid).unwrap().inventory.item(potion).is_none());
    }

    #[test]
    fn corrupt_equipment_reference_is_repaired() {
        let (mut world, sid) = spawn_world_with_player();
        {
            let p = world.players.get_mut(&sid).unwrap();
            p.inventory.equipment.ring = Some(987_654);
        }
        let err = unequip_item(&mut world, sid, EquipSlotKey::Ring).unwrap_err();
        assert_eq!(err.0, ItemFailReason::ExecutionError);
        let p = world.players.get(&sid).unwrap();
        assert!(p.inventory.equipment.ring.is_none());
    }

    #[test]
    fn grant_loot_stacks_then_spills() {
        let (mut world, sid) = spawn_world_with_player();
        let catalog = world.catalog.clone();
        let potion_t = catalog.item(1).unwrap();
        let mut ids = 5000u64..5100;

        let p = world.players.get_mut(&sid).unwrap();
        // Starter kit has 5/20 potions; 30 more fills the stack and opens
        // one new one.
        let added = grant_loot(&mut p.inventory, potion_t, 30, &mut ids);
        assert_eq!(added, 30);
        let total: u32 = p
            .inventory
            .items
            .iter()
            .filter(|i| i.template_id == 1)
            .map(|i| i.quantity)
            .sum();
        assert_eq!(total, 35);
        let stacks = p.inventory.items.iter().filter(|i| i.template_id == 1).count();
        assert_eq!(stacks, 2);
    }

    #[test]
    fn status_points_feed_the_derivation() {
        let (mut world, sid) = spawn_world_with_player();
        {
            let p = world.players.get_mut(&sid).unwrap();
            p.character.status_points = 2;
        }
        let atk_before = world.players.get(&sid).unwrap().derived.atk;
        add_status_point(&mut world, sid, BaseStatKey::Str).unwrap();
        let p = world.players.get(&sid).unwrap();
        assert_eq!(p.character.status_points, 1);
        // Warrior: 2 atk per str.
        assert_eq!(p.derived.atk, atk_before + 2);
    }
}
