use std::collections::{BTreeMap, BTreeSet, VecDeque};

use doorrando_game::sector::Sector;
use doorrando_game::{CrystalBarrier, DoorIdx, LocationIdx, RegionIdx, World};
use doorrando_logic::{
    DoorRules, ItemPlacementView, KeyCount, KeyLogic, LocationSet, PlacedItem, PlacementRule,
};
use log::{error, info, warn};

use crate::error::{GenResult, GenerationError};
use crate::settings::{Accessibility, DoorShuffle, GameMode, RandomizerSettings};
use crate::traverse::{ExplorableDoor, ExplorationState};

type CounterIdx = usize;

/// What can be reached in a dungeon with a given set of key doors opened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyCounter {
    pub free_locations: LocationSet,
    pub key_only_locations: LocationSet,
    pub child_doors: Vec<DoorIdx>,
    pub open_doors: BTreeSet<DoorIdx>,
    pub used_keys: KeyCount,
    pub big_key_opened: bool,
    pub important_location: bool,
    pub other_locations: LocationSet,
}

impl KeyCounter {
    fn used_smalls_loc(&self, reserve: KeyCount) -> KeyCount {
        (self.used_keys + reserve - self.key_only_locations.len() as KeyCount).max(0)
    }
}

/// Key door layout of one generated dungeon plus the memoized state graph over it.
#[derive(Clone, Debug)]
pub struct KeyLayout {
    pub dungeon: String,
    pub start_regions: Vec<RegionIdx>,
    // Every key door and its partner; bit order of counter ids
    pub proposal: Vec<DoorIdx>,
    pub key_logic: KeyLogic,
    pub key_counters: Vec<KeyCounter>,
    counter_ids: BTreeMap<String, CounterIdx>,
    pub max_chests: KeyCount,
    pub max_drops: KeyCount,
    pub all_chest_locations: LocationSet,
    pub big_key_special: Option<RegionIdx>,
    pub all_locations: LocationSet,
    pub item_locations: LocationSet,
}

impl KeyLayout {
    fn counter(&self, idx: CounterIdx) -> &KeyCounter {
        &self.key_counters[idx]
    }

    fn cid(&self, idx: CounterIdx) -> String {
        let counter = self.counter(idx);
        counter_id(&counter.open_doors, counter.big_key_opened, &self.proposal)
    }
}

pub struct KeyContext<'a> {
    pub world: &'a World,
    pub settings: &'a RandomizerSettings,
}

impl KeyContext<'_> {
    fn is_big(&self, door: DoorIdx) -> bool {
        self.world.doors[door].big_key
    }

    fn dest(&self, door: DoorIdx) -> Option<DoorIdx> {
        self.world.doors[door].dest
    }

    fn is_spiral(&self, door: DoorIdx) -> bool {
        self.world.doors[door].kind.is_spiral()
    }

    fn is_big_chest(&self, loc: LocationIdx) -> bool {
        self.world.locations[loc].is_big_chest()
    }

    fn important_location(&self, loc: LocationIdx) -> bool {
        self.world.locations[loc].is_important()
    }
}

/// Key doors of the sector, each followed by its partner unless it is a stairway.
pub fn find_key_door_proposal(world: &World, sector: &Sector) -> Vec<DoorIdx> {
    let mut proposal = BTreeSet::new();
    for &r in &sector.regions {
        for &exit in &world.regions[r].exits {
            let door = world.doors[exit].controller.unwrap_or(exit);
            let d = &world.doors[door];
            if d.small_key {
                proposal.insert(door);
                if !d.kind.is_spiral() {
                    proposal.extend(d.dest);
                }
            }
        }
    }
    proposal.into_iter().collect()
}

pub fn count_unique_sm_doors<'a>(world: &World, doors: impl IntoIterator<Item = &'a DoorIdx>) -> usize {
    let mut unique_d_set: BTreeSet<DoorIdx> = BTreeSet::new();
    for &d in doors {
        let door = &world.doors[d];
        if !unique_d_set.contains(&d)
            && (door.dest.is_none_or(|dest| !unique_d_set.contains(&dest)) || door.kind.is_spiral())
            && !door.big_key
        {
            unique_d_set.insert(d);
        }
    }
    unique_d_set.len()
}

pub fn build_key_layout(
    ctx: &KeyContext,
    dungeon: &str,
    sector: &Sector,
    start_regions: &[RegionIdx],
    key_doors_num: usize,
) -> GenResult<KeyLayout> {
    let world = ctx.world;
    let def = world
        .get_dungeon(dungeon)
        .map_err(|e| GenerationError::logic(dungeon, "", e.to_string()))?;
    let proposal = find_key_door_proposal(world, sector);
    let max_drops = sector
        .regions
        .iter()
        .flat_map(|&r| world.regions[r].locations.iter())
        .filter(|&&loc| world.locations[loc].is_key_drop())
        .count() as KeyCount;
    let max_chests = if ctx.settings.door_shuffle != DoorShuffle::Crossed {
        def.small_keys as KeyCount
    } else {
        (key_doors_num as KeyCount - max_drops).max(0)
    };
    let big_key_special = def
        .big_key_cell
        .as_deref()
        .and_then(|name| world.region_idx_by_name.get(name).copied())
        .filter(|&r| sector.contains_region(r));
    let all_locations = sector
        .regions
        .iter()
        .flat_map(|&r| world.regions[r].locations.iter().copied())
        .collect();
    Ok(KeyLayout {
        dungeon: dungeon.to_string(),
        start_regions: start_regions.to_vec(),
        proposal,
        key_logic: KeyLogic::new(dungeon),
        key_counters: vec![],
        counter_ids: BTreeMap::new(),
        max_chests,
        max_drops,
        all_chest_locations: LocationSet::new(),
        big_key_special,
        all_locations,
        item_locations: LocationSet::new(),
    })
}

/// Derive door rules, big key restrictions and placement rules for the dungeon.
pub fn analyze_dungeon(ctx: &KeyContext, key_layout: &mut KeyLayout) -> GenResult<()> {
    info!("Analyzing key logic for {}", key_layout.dungeon);
    create_key_counters(ctx, key_layout);
    find_bk_locked_sections(ctx, key_layout);
    let big_chests = find_big_chest_locations(ctx, &key_layout.all_chest_locations);
    key_layout.key_logic.bk_chests.extend(big_chests);
    if ctx.settings.retro && ctx.settings.mode != GameMode::Standard {
        return Ok(());
    }

    let original_key_counter = find_counter_checked(ctx, key_layout, &BTreeSet::new(), false)?;
    let mut queue: VecDeque<(Option<DoorIdx>, CounterIdx)> =
        VecDeque::from([(None, original_key_counter)]);
    let mut doors_completed: BTreeSet<DoorIdx> = BTreeSet::new();
    let mut visited_cid: BTreeSet<String> = BTreeSet::from([key_layout.cid(original_key_counter)]);

    while !queue.is_empty() {
        queue.make_contiguous().sort_by_key(|&(door, _)| queue_sorter(ctx, door));
        let Some((_, kc)) = queue.pop_front() else {
            break;
        };
        let key_counter = key_layout.counter(kc).clone();
        let chest_keys = available_chest_small_keys(ctx, key_layout, &key_counter);
        let raw_avail = chest_keys + key_counter.key_only_locations.len() as KeyCount;
        let available = raw_avail - key_counter.used_keys;
        let possible_smalls = count_unique_small_doors(ctx, &key_counter, &key_layout.proposal);
        let avail_bigs =
            exist_relevant_big_doors(ctx, key_layout, &key_counter) || exist_big_chest(ctx, &key_counter);
        let non_big_locs = count_locations_big_optional(ctx, &key_counter.free_locations, false);
        if !key_counter.big_key_opened
            && chest_keys == non_big_locs
            && chest_keys > 0
            && available <= possible_smalls
            && !avail_bigs
        {
            let restricted = filter_big_chest(ctx, &key_counter.free_locations);
            key_layout.key_logic.bk_restricted.extend(restricted);
        }

        let mut child_queue: VecDeque<(DoorIdx, KeyCounter, bool)> = VecDeque::new();
        for &child in &key_counter.child_doors {
            if !ctx.is_big(child) || key_layout.big_key_special.is_none() || key_counter.big_key_opened {
                let odd_counter = create_odd_key_counter(ctx, key_layout, child, kc)?;
                let empty_flag = empty_counter(&odd_counter);
                child_queue.push_back((child, odd_counter, empty_flag));
            }
        }
        while let Some((child, odd_counter, empty_flag)) = child_queue.pop_front() {
            if !ctx.is_big(child) && !doors_completed.contains(&child) {
                let best_counter =
                    find_best_counter(ctx, key_layout, child, &odd_counter, kc, false, empty_flag)?;
                let mut rule = create_rule(ctx, key_layout, best_counter, kc);
                check_for_self_lock_key(ctx, key_layout, &mut rule, child, best_counter)?;
                bk_restricted_rules(ctx, key_layout, &mut rule, child, &odd_counter, empty_flag, kc)?;
                key_layout.key_logic.door_rules.insert(child, rule);
            }
            doors_completed.insert(child);
            let next_counter = find_next_counter(ctx, key_layout, child, kc)?;
            if visited_cid.insert(key_layout.cid(next_counter)) {
                queue.push_back((Some(child), next_counter));
            }
        }
    }
    check_rules(ctx, key_layout, original_key_counter)?;

    // Flip to the alternate rule where it is the stricter one, so the big key is never placed
    // where it would soft-lock
    let max_counter = find_max_counter(key_layout)?;
    let max_free = key_layout.counter(max_counter).free_locations.clone();
    for rule in key_layout.key_logic.door_rules.values_mut() {
        if let Some(alternate) = rule.alternate_small_key {
            if alternate > rule.small_key_num {
                rule.alternate_big_key_loc = max_free
                    .difference(&rule.alternate_big_key_loc)
                    .copied()
                    .collect();
                rule.alternate_small_key = Some(rule.small_key_num);
                rule.small_key_num = alternate;
            }
        }
    }
    create_exhaustive_placement_rules(ctx, key_layout)?;
    set_paired_rules(ctx.world, &mut key_layout.key_logic);
    Ok(())
}

fn queue_sorter(ctx: &KeyContext, door: Option<DoorIdx>) -> u8 {
    match door {
        Some(d) if ctx.is_big(d) => 1,
        _ => 0,
    }
}

fn create_exhaustive_placement_rules(ctx: &KeyContext, key_layout: &mut KeyLayout) -> GenResult<()> {
    let max_ctr = key_layout.counter(find_max_counter(key_layout)?).clone();
    for idx in 0..key_layout.key_counters.len() {
        let code = key_layout.cid(idx);
        let key_counter = key_layout.counter(idx).clone();
        let accessible_loc: LocationSet = key_counter
            .free_locations
            .union(&key_counter.key_only_locations)
            .copied()
            .collect();
        let blocked_loc: LocationSet = key_layout
            .item_locations
            .difference(&accessible_loc)
            .copied()
            .collect();
        let min_keys = key_counter.used_keys + 1;
        if blocked_loc.is_empty() || key_counter.key_only_locations.len() as KeyCount >= min_keys {
            continue;
        }
        let mut valid_rule = true;
        let mut rule = PlacementRule::new(code.clone(), &key_layout.dungeon);
        if key_counter.big_key_opened || !big_key_progress(ctx, &key_counter) {
            rule.needed_keys_w_bk = Some(min_keys);
            rule.bk_relevant = key_counter.big_key_opened;
            if key_counter.big_key_opened && min_keys + 1 > accessible_loc.len() as KeyCount {
                // The big key cannot be in the accessible locations
                valid_rule = false;
                key_layout
                    .key_logic
                    .bk_restricted
                    .extend(accessible_loc.difference(&max_ctr.key_only_locations));
            } else {
                placement_self_lock_adjustment(ctx, &mut rule, &max_ctr, &blocked_loc, &key_counter);
                rule.check_locations_w_bk = Some(accessible_loc.clone());
                check_sm_restriction_needed(key_layout, &max_ctr, &rule, &blocked_loc);
            }
        } else {
            if only_sm_doors(ctx, &key_counter) {
                create_inclusive_rule(
                    ctx,
                    key_layout,
                    &max_ctr,
                    code,
                    &key_counter,
                    &blocked_loc,
                    &accessible_loc,
                    min_keys,
                );
            }
            rule.needed_keys_wo_bk = Some(min_keys);
            rule.check_locations_wo_bk = Some(filter_big_chest(ctx, &accessible_loc));
            rule.bk_conditional_set = Some(blocked_loc);
        }
        if valid_rule {
            key_layout.key_logic.placement_rules.push(rule);
        }
    }
    refine_placement_rules(key_layout, &max_ctr);
    Ok(())
}

fn placement_self_lock_adjustment(
    ctx: &KeyContext,
    rule: &mut PlacementRule,
    max_ctr: &KeyCounter,
    blocked_loc: &LocationSet,
    ctr: &KeyCounter,
) {
    if blocked_loc.len() == 1 && ctx.settings.accessibility != Accessibility::Locations {
        let important_found = max_ctr
            .other_locations
            .difference(&ctr.other_locations)
            .any(|&loc| ctx.important_location(loc));
        if !important_found {
            if let Some(n) = rule.needed_keys_w_bk.as_mut() {
                *n -= 1;
            }
        }
    }
}

fn check_sm_restriction_needed(
    key_layout: &mut KeyLayout,
    max_ctr: &KeyCounter,
    rule: &PlacementRule,
    blocked: &LocationSet,
) -> bool {
    if rule.needed_keys_w_bk
        == Some(key_layout.max_chests + max_ctr.key_only_locations.len() as KeyCount)
    {
        key_layout
            .key_logic
            .sm_restricted
            .extend(blocked.difference(&max_ctr.key_only_locations));
        return true;
    }
    false
}

fn create_inclusive_rule(
    ctx: &KeyContext,
    key_layout: &mut KeyLayout,
    max_ctr: &KeyCounter,
    code: String,
    key_counter: &KeyCounter,
    blocked_loc: &LocationSet,
    accessible_loc: &LocationSet,
    min_keys: KeyCount,
) {
    let mut rule = PlacementRule::new(code, &key_layout.dungeon);
    rule.needed_keys_w_bk = Some(min_keys);
    if key_counter.big_key_opened && min_keys + 1 > accessible_loc.len() as KeyCount {
        key_layout
            .key_logic
            .bk_restricted
            .extend(accessible_loc.difference(&max_ctr.key_only_locations));
    } else {
        placement_self_lock_adjustment(ctx, &mut rule, max_ctr, blocked_loc, key_counter);
        rule.check_locations_w_bk = Some(accessible_loc.clone());
        check_sm_restriction_needed(key_layout, max_ctr, &rule, blocked_loc);
        key_layout.key_logic.placement_rules.push(rule);
    }
}

// Strip key-only and restricted locations from one half of a rule and report whether the rule
// has become trivially satisfied
fn trim_rule_half(
    locs: &mut LocationSet,
    needed: &mut KeyCount,
    sm_restricted: &LocationSet,
    key_only: &LocationSet,
) -> bool {
    locs.retain(|l| !sm_restricted.contains(l));
    let key_onlys: Vec<LocationIdx> = locs.intersection(key_only).copied().collect();
    if !key_onlys.is_empty() {
        for l in &key_onlys {
            locs.remove(l);
        }
        *needed -= key_onlys.len() as KeyCount;
    }
    *needed == 0
}

/// Iterate the placement rules to a fixed point: drop satisfied or impossible rules, push
/// impossibilities into `bk_restricted`, and merge rules with identical requirements.
fn refine_placement_rules(key_layout: &mut KeyLayout, max_ctr: &KeyCounter) {
    let max_chests = key_layout.max_chests;
    let KeyLogic {
        placement_rules,
        bk_restricted,
        sm_restricted,
        ..
    } = &mut key_layout.key_logic;
    let mut changed = true;
    while changed {
        changed = false;
        let mut rules_to_remove: BTreeSet<usize> = BTreeSet::new();
        for (i, rule) in placement_rules.iter_mut().enumerate() {
            if rule.has_w_bk() {
                let locs = rule.check_locations_w_bk.get_or_insert_with(LocationSet::new);
                let needed = rule.needed_keys_w_bk.get_or_insert(0);
                if trim_rule_half(locs, needed, sm_restricted, &max_ctr.key_only_locations) {
                    rules_to_remove.insert(i);
                }
                if rule.bk_relevant && locs.len() as KeyCount == *needed + 1 {
                    let new_restricted: LocationSet =
                        max_ctr.free_locations.difference(locs).copied().collect();
                    if !new_restricted.is_subset(bk_restricted) {
                        // The big key must be in one of the check locations
                        bk_restricted.extend(new_restricted);
                        changed = true;
                    }
                }
                if *needed > max_chests || (locs.len() as KeyCount) < *needed {
                    warn!("Invalid placement rule {} dropped", rule.door_reference);
                    rules_to_remove.insert(i);
                    changed = true;
                }
            }
            if let Some(cond) = rule.bk_conditional_set.as_mut() {
                cond.retain(|l| !bk_restricted.contains(l) && !max_ctr.key_only_locations.contains(l));
                if cond.is_empty() {
                    rules_to_remove.insert(i);
                }
            }
            if rule.has_wo_bk() {
                let locs = rule.check_locations_wo_bk.get_or_insert_with(LocationSet::new);
                let needed = rule.needed_keys_wo_bk.get_or_insert(0);
                if trim_rule_half(locs, needed, sm_restricted, &max_ctr.key_only_locations) {
                    rules_to_remove.insert(i);
                }
                if (locs.len() as KeyCount) < *needed || *needed > max_chests {
                    if let Some(cond) = rule.bk_conditional_set.as_ref().filter(|c| !c.is_empty()) {
                        // The big key cannot be behind this rule's blocked locations
                        bk_restricted.extend(cond.iter().copied());
                        rules_to_remove.insert(i);
                        changed = true;
                    }
                }
            }
        }

        let remaining: Vec<usize> = (0..placement_rules.len())
            .filter(|i| !rules_to_remove.contains(i))
            .collect();
        'pairs: for (n, &ia) in remaining.iter().enumerate() {
            for &ib in &remaining[n + 1..] {
                let (mut a, mut b) = (ia, ib);
                if placement_rules[b].has_bk_conditional() && placement_rules[a].has_w_bk() {
                    std::mem::swap(&mut a, &mut b);
                }
                let (rule_a, rule_b) = (&placement_rules[a], &placement_rules[b]);
                if rule_a.has_bk_conditional() && rule_b.has_w_bk() {
                    let common_needed = rule_a
                        .needed_keys_wo_bk
                        .unwrap_or(0)
                        .min(rule_b.needed_keys_w_bk.unwrap_or(0));
                    let empty = LocationSet::new();
                    let a_wo = rule_a.check_locations_wo_bk.as_ref().unwrap_or(&empty);
                    let b_w = rule_b.check_locations_w_bk.as_ref().unwrap_or(&empty);
                    let common = b_w.intersection(a_wo).count() as KeyCount;
                    if common < common_needed {
                        if let Some(cond) = &rule_a.bk_conditional_set {
                            bk_restricted.extend(cond.iter().copied());
                        }
                        rules_to_remove.insert(a);
                        changed = true;
                        break 'pairs;
                    }
                }
            }
        }

        let mut equivalent_rules: Vec<(usize, usize)> = vec![];
        for (i, rule) in placement_rules.iter().enumerate() {
            for (j, rule2) in placement_rules.iter().enumerate() {
                if i == j {
                    continue;
                }
                if let (Some(l1), Some(l2)) = (
                    rule.check_locations_w_bk.as_ref().filter(|s| !s.is_empty()),
                    rule2.check_locations_w_bk.as_ref().filter(|s| !s.is_empty()),
                ) {
                    let (n1, n2) = (rule.needed_keys_w_bk, rule2.needed_keys_w_bk);
                    if l2 == l1 && n2 > n1 {
                        rules_to_remove.insert(i);
                    } else if n2 == n1 && l2.is_subset(l1) && l2 != l1 {
                        rules_to_remove.insert(i);
                    } else if l2 == l1 && n2 == n1 {
                        equivalent_rules.push((i, j));
                    }
                }
                if let (Some(l1), Some(l2)) = (
                    rule.check_locations_wo_bk.as_ref().filter(|s| !s.is_empty()),
                    rule2.check_locations_wo_bk.as_ref().filter(|s| !s.is_empty()),
                ) {
                    if rule.bk_conditional_set == rule2.bk_conditional_set {
                        let (n1, n2) = (rule.needed_keys_wo_bk, rule2.needed_keys_wo_bk);
                        if l2 == l1 && n2 > n1 {
                            rules_to_remove.insert(i);
                        } else if n2 == n1 && l2.is_subset(l1) && l2 != l1 {
                            rules_to_remove.insert(i);
                        } else if l2 == l1 && n2 == n1 {
                            equivalent_rules.push((i, j));
                        }
                    }
                }
            }
        }
        equivalent_rules.retain(|(a, b)| !rules_to_remove.contains(a) && !rules_to_remove.contains(b));

        // Merge equivalent rules into the first of each group
        let mut removed_rules: BTreeMap<usize, usize> = BTreeMap::new();
        let resolve = |removed: &BTreeMap<usize, usize>, mut r: usize| {
            while let Some(&next) = removed.get(&r) {
                r = next;
            }
            r
        };
        for (r1, r2) in equivalent_rules {
            let r1 = resolve(&removed_rules, r1);
            let r2 = resolve(&removed_rules, r2);
            if r1 != r2 {
                let reference = placement_rules[r2].door_reference.clone();
                placement_rules[r1].door_reference.push(',');
                placement_rules[r1].door_reference.push_str(&reference);
                removed_rules.insert(r2, r1);
            }
        }
        rules_to_remove.extend(removed_rules.keys().copied());
        if !rules_to_remove.is_empty() {
            let mut i = 0;
            placement_rules.retain(|_| {
                let keep = !rules_to_remove.contains(&i);
                i += 1;
                keep
            });
        }
    }
}

fn find_bk_locked_sections(ctx: &KeyContext, key_layout: &mut KeyLayout) {
    if key_layout.big_key_special.is_some() {
        return;
    }
    let mut bk_key_not_required = LocationSet::new();
    let mut big_chest_allowed_big_key = ctx.settings.accessibility != Accessibility::Locations;
    for counter in &key_layout.key_counters {
        key_layout
            .all_chest_locations
            .extend(counter.free_locations.iter().copied());
        key_layout
            .item_locations
            .extend(counter.free_locations.iter().copied());
        key_layout
            .item_locations
            .extend(counter.key_only_locations.iter().copied());
        if counter.big_key_opened && counter.important_location {
            big_chest_allowed_big_key = false;
        }
        if !counter.big_key_opened {
            bk_key_not_required.extend(counter.free_locations.iter().copied());
        }
    }
    let key_logic = &mut key_layout.key_logic;
    key_logic.bk_restricted.extend(
        key_layout
            .all_chest_locations
            .difference(&bk_key_not_required)
            .copied(),
    );
    if !big_chest_allowed_big_key {
        key_logic
            .bk_restricted
            .extend(find_big_chest_locations(ctx, &key_layout.all_chest_locations));
    }
}

fn empty_counter(counter: &KeyCounter) -> bool {
    counter.key_only_locations.is_empty()
        && counter.free_locations.is_empty()
        && counter.child_doors.is_empty()
        && !counter.important_location
}

fn relative_empty_counter(ctx: &KeyContext, odd_counter: &KeyCounter, key_counter: &KeyCounter) -> bool {
    if !odd_counter.key_only_locations.is_subset(&key_counter.key_only_locations) {
        return false;
    }
    if !odd_counter.free_locations.is_subset(&key_counter.free_locations) {
        return false;
    }
    !odd_counter
        .child_doors
        .iter()
        .any(|&child| unique_child_door(ctx, child, key_counter))
}

fn unique_child_door(ctx: &KeyContext, child: DoorIdx, key_counter: &KeyCounter) -> bool {
    let dest_is_child = ctx
        .dest(child)
        .is_some_and(|d| key_counter.child_doors.contains(&d));
    if key_counter.child_doors.contains(&child) || dest_is_child {
        return false;
    }
    if key_counter.open_doors.contains(&child) {
        return false;
    }
    !(ctx.is_big(child) && key_counter.big_key_opened)
}

fn ignored_pair(ctx: &KeyContext, door: DoorIdx) -> BTreeSet<DoorIdx> {
    let mut ignored = BTreeSet::from([door]);
    ignored.extend(ctx.dest(door));
    ignored
}

fn with_opened(ctx: &KeyContext, opened: &BTreeSet<DoorIdx>, door: DoorIdx) -> BTreeSet<DoorIdx> {
    let mut proposed = opened.clone();
    proposed.insert(door);
    proposed.extend(ctx.dest(door));
    proposed
}

/// Open as many other doors as possible before `door`, wasting keys where that can happen,
/// so the rule derived from the result is not too loose.
fn find_best_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    door: DoorIdx,
    odd_counter: &KeyCounter,
    key_counter: CounterIdx,
    skip_bk: bool,
    empty_flag: bool,
) -> GenResult<CounterIdx> {
    let mut ignored_doors = ignored_pair(ctx, door);
    let mut opened_doors = key_layout.counter(key_counter).open_doors.clone();
    let mut bk_opened = key_layout.counter(key_counter).big_key_opened;
    let mut last_counter = key_counter;
    loop {
        let Some(door_set) = find_potential_open_doors(
            ctx,
            key_layout,
            key_layout.counter(last_counter),
            &ignored_doors,
            skip_bk,
            1,
        ) else {
            break;
        };
        if door_set.is_empty() {
            break;
        }
        let progress_marker = (last_counter, ignored_doors.len());
        for new_door in door_set {
            let proposed_doors = with_opened(ctx, &opened_doors, new_door);
            let bk_open = bk_opened || ctx.is_big(new_door);
            let new_counter = find_counter_checked(ctx, key_layout, &proposed_doors, bk_open)?;
            let bk_open = key_layout.counter(new_counter).big_key_opened;
            if !empty_flag && relative_empty_counter(ctx, odd_counter, key_layout.counter(new_counter)) {
                // This door leads to the same things as the door being evaluated
                ignored_doors.insert(new_door);
            } else if empty_flag
                || key_wasted(ctx, key_layout, new_door, door, last_counter, new_counter)?
            {
                last_counter = new_counter;
                opened_doors = proposed_doors;
                bk_opened = bk_open;
            } else {
                ignored_doors.insert(new_door);
            }
        }
        if progress_marker == (last_counter, ignored_doors.len()) {
            break;
        }
    }
    Ok(last_counter)
}

fn find_potential_open_doors(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    key_counter: &KeyCounter,
    ignored_doors: &BTreeSet<DoorIdx>,
    skip_bk: bool,
    reserve: KeyCount,
) -> Option<Vec<DoorIdx>> {
    let mut small_doors: Vec<DoorIdx> = vec![];
    let mut big_doors: Vec<DoorIdx> = vec![];
    for &other in &key_counter.child_doors {
        let dest = ctx.dest(other);
        if ignored_doors.contains(&other) || dest.is_some_and(|d| ignored_doors.contains(&d)) {
            continue;
        }
        if ctx.is_big(other) {
            if !skip_bk && (key_layout.big_key_special.is_none() || key_counter.big_key_opened) {
                big_doors.push(other);
            }
        } else if dest.is_none_or(|d| !small_doors.contains(&d)) {
            small_doors.push(other);
        }
    }
    let big_key_available = if key_layout.big_key_special.is_some() {
        key_counter.big_key_opened
    } else {
        key_counter.free_locations.len() as KeyCount - key_counter.used_smalls_loc(reserve) > 0
    };
    if small_doors.is_empty() && !skip_bk && (big_doors.is_empty() || !big_key_available) {
        return None;
    }
    small_doors.extend(big_doors);
    Some(small_doors)
}

/// Whether opening `new_door` (and whatever it leads to) can burn keys without giving enough
/// back.
fn key_wasted(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    new_door: DoorIdx,
    old_door: DoorIdx,
    old_counter: CounterIdx,
    new_counter: CounterIdx,
) -> GenResult<bool> {
    if ctx.is_big(new_door) {
        // Big key doors use up a location rather than a key
        return Ok(true);
    }
    let old = key_layout.counter(old_counter);
    let new = key_layout.counter(new_counter);
    let chest_keys = available_chest_small_keys(ctx, key_layout, old);
    let old_key_diff = old.key_only_locations.len() as KeyCount - old.used_keys;
    let old_avail = chest_keys + old_key_diff;
    let new_chest_keys = available_chest_small_keys(ctx, key_layout, new);
    let new_key_diff = new.key_only_locations.len() as KeyCount - new.used_keys;
    let new_avail = new_chest_keys + new_key_diff;
    if new_key_diff < old_key_diff || new_avail < old_avail {
        return Ok(true);
    }
    let mut wasted_keys = 0;
    let new_children: Vec<DoorIdx> = new
        .child_doors
        .iter()
        .copied()
        .filter(|&x| {
            x != old_door
                && ctx.dest(x) != Some(old_door)
                && (!ctx.is_big(x) || !old.child_doors.contains(&x))
        })
        .collect();
    let opened_doors = new.open_doors.clone();
    let bk_opened = new.big_key_opened;
    for new_child in new_children {
        let proposed_doors = with_opened(ctx, &opened_doors, new_child);
        let bk_open = bk_opened || ctx.is_big(new_door);
        let child_counter = find_counter_checked(ctx, key_layout, &proposed_doors, bk_open)?;
        if key_wasted(ctx, key_layout, new_child, old_door, new_counter, child_counter)? {
            wasted_keys += 1;
        }
        if new_avail - wasted_keys < old_avail {
            return Ok(true);
        }
    }
    Ok(false)
}

fn find_next_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    new_door: DoorIdx,
    old_counter: CounterIdx,
) -> GenResult<CounterIdx> {
    let old = key_layout.counter(old_counter);
    let proposed_doors = with_opened(ctx, &old.open_doors, new_door);
    let bk_open = old.big_key_opened || ctx.is_big(new_door);
    find_counter_checked(ctx, key_layout, &proposed_doors, bk_open)
}

fn create_rule(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    key_counter: CounterIdx,
    prev_counter: CounterIdx,
) -> DoorRules {
    let counter = key_layout.counter(key_counter);
    let prev = key_layout.counter(prev_counter);
    let chest_keys = available_chest_small_keys(ctx, key_layout, counter);
    let key_only = counter.key_only_locations.len() as KeyCount;
    let key_gain = key_only - prev.key_only_locations.len() as KeyCount;
    // The counter has wasted all the keys it can, so one more is needed
    let required_keys = counter.used_keys + 1;
    let adj_chest_keys = chest_keys.min(required_keys);
    let needed_chests = required_keys - key_only;
    let is_valid = needed_chests <= chest_keys;
    let unneeded_chests = key_gain.min((adj_chest_keys - needed_chests).max(0));
    DoorRules::new(required_keys - unneeded_chests, is_valid)
}

fn check_for_self_lock_key(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    rule: &mut DoorRules,
    door: DoorIdx,
    parent_counter: CounterIdx,
) -> GenResult<()> {
    if ctx.settings.accessibility == Accessibility::Locations {
        return Ok(());
    }
    let counter = find_inverted_counter(ctx, key_layout, door, parent_counter)?;
    if !self_lock_possible(&counter) {
        return Ok(());
    }
    if counter.free_locations.len() == 1
        && counter.key_only_locations.is_empty()
        && !counter.important_location
    {
        rule.allow_small = true;
        rule.small_location = counter.free_locations.first().copied();
    }
    Ok(())
}

/// Everything only reachable through `door`: the max counter minus what opening every other
/// door yields.
fn find_inverted_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    door: DoorIdx,
    parent_counter: CounterIdx,
) -> GenResult<KeyCounter> {
    let counter = key_layout.counter(open_all_counter(ctx, key_layout, parent_counter, Some(door), false)?);
    let max_counter = key_layout.counter(find_max_counter(key_layout)?);
    let mut inverted_counter = KeyCounter {
        free_locations: max_counter
            .free_locations
            .difference(&counter.free_locations)
            .copied()
            .collect(),
        key_only_locations: max_counter
            .key_only_locations
            .difference(&counter.key_only_locations)
            .copied()
            .collect(),
        open_doors: max_counter
            .open_doors
            .difference(&counter.open_doors)
            .copied()
            .collect(),
        other_locations: max_counter
            .other_locations
            .difference(&counter.other_locations)
            .copied()
            .collect(),
        ..KeyCounter::default()
    };
    inverted_counter.important_location = inverted_counter
        .other_locations
        .iter()
        .any(|&loc| ctx.important_location(loc));
    Ok(inverted_counter)
}

fn open_all_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    parent_counter: CounterIdx,
    door: Option<DoorIdx>,
    skip_bk: bool,
) -> GenResult<CounterIdx> {
    let mut counter = parent_counter;
    let mut proposed_doors = key_layout.counter(parent_counter).open_doors.clone();
    let door_dest = door.and_then(|d| ctx.dest(d));
    loop {
        let current = key_layout.counter(counter);
        let doors_to_open: Vec<DoorIdx> = current
            .child_doors
            .iter()
            .copied()
            .filter(|&child| door.is_none() || (Some(child) != door && Some(child) != door_dest))
            .filter(|&child| {
                if skip_bk {
                    !ctx.is_big(child)
                } else {
                    !ctx.is_big(child)
                        || key_layout.big_key_special.is_none()
                        || current.big_key_opened
                }
            })
            .collect();
        if doors_to_open.is_empty() {
            break;
        }
        proposed_doors.extend(doors_to_open.iter().copied());
        let bk_hint = current.big_key_opened || doors_to_open.iter().any(|&d| ctx.is_big(d));
        let next = find_counter_checked(ctx, key_layout, &proposed_doors, bk_hint)?;
        if next == counter {
            break;
        }
        counter = next;
    }
    Ok(counter)
}

fn open_some_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    parent_counter: CounterIdx,
    ignored_doors: &BTreeSet<DoorIdx>,
) -> GenResult<CounterIdx> {
    let mut counter = parent_counter;
    let mut proposed_doors = key_layout.counter(parent_counter).open_doors.clone();
    loop {
        let current = key_layout.counter(counter);
        let doors_to_open: Vec<DoorIdx> = current
            .child_doors
            .iter()
            .copied()
            .filter(|&child| !ignored_doors.contains(&child) && !ctx.is_big(child))
            .collect();
        if doors_to_open.is_empty() {
            break;
        }
        proposed_doors.extend(doors_to_open.iter().copied());
        let next = find_counter_checked(ctx, key_layout, &proposed_doors, current.big_key_opened)?;
        if next == counter {
            break;
        }
        counter = next;
    }
    Ok(counter)
}

fn self_lock_possible(counter: &KeyCounter) -> bool {
    counter.free_locations.len() <= 1
        && counter.key_only_locations.is_empty()
        && !counter.important_location
}

fn available_chest_small_keys(ctx: &KeyContext, key_layout: &KeyLayout, key_counter: &KeyCounter) -> KeyCount {
    available_chest_small_keys_logic(ctx, key_layout, key_counter, &LocationSet::new())
}

fn available_chest_small_keys_logic(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    key_counter: &KeyCounter,
    sm_restricted: &LocationSet,
) -> KeyCount {
    if ctx.settings.key_shuffle || ctx.settings.retro {
        return key_layout.max_chests;
    }
    let cnt = key_counter
        .free_locations
        .iter()
        .filter(|&&loc| {
            !sm_restricted.contains(&loc) && (key_counter.big_key_opened || !ctx.is_big_chest(loc))
        })
        .count() as KeyCount;
    cnt.min(key_layout.max_chests)
}

/// Record a relaxed threshold for `door` when the big key sits behind it.
fn bk_restricted_rules(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    rule: &mut DoorRules,
    door: DoorIdx,
    odd_counter: &KeyCounter,
    empty_flag: bool,
    key_counter: CounterIdx,
) -> GenResult<()> {
    if key_layout.counter(key_counter).big_key_opened {
        return Ok(());
    }
    let best_counter = find_best_counter(ctx, key_layout, door, odd_counter, key_counter, true, empty_flag)?;
    let bk_rule = create_rule(ctx, key_layout, best_counter, key_counter);
    if bk_rule.small_key_num >= rule.small_key_num {
        return Ok(());
    }
    let door_open = find_next_counter(ctx, key_layout, door, best_counter)?;
    let best_children = &key_layout.counter(best_counter).child_doors;
    let mut ignored_doors: BTreeSet<DoorIdx> = key_layout
        .counter(door_open)
        .child_doors
        .iter()
        .copied()
        .filter(|d| best_children.contains(d))
        .collect();
    let dest_ignored: Vec<DoorIdx> = ignored_doors
        .iter()
        .filter_map(|&d| ctx.dest(d))
        .filter(|d| !ignored_doors.contains(d))
        .collect();
    ignored_doors.extend(dest_ignored);
    let post_counter = open_some_counter(ctx, key_layout, door_open, &ignored_doors)?;
    let unique_loc: LocationSet = key_layout
        .counter(post_counter)
        .free_locations
        .difference(&key_layout.counter(best_counter).free_locations)
        .copied()
        .collect();
    if !unique_loc.is_empty() {
        rule.alternate_small_key = Some(bk_rule.small_key_num);
        rule.alternate_big_key_loc.extend(unique_loc);
    }
    Ok(())
}

fn open_a_door(world: &World, door: DoorIdx, child_state: &mut ExplorationState, flat_proposal: &[DoorIdx]) {
    if world.doors[door].big_key {
        child_state.big_key_opened = true;
        for exp_door in &child_state.big_doors {
            if !child_state.opened_doors.contains(&exp_door.door) {
                child_state.opened_doors.push(exp_door.door);
            }
        }
        child_state.avail_doors.append(&mut child_state.big_doors);
    } else {
        child_state.opened_doors.push(door);
        release_small_door(child_state, door);
        let d = &world.doors[door];
        if let Some(dest_door) = d.dest {
            if flat_proposal.contains(&dest_door) && !d.kind.is_spiral() {
                child_state.opened_doors.push(dest_door);
                release_small_door(child_state, dest_door);
            }
        }
    }
}

fn release_small_door(state: &mut ExplorationState, door: DoorIdx) {
    let (now_available, still_locked): (Vec<_>, Vec<_>) = std::mem::take(&mut state.small_doors)
        .into_iter()
        .partition(|x| x.door == door);
    state.small_doors = still_locked;
    state.avail_doors.extend(now_available);
}

fn unique_doors(doors: &[ExplorableDoor]) -> Vec<DoorIdx> {
    let mut unique_d_set: Vec<DoorIdx> = vec![];
    for d in doors {
        if !unique_d_set.contains(&d.door) {
            unique_d_set.push(d.door);
        }
    }
    unique_d_set
}

fn big_key_progress(ctx: &KeyContext, key_counter: &KeyCounter) -> bool {
    !only_sm_doors(ctx, key_counter) || exist_big_chest(ctx, key_counter)
}

fn only_sm_doors(ctx: &KeyContext, key_counter: &KeyCounter) -> bool {
    !key_counter.child_doors.iter().any(|&d| ctx.is_big(d))
}

// Partner doors are not counted separately
fn count_unique_small_doors(ctx: &KeyContext, key_counter: &KeyCounter, proposal: &[DoorIdx]) -> KeyCount {
    let mut cnt = 0;
    let mut counted: BTreeSet<DoorIdx> = BTreeSet::new();
    for &door in &key_counter.child_doors {
        if proposal.contains(&door) && counted.insert(door) {
            cnt += 1;
            if !ctx.is_spiral(door) {
                counted.extend(ctx.dest(door));
            }
        }
    }
    cnt
}

fn exist_relevant_big_doors(ctx: &KeyContext, key_layout: &KeyLayout, key_counter: &KeyCounter) -> bool {
    let Some(bk_counter) = find_counter(ctx, key_layout, &key_counter.open_doors, true) else {
        return false;
    };
    let bk_counter = key_layout.counter(bk_counter);
    !bk_counter.free_locations.is_subset(&key_counter.free_locations)
        || !bk_counter
            .key_only_locations
            .is_subset(&key_counter.key_only_locations)
        || bk_counter
            .child_doors
            .iter()
            .any(|d| !key_counter.child_doors.contains(d))
}

fn exist_big_chest(ctx: &KeyContext, key_counter: &KeyCounter) -> bool {
    key_counter.free_locations.iter().any(|&loc| ctx.is_big_chest(loc))
}

fn count_locations_big_optional(ctx: &KeyContext, locations: &LocationSet, bk: bool) -> KeyCount {
    locations
        .iter()
        .filter(|&&loc| bk || !ctx.is_big_chest(loc))
        .count() as KeyCount
}

fn filter_big_chest(ctx: &KeyContext, locations: &LocationSet) -> LocationSet {
    locations
        .iter()
        .copied()
        .filter(|&loc| !ctx.is_big_chest(loc))
        .collect()
}

fn find_big_chest_locations(ctx: &KeyContext, locations: &LocationSet) -> LocationSet {
    locations
        .iter()
        .copied()
        .filter(|&loc| ctx.is_big_chest(loc))
        .collect()
}

fn expand_key_state(world: &World, state: &mut ExplorationState, flat_proposal: &[DoorIdx]) {
    while let Some(exp_door) = state.next_avail_door(world) {
        let door = exp_door.door;
        let Some(connect_region) = world.doors[door].connected else {
            continue;
        };
        if state.validate(world, door, connect_region) {
            state.visit_region(world, connect_region, true, false);
            state.add_all_doors_check_keys(world, connect_region, flat_proposal);
        }
    }
}

/// How a stored rule's threshold is read and adjusted while checking key-only locations.
#[derive(Copy, Clone)]
enum RuleField {
    SmallKey,
    Alternate,
}

// A rule guarding a key-only location; None stands for a free (zero key) access
type RuleRef = Option<DoorIdx>;

fn rule_value(key_logic: &KeyLogic, rule: RuleRef, field: RuleField) -> KeyCount {
    let Some(r) = rule.and_then(|d| key_logic.door_rules.get(&d)) else {
        return 0;
    };
    match field {
        RuleField::SmallKey => r.small_key_num,
        RuleField::Alternate => r.alternate_small_key.unwrap_or(r.small_key_num),
    }
}

fn set_rule_value(key_logic: &mut KeyLogic, rule: RuleRef, field: RuleField, value: KeyCount) {
    let Some(r) = rule.and_then(|d| key_logic.door_rules.get_mut(&d)) else {
        return;
    };
    match field {
        RuleField::SmallKey => r.small_key_num = value,
        RuleField::Alternate => {
            if r.alternate_small_key.is_some() {
                r.alternate_small_key = Some(value);
            }
        }
    }
}

/// Make sure every key-only location stays collectible under the derived door rules, then
/// walk the whole state graph with them.
fn check_rules(ctx: &KeyContext, key_layout: &mut KeyLayout, original_counter: CounterIdx) -> GenResult<()> {
    let mut key_only_map: BTreeMap<LocationIdx, Vec<RuleRef>> = BTreeMap::new();
    let mut queue: VecDeque<(Option<DoorIdx>, CounterIdx, LocationSet)> = VecDeque::from([(
        None,
        original_counter,
        key_layout.counter(original_counter).key_only_locations.clone(),
    )]);
    let mut completed: BTreeSet<String> = BTreeSet::from([key_layout.cid(original_counter)]);
    while !queue.is_empty() {
        queue
            .make_contiguous()
            .sort_by_key(|(door, _, _)| queue_sorter(ctx, *door));
        let Some((access_door, counter, key_only_loc)) = queue.pop_front() else {
            break;
        };
        for loc in key_only_loc {
            let access_rules = key_only_map.entry(loc).or_default();
            match access_door {
                Some(d) if key_layout.key_logic.door_rules.contains_key(&d) => {
                    if !access_rules.contains(&Some(d)) {
                        access_rules.push(Some(d));
                    }
                }
                Some(d) if ctx.is_big(d) => {}
                _ => access_rules.push(None),
            }
        }
        let current = key_layout.counter(counter).clone();
        for &child in &current.child_doors {
            if !ctx.is_big(child) || key_layout.big_key_special.is_none() || current.big_key_opened {
                let next_counter = find_next_counter(ctx, key_layout, child, counter)?;
                if completed.insert(key_layout.cid(next_counter)) {
                    let new_key_only = key_layout
                        .counter(next_counter)
                        .key_only_locations
                        .difference(&current.key_only_locations)
                        .copied()
                        .collect();
                    queue.push_back((Some(child), next_counter, new_key_only));
                }
            }
        }
    }

    let key_logic = &key_layout.key_logic;
    let mut min_rule_bk: BTreeMap<LocationIdx, Vec<RuleRef>> = BTreeMap::new();
    let mut min_rule_non_bk: BTreeMap<LocationIdx, Vec<RuleRef>> = BTreeMap::new();
    let mut check_non_bk = false;
    for (&loc, rule_list) in &key_only_map {
        let mut m_bk: Option<KeyCount> = None;
        let mut m_nbk: Option<KeyCount> = None;
        for &rule in rule_list {
            let small_key_num = rule_value(key_logic, rule, RuleField::SmallKey);
            if m_bk.is_none_or(|m| small_key_num <= m) {
                min_rule_bk.entry(loc).or_default().push(rule);
                m_bk = Some(small_key_num);
            }
            let alternate = rule
                .and_then(|d| key_logic.door_rules.get(&d))
                .and_then(|r| r.alternate_small_key);
            if alternate.is_some() {
                check_non_bk = true;
            }
            let ask = alternate.unwrap_or(small_key_num);
            if m_nbk.is_none_or(|m| ask <= m) {
                min_rule_non_bk.entry(loc).or_default().push(rule);
                m_nbk = alternate;
            }
        }
    }
    adjust_key_location_mins(key_layout, min_rule_bk, RuleField::SmallKey);
    if check_non_bk {
        adjust_key_location_mins(key_layout, min_rule_non_bk, RuleField::Alternate);
    }
    check_rules_deep(ctx, key_layout, original_counter)
}

fn adjust_key_location_mins(
    key_layout: &mut KeyLayout,
    mut min_rules: BTreeMap<LocationIdx, Vec<RuleRef>>,
    field: RuleField,
) {
    let mut collected_keys = key_layout.max_chests;
    let mut collected_locs: LocationSet = LocationSet::new();
    let mut changed = true;
    while changed {
        changed = false;
        let mut for_removal = vec![];
        for (&loc, rules) in &min_rules {
            if collected_locs.contains(&loc) {
                for_removal.push(loc);
            }
            for &rule in rules {
                if rule_value(&key_layout.key_logic, rule, field) <= collected_keys
                    && !collected_locs.contains(&loc)
                {
                    changed = true;
                    collected_keys += 1;
                    collected_locs.insert(loc);
                    for_removal.push(loc);
                }
            }
        }
        for loc in for_removal {
            min_rules.remove(&loc);
        }
    }
    for rules in min_rules.values() {
        for &rule in rules {
            set_rule_value(&mut key_layout.key_logic, rule, field, collected_keys);
        }
    }
}

/// Walk every key counter under the derived rules; any state that cannot progress has its
/// smallest rules lowered, and a state that still cannot progress is a derivation defect.
fn check_rules_deep(ctx: &KeyContext, key_layout: &mut KeyLayout, original_counter: CounterIdx) -> GenResult<()> {
    let big_locations: LocationSet = key_layout
        .all_chest_locations
        .difference(&key_layout.key_logic.bk_restricted)
        .copied()
        .collect();
    let mut queue: VecDeque<CounterIdx> = VecDeque::from([original_counter]);
    let mut completed: BTreeSet<String> = BTreeSet::from([key_layout.cid(original_counter)]);
    let mut last_counter: Option<CounterIdx> = None;
    let mut bail = 0;
    while let Some(counter_idx) = queue.pop_front() {
        if last_counter == Some(counter_idx) {
            bail += 1;
            if bail > 10 {
                return Err(GenerationError::logic(
                    &key_layout.dungeon,
                    key_layout.cid(counter_idx),
                    "deep rule check cannot make progress",
                ));
            }
        } else {
            bail = 0;
        }
        last_counter = Some(counter_idx);
        let counter = key_layout.counter(counter_idx).clone();
        let key_logic = &key_layout.key_logic;
        let mut chest_keys =
            available_chest_small_keys_logic(ctx, key_layout, &counter, &key_logic.sm_restricted);
        let mut big_avail = counter.big_key_opened;
        let mut big_maybe_not_found = !counter.big_key_opened;
        if key_layout.big_key_special.is_none() && !big_avail {
            big_avail = counter
                .free_locations
                .iter()
                .any(|loc| !key_logic.bk_restricted.contains(loc));
        }
        let outstanding_big_locs: LocationSet = big_locations
            .difference(&counter.free_locations)
            .copied()
            .collect();
        if big_maybe_not_found && outstanding_big_locs.is_empty() {
            big_maybe_not_found = false;
        }
        let big_uses_chest = big_avail && key_layout.big_key_special.is_none();
        let key_only = counter.key_only_locations.len() as KeyCount;
        let collected_alt = key_only + chest_keys;
        if big_uses_chest
            && chest_keys
                == count_locations_big_optional(ctx, &counter.free_locations, counter.big_key_opened)
        {
            chest_keys -= 1;
        }
        let collected = key_only + chest_keys;
        let mut can_progress = counter.child_doors.is_empty();
        let mut smalls_opened = false;
        let mut small_rules: Vec<DoorIdx> = vec![];
        for &door in &counter.child_doors {
            let mut can_open = false;
            if ctx.is_big(door) && big_avail {
                can_open = true;
            } else if let Some(rule) = key_logic.door_rules.get(&door) {
                small_rules.push(door);
                if rule_satisfied(
                    rule,
                    collected,
                    collected_alt,
                    &outstanding_big_locs,
                    chest_keys,
                    key_layout.max_chests,
                ) {
                    can_open = true;
                    smalls_opened = true;
                }
            } else if !ctx.is_big(door) {
                can_open = true;
            }
            if can_open {
                can_progress = smalls_opened || !big_maybe_not_found;
                let next_counter = find_next_counter(ctx, key_layout, door, counter_idx)?;
                if completed.insert(key_layout.cid(next_counter)) {
                    queue.push_back(next_counter);
                }
            }
        }
        if !can_progress {
            if small_rules.is_empty() {
                return Err(GenerationError::logic(
                    &key_layout.dungeon,
                    key_layout.cid(counter_idx),
                    "no door can be opened and no rule can be relaxed",
                ));
            }
            reduce_rules(&mut key_layout.key_logic, &small_rules, collected, collected_alt);
            queue.push_back(counter_idx);
        }
    }
    Ok(())
}

fn rule_satisfied(
    rule: &DoorRules,
    collected: KeyCount,
    collected_alt: KeyCount,
    outstanding_big_locs: &LocationSet,
    chest_keys: KeyCount,
    max_chests: KeyCount,
) -> bool {
    if collected >= rule.small_key_num {
        return true;
    }
    if rule.allow_small && collected >= rule.small_key_num - 1 && chest_keys < max_chests {
        return true;
    }
    let big_key_in_alternate = outstanding_big_locs.is_subset(&rule.alternate_big_key_loc);
    if rule
        .alternate_small_key
        .is_some_and(|a| big_key_in_alternate && collected >= a)
    {
        return true;
    }
    if collected_alt > collected {
        if collected_alt >= rule.small_key_num {
            return true;
        }
        if rule.allow_small && collected_alt >= rule.small_key_num - 1 && chest_keys + 1 < max_chests {
            return true;
        }
        if rule
            .alternate_small_key
            .is_some_and(|a| big_key_in_alternate && collected_alt >= a)
        {
            return true;
        }
    }
    false
}

fn reduce_rules(key_logic: &mut KeyLogic, small_rules: &[DoorIdx], collected: KeyCount, collected_alt: KeyCount) {
    let Some(min_num) = small_rules
        .iter()
        .filter_map(|d| key_logic.door_rules.get(d))
        .map(|r| r.small_key_num)
        .min()
    else {
        return;
    };
    for door in small_rules {
        let Some(rule) = key_logic.door_rules.get_mut(door) else {
            continue;
        };
        if rule.small_key_num != min_num {
            continue;
        }
        // Already being reduced
        rule.allow_small = false;
        rule.small_key_num = if min_num > collected_alt && collected_alt > collected {
            collected_alt
        } else {
            collected
        };
    }
}

fn set_paired_rules(world: &World, key_logic: &mut KeyLogic) {
    let pairs: Vec<(DoorIdx, DoorIdx)> = key_logic
        .door_rules
        .keys()
        .filter_map(|&d| world.doors[d].dest.map(|dest| (d, dest)))
        .filter(|(_, dest)| key_logic.door_rules.contains_key(dest))
        .collect();
    for (door, dest) in pairs {
        if let Some(rule) = key_logic.door_rules.get_mut(&door) {
            rule.opposite = Some(dest);
        }
    }
}

/// Explore every combination of opened key doors reachable from the start regions and record
/// one counter per distinct state.
fn create_key_counters(ctx: &KeyContext, key_layout: &mut KeyLayout) {
    let world = ctx.world;
    let mut state = ExplorationState::new(CrystalBarrier::Orange, &key_layout.dungeon);
    state.key_locations = key_layout.max_chests;
    state.big_key_special = key_layout.big_key_special;
    for &region in &key_layout.start_regions {
        state.visit_region(world, region, true, false);
        state.add_all_doors_check_keys(world, region, &key_layout.proposal);
    }
    expand_key_state(world, &mut state, &key_layout.proposal);
    let code = state_id(&state, &key_layout.proposal);
    let counter = create_key_counter(ctx, key_layout, &state);
    key_layout.key_counters.push(counter);
    key_layout.counter_ids.insert(code, 0);
    let mut queue: VecDeque<(CounterIdx, ExplorationState)> = VecDeque::from([(0, state)]);
    while let Some((counter_idx, parent_state)) = queue.pop_front() {
        let child_doors = key_layout.counter(counter_idx).child_doors.clone();
        for door in child_doors {
            let mut child_state = parent_state.clone();
            if ctx.is_big(door) {
                key_layout.key_logic.bk_doors.insert(door);
            }
            if !ctx.is_big(door) || child_state.big_key_special.is_none() || child_state.big_key_opened {
                open_a_door(world, door, &mut child_state, &key_layout.proposal);
                expand_key_state(world, &mut child_state, &key_layout.proposal);
                let code = state_id(&child_state, &key_layout.proposal);
                if !key_layout.counter_ids.contains_key(&code) {
                    let child_counter = create_key_counter(ctx, key_layout, &child_state);
                    let idx = key_layout.key_counters.len();
                    key_layout.key_counters.push(child_counter);
                    key_layout.counter_ids.insert(code, idx);
                    queue.push_back((idx, child_state));
                }
            }
        }
    }
}

fn create_key_counter(ctx: &KeyContext, key_layout: &KeyLayout, state: &ExplorationState) -> KeyCounter {
    let world = ctx.world;
    let mut locked = state.small_doors.clone();
    locked.extend(state.big_doors.iter().cloned());
    let mut key_counter = KeyCounter {
        child_doors: unique_doors(&locked),
        ..KeyCounter::default()
    };
    for &loc in &state.found_locations {
        let location = &world.locations[loc];
        if ctx.important_location(loc) {
            key_counter.important_location = true;
            key_counter.other_locations.insert(loc);
        } else if location.is_key_drop() {
            key_counter.key_only_locations.insert(loc);
        } else if !location.is_event() {
            key_counter.free_locations.insert(loc);
        } else {
            key_counter.other_locations.insert(loc);
        }
    }
    key_counter.open_doors = state.opened_doors.iter().copied().collect();
    key_counter.used_keys = count_unique_sm_doors(world, &state.opened_doors) as KeyCount;
    key_counter.big_key_opened = match key_layout.big_key_special {
        Some(special) => state.visited(special),
        None => state.big_key_opened,
    };
    key_counter
}

fn create_odd_key_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    door: DoorIdx,
    parent_counter: CounterIdx,
) -> GenResult<KeyCounter> {
    let next_counter = key_layout.counter(find_next_counter(ctx, key_layout, door, parent_counter)?);
    let parent = key_layout.counter(parent_counter);
    let mut odd_counter = KeyCounter {
        free_locations: next_counter
            .free_locations
            .difference(&parent.free_locations)
            .copied()
            .collect(),
        key_only_locations: next_counter
            .key_only_locations
            .difference(&parent.key_only_locations)
            .copied()
            .collect(),
        child_doors: next_counter
            .child_doors
            .iter()
            .copied()
            .filter(|d| !parent.child_doors.contains(d))
            .collect(),
        other_locations: next_counter
            .other_locations
            .difference(&parent.other_locations)
            .copied()
            .collect(),
        ..KeyCounter::default()
    };
    odd_counter.important_location = odd_counter
        .other_locations
        .iter()
        .any(|&loc| ctx.important_location(loc));
    Ok(odd_counter)
}

fn state_id(state: &ExplorationState, flat_proposal: &[DoorIdx]) -> String {
    let mut s_id = String::with_capacity(flat_proposal.len() + 1);
    s_id.push(if state.big_key_opened { '1' } else { '0' });
    for d in flat_proposal {
        s_id.push(if state.opened_doors.contains(d) { '1' } else { '0' });
    }
    s_id
}

/// Canonical id of a set of opened key doors plus the big key flag.
pub fn counter_id(opened_doors: &BTreeSet<DoorIdx>, bk_unlocked: bool, flat_proposal: &[DoorIdx]) -> String {
    let mut s_id = String::with_capacity(flat_proposal.len() + 1);
    s_id.push(if bk_unlocked { '1' } else { '0' });
    for d in flat_proposal {
        s_id.push(if opened_doors.contains(d) { '1' } else { '0' });
    }
    s_id
}

fn find_counter_hint(key_layout: &KeyLayout, opened_doors: &BTreeSet<DoorIdx>, bk_hint: bool) -> Option<CounterIdx> {
    let id = counter_id(opened_doors, bk_hint, &key_layout.proposal);
    if let Some(&c) = key_layout.counter_ids.get(&id) {
        return Some(c);
    }
    if !bk_hint {
        let id = counter_id(opened_doors, true, &key_layout.proposal);
        return key_layout.counter_ids.get(&id).copied();
    }
    None
}

fn find_counter(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    opened_doors: &BTreeSet<DoorIdx>,
    bk_hint: bool,
) -> Option<CounterIdx> {
    if let Some(c) = find_counter_hint(key_layout, opened_doors, bk_hint) {
        return Some(c);
    }
    let mut more_doors = opened_doors.clone();
    for &door in opened_doors {
        more_doors.extend(ctx.dest(door));
    }
    if more_doors.len() > opened_doors.len() {
        return find_counter_hint(key_layout, &more_doors, bk_hint);
    }
    None
}

fn find_counter_checked(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    opened_doors: &BTreeSet<DoorIdx>,
    bk_hint: bool,
) -> GenResult<CounterIdx> {
    find_counter(ctx, key_layout, opened_doors, bk_hint).ok_or_else(|| {
        GenerationError::logic(
            &key_layout.dungeon,
            counter_id(opened_doors, bk_hint, &key_layout.proposal),
            "unable to find door permutation",
        )
    })
}

/// The state with every key door (and, if needed, the big key door) opened.
fn find_max_counter(key_layout: &KeyLayout) -> GenResult<CounterIdx> {
    let all_doors: BTreeSet<DoorIdx> = key_layout.proposal.iter().copied().collect();
    let max_counter = find_counter_hint(key_layout, &all_doors, false);
    let max_counter = match max_counter {
        Some(c) if !key_layout.counter(c).child_doors.is_empty() => {
            find_counter_hint(key_layout, &all_doors, true).or(Some(c))
        }
        other => other,
    };
    max_counter.ok_or_else(|| {
        GenerationError::logic(
            &key_layout.dungeon,
            counter_id(&all_doors, false, &key_layout.proposal),
            "no state with every key door opened",
        )
    })
}

/// Check an actual item placement for key locks: every reachable state must be able to open a
/// further door, unless nothing of value is left behind the locked doors.
pub fn validate_key_placement(
    ctx: &KeyContext,
    key_layout: &KeyLayout,
    view: &impl ItemPlacementView,
) -> GenResult<bool> {
    let settings = ctx.settings;
    if settings.retro || settings.accessibility == Accessibility::None {
        return Ok(true);
    }
    let dungeon = key_layout.dungeon.as_str();
    let is_small_key = |loc: LocationIdx| matches!(view.item_at(loc), PlacedItem::SmallKey { dungeon: d } if d == dungeon);
    let is_big_key = |loc: LocationIdx| matches!(view.item_at(loc), PlacedItem::BigKey { dungeon: d } if d == dungeon);
    let max_counter = key_layout.counter(find_max_counter(key_layout)?);
    let mut keys_outside = 0;
    if settings.key_shuffle {
        keys_outside = key_layout.max_chests
            - max_counter
                .free_locations
                .iter()
                .filter(|&&l| is_small_key(l))
                .count() as KeyCount;
    }
    let big_key_outside =
        settings.big_key_shuffle && !max_counter.free_locations.iter().any(|&l| is_big_key(l));

    for (idx, counter) in key_layout.key_counters.iter().enumerate() {
        if counter.child_doors.is_empty() {
            continue;
        }
        let big_found = big_key_outside
            || counter
                .free_locations
                .iter()
                .any(|&l| !ctx.is_big_chest(l) && is_big_key(l));
        if counter.big_key_opened && !big_found {
            // Unreachable state
            continue;
        }
        let found_locations: LocationSet = counter
            .free_locations
            .iter()
            .copied()
            .filter(|&l| big_found || !ctx.is_big_chest(l))
            .collect();
        let found_keys = found_locations.iter().filter(|&&l| is_small_key(l)).count() as KeyCount
            + counter.key_only_locations.len() as KeyCount
            + keys_outside;
        let can_progress = (!counter.big_key_opened
            && big_found
            && counter.child_doors.iter().any(|&d| ctx.is_big(d)))
            || (found_keys > counter.used_keys && counter.child_doors.iter().any(|&d| !ctx.is_big(d)));
        if !can_progress {
            let missing_locations: Vec<LocationIdx> = max_counter
                .free_locations
                .difference(&found_locations)
                .copied()
                .collect();
            let missing_items = missing_locations
                .iter()
                .any(|&l| !is_small_key(l) && !is_big_key(l));
            if missing_items {
                error!("Keylock in {} - can't open locations:", dungeon);
                error!("code: {}", key_layout.cid(idx));
                for &loc in &missing_locations {
                    error!("{}", ctx.world.location_name(loc));
                }
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_id() {
        let opened = BTreeSet::from([3, 9]);
        assert_eq!(counter_id(&opened, false, &[3, 5, 9]), "0101");
        assert_eq!(counter_id(&BTreeSet::new(), true, &[3, 5, 9]), "1000");
    }

    #[test]
    fn test_rule_satisfied_thresholds() {
        let mut rule = DoorRules::new(2, true);
        let none = LocationSet::new();
        assert!(rule_satisfied(&rule, 2, 2, &none, 1, 3));
        assert!(!rule_satisfied(&rule, 1, 1, &none, 1, 3));
        rule.allow_small = true;
        assert!(rule_satisfied(&rule, 1, 1, &none, 1, 3));
        rule.allow_small = false;
        rule.alternate_small_key = Some(1);
        rule.alternate_big_key_loc = LocationSet::from([4]);
        assert!(rule_satisfied(&rule, 1, 1, &LocationSet::from([4]), 1, 3));
        assert!(!rule_satisfied(&rule, 1, 1, &LocationSet::from([4, 5]), 1, 3));
    }

    #[test]
    fn test_reduce_rules_lowers_smallest() {
        let mut logic = KeyLogic::new("D");
        logic.door_rules.insert(1, DoorRules::new(3, true));
        logic.door_rules.insert(2, DoorRules::new(4, true));
        reduce_rules(&mut logic, &[1, 2], 2, 2);
        assert_eq!(logic.door_rules[&1].small_key_num, 2);
        assert_eq!(logic.door_rules[&2].small_key_num, 4);
    }

    #[test]
    fn test_used_smalls_loc() {
        let counter = KeyCounter {
            used_keys: 2,
            key_only_locations: LocationSet::from([1]),
            ..KeyCounter::default()
        };
        assert_eq!(counter.used_smalls_loc(0), 1);
        assert_eq!(counter.used_smalls_loc(1), 2);
    }
}
