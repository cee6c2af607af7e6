use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use doorrando_game::hook::{Hook, hanger_from_door, hook_from_door};
use doorrando_game::sector::Sector;
use doorrando_game::{CrystalBarrier, DoorIdx, RegionIdx, World};
use log::{debug, info};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::balance::DungeonBuilder;
use crate::error::{GenResult, GenerationError};
use crate::settings::{GameMode, RandomizerSettings};
use crate::traverse::{
    ExplorationState, GraphPiece, ProposedMap, create_graph_piece_from_state,
    extend_reachable_state_improved,
};

#[derive(Clone, Debug)]
struct HookInfo {
    door: DoorIdx,
    // The hanger whose exploration found this hook; None for the entrances
    orig_hanger: Option<DoorIdx>,
}

/// Graph pieces of the entrances (keyed `None`) and of every open hanger, with the hangers and
/// hooks catalogued by type.
#[derive(Clone, Debug, Default)]
struct DungeonInfo {
    pieces: BTreeMap<Option<DoorIdx>, GraphPiece>,
    hangers: BTreeMap<Hook, Vec<DoorIdx>>,
    hooks: BTreeMap<Hook, Vec<HookInfo>>,
}

impl DungeonInfo {
    fn origin(&self) -> Option<&GraphPiece> {
        self.pieces.get(&None)
    }

    fn num_hangers(&self, hook: Hook) -> usize {
        self.hangers.get(&hook).map_or(0, |h| h.len())
    }

    fn num_hooks(&self, hook: Hook) -> usize {
        self.hooks.get(&hook).map_or(0, |h| h.len())
    }
}

/// Fixed inputs of one dungeon's topology search.
struct SearchContext<'a> {
    world: &'a World,
    name: &'a str,
    entrance_regions: Vec<RegionIdx>,
    sectors: &'a [Sector],
    doors_to_connect: BTreeSet<DoorIdx>,
    all_regions: BTreeSet<RegionIdx>,
    bk_needed: bool,
    bk_special: Option<RegionIdx>,
    escort: Option<(RegionIdx, RegionIdx)>,
}

impl<'a> SearchContext<'a> {
    fn new(
        world: &'a World,
        builder: &'a DungeonBuilder,
        split_dungeon: bool,
        settings: &RandomizerSettings,
    ) -> SearchContext<'a> {
        let mut doors_to_connect = BTreeSet::new();
        let mut all_regions = BTreeSet::new();
        let mut bk_needed = false;
        let mut bk_special = None;
        for sector in &builder.sectors {
            doors_to_connect.extend(sector.outstanding_doors.iter().copied());
            all_regions.extend(sector.regions.iter().copied());
            bk_needed = bk_needed || determine_if_bk_needed(world, sector, split_dungeon);
            bk_special = bk_special.or_else(|| check_for_special(world, sector));
        }
        let escort = if settings.mode == GameMode::Standard {
            find_escort_route(world, &all_regions)
        } else {
            None
        };
        SearchContext {
            world,
            name: &builder.name,
            entrance_regions: builder.all_entrances.clone(),
            sectors: &builder.sectors,
            doors_to_connect,
            all_regions,
            bk_needed,
            bk_special,
            escort,
        }
    }
}

fn determine_if_bk_needed(world: &World, sector: &Sector, split_dungeon: bool) -> bool {
    if split_dungeon {
        return false;
    }
    sector
        .regions
        .iter()
        .any(|&r| world.regions[r].exits.iter().any(|&d| world.doors[d].big_key))
}

/// The region standing in for "big key found" if the sector contains one.
fn check_for_special(world: &World, sector: &Sector) -> Option<RegionIdx> {
    world
        .dungeons
        .iter()
        .filter_map(|d| d.big_key_cell.as_deref())
        .filter_map(|name| world.region_idx_by_name.get(name).copied())
        .find(|&r| sector.contains_region(r))
}

fn find_escort_route(world: &World, all_regions: &BTreeSet<RegionIdx>) -> Option<(RegionIdx, RegionIdx)> {
    world.dungeons.iter().find_map(|d| {
        let escort = d.escort.as_ref()?;
        let from = *world.region_idx_by_name.get(&escort.from)?;
        let to = *world.region_idx_by_name.get(&escort.to)?;
        all_regions.contains(&from).then_some((from, to))
    })
}

fn check_for_stonewall(builder: &DungeonBuilder, world: &World) -> Option<DoorIdx> {
    builder
        .sectors
        .iter()
        .flat_map(|s| s.outstanding_doors.iter().copied())
        .find(|&d| world.doors[d].stonewall)
}

/// Pair up every outstanding door of the builder's sectors, connect them in the world and fold
/// the sectors into the builder's master sector. Returns the connections as (hanger, hook).
pub fn generate_dungeon<R: Rng>(
    world: &mut World,
    builder: &mut DungeonBuilder,
    split_dungeon: bool,
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<Vec<(DoorIdx, DoorIdx)>> {
    info!("Generating dungeon {}", builder.name);
    let stonewall = check_for_stonewall(builder, world);
    let connections = {
        let ctx = SearchContext::new(world, builder, split_dungeon, settings);
        search_connections(&ctx, settings, rng)?
    };
    for &(hanger, hook) in connections.iter().rev() {
        world.connect_doors(hook, hanger);
    }
    let mut available_sectors = builder.sectors.clone();
    if let Some(mut master_sector) = available_sectors.pop() {
        master_sector.absorb(world, available_sectors);
        builder.master_sector = Some(master_sector);
    }
    if let Some(stonewall) = stonewall {
        if !stonewall_valid(world, stonewall) {
            info!(
                "{}: pre-opening stonewall {}",
                builder.name,
                world.door_name(stonewall)
            );
            builder.pre_open_stonewall = Some(stonewall);
        }
    }
    Ok(connections)
}

/// Backtracking search over hanger/hook pairings. The choice stack holds, per depth, every
/// pairing tried so far; the last one is the live pairing. Undoing a level truncates the stack
/// and the per-depth info cache.
fn search_connections<R: Rng>(
    ctx: &SearchContext,
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<Vec<(DoorIdx, DoorIdx)>> {
    let mut proposed_map: ProposedMap = BTreeMap::new();
    let mut choices_master: Vec<Vec<(DoorIdx, DoorIdx)>> = vec![vec![]];
    let mut dungeon_cache: Vec<DungeonInfo> = vec![];
    let mut depth: usize = 0;
    let mut itr = 0;
    loop {
        itr += 1;
        if itr > settings.max_search_iterations {
            return Err(GenerationError::structural(
                ctx.name,
                format!("search exceeded {} iterations", settings.max_search_iterations),
            ));
        }
        let valid = if dungeon_cache.len() <= depth {
            let info = gen_dungeon_info(ctx, &proposed_map);
            let valid = check_valid(ctx, &info, &proposed_map);
            dungeon_cache.push(info);
            valid
        } else {
            true
        };
        let mut backtrack = !valid;
        if valid {
            if proposed_map.len() == ctx.doors_to_connect.len() {
                break;
            }
            match make_a_choice(ctx.world, &dungeon_cache[depth], &choices_master[depth], rng) {
                None => backtrack = true,
                Some((hanger, hook)) => {
                    debug!(
                        "{}{}: Linking {} to {}",
                        " ".repeat(depth),
                        depth,
                        ctx.world.door_name(hanger),
                        ctx.world.door_name(hook)
                    );
                    proposed_map.insert(hanger, hook);
                    proposed_map.insert(hook, hanger);
                    choices_master[depth].push((hanger, hook));
                    depth += 1;
                    choices_master.push(vec![]);
                }
            }
        }
        if backtrack {
            choices_master.pop();
            dungeon_cache.truncate(depth);
            if depth == 0 {
                return Err(GenerationError::structural(
                    ctx.name,
                    "backtracking exhausted every choice",
                ));
            }
            depth -= 1;
            if let Some(&(a, b)) = choices_master[depth].last() {
                debug!(
                    "{}{}: Rescinding {}, {}",
                    " ".repeat(depth),
                    depth,
                    ctx.world.door_name(a),
                    ctx.world.door_name(b)
                );
                proposed_map.remove(&a);
                proposed_map.remove(&b);
            }
        }
    }
    Ok(choices_master
        .iter()
        .filter_map(|choices| choices.last().copied())
        .collect())
}

fn gen_dungeon_info(ctx: &SearchContext, proposed_map: &ProposedMap) -> DungeonInfo {
    let world = ctx.world;
    let mut info = DungeonInfo::default();
    let mut start = ExplorationState::new(CrystalBarrier::Orange, ctx.name);
    start.big_key_special = ctx.bk_special;
    let original_state = extend_reachable_state_improved(
        world,
        &ctx.entrance_regions,
        &start,
        proposed_map,
        &ctx.doors_to_connect,
        ctx.bk_needed,
    );
    let origin = create_graph_piece_from_state(world, None, &original_state, &original_state, proposed_map);
    let either_crystal = origin.hooks.values().all(|&c| c == CrystalBarrier::Either);
    let init_crystal = if either_crystal {
        CrystalBarrier::Either
    } else {
        CrystalBarrier::Orange
    };
    info.pieces.insert(None, origin);

    let mut hanger_set: BTreeSet<DoorIdx> = BTreeSet::new();
    let mut o_state_cache: BTreeMap<DoorIdx, ExplorationState> = BTreeMap::new();
    for sector in ctx.sectors {
        for &door in &sector.outstanding_doors {
            if world.doors[door].stonewall || proposed_map.contains_key(&door) {
                continue;
            }
            hanger_set.insert(door);
            let parent = world.doors[door].region;
            let crystal_start = if world.regions[parent].crystal_switch {
                CrystalBarrier::Either
            } else {
                init_crystal
            };
            let mut init_state = ExplorationState::new(crystal_start, ctx.name);
            init_state.big_key_special = ctx.bk_special;
            let o_state = extend_reachable_state_improved(
                world,
                &[parent],
                &init_state,
                proposed_map,
                &ctx.doors_to_connect,
                false,
            );
            let piece = create_graph_piece_from_state(world, Some(door), &o_state, &o_state, proposed_map);
            o_state_cache.insert(door, o_state);
            info.pieces.insert(Some(door), piece);
        }
    }
    check_blue_states(ctx, &hanger_set, &mut info, &o_state_cache, proposed_map);

    for piece in info.pieces.values() {
        let door_hang = piece.hanger_info;
        if let Some(hanger) = door_hang.and_then(|d| hanger_from_door(world.doors[d].kind)) {
            info.hangers.entry(hanger).or_default().extend(door_hang);
        }
        for &door in piece.hooks.keys() {
            if let Some(hook) = hook_from_door(world.doors[door].kind) {
                info.hooks.entry(hook).or_default().push(HookInfo {
                    door,
                    orig_hanger: door_hang,
                });
            }
        }
    }
    winnow_hangers(&mut info);
    info
}

/// Re-explore hangers in blue once any hook or hanger of a compatible type is known to be
/// reachable in blue, until nothing new turns blue.
fn check_blue_states(
    ctx: &SearchContext,
    hanger_set: &BTreeSet<DoorIdx>,
    info: &mut DungeonInfo,
    o_state_cache: &BTreeMap<DoorIdx, ExplorationState>,
    proposed_map: &ProposedMap,
) {
    let world = ctx.world;
    let mut not_blue = hanger_set.clone();
    let mut doors_to_check = hanger_set.clone();
    let mut blue_hooks: Vec<Hook> = vec![];
    let mut blue_hangers: Vec<Hook> = vec![];
    let mut new_blues = true;
    while new_blues {
        new_blues = false;
        for door in &doors_to_check {
            let Some(piece) = info.pieces.get(&Some(*door)) else {
                continue;
            };
            for (&hook, &crystal) in &piece.hooks {
                if crystal != CrystalBarrier::Orange {
                    if let Some(h_type) = hook_from_door(world.doors[hook].kind) {
                        if !blue_hooks.contains(&h_type) {
                            new_blues = true;
                            blue_hooks.push(h_type);
                        }
                    }
                }
            }
            if piece.hanger_crystal == Some(CrystalBarrier::Either) {
                let h_type = piece
                    .hanger_info
                    .and_then(|d| hanger_from_door(world.doors[d].kind));
                if let Some(h_type) = h_type {
                    if !blue_hangers.contains(&h_type) {
                        new_blues = true;
                        blue_hangers.push(h_type);
                    }
                }
            }
        }
        doors_to_check = BTreeSet::new();
        for &door in &not_blue {
            let d = &world.doors[door];
            let hangable = hanger_from_door(d.kind).is_some_and(|h| blue_hooks.contains(&h));
            let hookable = hook_from_door(d.kind).is_some_and(|h| blue_hangers.contains(&h));
            if (hangable && !d.stonewall) || hookable {
                if let Some(o_state) = o_state_cache.get(&door) {
                    explore_blue_state(ctx, door, info, o_state, proposed_map);
                }
                doors_to_check.insert(door);
            }
        }
        not_blue.retain(|d| !doors_to_check.contains(d));
    }
}

fn explore_blue_state(
    ctx: &SearchContext,
    door: DoorIdx,
    info: &mut DungeonInfo,
    o_state: &ExplorationState,
    proposed_map: &ProposedMap,
) {
    let world = ctx.world;
    let parent = world.doors[door].region;
    let mut blue_start = ExplorationState::new(CrystalBarrier::Blue, &o_state.dungeon);
    blue_start.big_key_special = o_state.big_key_special;
    let b_state = extend_reachable_state_improved(
        world,
        &[parent],
        &blue_start,
        proposed_map,
        &ctx.doors_to_connect,
        false,
    );
    let piece = create_graph_piece_from_state(world, Some(door), o_state, &b_state, proposed_map);
    info.pieces.insert(Some(door), piece);
}

/// Pick the next hanger (hangers that are not hooks first, then those not reachable from the
/// entrances) and a random compatible hook not tried at this depth.
fn make_a_choice<R: Rng>(
    world: &World,
    info: &DungeonInfo,
    prev_choices: &[(DoorIdx, DoorIdx)],
    rng: &mut R,
) -> Option<(DoorIdx, DoorIdx)> {
    let origin = info.origin()?;
    let all_hooks: BTreeSet<DoorIdx> = info
        .hooks
        .values()
        .flat_map(|v| v.iter().map(|h| h.door))
        .collect();
    let mut candidate_hangers: Vec<DoorIdx> = info.hangers.values().flatten().copied().collect();
    candidate_hangers.sort_by(|&a, &b| world.door_name(a).cmp(world.door_name(b)));
    candidate_hangers.shuffle(rng);

    let mut stage_2_hangers: Vec<DoorIdx> = vec![];
    if let Some(&(prev_hanger, _)) = prev_choices.first() {
        if let Some(pos) = candidate_hangers.iter().position(|&d| d == prev_hanger) {
            stage_2_hangers.push(prev_hanger);
            candidate_hangers.remove(pos);
        }
    }
    let mut hookable_hangers: Vec<DoorIdx> = vec![];
    while let Some(c_hang) = candidate_hangers.pop() {
        if all_hooks.contains(&c_hang) {
            hookable_hangers.push(c_hang);
        } else {
            stage_2_hangers.push(c_hang);
        }
    }
    hookable_hangers.sort_by_key(|&d| {
        Reverse(
            hanger_from_door(world.doors[d].kind).map_or(0, |h| info.num_hangers(h)),
        )
    });
    let mut origin_hangers = vec![];
    while let Some(c_hang) = hookable_hangers.pop() {
        if origin.hooks.contains_key(&c_hang) {
            origin_hangers.push(c_hang);
        } else {
            stage_2_hangers.push(c_hang);
        }
    }
    stage_2_hangers.extend(origin_hangers);

    let next_hanger = *stage_2_hangers.first()?;
    let next_hanger_type = hanger_from_door(world.doors[next_hanger].kind)?;
    let mut hook_candidates: Vec<DoorIdx> = vec![];
    for h in info.hooks.get(&next_hanger_type).into_iter().flatten() {
        if filter_choices(next_hanger, h.door, h.orig_hanger, prev_choices, &hook_candidates) {
            hook_candidates.push(h.door);
        }
    }
    hook_candidates.sort_by(|&a, &b| world.door_name(a).cmp(world.door_name(b)));
    let hook = *hook_candidates.choose(rng)?;
    Some((next_hanger, hook))
}

fn filter_choices(
    next_hanger: DoorIdx,
    door: DoorIdx,
    orig_hang: Option<DoorIdx>,
    prev_choices: &[(DoorIdx, DoorIdx)],
    hook_candidates: &[DoorIdx],
) -> bool {
    if prev_choices.contains(&(next_hanger, door)) || prev_choices.contains(&(door, next_hanger)) {
        return false;
    }
    next_hanger != door && orig_hang != Some(next_hanger) && !hook_candidates.contains(&door)
}

/// Feasibility of the current tentative pairings.
fn check_valid(ctx: &SearchContext, info: &DungeonInfo, proposed_map: &ProposedMap) -> bool {
    let world = ctx.world;
    let all_proposed = proposed_map.len() >= ctx.doors_to_connect.len();
    // Only the entrances are left but not everything is connected:
    if info.pieces.len() <= 1 && !all_proposed {
        return false;
    }
    let Some(origin) = info.origin() else {
        return false;
    };
    let possible_bks = origin.possible_bk_locations.len();
    let true_origin_hooks = origin
        .hooks
        .keys()
        .filter(|&&d| !world.doors[d].big_key || possible_bks > 0 || !ctx.bk_needed)
        .count();
    if true_origin_hooks == 0 && !all_proposed {
        return false;
    }
    if true_origin_hooks == 0 && ctx.bk_needed && possible_bks == 0 && all_proposed {
        return false;
    }
    for (&key, hangers) in &info.hangers {
        if info.num_hooks(key) > 0 && hangers.is_empty() {
            return false;
        }
    }
    let all_hooks: BTreeSet<DoorIdx> = info
        .hooks
        .values()
        .flat_map(|v| v.iter().map(|h| h.door))
        .collect();
    for (&key, hangers) in &info.hangers {
        let must_hang = hangers.iter().filter(|d| !all_hooks.contains(d)).count();
        if must_hang > info.num_hooks(key) {
            return false;
        }
    }
    let mut outstanding_doors: BTreeMap<Hook, usize> = BTreeMap::new();
    for &d in &ctx.doors_to_connect {
        if !proposed_map.contains_key(&d) {
            if let Some(h) = hook_from_door(world.doors[d].kind) {
                *outstanding_doors.entry(h).or_default() += 1;
            }
        }
    }
    for (&key, &count) in &outstanding_doors {
        if count > 0 && info.num_hangers(key) == 0 && info.num_hooks(key.opposite()) == 0 {
            return false;
        }
    }
    let mut all_visited: BTreeSet<RegionIdx> = BTreeSet::new();
    let mut bk_possible = !ctx.bk_needed;
    for piece in info.pieces.values() {
        all_visited.extend(piece.visited_regions.iter().copied());
        if !piece.possible_bk_locations.is_empty() {
            bk_possible = true;
        }
    }
    if !ctx.all_regions.is_subset(&all_visited) {
        return false;
    }
    if !bk_possible {
        return false;
    }
    if let Some((from, to)) = ctx.escort {
        if !escort_valid(ctx, from, to, proposed_map) {
            return false;
        }
    }

    // Every hanger must be attachable, transitively, starting from the entrance hooks:
    let mut origin_hooks: BTreeSet<DoorIdx> = origin.hooks.keys().copied().collect();
    let mut accessible_hook_types: Vec<Hook> = vec![];
    for &door_hook in &origin_hooks {
        if let Some(h_type) = hook_from_door(world.doors[door_hook].kind) {
            if !accessible_hook_types.contains(&h_type) {
                accessible_hook_types.push(h_type);
            }
        }
    }
    let mut hanger_matching: BTreeSet<DoorIdx> = BTreeSet::new();
    let mut all_hangers: BTreeSet<DoorIdx> = BTreeSet::new();
    let mut new_hangers_found = true;
    while new_hangers_found {
        new_hangers_found = false;
        for hanger_list in info.hangers.values() {
            for &hanger in hanger_list {
                all_hangers.insert(hanger);
                let h_type = hanger_from_door(world.doors[hanger].kind);
                let reachable = h_type.is_some_and(|h| accessible_hook_types.contains(&h))
                    || origin_hooks.contains(&hanger);
                if reachable && hanger_matching.insert(hanger) {
                    new_hangers_found = true;
                    if let Some(piece) = info.pieces.get(&Some(hanger)) {
                        for &door_hook in piece.hooks.keys() {
                            origin_hooks.insert(door_hook);
                            if let Some(new_h_type) = hook_from_door(world.doors[door_hook].kind) {
                                if !accessible_hook_types.contains(&new_h_type) {
                                    accessible_hook_types.push(new_h_type);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    all_hangers.is_subset(&hanger_matching)
}

/// The escort destination must stay reachable from its start, or an unpaired door on the way
/// must still be able to provide the link.
fn escort_valid(ctx: &SearchContext, from: RegionIdx, to: RegionIdx, proposed_map: &ProposedMap) -> bool {
    let world = ctx.world;
    let mut queue = VecDeque::from([from]);
    let mut visited = BTreeSet::from([from]);
    while let Some(region) = queue.pop_front() {
        if region == to {
            return true;
        }
        for &exit in &world.regions[region].exits {
            let door = &world.doors[exit];
            match door.connected {
                None if ctx.doors_to_connect.contains(&exit) => {
                    if !door.blocked {
                        match proposed_map.get(&exit) {
                            Some(&partner) => {
                                let new_region = world.doors[partner].region;
                                if visited.insert(new_region) {
                                    queue.push_back(new_region);
                                }
                            }
                            None => return true,
                        }
                    }
                }
                Some(connect) => {
                    if !door.blocked && visited.insert(connect) {
                        queue.push_back(connect);
                    }
                }
                None => {}
            }
        }
    }
    false
}

/// Drop hangers whose only compatible hooks were found by exploring from that same hanger.
fn winnow_hangers(info: &mut DungeonInfo) {
    let mut removal_info: Vec<(Hook, DoorIdx)> = vec![];
    for (&hanger, door_set) in &info.hangers {
        for &door in door_set {
            let found_valid = info
                .hooks
                .get(&hanger)
                .is_some_and(|hook_set| hook_set.iter().any(|h| h.orig_hanger != Some(door)));
            if !found_valid {
                removal_info.push((hanger, door));
            }
        }
    }
    for (hanger, door) in removal_info {
        if let Some(list) = info.hangers.get_mut(&hanger) {
            list.retain(|&d| d != door);
        }
    }
}

/// False if walking backwards from the far side of the stonewall can reach the stonewall's own
/// region or the outside, meaning a player could get stuck behind it.
fn stonewall_valid(world: &World, stonewall: DoorIdx) -> bool {
    let Some(bad_door) = world.doors[stonewall].dest else {
        return true;
    };
    if world.doors[bad_door].blocked {
        return true;
    }
    let loop_region = world.doors[stonewall].region;
    let mut start_regions = vec![world.doors[bad_door].region];
    for &dep in &world.doors[bad_door].dependents {
        start_regions.push(world.doors[dep].region);
    }
    let mut visited: BTreeSet<RegionIdx> = start_regions.iter().copied().collect();
    let mut queue: VecDeque<RegionIdx> = start_regions.into_iter().collect();
    while let Some(region) = queue.pop_front() {
        if region == loop_region {
            return false;
        }
        for &entrance in &world.regions[region].entrances {
            let parent = world.doors[entrance].region;
            if !world.is_dungeon_region(parent) {
                return false;
            }
            if entrance != stonewall && !world.doors[entrance].blocked && visited.insert(parent) {
                queue.push_back(parent);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_choices() {
        let prev = [(1, 2)];
        assert!(!filter_choices(1, 2, None, &prev, &[]));
        assert!(!filter_choices(2, 1, None, &prev, &[]));
        assert!(!filter_choices(3, 3, None, &prev, &[]));
        assert!(!filter_choices(3, 4, Some(3), &prev, &[]));
        assert!(!filter_choices(3, 4, None, &prev, &[4]));
        assert!(filter_choices(3, 4, Some(5), &prev, &[]));
    }

    #[test]
    fn test_winnow_self_only_hanger() {
        let mut info = DungeonInfo::default();
        info.hangers.insert(Hook::North, vec![7, 8]);
        info.hooks.insert(
            Hook::North,
            vec![HookInfo {
                door: 9,
                orig_hanger: Some(7),
            }],
        );
        winnow_hangers(&mut info);
        assert_eq!(info.hangers[&Hook::North], vec![8]);
    }
}
