use std::collections::{BTreeMap, BTreeSet};

use doorrando_game::{CrystalBarrier, DoorIdx, LocationIdx, RegionIdx, World};
use log::warn;

// Tentative hanger/hook pairings, stored in both directions
pub type ProposedMap = BTreeMap<DoorIdx, DoorIdx>;

#[derive(Clone, Debug, PartialEq)]
pub struct ExplorableDoor {
    pub door: DoorIdx,
    pub crystal: CrystalBarrier,
    // Reached only through a big key door
    pub flag: bool,
}

#[derive(Clone, Debug)]
pub struct ExplorationState {
    pub unattached_doors: Vec<ExplorableDoor>,
    pub avail_doors: Vec<ExplorableDoor>,
    pub event_doors: Vec<ExplorableDoor>,

    pub visited_orange: BTreeSet<RegionIdx>,
    pub visited_blue: BTreeSet<RegionIdx>,
    pub events: BTreeSet<LocationIdx>,
    pub crystal: CrystalBarrier,

    pub small_doors: Vec<ExplorableDoor>,
    pub big_doors: Vec<ExplorableDoor>,
    pub opened_doors: Vec<DoorIdx>,
    pub big_key_opened: bool,
    // Region that, once visited, means the big key has been found
    pub big_key_special: Option<RegionIdx>,

    pub found_locations: BTreeSet<LocationIdx>,
    pub ttl_locations: i32,
    pub key_locations: i32,
    pub used_locations: i32,
    pub used_smalls: i32,
    // Locations found without passing a big key door
    pub bk_found: BTreeSet<LocationIdx>,

    pub dungeon: String,
}

impl ExplorationState {
    pub fn new(init_crystal: CrystalBarrier, dungeon: &str) -> ExplorationState {
        ExplorationState {
            unattached_doors: vec![],
            avail_doors: vec![],
            event_doors: vec![],
            visited_orange: BTreeSet::new(),
            visited_blue: BTreeSet::new(),
            events: BTreeSet::new(),
            crystal: init_crystal,
            small_doors: vec![],
            big_doors: vec![],
            opened_doors: vec![],
            big_key_opened: false,
            big_key_special: None,
            found_locations: BTreeSet::new(),
            ttl_locations: 0,
            key_locations: 0,
            used_locations: 0,
            used_smalls: 0,
            bk_found: BTreeSet::new(),
            dungeon: dungeon.to_string(),
        }
    }

    /// Take the next door to explore, preferring (from the back) normal doors, then big key
    /// doors, then doors reached through a big key door.
    pub fn next_avail_door(&mut self, world: &World) -> Option<ExplorableDoor> {
        self.avail_doors.sort_by_key(|x| {
            if x.flag {
                0
            } else if world.doors[x.door].big_key {
                1
            } else {
                2
            }
        });
        let exp_door = self.avail_doors.pop()?;
        self.crystal = exp_door.crystal;
        Some(exp_door)
    }

    pub fn visit_region(&mut self, world: &World, region: RegionIdx, key_checks: bool, bk_flag: bool) {
        // A crystal switch can be hit to either color, so everything past it is open both ways
        if world.regions[region].crystal_switch {
            self.crystal = CrystalBarrier::Either;
        }
        match self.crystal {
            CrystalBarrier::Either => {
                self.visited_blue.insert(region);
                self.visited_orange.insert(region);
            }
            CrystalBarrier::Orange => {
                self.visited_orange.insert(region);
            }
            CrystalBarrier::Blue => {
                self.visited_blue.insert(region);
            }
            CrystalBarrier::Null => {}
        }
        if world.is_dungeon_region(region) {
            for &loc in &world.regions[region].locations {
                let location = &world.locations[loc];
                if key_checks && !self.found_locations.contains(&loc) {
                    if location.is_key_drop() {
                        self.key_locations += 1;
                    }
                    if location.is_item_slot() {
                        self.ttl_locations += 1;
                    }
                }
                if self.found_locations.insert(loc) && !bk_flag {
                    self.bk_found.insert(loc);
                }
                if location.is_event() && !self.events.contains(&loc) && self.flooded_key_check(world, loc)
                {
                    self.perform_event(world, loc);
                }
                for &event in &location.unlocks {
                    if self.found_locations.contains(&event) {
                        self.perform_event(world, event);
                    }
                }
            }
        }
        if key_checks && self.big_key_special == Some(region) && !self.big_key_opened {
            self.big_key_opened = true;
            self.avail_doors.append(&mut self.big_doors);
        }
    }

    fn flooded_key_check(&self, world: &World, loc: LocationIdx) -> bool {
        match world.locations[loc].requires {
            None => true,
            Some(req) => self.found_locations.contains(&req),
        }
    }

    pub fn perform_event(&mut self, world: &World, loc: LocationIdx) {
        self.events.insert(loc);
        let mut released = vec![];
        for exp_door in self.event_doors.iter().rev() {
            if world.doors[exp_door.door].req_event == Some(loc) {
                released.push(exp_door.clone());
            }
        }
        self.event_doors
            .retain(|d| world.doors[d.door].req_event != Some(loc));
        self.avail_doors.extend(released);
    }

    fn event_pending(&self, world: &World, door: DoorIdx) -> bool {
        world.doors[door]
            .req_event
            .is_some_and(|e| !self.events.contains(&e))
    }

    pub fn add_all_doors_check_proposed(
        &mut self,
        world: &World,
        region: RegionIdx,
        proposed_map: &ProposedMap,
        valid_doors: &BTreeSet<DoorIdx>,
        flag: bool,
    ) {
        for &exit in &world.regions[region].exits {
            if !self.can_traverse(world, exit) {
                continue;
            }
            let door = world.doors[exit].controller.unwrap_or(exit);
            if world.doors[door].dest.is_none()
                && !proposed_map.contains_key(&door)
                && valid_doors.contains(&door)
            {
                match self.unattached_doors.iter_mut().find(|d| d.door == door) {
                    None => self.append_door(world, door, ExplorationList::Unattached, flag),
                    Some(other) => {
                        if self.crystal != other.crystal {
                            other.crystal = CrystalBarrier::Either;
                        }
                    }
                }
            } else if self.event_pending(world, door) {
                if !self.in_door_list(door, &self.event_doors) {
                    self.append_door(world, door, ExplorationList::Event, flag);
                }
            } else if !self.in_door_list(door, &self.avail_doors) {
                self.append_door(world, door, ExplorationList::Avail, flag);
            }
        }
    }

    /// Sort reachable doors for key exploration: unopened small key doors, big key doors while
    /// the big key is unused, doors waiting on an event, and the rest.
    pub fn add_all_doors_check_keys(
        &mut self,
        world: &World,
        region: RegionIdx,
        key_door_proposal: &[DoorIdx],
    ) {
        for &exit in &world.regions[region].exits {
            if !self.can_traverse(world, exit) {
                continue;
            }
            let door = world.doors[exit].controller.unwrap_or(exit);
            if key_door_proposal.contains(&door) && !self.opened_doors.contains(&door) {
                if !self.in_door_list(door, &self.small_doors) {
                    self.append_door(world, door, ExplorationList::Small, false);
                }
            } else if world.doors[door].big_key && !self.big_key_opened {
                if !self.in_door_list(door, &self.big_doors) {
                    self.append_door(world, door, ExplorationList::Big, false);
                }
            } else if self.event_pending(world, door) {
                if !self.in_door_list(door, &self.event_doors) {
                    self.append_door(world, door, ExplorationList::Event, false);
                }
            } else if !self.in_door_list(door, &self.avail_doors) {
                self.append_door(world, door, ExplorationList::Avail, false);
            }
        }
    }

    pub fn visited(&self, region: RegionIdx) -> bool {
        match self.crystal {
            CrystalBarrier::Either => {
                self.visited_blue.contains(&region) && self.visited_orange.contains(&region)
            }
            CrystalBarrier::Orange => self.visited_orange.contains(&region),
            CrystalBarrier::Blue => self.visited_blue.contains(&region),
            CrystalBarrier::Null => false,
        }
    }

    pub fn visited_at_all(&self, region: RegionIdx) -> bool {
        self.visited_blue.contains(&region) || self.visited_orange.contains(&region)
    }

    pub fn can_traverse(&self, world: &World, door: DoorIdx) -> bool {
        let door = &world.doors[door];
        if door.blocked {
            return false;
        }
        match door.crystal {
            CrystalBarrier::Null | CrystalBarrier::Either => true,
            c => self.crystal == CrystalBarrier::Either || self.crystal == c,
        }
    }

    pub fn count_locations_exclude_specials(&self, world: &World) -> usize {
        self.found_locations
            .iter()
            .filter(|&&loc| world.locations[loc].is_potential_big_key())
            .count()
    }

    pub fn validate(&self, world: &World, door: DoorIdx, region: RegionIdx) -> bool {
        self.can_traverse(world, door)
            && !self.visited(region)
            && world.valid_region_to_explore(region, &self.dungeon)
    }

    pub fn in_door_list(&self, door: DoorIdx, door_list: &[ExplorableDoor]) -> bool {
        door_list
            .iter()
            .any(|d| d.door == door && d.crystal == self.crystal)
    }

    fn append_door(&mut self, world: &World, door: DoorIdx, list: ExplorationList, flag: bool) {
        let crystal = match world.doors[door].crystal {
            CrystalBarrier::Null => self.crystal,
            c => c,
        };
        let exp_door = ExplorableDoor {
            door,
            crystal,
            flag,
        };
        match list {
            ExplorationList::Unattached => self.unattached_doors.push(exp_door),
            ExplorationList::Avail => self.avail_doors.push(exp_door),
            ExplorationList::Event => self.event_doors.push(exp_door),
            ExplorationList::Small => self.small_doors.push(exp_door),
            ExplorationList::Big => self.big_doors.push(exp_door),
        }
    }
}

#[derive(Copy, Clone)]
enum ExplorationList {
    Unattached,
    Avail,
    Event,
    Small,
    Big,
}

/// Where a door currently leads, honoring tentative pairings.
pub fn door_target(world: &World, door: DoorIdx, proposed_map: &ProposedMap) -> Option<RegionIdx> {
    match proposed_map.get(&door) {
        Some(&partner) => Some(world.doors[partner].region),
        None => world.doors[door].connected,
    }
}

fn special_big_key_found(state: &ExplorationState) -> bool {
    state.big_key_special.is_some_and(|r| state.visited(r))
}

/// Explore outward from `search_regions`. With `is_origin`, big key doors stay shut until the
/// big key could have been found.
pub fn extend_reachable_state_improved(
    world: &World,
    search_regions: &[RegionIdx],
    state: &ExplorationState,
    proposed_map: &ProposedMap,
    valid_doors: &BTreeSet<DoorIdx>,
    is_origin: bool,
) -> ExplorationState {
    let mut local_state = state.clone();
    for &region in search_regions {
        local_state.visit_region(world, region, false, false);
        local_state.add_all_doors_check_proposed(world, region, proposed_map, valid_doors, false);
    }
    while let Some(explorable_door) = local_state.next_avail_door(world) {
        let door = &world.doors[explorable_door.door];
        if door.big_key && is_origin {
            let big_not_found = if local_state.big_key_special.is_some() {
                !special_big_key_found(&local_state)
            } else {
                local_state.count_locations_exclude_specials(world) == 0
            };
            if big_not_found {
                continue;
            }
        }
        let Some(connect_region) = door_target(world, explorable_door.door, proposed_map) else {
            continue;
        };
        if world.valid_region_to_explore(connect_region, &local_state.dungeon)
            && !local_state.visited(connect_region)
        {
            let flag = explorable_door.flag || door.big_key;
            local_state.visit_region(world, connect_region, false, flag);
            local_state.add_all_doors_check_proposed(
                world,
                connect_region,
                proposed_map,
                valid_doors,
                flag,
            );
        }
    }
    local_state
}

/// Reachability summary of one hanger door (or of the dungeon entrances when `hanger_info` is
/// None) under the current tentative pairings.
#[derive(Clone, Debug, Default)]
pub struct GraphPiece {
    pub hanger_info: Option<DoorIdx>,
    pub hanger_crystal: Option<CrystalBarrier>,
    pub hooks: BTreeMap<DoorIdx, CrystalBarrier>,
    pub visited_regions: BTreeSet<RegionIdx>,
    pub possible_bk_locations: BTreeSet<LocationIdx>,
}

pub fn filter_for_potential_bk_locations<'a>(
    world: &'a World,
    locations: impl IntoIterator<Item = &'a LocationIdx> + 'a,
) -> impl Iterator<Item = LocationIdx> + 'a {
    locations
        .into_iter()
        .copied()
        .filter(|&loc| world.locations[loc].is_potential_big_key())
}

pub fn create_graph_piece_from_state(
    world: &World,
    door: Option<DoorIdx>,
    o_state: &ExplorationState,
    b_state: &ExplorationState,
    proposed_map: &ProposedMap,
) -> GraphPiece {
    let mut all_unattached: BTreeMap<DoorIdx, CrystalBarrier> = BTreeMap::new();
    for exp_d in &o_state.unattached_doors {
        all_unattached.insert(exp_d.door, exp_d.crystal);
    }
    for exp_d in &b_state.unattached_doors {
        match all_unattached.get_mut(&exp_d.door) {
            Some(current) => {
                if *current != exp_d.crystal {
                    match (*current, exp_d.crystal) {
                        (CrystalBarrier::Orange, CrystalBarrier::Blue) => {
                            *current = CrystalBarrier::Null;
                        }
                        (CrystalBarrier::Blue, CrystalBarrier::Orange) => {
                            warn!(
                                "Mismatched state @ {} (o:{:?} b:{:?})",
                                world.door_name(exp_d.door),
                                current,
                                exp_d.crystal
                            );
                        }
                        (CrystalBarrier::Either, c) => {
                            *current = c;
                        }
                        _ => {}
                    }
                }
            }
            None => {
                all_unattached.insert(exp_d.door, exp_d.crystal);
            }
        }
    }
    let mut piece = GraphPiece {
        hanger_info: door,
        hanger_crystal: door.map(|d| world.doors[d].crystal),
        ..GraphPiece::default()
    };
    for (&d, &crystal) in &all_unattached {
        if door != Some(d) && !world.doors[d].blocked && !proposed_map.contains_key(&d) {
            piece.hooks.insert(d, crystal);
        }
        if door == Some(d) {
            piece.hanger_crystal = Some(crystal);
        }
    }
    for state in [o_state, b_state] {
        piece.visited_regions.extend(state.visited_blue.iter().copied());
        piece.visited_regions.extend(state.visited_orange.iter().copied());
        piece
            .possible_bk_locations
            .extend(filter_for_potential_bk_locations(world, &state.bk_found));
    }
    piece
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARRIER_WORLD: &str = r#"{
        "regions": [
            {"name": "Entry", "dungeon": "D", "overworld_entrance": true, "locations": [{"name": "Entry Chest"}]},
            {"name": "Orange Side", "dungeon": "D"},
            {"name": "Blue Side", "dungeon": "D", "locations": [{"name": "Blue Chest"}]},
            {"name": "Vault", "dungeon": "D", "locations": [{"name": "Vault Chest"}]}
        ],
        "doors": [
            {"name": "Entry to Orange", "region": "Entry", "kind": {"type": "Interior"}, "connects_to": "Orange Side", "crystal": "Orange"},
            {"name": "Entry to Blue", "region": "Entry", "kind": {"type": "Interior"}, "connects_to": "Blue Side", "crystal": "Blue"},
            {"name": "Entry to Vault", "region": "Entry", "kind": {"type": "Interior"}, "connects_to": "Vault", "big_key": true},
            {"name": "Orange N", "region": "Orange Side", "kind": {"type": "Normal", "direction": "North"}}
        ],
        "dungeons": [{"name": "D", "entrances": ["Entry"]}]
    }"#;

    #[test]
    fn test_crystal_barriers_gate_exploration() {
        let world = World::from_json(BARRIER_WORLD).unwrap();
        let entry = world.get_region_idx("Entry").unwrap();
        let orange = world.get_region_idx("Orange Side").unwrap();
        let blue = world.get_region_idx("Blue Side").unwrap();
        let north = world.get_door_idx("Orange N").unwrap();
        let valid: BTreeSet<DoorIdx> = [north].into_iter().collect();
        let proposed = ProposedMap::new();

        let start = ExplorationState::new(CrystalBarrier::Orange, "D");
        let state =
            extend_reachable_state_improved(&world, &[entry], &start, &proposed, &valid, false);
        assert!(state.visited_at_all(orange));
        assert!(!state.visited_at_all(blue));
        assert_eq!(state.unattached_doors.len(), 1);

        let start = ExplorationState::new(CrystalBarrier::Either, "D");
        let state =
            extend_reachable_state_improved(&world, &[entry], &start, &proposed, &valid, false);
        assert!(state.visited_at_all(orange));
        assert!(state.visited_at_all(blue));
    }

    #[test]
    fn test_crystal_switch_opens_both_colors() {
        let world = World::from_json(
            r#"{
            "regions": [
                {"name": "Entry", "dungeon": "D", "overworld_entrance": true},
                {"name": "Switch Room", "dungeon": "D", "crystal_switch": true},
                {"name": "Pen", "dungeon": "D", "locations": [{"name": "Pen Chest"}]}
            ],
            "doors": [
                {"name": "Entry to Switch", "region": "Entry", "kind": {"type": "Interior"}, "connects_to": "Switch Room"},
                {"name": "Switch to Pen", "region": "Switch Room", "kind": {"type": "Interior"}, "connects_to": "Pen", "crystal": "Blue"}
            ],
            "dungeons": [{"name": "D", "entrances": ["Entry"]}]
        }"#,
        )
        .unwrap();
        let entry = world.get_region_idx("Entry").unwrap();
        let switch = world.get_region_idx("Switch Room").unwrap();
        let pen = world.get_region_idx("Pen").unwrap();
        let start = ExplorationState::new(CrystalBarrier::Orange, "D");
        let state = extend_reachable_state_improved(
            &world,
            &[entry],
            &start,
            &ProposedMap::new(),
            &BTreeSet::new(),
            false,
        );
        assert!(!state.visited_blue.contains(&entry));
        assert!(state.visited_blue.contains(&switch));
        assert!(state.visited_orange.contains(&switch));
        assert!(state.visited_blue.contains(&pen));
    }

    #[test]
    fn test_big_key_door_waits_for_a_location() {
        let world = World::from_json(BARRIER_WORLD).unwrap();
        let entry = world.get_region_idx("Entry").unwrap();
        let vault = world.get_region_idx("Vault").unwrap();
        let vault_chest = world.get_location_idx("Vault Chest").unwrap();
        let valid = BTreeSet::new();
        let proposed = ProposedMap::new();
        let start = ExplorationState::new(CrystalBarrier::Orange, "D");
        let state =
            extend_reachable_state_improved(&world, &[entry], &start, &proposed, &valid, true);
        // Entry Chest counts as a place the big key could be found
        assert!(state.visited_at_all(vault));
        assert!(state.found_locations.contains(&vault_chest));
        assert!(!state.bk_found.contains(&vault_chest));

        let piece = create_graph_piece_from_state(&world, None, &state, &state, &proposed);
        // Only locations found before the big key door count
        assert_eq!(piece.possible_bk_locations.len(), 1);
        assert!(piece.visited_regions.contains(&vault));
    }
}
