// The changes suggested by this lint usually make the code more cluttered and less clear:
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

pub mod hook;
pub mod sector;

use anyhow::{Context, Result, bail, ensure};
use hashbrown::HashMap;
use log::info;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::{EnumString, VariantNames};

pub type RegionIdx = usize; // Index into World.regions
pub type DoorIdx = usize; // Index into World.doors
pub type LocationIdx = usize; // Index into World.locations
pub type DungeonIdx = usize; // Index into World.dungeons

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
pub enum Direction {
    North,
    South,
    West,
    East,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
pub enum Vertical {
    Up,
    Down,
}

/// Physical shape of a door stub. Only `Normal`, `OpenEdge` and `SpiralStairs` doors take part
/// in connection shuffling; the remaining kinds are fixed wiring inside the world data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "direction")]
pub enum DoorKind {
    Normal(Direction),
    OpenEdge(Direction),
    SpiralStairs(Vertical),
    Interior,
    Logical,
    OneWay,
}

impl DoorKind {
    pub fn is_attachable(&self) -> bool {
        matches!(
            self,
            DoorKind::Normal(_) | DoorKind::OpenEdge(_) | DoorKind::SpiralStairs(_)
        )
    }

    pub fn is_spiral(&self) -> bool {
        matches!(self, DoorKind::SpiralStairs(_))
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
pub enum CrystalBarrier {
    #[default]
    Null,
    Orange,
    Blue,
    Either,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
pub enum LocationKind {
    #[default]
    Chest,
    BigChest,
    // Location that can only ever hold this dungeon's small key (enemy/pot drops)
    KeyDrop,
    Event,
    Prize,
}

#[derive(Clone, Debug)]
pub struct Location {
    pub name: String,
    pub region: RegionIdx,
    pub kind: LocationKind,
    pub important: bool,
    // Event that only fires once this other location has been found
    pub requires: Option<LocationIdx>,
    // Events whose `requires` is this location
    pub unlocks: Vec<LocationIdx>,
}

impl Location {
    pub fn is_big_chest(&self) -> bool {
        self.kind == LocationKind::BigChest
    }

    pub fn is_key_drop(&self) -> bool {
        self.kind == LocationKind::KeyDrop
    }

    pub fn is_event(&self) -> bool {
        self.kind == LocationKind::Event
    }

    pub fn is_important(&self) -> bool {
        self.kind == LocationKind::Prize || self.important
    }

    /// Locations that could plausibly hold the big key.
    pub fn is_potential_big_key(&self) -> bool {
        matches!(self.kind, LocationKind::Chest)
    }

    /// Locations counted as item slots during key exploration.
    pub fn is_item_slot(&self) -> bool {
        !matches!(self.kind, LocationKind::Event | LocationKind::Prize)
    }
}

#[derive(Clone, Debug)]
pub struct Region {
    pub name: String,
    pub dungeon: Option<String>,
    pub exits: Vec<DoorIdx>,
    // Doors whose connection currently leads into this region
    pub entrances: Vec<DoorIdx>,
    pub locations: Vec<LocationIdx>,
    pub crystal_switch: bool,
    pub overworld_entrance: bool,
    pub inaccessible: bool,
}

#[derive(Clone, Debug)]
pub struct Door {
    pub name: String,
    pub kind: DoorKind,
    pub region: RegionIdx,
    pub connected: Option<RegionIdx>,
    pub dest: Option<DoorIdx>,
    pub blocked: bool,
    pub dead: bool,
    pub stonewall: bool,
    pub small_key: bool,
    pub big_key: bool,
    pub crystal: CrystalBarrier,
    pub req_event: Option<LocationIdx>,
    pub controller: Option<DoorIdx>,
    pub dependents: Vec<DoorIdx>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EscortRoute {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DungeonSplit {
    pub name: String,
    pub entrances: Vec<String>,
    #[serde(default = "default_dead_end_allowance")]
    pub dead_end_allowance: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DungeonDef {
    pub name: String,
    pub entrances: Vec<String>,
    #[serde(default)]
    pub boss_regions: Vec<String>,
    #[serde(default)]
    pub small_keys: usize,
    #[serde(default = "default_dead_end_allowance")]
    pub dead_end_allowance: i32,
    #[serde(default = "default_location_weight")]
    pub location_weight: f64,
    // Region whose visit stands in for "the big key has been found"
    #[serde(default)]
    pub big_key_cell: Option<String>,
    #[serde(default)]
    pub escort: Option<EscortRoute>,
    #[serde(default)]
    pub splits: Vec<DungeonSplit>,
}

fn default_dead_end_allowance() -> i32 {
    1
}

fn default_location_weight() -> f64 {
    6.375
}

#[derive(Deserialize)]
struct WorldData {
    regions: Vec<RegionData>,
    doors: Vec<DoorData>,
    dungeons: Vec<DungeonDef>,
}

#[derive(Deserialize)]
struct RegionData {
    name: String,
    #[serde(default)]
    dungeon: Option<String>,
    #[serde(default)]
    crystal_switch: bool,
    #[serde(default)]
    overworld_entrance: bool,
    #[serde(default)]
    inaccessible: bool,
    #[serde(default)]
    locations: Vec<LocationData>,
}

#[derive(Deserialize)]
struct LocationData {
    name: String,
    #[serde(default)]
    kind: LocationKind,
    #[serde(default)]
    important: bool,
    #[serde(default)]
    requires: Option<String>,
}

#[derive(Deserialize)]
struct DoorData {
    name: String,
    region: String,
    kind: DoorKind,
    // Door on the other side; wires a two-way connection
    #[serde(default)]
    pair: Option<String>,
    // Fixed connection to a region without a partner door
    #[serde(default)]
    connects_to: Option<String>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    dead: bool,
    #[serde(default)]
    stonewall: bool,
    #[serde(default)]
    small_key: bool,
    #[serde(default)]
    big_key: bool,
    #[serde(default)]
    crystal: CrystalBarrier,
    #[serde(default)]
    req_event: Option<String>,
    #[serde(default)]
    controller: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct World {
    pub regions: Vec<Region>,
    pub doors: Vec<Door>,
    pub locations: Vec<Location>,
    pub dungeons: Vec<DungeonDef>,
    pub region_idx_by_name: HashMap<String, RegionIdx>,
    pub door_idx_by_name: HashMap<String, DoorIdx>,
    pub location_idx_by_name: HashMap<String, LocationIdx>,
}

impl World {
    pub fn load(path: &Path) -> Result<World> {
        let world_str = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read world data at {}", path.display()))?;
        let world = World::from_json(&world_str)
            .with_context(|| format!("Unable to load world data at {}", path.display()))?;
        info!(
            "Loaded world: {} regions, {} doors, {} locations, {} dungeons",
            world.regions.len(),
            world.doors.len(),
            world.locations.len(),
            world.dungeons.len()
        );
        Ok(world)
    }

    pub fn from_json(world_str: &str) -> Result<World> {
        let data: WorldData = serde_json::from_str(world_str)?;
        let mut world = World::default();

        for region_data in &data.regions {
            let region_idx = world.regions.len();
            if world
                .region_idx_by_name
                .insert(region_data.name.clone(), region_idx)
                .is_some()
            {
                bail!("Duplicate region name: {}", region_data.name);
            }
            let mut locations = vec![];
            for loc_data in &region_data.locations {
                let loc_idx = world.locations.len();
                if world
                    .location_idx_by_name
                    .insert(loc_data.name.clone(), loc_idx)
                    .is_some()
                {
                    bail!("Duplicate location name: {}", loc_data.name);
                }
                world.locations.push(Location {
                    name: loc_data.name.clone(),
                    region: region_idx,
                    kind: loc_data.kind,
                    important: loc_data.important,
                    requires: None,
                    unlocks: vec![],
                });
                locations.push(loc_idx);
            }
            world.regions.push(Region {
                name: region_data.name.clone(),
                dungeon: region_data.dungeon.clone(),
                exits: vec![],
                entrances: vec![],
                locations,
                crystal_switch: region_data.crystal_switch,
                overworld_entrance: region_data.overworld_entrance,
                inaccessible: region_data.inaccessible,
            });
        }
        for region_data in &data.regions {
            for loc_data in &region_data.locations {
                if let Some(req) = &loc_data.requires {
                    let req_idx = world.get_location_idx(req)?;
                    let loc_idx = world.get_location_idx(&loc_data.name)?;
                    world.locations[loc_idx].requires = Some(req_idx);
                    world.locations[req_idx].unlocks.push(loc_idx);
                }
            }
        }

        for door_data in &data.doors {
            let door_idx = world.doors.len();
            let region = world
                .get_region_idx(&door_data.region)
                .with_context(|| format!("Invalid region for door {}", door_data.name))?;
            if world
                .door_idx_by_name
                .insert(door_data.name.clone(), door_idx)
                .is_some()
            {
                bail!("Duplicate door name: {}", door_data.name);
            }
            let req_event = match &door_data.req_event {
                Some(name) => Some(world.get_location_idx(name)?),
                None => None,
            };
            world.doors.push(Door {
                name: door_data.name.clone(),
                kind: door_data.kind,
                region,
                connected: None,
                dest: None,
                blocked: door_data.blocked,
                dead: door_data.dead,
                stonewall: door_data.stonewall,
                small_key: door_data.small_key,
                big_key: door_data.big_key,
                crystal: door_data.crystal,
                req_event,
                controller: None,
                dependents: vec![],
            });
            world.regions[region].exits.push(door_idx);
        }

        for door_data in &data.doors {
            let door_idx = world.get_door_idx(&door_data.name)?;
            if let Some(controller_name) = &door_data.controller {
                let controller = world.get_door_idx(controller_name)?;
                world.doors[door_idx].controller = Some(controller);
                world.doors[controller].dependents.push(door_idx);
            }
            ensure!(
                door_data.pair.is_none() || door_data.connects_to.is_none(),
                "Door {} has both a pair and a fixed connection",
                door_data.name
            );
            if let Some(pair_name) = &door_data.pair {
                let pair_idx = world.get_door_idx(pair_name)?;
                if world.doors[door_idx].dest.is_none() {
                    world.wire_pair(door_idx, pair_idx);
                } else if world.doors[door_idx].dest != Some(pair_idx) {
                    bail!("Door {} is paired twice", door_data.name);
                }
            }
            if let Some(region_name) = &door_data.connects_to {
                let target = world.get_region_idx(region_name)?;
                world.doors[door_idx].connected = Some(target);
                world.regions[target].entrances.push(door_idx);
            }
        }

        for dungeon in &data.dungeons {
            for r in dungeon
                .entrances
                .iter()
                .chain(dungeon.boss_regions.iter())
                .chain(dungeon.big_key_cell.iter())
                .chain(dungeon.splits.iter().flat_map(|s| s.entrances.iter()))
            {
                world
                    .get_region_idx(r)
                    .with_context(|| format!("Invalid region in dungeon {}", dungeon.name))?;
            }
            if let Some(escort) = &dungeon.escort {
                world.get_region_idx(&escort.from)?;
                world.get_region_idx(&escort.to)?;
            }
        }
        world.dungeons = data.dungeons;
        Ok(world)
    }

    // Pairing from world data: honors the `blocked` flag the same way a generated connection does.
    fn wire_pair(&mut self, a: DoorIdx, b: DoorIdx) {
        if self.doors[a].kind.is_attachable() {
            self.connect_doors(a, b);
        } else {
            self.connect_two_way(a, b);
        }
    }

    pub fn get_region_idx(&self, name: &str) -> Result<RegionIdx> {
        self.region_idx_by_name
            .get(name)
            .copied()
            .with_context(|| format!("Unknown region: {name}"))
    }

    pub fn get_door_idx(&self, name: &str) -> Result<DoorIdx> {
        self.door_idx_by_name
            .get(name)
            .copied()
            .with_context(|| format!("Unknown door: {name}"))
    }

    pub fn get_location_idx(&self, name: &str) -> Result<LocationIdx> {
        self.location_idx_by_name
            .get(name)
            .copied()
            .with_context(|| format!("Unknown location: {name}"))
    }

    pub fn get_dungeon(&self, name: &str) -> Result<&DungeonDef> {
        self.dungeons
            .iter()
            .find(|d| d.name == name)
            .with_context(|| format!("Unknown dungeon: {name}"))
    }

    pub fn region_indices(&self, names: &[String]) -> Result<Vec<RegionIdx>> {
        names.iter().map(|n| self.get_region_idx(n)).collect()
    }

    /// Regions belonging to the named dungeon, in index order.
    pub fn dungeon_regions(&self, dungeon: &str) -> Vec<RegionIdx> {
        (0..self.regions.len())
            .filter(|&r| self.regions[r].dungeon.as_deref() == Some(dungeon))
            .collect()
    }

    pub fn door_name(&self, door: DoorIdx) -> &str {
        &self.doors[door].name
    }

    pub fn region_name(&self, region: RegionIdx) -> &str {
        &self.regions[region].name
    }

    pub fn location_name(&self, loc: LocationIdx) -> &str {
        &self.locations[loc].name
    }

    pub fn is_dungeon_region(&self, region: RegionIdx) -> bool {
        self.regions[region].dungeon.is_some()
    }

    /// Dungeon names are matched by containment so that split sub-dungeons ("X Back") still
    /// explore the regions of their parent dungeon.
    pub fn valid_region_to_explore(&self, region: RegionIdx, dungeon: &str) -> bool {
        let r = &self.regions[region];
        r.inaccessible || r.dungeon.as_deref().is_some_and(|d| dungeon.contains(d))
    }

    /// True if the region can be entered directly from outside any dungeon.
    pub fn is_overworld_entrance(&self, region: RegionIdx) -> bool {
        let r = &self.regions[region];
        r.overworld_entrance
            || r.entrances
                .iter()
                .any(|&d| !self.is_dungeon_region(self.doors[d].region))
    }

    /// Connect two door stubs that were matched by the generator. Non-attachable door kinds are
    /// fixed wiring and are left untouched.
    pub fn connect_doors(&mut self, a: DoorIdx, b: DoorIdx) {
        if !self.doors[a].kind.is_attachable() {
            return;
        }
        if self.doors[a].blocked {
            self.connect_one_way(b, a);
        } else if self.doors[b].blocked {
            self.connect_one_way(a, b);
        } else {
            self.connect_two_way(a, b);
        }
        let (dep_doors, target) = if !self.doors[a].dependents.is_empty() {
            (self.doors[a].dependents.clone(), Some(b))
        } else if !self.doors[b].dependents.is_empty() {
            (self.doors[b].dependents.clone(), Some(a))
        } else {
            (vec![], None)
        };
        if let Some(target) = target {
            let target_region = self.doors[target].region;
            for dep in dep_doors {
                self.connect_simple_door(dep, target_region);
            }
        }
    }

    fn detach(&mut self, door: DoorIdx) {
        if let Some(old) = self.doors[door].connected.take() {
            self.regions[old].entrances.retain(|&d| d != door);
        }
    }

    pub fn connect_two_way(&mut self, a: DoorIdx, b: DoorIdx) {
        self.detach(a);
        self.detach(b);
        let region_a = self.doors[a].region;
        let region_b = self.doors[b].region;
        self.doors[a].connected = Some(region_b);
        self.regions[region_b].entrances.push(a);
        self.doors[b].connected = Some(region_a);
        self.regions[region_a].entrances.push(b);
        self.doors[a].dest = Some(b);
        self.doors[b].dest = Some(a);
    }

    /// Only `entrance` becomes traversable; both doors still record each other as partner.
    pub fn connect_one_way(&mut self, entrance: DoorIdx, exit: DoorIdx) {
        self.detach(entrance);
        self.detach(exit);
        let target = self.doors[exit].region;
        self.doors[entrance].connected = Some(target);
        self.regions[target].entrances.push(entrance);
        self.doors[entrance].dest = Some(exit);
        self.doors[exit].dest = Some(entrance);
    }

    pub fn connect_simple_door(&mut self, door: DoorIdx, region: RegionIdx) {
        self.detach(door);
        self.doors[door].connected = Some(region);
        self.regions[region].entrances.push(door);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_WORLD: &str = r#"{
        "regions": [
            {"name": "Outside"},
            {"name": "Lobby", "dungeon": "Test", "locations": [{"name": "Lobby Chest"}]},
            {"name": "Hall", "dungeon": "Test", "crystal_switch": true},
            {"name": "Vault", "dungeon": "Test", "locations": [
                {"name": "Vault Chest", "kind": "BigChest"},
                {"name": "Vault Drop", "kind": "KeyDrop"}
            ]}
        ],
        "doors": [
            {"name": "Outside Door", "region": "Outside", "kind": {"type": "Logical"}, "connects_to": "Lobby"},
            {"name": "Lobby N", "region": "Lobby", "kind": {"type": "Normal", "direction": "North"}},
            {"name": "Hall S", "region": "Hall", "kind": {"type": "Normal", "direction": "South"}, "blocked": true},
            {"name": "Hall Up", "region": "Hall", "kind": {"type": "SpiralStairs", "direction": "Up"}, "pair": "Vault Down", "small_key": true},
            {"name": "Vault Down", "region": "Vault", "kind": {"type": "SpiralStairs", "direction": "Down"}}
        ],
        "dungeons": [{"name": "Test", "entrances": ["Lobby"], "small_keys": 1}]
    }"#;

    #[test]
    fn test_load_world() {
        let world = World::from_json(SMALL_WORLD).unwrap();
        assert_eq!(world.regions.len(), 4);
        assert_eq!(world.doors.len(), 5);
        let lobby = world.get_region_idx("Lobby").unwrap();
        let up = world.get_door_idx("Hall Up").unwrap();
        let down = world.get_door_idx("Vault Down").unwrap();
        assert_eq!(world.doors[up].dest, Some(down));
        assert_eq!(world.doors[down].dest, Some(up));
        assert!(world.is_overworld_entrance(lobby));
        assert_eq!(world.dungeon_regions("Test").len(), 3);
        assert!(world.get_dungeon("Nowhere").is_err());
    }

    #[test]
    fn test_connect_blocked_door_is_one_way() {
        let mut world = World::from_json(SMALL_WORLD).unwrap();
        let north = world.get_door_idx("Lobby N").unwrap();
        let south = world.get_door_idx("Hall S").unwrap();
        world.connect_doors(north, south);
        let hall = world.get_region_idx("Hall").unwrap();
        assert_eq!(world.doors[north].connected, Some(hall));
        assert_eq!(world.doors[south].connected, None);
        assert_eq!(world.doors[north].dest, Some(south));
        assert_eq!(world.doors[south].dest, Some(north));
        assert_eq!(world.regions[hall].entrances, vec![north]);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let bad = SMALL_WORLD.replace("\"pair\": \"Vault Down\"", "\"pair\": \"Nope\"");
        assert!(World::from_json(&bad).is_err());
    }
}
