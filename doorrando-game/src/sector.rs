use crate::hook::{Hook, hook_from_door};
use crate::{CrystalBarrier, Direction, DoorIdx, DoorKind, LocationKind, RegionIdx, World};
use hashbrown::HashSet;
use std::collections::VecDeque;
use std::ops::{Add, AddAssign};
use strum_macros::EnumIter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
pub enum PolSlot {
    NorthSouth = 0,
    EastWest = 1,
    Stairs = 2,
}

impl PolSlot {
    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn of_door(kind: DoorKind) -> Option<(PolSlot, i32)> {
        match kind {
            DoorKind::Normal(d) | DoorKind::OpenEdge(d) => Some(match d {
                Direction::North => (PolSlot::NorthSouth, 1),
                Direction::South => (PolSlot::NorthSouth, -1),
                Direction::East => (PolSlot::EastWest, 1),
                Direction::West => (PolSlot::EastWest, -1),
            }),
            DoorKind::SpiralStairs(_) => Some((PolSlot::Stairs, 1)),
            DoorKind::Interior | DoorKind::Logical | DoorKind::OneWay => None,
        }
    }
}

/// Net connection supply of a set of outstanding doors. The two directional slots are signed
/// sums; the stairs slot only tracks parity since any stair pairs with any other stair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Polarity(pub [i32; 3]);

impl Polarity {
    pub fn is_neutral(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn charge(&self) -> i32 {
        self.0.iter().map(|x| x.abs()).sum()
    }

    pub fn complement(&self) -> Polarity {
        let [ns, ew, st] = self.0;
        Polarity([-ns, -ew, if st == 0 { 0 } else { 1 }])
    }

    pub fn get(&self, slot: PolSlot) -> i32 {
        self.0[slot.idx()]
    }

    pub fn sum<'a>(pols: impl IntoIterator<Item = &'a Polarity>) -> Polarity {
        pols.into_iter().fold(Polarity::default(), |acc, p| acc + *p)
    }
}

impl Add for Polarity {
    type Output = Polarity;

    fn add(self, other: Polarity) -> Polarity {
        let mut result = [0; 3];
        for i in 0..3 {
            result[i] = self.0[i] + other.0[i];
        }
        result[PolSlot::Stairs.idx()] = result[PolSlot::Stairs.idx()].rem_euclid(2);
        Polarity(result)
    }
}

impl AddAssign for Polarity {
    fn add_assign(&mut self, other: Polarity) {
        *self = *self + other;
    }
}

pub type Magnitude = [i32; 3];

pub fn sum_magnitude<'a>(mags: impl IntoIterator<Item = &'a Magnitude>) -> Magnitude {
    let mut result = [0; 3];
    for m in mags {
        for i in 0..3 {
            result[i] += m[i];
        }
    }
    result
}

/// A connected group of regions plus the door stubs it still needs connected.
#[derive(Clone, Debug, Default)]
pub struct Sector {
    pub name: String,
    pub regions: Vec<RegionIdx>,
    pub outstanding_doors: Vec<DoorIdx>,

    pub chest_locations: usize,
    pub key_only_locations: usize,
    pub c_switch: bool,
    pub orange_barrier: bool,
    pub blue_barrier: bool,
    pub bk_required: bool,
    pub bk_provided: bool,
    pub big_chest_present: bool,

    polarity: Polarity,
    magnitude: Magnitude,
    outflow: usize,
    adj_outflow: usize,
    branching_factor: i32,
    entrance_sector: bool,
    // (hook, blocked, dead) of each outstanding door, same order as outstanding_doors
    door_hooks: Vec<(Hook, bool, bool)>,
}

impl Sector {
    pub fn new(world: &World, regions: Vec<RegionIdx>, outstanding_doors: Vec<DoorIdx>) -> Sector {
        let mut sector = Sector {
            name: regions
                .first()
                .map(|&r| world.regions[r].name.clone())
                .unwrap_or_default(),
            regions,
            outstanding_doors,
            ..Sector::default()
        };
        sector.compute_metrics(world);
        sector.define_features(world);
        sector
    }

    fn compute_metrics(&mut self, world: &World) {
        let mut pol = Polarity::default();
        let mut mag = [0; 3];
        let mut cnt_dead = 0;
        self.door_hooks.clear();
        for &d in &self.outstanding_doors {
            let door = &world.doors[d];
            if let Some((slot, inc)) = PolSlot::of_door(door.kind) {
                pol += Polarity({
                    let mut p = [0; 3];
                    p[slot.idx()] = inc;
                    p
                });
                mag[slot.idx()] += 1;
            }
            if !door.blocked {
                self.outflow += 1;
                if !door.dead {
                    self.adj_outflow += 1;
                }
            }
            if door.dead {
                cnt_dead += 1;
            }
            if let Some(h) = hook_from_door(door.kind) {
                self.door_hooks.push((h, door.blocked, door.dead));
            }
        }
        self.polarity = pol;
        self.magnitude = mag;
        self.entrance_sector = self.regions.iter().any(|&r| world.is_overworld_entrance(r));
        let mut bf = self.outstanding_doors.len() as i32;
        if cnt_dead > 1 {
            bf -= cnt_dead - 1;
        }
        if self.entrance_sector {
            bf += 1;
        }
        self.branching_factor = bf;
    }

    fn define_features(&mut self, world: &World) {
        for &r in &self.regions {
            let region = &world.regions[r];
            if world
                .dungeons
                .iter()
                .any(|d| d.big_key_cell.as_deref() == Some(region.name.as_str()))
            {
                self.bk_provided = true;
            }
            if region.crystal_switch {
                self.c_switch = true;
            }
            for &l in &region.locations {
                match world.locations[l].kind {
                    LocationKind::Prize | LocationKind::Event => {}
                    LocationKind::KeyDrop => self.key_only_locations += 1,
                    LocationKind::Chest => self.chest_locations += 1,
                    LocationKind::BigChest => {
                        self.chest_locations += 1;
                        self.bk_required = true;
                        self.big_chest_present = true;
                    }
                }
            }
            for &d in &region.exits {
                let door = &world.doors[d];
                match door.crystal {
                    CrystalBarrier::Either => self.c_switch = true,
                    CrystalBarrier::Orange => self.orange_barrier = true,
                    CrystalBarrier::Blue => self.blue_barrier = true,
                    CrystalBarrier::Null => {}
                }
                if door.big_key {
                    self.bk_required = true;
                }
            }
        }
    }

    pub fn contains_region(&self, region: RegionIdx) -> bool {
        self.regions.contains(&region)
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn magnitude(&self) -> Magnitude {
        self.magnitude
    }

    pub fn outflow(&self) -> usize {
        self.outflow
    }

    pub fn adj_outflow(&self) -> usize {
        self.adj_outflow
    }

    pub fn branching_factor(&self) -> i32 {
        self.branching_factor
    }

    pub fn dead_ends(&self) -> i32 {
        if self.branching_factor == 1 { 1 } else { 0 }
    }

    pub fn branches(&self) -> i32 {
        (self.branching_factor - 2).max(0)
    }

    pub fn is_entrance_sector(&self) -> bool {
        self.entrance_sector
    }

    /// Hook type of each outstanding door with its (blocked, dead) flags.
    pub fn door_hooks(&self) -> &[(Hook, bool, bool)] {
        &self.door_hooks
    }

    /// Fold other sectors into this one once all their doors are resolved.
    pub fn absorb(&mut self, world: &World, others: Vec<Sector>) {
        for other in others {
            self.regions.extend(other.regions);
        }
        let regions = std::mem::take(&mut self.regions);
        *self = Sector::new(world, regions, vec![]);
    }
}

/// Group the given regions into sectors through their resolved connections. Attachable doors
/// with nothing on the other side become outstanding.
pub fn convert_to_sectors(world: &World, region_list: &[RegionIdx]) -> Vec<Sector> {
    let region_set: HashSet<RegionIdx> = region_list.iter().copied().collect();
    let mut adjacency: Vec<Vec<RegionIdx>> = vec![vec![]; world.regions.len()];
    let mut link = |a: RegionIdx, b: RegionIdx| {
        if region_set.contains(&a) && region_set.contains(&b) {
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
    };
    for &r in region_list {
        for &d in &world.regions[r].exits {
            let door = &world.doors[d];
            if let Some(c) = door.connected {
                link(r, c);
            }
            if let Some(dest) = door.dest {
                link(r, world.doors[dest].region);
            }
            if let Some(controller) = door.controller {
                link(r, world.doors[controller].region);
            }
        }
    }

    let mut visited: HashSet<RegionIdx> = HashSet::new();
    let mut sectors = vec![];
    for &start in region_list {
        if visited.contains(&start) {
            continue;
        }
        visited.insert(start);
        let mut regions = vec![];
        let mut outstanding = vec![];
        let mut queue = VecDeque::from([start]);
        while let Some(r) = queue.pop_front() {
            regions.push(r);
            for &d in &world.regions[r].exits {
                let door = &world.doors[d];
                if door.kind.is_attachable()
                    && door.dest.is_none()
                    && door.connected.is_none()
                    && door.controller.is_none()
                {
                    outstanding.push(d);
                }
            }
            for &next in &adjacency[r] {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        sectors.push(Sector::new(world, regions, outstanding));
    }
    sectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polarity_arithmetic() {
        let a = Polarity([1, -1, 1]);
        let b = Polarity([-1, 0, 1]);
        assert_eq!(a + b, Polarity([0, -1, 0]));
        assert_eq!(a.charge(), 3);
        assert_eq!(a.complement(), Polarity([-1, 1, 1]));
        assert!((a + a.complement()).0[0] == 0);
        assert!(Polarity::default().is_neutral());
        assert_eq!(Polarity::sum(&[a, a, a]), Polarity([3, -3, 1]));
    }

    #[test]
    fn test_convert_to_sectors() {
        let world = World::from_json(
            r#"{
            "regions": [
                {"name": "A", "dungeon": "D", "overworld_entrance": true, "locations": [{"name": "A Chest"}]},
                {"name": "B", "dungeon": "D"},
                {"name": "C", "dungeon": "D", "locations": [{"name": "C Drop", "kind": "KeyDrop"}]}
            ],
            "doors": [
                {"name": "A N", "region": "A", "kind": {"type": "Normal", "direction": "North"}},
                {"name": "A E", "region": "A", "kind": {"type": "Normal", "direction": "East"}, "pair": "B W"},
                {"name": "B W", "region": "B", "kind": {"type": "Normal", "direction": "West"}},
                {"name": "B Up", "region": "B", "kind": {"type": "SpiralStairs", "direction": "Up"}},
                {"name": "C S", "region": "C", "kind": {"type": "Normal", "direction": "South"}, "dead": true}
            ],
            "dungeons": [{"name": "D", "entrances": ["A"]}]
        }"#,
        )
        .unwrap();
        let regions = world.dungeon_regions("D");
        let sectors = convert_to_sectors(&world, &regions);
        assert_eq!(sectors.len(), 2);
        let ab = &sectors[0];
        assert_eq!(ab.regions.len(), 2);
        assert_eq!(ab.outstanding_doors.len(), 2);
        assert_eq!(ab.polarity(), Polarity([1, 0, 1]));
        assert_eq!(ab.magnitude(), [1, 0, 1]);
        assert!(ab.is_entrance_sector());
        assert_eq!(ab.branching_factor(), 3);
        assert_eq!(ab.branches(), 1);
        assert_eq!(ab.chest_locations, 1);
        let c = &sectors[1];
        assert_eq!(c.dead_ends(), 1);
        assert_eq!(c.key_only_locations, 1);
        assert_eq!(c.adj_outflow(), 0);
    }
}
