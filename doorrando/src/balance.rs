use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use doorrando_game::hook::{Hook, NUM_HOOKS, hanger_from_door, hook_from_door};
use doorrando_game::sector::{Magnitude, PolSlot, Polarity, Sector, sum_magnitude};
use doorrando_game::{DoorIdx, DungeonSplit, LocationIdx, RegionIdx, World};
use log::info;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use strum::IntoEnumIterator;

use crate::error::{GenResult, GenerationError};
use crate::settings::{GameMode, RandomizerSettings};

pub type HookCounts = [i32; NUM_HOOKS];

/// The sectors assigned to one (sub-)dungeon together with the running totals the balancer
/// uses to judge whether they can be wired into one piece.
#[derive(Clone, Debug)]
pub struct DungeonBuilder {
    pub name: String,
    pub sectors: Vec<Sector>,
    pub location_cnt: usize,
    pub key_drop_cnt: usize,
    pub bk_required: bool,
    pub bk_provided: bool,
    pub c_switch_required: bool,
    pub c_switch_present: bool,
    pub dead_ends: i32,
    pub branches: i32,
    pub total_conn_lack: i32,
    pub conn_needed: HookCounts,
    pub conn_supplied: HookCounts,
    pub conn_balance: HookCounts,
    pub mag_needed: BTreeMap<PolSlot, Vec<PolSlot>>,
    pub unfulfilled: HookCounts,
    pub all_entrances: Vec<RegionIdx>,
    pub master_sector: Option<Sector>,
    pub split_flag: bool,
    pub pre_open_stonewall: Option<DoorIdx>,
    pub key_doors_num: usize,
    pub allowance: i32,
    pub location_weight: f64,
}

impl DungeonBuilder {
    pub fn new(name: &str, allowance: i32) -> DungeonBuilder {
        DungeonBuilder {
            name: name.to_string(),
            sectors: vec![],
            location_cnt: 0,
            key_drop_cnt: 0,
            bk_required: false,
            bk_provided: false,
            c_switch_required: false,
            c_switch_present: false,
            dead_ends: 0,
            branches: 0,
            total_conn_lack: 0,
            conn_needed: [0; NUM_HOOKS],
            conn_supplied: [0; NUM_HOOKS],
            conn_balance: [0; NUM_HOOKS],
            mag_needed: BTreeMap::new(),
            unfulfilled: [0; NUM_HOOKS],
            all_entrances: vec![],
            master_sector: None,
            split_flag: false,
            pre_open_stonewall: None,
            key_doors_num: 0,
            allowance,
            location_weight: 1.0,
        }
    }

    pub fn polarity(&self) -> Polarity {
        sum_polarity(self.sectors.iter())
    }

    pub fn polarity_complement(&self) -> Polarity {
        self.polarity().complement()
    }

    fn is_entrance_sector(&self, sector: &Sector) -> bool {
        self.all_entrances.iter().any(|&r| sector.contains_region(r))
    }
}

pub fn sum_polarity<'a>(sectors: impl Iterator<Item = &'a Sector>) -> Polarity {
    sectors.fold(Polarity::default(), |acc, s| acc + s.polarity())
}

fn sector_magnitudes<'a>(sectors: impl Iterator<Item = &'a Sector>) -> Magnitude {
    let mags: Vec<Magnitude> = sectors.map(|s| s.magnitude()).collect();
    sum_magnitude(mags.iter())
}

/// Remaining polarity supply of the unassigned sector pool. Positive and negative charge must
/// be available for every charge already committed to a dungeon.
#[derive(Clone, Debug, Default)]
pub struct GlobalPolarity {
    positives: [i32; 3],
    negatives: [i32; 3],
}

impl GlobalPolarity {
    pub fn new<'a>(candidate_sectors: impl Iterator<Item = &'a Sector>) -> GlobalPolarity {
        let mut gp = GlobalPolarity::default();
        for sector in candidate_sectors {
            let pol = sector.polarity();
            for slot in PolSlot::iter() {
                let v = pol.get(slot);
                if v < 0 {
                    gp.negatives[slot.idx()] += -v;
                } else if v > 0 {
                    gp.positives[slot.idx()] += v;
                }
            }
        }
        gp
    }

    pub fn is_valid(&self, builders: &[DungeonBuilder]) -> bool {
        let polarities: Vec<Polarity> = builders.iter().map(|b| b.polarity()).collect();
        self.is_valid_polarities(&polarities)
    }

    fn is_valid_polarities(&self, polarities: &[Polarity]) -> bool {
        let mut positives = self.positives;
        let mut negatives = self.negatives;
        for polarity in polarities {
            for slot in PolSlot::iter() {
                let i = slot.idx();
                let v = polarity.get(slot);
                if slot == PolSlot::Stairs {
                    if positives[i] >= v {
                        positives[i] -= v;
                    } else {
                        return false;
                    }
                } else if v > 0 {
                    if negatives[i] >= v {
                        negatives[i] -= v;
                    } else {
                        return false;
                    }
                } else if v < 0 {
                    if positives[i] >= -v {
                        positives[i] += v;
                    } else {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Remove a sector's charge from the pool. Returns false if the pool cannot supply it.
    fn consume(&mut self, polarity: Polarity) -> bool {
        for slot in PolSlot::iter() {
            let i = slot.idx();
            let v = polarity.get(slot);
            if slot == PolSlot::Stairs {
                if self.positives[i] >= v {
                    self.positives[i] -= v;
                } else {
                    return false;
                }
            } else if v > 0 {
                if self.positives[i] >= v {
                    self.positives[i] -= v;
                } else {
                    return false;
                }
            } else if v < 0 {
                if self.negatives[i] >= -v {
                    self.negatives[i] += v;
                } else {
                    return false;
                }
            }
        }
        true
    }

    pub fn is_valid_choice(
        &self,
        builders: &[DungeonBuilder],
        builder_idx: usize,
        sectors: &[&Sector],
    ) -> bool {
        let mut proposal = self.clone();
        let mut non_neutral_polarities: Vec<Polarity> = builders
            .iter()
            .enumerate()
            .filter(|&(i, b)| i != builder_idx && !b.polarity().is_neutral())
            .map(|(_, b)| b.polarity())
            .collect();
        non_neutral_polarities
            .push(builders[builder_idx].polarity() + sum_polarity(sectors.iter().copied()));
        for sector in sectors {
            if !proposal.consume(sector.polarity()) {
                return false;
            }
        }
        proposal.is_valid_polarities(&non_neutral_polarities)
    }
}

pub fn assign_sector(
    sector: Sector,
    builder: &mut DungeonBuilder,
    global_pole: &mut GlobalPolarity,
) -> GenResult<()> {
    if !global_pole.consume(sector.polarity()) {
        return Err(GenerationError::balance(format!(
            "Invalid assignment of {} to {}",
            sector.name, builder.name
        )));
    }
    builder.location_cnt += sector.chest_locations;
    builder.key_drop_cnt += sector.key_only_locations;
    if sector.c_switch {
        builder.c_switch_present = true;
    }
    if sector.blue_barrier {
        builder.c_switch_required = true;
    }
    if sector.bk_required {
        builder.bk_required = true;
    }
    if sector.bk_provided {
        builder.bk_provided = true;
    }
    count_conn_needed_supplied(&sector, &mut builder.conn_needed, &mut builder.conn_supplied);
    builder.dead_ends += sector.dead_ends();
    builder.branches += sector.branches();
    builder.sectors.push(sector);
    Ok(())
}

fn count_conn_needed_supplied(
    sector: &Sector,
    conn_needed: &mut HookCounts,
    conn_supplied: &mut HookCounts,
) {
    for &(hook, blocked, dead) in sector.door_hooks() {
        if (blocked || dead || sector.adj_outflow() <= 1) && !sector.is_entrance_sector() {
            conn_needed[hook.idx()] += 1;
        } else {
            conn_supplied[hook.opposite().idx()] += 1;
        }
    }
}

fn sector_conn_balance(sector: &Sector) -> HookCounts {
    let mut balance = [0; NUM_HOOKS];
    for &(hook, blocked, dead) in sector.door_hooks() {
        if blocked || dead || sector.branching_factor() <= 1 {
            balance[hook.idx()] -= 1;
        } else {
            balance[hook.opposite().idx()] += 1;
        }
    }
    balance
}

fn find_sector(region: RegionIdx, pool: &[Sector]) -> Option<usize> {
    pool.iter().position(|s| s.contains_region(region))
}

fn assign_by_region(
    region: RegionIdx,
    pool: &mut Vec<Sector>,
    builder: &mut DungeonBuilder,
    global_pole: &mut GlobalPolarity,
) -> GenResult<()> {
    if let Some(pos) = find_sector(region, pool) {
        assign_sector(pool.remove(pos), builder, global_pole)?;
    }
    Ok(())
}

/// Split `pool` into the sectors at `idxs` (in that order) and the rest (in pool order).
fn take_sectors(pool: Vec<Sector>, idxs: &[usize]) -> (Vec<Sector>, Vec<Sector>) {
    let mut slots: Vec<Option<Sector>> = pool.into_iter().map(Some).collect();
    let taken = idxs.iter().filter_map(|&i| slots[i].take()).collect();
    let rest = slots.into_iter().flatten().collect();
    (taken, rest)
}

pub fn simple_dungeon_builder(
    name: &str,
    allowance: i32,
    sectors: Vec<Sector>,
) -> GenResult<DungeonBuilder> {
    let mut builder = DungeonBuilder::new(name, allowance);
    let mut global_pole = GlobalPolarity::new(sectors.iter());
    for sector in sectors {
        assign_sector(sector, &mut builder, &mut global_pole)?;
    }
    Ok(builder)
}

/// Distribute the pooled sectors of every dungeon across all dungeons.
pub fn create_dungeon_builders<R: Rng>(
    world: &World,
    all_sectors: Vec<Sector>,
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<Vec<DungeonBuilder>> {
    info!("Shuffling dungeon sectors");
    let mut global_pole = GlobalPolarity::new(all_sectors.iter());
    let mut pool = all_sectors;
    let mut builders: Vec<DungeonBuilder> = vec![];
    for def in &world.dungeons {
        let mut builder = DungeonBuilder::new(&def.name, def.dead_end_allowance);
        builder.location_weight = def.location_weight;
        builder.all_entrances = region_indices(world, &def.entrances)?;
        builders.push(builder);
    }
    for (i, def) in world.dungeons.iter().enumerate() {
        for r in region_indices(world, &def.boss_regions)? {
            assign_by_region(r, &mut pool, &mut builders[i], &mut global_pole)?;
        }
        if settings.mode == GameMode::Standard {
            if let Some(escort) = &def.escort {
                for name in [&escort.from, &escort.to] {
                    let r = region_indices(world, std::slice::from_ref(name))?[0];
                    assign_by_region(r, &mut pool, &mut builders[i], &mut global_pole)?;
                }
            }
        }
    }
    for i in 0..builders.len() {
        for r in builders[i].all_entrances.clone() {
            assign_by_region(r, &mut pool, &mut builders[i], &mut global_pole)?;
        }
    }

    let mut free_location_sectors = vec![];
    let mut crystal_switches = vec![];
    let mut crystal_barriers = vec![];
    let mut polarized_sectors = vec![];
    let mut neutral_sectors = vec![];
    for sector in pool {
        if sector.chest_locations > 0 {
            free_location_sectors.push(sector);
        } else if sector.c_switch {
            crystal_switches.push(sector);
        } else if sector.blue_barrier {
            crystal_barriers.push(sector);
        } else if sector.polarity().is_neutral() {
            neutral_sectors.push(sector);
        } else {
            polarized_sectors.push(sector);
        }
    }
    info!("-Assigning chest locations");
    assign_location_sectors(&mut builders, free_location_sectors, &mut global_pole, rng)?;
    info!("-Assigning crystal switches and barriers");
    let leftover =
        assign_crystal_switch_sectors(&mut builders, crystal_switches, &mut global_pole, false, rng)?;
    for sector in leftover {
        if sector.polarity().is_neutral() {
            neutral_sectors.push(sector);
        } else {
            polarized_sectors.push(sector);
        }
    }
    assign_crystal_barrier_sectors(&mut builders, crystal_barriers, &mut global_pole, rng)?;
    if !global_pole.is_valid(&builders) {
        return Err(GenerationError::balance(
            "chest location and crystal assignment is already globally invalid",
        ));
    }
    info!("-Balancing doors");
    assign_polarized_sectors(world, &mut builders, polarized_sectors, &mut global_pole, settings, rng)?;
    assign_the_rest(&mut builders, neutral_sectors, &mut global_pole, settings, rng)?;
    Ok(builders)
}

fn region_indices(world: &World, names: &[String]) -> GenResult<Vec<RegionIdx>> {
    world
        .region_indices(names)
        .map_err(|e| GenerationError::balance(e.to_string()))
}

fn assign_location_sectors<R: Rng>(
    builders: &mut [DungeonBuilder],
    mut free_location_sectors: Vec<Sector>,
    global_pole: &mut GlobalPolarity,
    rng: &mut R,
) -> GenResult<()> {
    free_location_sectors.shuffle(rng);
    let choices = weighted_random_locations(builders, free_location_sectors.len(), rng)?;
    for (sector, choice) in free_location_sectors.into_iter().zip(choices) {
        assign_sector(sector, &mut builders[choice], global_pole)?;
    }
    Ok(())
}

fn weighted_random_locations<R: Rng>(
    builders: &[DungeonBuilder],
    k: usize,
    rng: &mut R,
) -> GenResult<Vec<usize>> {
    if k == 0 {
        return Ok(vec![]);
    }
    let weights: Vec<f64> = builders.iter().map(|b| b.location_weight).collect();
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| GenerationError::balance(format!("invalid dungeon location weights: {e}")))?;
    Ok((0..k).map(|_| dist.sample(rng)).collect())
}

/// Give a crystal switch to every dungeon with a blue barrier but no switch. With `assign_one`,
/// one switch is placed somewhere even if nothing requires it yet. Returns the unused switches.
fn assign_crystal_switch_sectors<R: Rng>(
    builders: &mut [DungeonBuilder],
    crystal_switches: Vec<Sector>,
    global_pole: &mut GlobalPolarity,
    assign_one: bool,
    rng: &mut R,
) -> GenResult<Vec<Sector>> {
    let population: Vec<usize> = (0..builders.len())
        .filter(|&i| builders[i].c_switch_required && !builders[i].c_switch_present)
        .collect();
    let some_c_switches_present = builders.iter().any(|b| b.c_switch_present);
    if population.is_empty() {
        if !assign_one || some_c_switches_present {
            return Ok(crystal_switches);
        }
        let mut switch_candidates: Vec<usize> = (0..crystal_switches.len()).collect();
        let pick_switch = |candidates: &mut Vec<usize>, rng: &mut R| -> GenResult<usize> {
            if candidates.is_empty() {
                return Err(GenerationError::balance("nowhere to assign a crystal switch"));
            }
            Ok(candidates.remove(rng.gen_range(0..candidates.len())))
        };
        let mut switch_choice = pick_switch(&mut switch_candidates, rng)?;
        let mut builder_candidates: Vec<usize> = (0..builders.len()).collect();
        let builder_choice = loop {
            if builder_candidates.is_empty() {
                switch_choice = pick_switch(&mut switch_candidates, rng)?;
                builder_candidates = (0..builders.len()).collect();
            }
            let choice = builder_candidates.remove(rng.gen_range(0..builder_candidates.len()));
            if global_pole.is_valid_choice(builders, choice, &[&crystal_switches[switch_choice]]) {
                break choice;
            }
        };
        let (taken, rest) = take_sectors(crystal_switches, &[switch_choice]);
        for sector in taken {
            assign_sector(sector, &mut builders[builder_choice], global_pole)?;
        }
        return Ok(rest);
    }
    if population.len() > crystal_switches.len() {
        return Err(GenerationError::balance(format!(
            "{} dungeons need a crystal switch but only {} are available",
            population.len(),
            crystal_switches.len()
        )));
    }
    let choices = rand::seq::index::sample(rng, crystal_switches.len(), population.len()).into_vec();
    let (taken, rest) = take_sectors(crystal_switches, &choices);
    for (sector, &b) in taken.into_iter().zip(population.iter()) {
        assign_sector(sector, &mut builders[b], global_pole)?;
    }
    Ok(rest)
}

fn assign_crystal_barrier_sectors<R: Rng>(
    builders: &mut [DungeonBuilder],
    mut crystal_barriers: Vec<Sector>,
    global_pole: &mut GlobalPolarity,
    rng: &mut R,
) -> GenResult<()> {
    if crystal_barriers.is_empty() {
        return Ok(());
    }
    let population: Vec<usize> = (0..builders.len())
        .filter(|&i| builders[i].c_switch_present)
        .collect();
    if population.is_empty() {
        return Err(GenerationError::balance(
            "crystal barriers left over with no dungeon holding a crystal switch",
        ));
    }
    crystal_barriers.shuffle(rng);
    for sector in crystal_barriers {
        let choice = population[rng.gen_range(0..population.len())];
        assign_sector(sector, &mut builders[choice], global_pole)?;
    }
    Ok(())
}

fn self_connecting(sector: &Sector, slot: PolSlot, magnitude: &Magnitude) -> bool {
    sector.polarity().get(slot) == 0 && magnitude.iter().sum::<i32>() > magnitude[slot.idx()]
}

fn check_flags(sector_mag: &Magnitude, connection_flags: &mut [[bool; 3]; 3]) {
    for slot in PolSlot::iter() {
        for slot2 in PolSlot::iter() {
            if sector_mag[slot.idx()] > 0 && sector_mag[slot2.idx()] > 0 {
                connection_flags[slot.idx()][slot2.idx()] = true;
                if slot != slot2 {
                    for check_slot in PolSlot::iter() {
                        if check_slot != slot
                            && check_slot != slot2
                            && connection_flags[slot2.idx()][check_slot.idx()]
                        {
                            connection_flags[slot.idx()][check_slot.idx()] = true;
                            connection_flags[check_slot.idx()][slot.idx()] = true;
                        }
                    }
                }
            }
        }
    }
}

/// Dungeons with a door type that nothing else in the dungeon can attach to.
fn identify_polarity_issues(builders: &mut [DungeonBuilder], subset: &[usize]) -> Vec<usize> {
    let mut unconnected = vec![];
    for &b in subset {
        let builder = &builders[b];
        if builder.sectors.len() == 1 {
            continue;
        }
        let mut mag_needed: Vec<(PolSlot, Vec<PolSlot>)> = vec![];
        let mut connection_flags = [[false; 3]; 3];
        for (i, sector) in builder.sectors.iter().enumerate() {
            let other_mag = sector_magnitudes(
                builder
                    .sectors
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(_, s)| s),
            );
            let sector_mag = sector.magnitude();
            check_flags(&sector_mag, &mut connection_flags);
            for slot in PolSlot::iter() {
                if sector_mag[slot.idx()] > 0
                    && other_mag[slot.idx()] == 0
                    && !self_connecting(sector, slot, &sector_mag)
                {
                    let matches = PolSlot::iter().filter(|x| other_mag[x.idx()] > 0).collect();
                    mag_needed.push((slot, matches));
                }
            }
        }
        let ttl_mag = sector_magnitudes(builder.sectors.iter());
        for slot in PolSlot::iter() {
            for slot2 in PolSlot::iter() {
                if ttl_mag[slot.idx()] > 0
                    && ttl_mag[slot2.idx()] > 0
                    && !connection_flags[slot.idx()][slot2.idx()]
                {
                    mag_needed.push((slot, vec![slot2]));
                    mag_needed.push((slot2, vec![slot]));
                }
            }
        }
        if !mag_needed.is_empty() {
            let builder = &mut builders[b];
            builder.mag_needed.extend(mag_needed);
            unconnected.push(b);
        }
    }
    unconnected
}

fn identify_simple_branching_issues(builders: &mut [DungeonBuilder], subset: &[usize]) -> Vec<usize> {
    let mut problem_builders = vec![];
    for &b in subset {
        let builder = &mut builders[b];
        let mut problem = builder.dead_ends > builder.branches + builder.allowance;
        for h in 0..NUM_HOOKS {
            let lack = builder.conn_supplied[h] - builder.conn_needed[h];
            builder.conn_balance[h] = lack;
            if lack < 0 {
                builder.total_conn_lack += -lack;
                problem = true;
            }
        }
        if problem {
            problem_builders.push(b);
        }
    }
    problem_builders
}

fn find_connection_candidates(
    mag_needed: &BTreeMap<PolSlot, Vec<PolSlot>>,
    sector_pool: &[Sector],
) -> Vec<usize> {
    let mut candidates = vec![];
    for (i, sector) in sector_pool.iter().enumerate() {
        if sector.branching_factor() < 2 {
            continue;
        }
        let mag = sector.magnitude();
        let matches = mag_needed.iter().any(|(slot, match_slot)| {
            mag[slot.idx()] > 0 && match_slot.iter().any(|m| mag[m.idx()] > 0)
        });
        if matches {
            candidates.push(i);
        }
    }
    candidates
}

fn find_simple_branching_candidates(
    builder: &DungeonBuilder,
    sector_pool: &[Sector],
) -> GenResult<(Vec<usize>, Vec<i32>)> {
    let mut candidates: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    let mut charges: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    let outflow_needed = builder.dead_ends > builder.branches + builder.allowance;
    let original_lack = builder.total_conn_lack;
    let mut best_lack = original_lack;
    for (i, sector) in sector_pool.iter().enumerate() {
        if outflow_needed && sector.branching_factor() <= 2 {
            continue;
        }
        let balance = sector_conn_balance(sector);
        let ttl_lack: i32 = (0..NUM_HOOKS)
            .map(|h| (-(builder.conn_balance[h] + balance[h])).max(0))
            .sum();
        candidates.entry(ttl_lack).or_default().push(i);
        charges
            .entry(ttl_lack)
            .or_default()
            .push((builder.polarity() + sector.polarity()).charge());
        best_lack = best_lack.min(ttl_lack);
    }
    if best_lack == original_lack && !outflow_needed {
        return Err(GenerationError::balance(format!(
            "no sector improves the connection balance of {}",
            builder.name
        )));
    }
    match (candidates.remove(&best_lack), charges.remove(&best_lack)) {
        (Some(c), Some(ch)) if !c.is_empty() => Ok((c, ch)),
        _ => Err(GenerationError::balance(format!(
            "nothing can fix the simple branching issue of {}",
            builder.name
        ))),
    }
}

fn assign_polarized_sectors<R: Rng>(
    world: &World,
    builders: &mut [DungeonBuilder],
    mut polarized_sectors: Vec<Sector>,
    global_pole: &mut GlobalPolarity,
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<()> {
    // Step 1: dungeons with door types nothing else can attach to:
    info!("--Basic traversal");
    let all: Vec<usize> = (0..builders.len()).collect();
    let mut unconnected = identify_polarity_issues(builders, &all);
    while !unconnected.is_empty() {
        for &b in &unconnected {
            let mut candidates = find_connection_candidates(&builders[b].mag_needed, &polarized_sectors);
            let choice = loop {
                if candidates.is_empty() {
                    return Err(GenerationError::balance(format!(
                        "cannot find a candidate for connectedness in {}",
                        builders[b].name
                    )));
                }
                let c = candidates.remove(rng.gen_range(0..candidates.len()));
                if global_pole.is_valid_choice(builders, b, &[&polarized_sectors[c]]) {
                    break c;
                }
            };
            assign_sector(polarized_sectors.remove(choice), &mut builders[b], global_pole)?;
            builders[b].mag_needed.clear();
        }
        unconnected = identify_polarity_issues(builders, &unconnected);
    }

    // Step 2: too many dead ends or unmatched hooks:
    let mut problem_builders = identify_simple_branching_issues(builders, &all);
    while !problem_builders.is_empty() {
        for &b in &problem_builders {
            let (mut candidates, charges) =
                find_simple_branching_candidates(&builders[b], &polarized_sectors)?;
            let biggest = charges.iter().copied().max().unwrap_or(0) + 1;
            let mut weights: Vec<i32> = charges.iter().map(|x| biggest - x).collect();
            let choice = loop {
                if candidates.is_empty() {
                    return Err(GenerationError::balance(format!(
                        "simple branching problems in {}",
                        builders[b].name
                    )));
                }
                let dist = WeightedIndex::new(&weights)
                    .map_err(|e| GenerationError::balance(e.to_string()))?;
                let i = dist.sample(rng);
                let c = candidates.remove(i);
                weights.remove(i);
                let sector = &polarized_sectors[c];
                if global_pole.is_valid_choice(builders, b, &[sector])
                    && valid_connected_assignment(&builders[b], &[sector])
                {
                    break c;
                }
            };
            assign_sector(polarized_sectors.remove(choice), &mut builders[b], global_pole)?;
            builders[b].total_conn_lack = 0;
            builders[b].conn_balance = [0; NUM_HOOKS];
        }
        problem_builders = identify_simple_branching_issues(builders, &problem_builders);
    }

    // Step 3: neutralize each dungeon's polarity:
    polarized_sectors = polarity_step_3(builders, polarized_sectors, global_pole, rng)?;

    // Step 4: fix branching again with neutral groups of the leftovers:
    let mut neutral_choices = neutralize_the_rest(polarized_sectors, rng)?;
    let mut problem_builders = identify_branching_issues_2(world, builders, &all)?;
    let mut attempts = 0;
    while !problem_builders.is_empty() {
        attempts += 1;
        if attempts > settings.max_balance_attempts {
            return Err(GenerationError::balance(
                "unable to resolve branching with neutral sector groups",
            ));
        }
        for &b in &problem_builders {
            let candidates = find_branching_candidates(&builders[b], &neutral_choices)?;
            let choice = candidates[rng.gen_range(0..candidates.len())];
            let group: Vec<&Sector> = neutral_choices[choice].iter().collect();
            if valid_polarized_assignment(&builders[b], &group) {
                for sector in neutral_choices.remove(choice) {
                    assign_sector(sector, &mut builders[b], global_pole)?;
                }
            }
            builders[b].unfulfilled = [0; NUM_HOOKS];
        }
        problem_builders = identify_branching_issues_2(world, builders, &problem_builders)?;
    }

    // Step 5: hand out the remaining neutral groups, keeping every dungeon valid:
    let n = builders.len();
    let mut combinations: Option<Vec<Vec<usize>>> = None;
    if let Some(total) = u32::try_from(neutral_choices.len())
        .ok()
        .and_then(|k| n.checked_pow(k))
    {
        if total <= 1000 {
            let mut combos = product(n, neutral_choices.len());
            combos.shuffle(rng);
            combinations = Some(combos);
        }
    }
    let mut tries = 0;
    while !neutral_choices.is_empty() {
        let exhausted = combinations.as_ref().is_some_and(|c| tries >= c.len());
        if tries > settings.max_balance_attempts || exhausted {
            return Err(GenerationError::balance(format!(
                "no valid assignment found for the remaining sectors near {}",
                builders.first().map(|b| b.name.as_str()).unwrap_or_default()
            )));
        }
        let choices: Vec<usize> = match &combinations {
            Some(c) => c[tries].clone(),
            None => (0..neutral_choices.len())
                .map(|_| rng.gen_range(0..n))
                .collect(),
        };
        let mut chosen_sectors: BTreeMap<usize, Vec<&Sector>> = BTreeMap::new();
        for (i, &choice) in choices.iter().enumerate() {
            chosen_sectors
                .entry(choice)
                .or_default()
                .extend(neutral_choices[i].iter());
        }
        let mut all_valid = true;
        for (&b, sector_list) in &chosen_sectors {
            if !valid_assignment(world, &builders[b], sector_list)? {
                all_valid = false;
                break;
            }
        }
        if all_valid {
            for (group, choice) in std::mem::take(&mut neutral_choices).into_iter().zip(choices) {
                for sector in group {
                    assign_sector(sector, &mut builders[choice], global_pole)?;
                }
            }
        }
        tries += 1;
    }
    Ok(())
}

// Every length-`k` tuple over `0..n`, in lexicographic order
fn product(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut result: Vec<Vec<usize>> = vec![vec![]];
    for _ in 0..k {
        let mut next = Vec::with_capacity(result.len() * n);
        for prefix in &result {
            for i in 0..n {
                let mut t = prefix.clone();
                t.push(i);
                next.push(t);
            }
        }
        result = next;
    }
    result
}

fn polarity_step_3<R: Rng>(
    builders: &mut [DungeonBuilder],
    mut polarized_sectors: Vec<Sector>,
    global_pole: &mut GlobalPolarity,
    rng: &mut R,
) -> GenResult<Vec<Sector>> {
    let mut builder_order: Vec<usize> = (0..builders.len()).collect();
    builder_order.shuffle(rng);
    for b in builder_order {
        info!("--Balancing {}", builders[b].name);
        while !builders[b].polarity().is_neutral() {
            let mut candidates = find_neutralizing_candidates(&builders[b], &polarized_sectors)?;
            let choice = loop {
                if candidates.is_empty() {
                    return Err(GenerationError::balance(format!(
                        "unable to find a globally valid neutralizer for {}",
                        builders[b].name
                    )));
                }
                let c = candidates.remove(rng.gen_range(0..candidates.len()));
                let sectors: Vec<&Sector> = c.iter().map(|&i| &polarized_sectors[i]).collect();
                if global_pole.is_valid_choice(builders, b, &sectors) {
                    break c;
                }
            };
            let (taken, rest) = take_sectors(polarized_sectors, &choice);
            polarized_sectors = rest;
            for sector in taken {
                assign_sector(sector, &mut builders[b], global_pole)?;
            }
        }
    }
    Ok(polarized_sectors)
}

/// Smallest sector combinations that bring the builder's charge down the most without making
/// its dead end or connection balance worse.
fn find_neutralizing_candidates(
    builder: &DungeonBuilder,
    sector_pool: &[Sector],
) -> GenResult<Vec<Vec<usize>>> {
    let polarity = builder.polarity();
    let mut candidates: BTreeMap<i32, Vec<Vec<usize>>> = BTreeMap::new();
    let original_charge = polarity.charge();
    let mut best_charge = original_charge;
    let main_pool: Vec<usize> = (0..sector_pool.len()).collect();
    let mut last_r = 0;
    while candidates.is_empty() {
        for r in last_r + 1..last_r + 3 {
            if r > main_pool.len() {
                if candidates.is_empty() {
                    return Err(GenerationError::balance(format!(
                        "no possible neutralizers left for {}",
                        builder.name
                    )));
                }
                continue;
            }
            last_r = r;
            for i in 0..ncr(main_pool.len(), r) {
                let choice = kth_combination(i, &main_pool, r);
                let p_charge =
                    (polarity + sum_polarity(choice.iter().map(|&s| &sector_pool[s]))).charge();
                if p_charge < original_charge && p_charge <= best_charge {
                    candidates.entry(p_charge).or_default().push(choice);
                    best_charge = best_charge.min(p_charge);
                }
            }
        }
    }

    let mut official_cand: Vec<Vec<usize>> = vec![];
    while official_cand.is_empty() {
        let Some((_, candidate_list)) = candidates.pop_first() else {
            return Err(GenerationError::balance(format!(
                "weeded out all neutralizing candidates for {}",
                builder.name
            )));
        };
        let mut best_lack: Option<i32> = None;
        for cand in candidate_list {
            let mut ttl_deads = 0;
            let mut ttl_branches = 0;
            let mut bal = [0; NUM_HOOKS];
            for &s in &cand {
                let sector = &sector_pool[s];
                ttl_deads += sector.dead_ends();
                ttl_branches += sector.branches();
                let sb = sector_conn_balance(sector);
                for h in 0..NUM_HOOKS {
                    bal[h] += sb[h];
                }
            }
            let mut ttl_lack = 0;
            let mut ttl_balance = 0;
            for h in 0..NUM_HOOKS {
                let lack = builder.conn_balance[h] + bal[h];
                ttl_balance += lack;
                if lack < 0 {
                    ttl_lack += -lack;
                }
            }
            if ttl_balance >= 0
                && builder.dead_ends + ttl_deads
                    <= builder.branches + ttl_branches + builder.allowance
            {
                match best_lack {
                    Some(best) if ttl_lack > best => {}
                    Some(best) if ttl_lack == best => official_cand.push(cand),
                    _ => {
                        best_lack = Some(ttl_lack);
                        official_cand = vec![cand];
                    }
                }
            }
        }
    }

    let best_len = official_cand.iter().map(|c| c.len()).min().unwrap_or(0);
    official_cand.retain(|c| c.len() == best_len);
    Ok(official_cand)
}

fn find_branching_candidates(
    builder: &DungeonBuilder,
    neutral_choices: &[Vec<Sector>],
) -> GenResult<Vec<usize>> {
    let mut candidates = vec![];
    for (i, choice) in neutral_choices.iter().enumerate() {
        let flow_match = choice.iter().any(|s| s.adj_outflow() >= 2);
        let door_match = choice.iter().any(|s| {
            s.door_hooks()
                .iter()
                .any(|&(hook, _, _)| builder.unfulfilled[hook.opposite().idx()] > 0)
        });
        if door_match && flow_match {
            candidates.push(i);
        }
    }
    if candidates.is_empty() {
        return Err(GenerationError::balance(format!(
            "no more branching candidates for {}",
            builder.name
        )));
    }
    Ok(candidates)
}

/// Partition the leftover polarized sectors into groups of zero total polarity.
fn neutralize_the_rest<R: Rng>(sector_pool: Vec<Sector>, rng: &mut R) -> GenResult<Vec<Vec<Sector>>> {
    let mut neutral_choices = vec![];
    let mut main_pool = sector_pool;
    let mut failed_pool: Vec<Sector> = vec![];
    let mut r_size = 1;
    while !main_pool.is_empty() || !failed_pool.is_empty() {
        if main_pool.len() <= r_size {
            main_pool.append(&mut failed_pool);
            r_size += 1;
        }
        let candidate = main_pool.remove(rng.gen_range(0..main_pool.len()));
        if r_size > main_pool.len() {
            return Err(GenerationError::balance("no more neutral pairings possible"));
        }
        let idxs: Vec<usize> = (0..main_pool.len()).collect();
        let combinations = ncr(main_pool.len(), r_size);
        let found = (0..combinations).find_map(|itr| {
            let choice_set = kth_combination(itr, &idxs, r_size);
            let ttl_polarity = candidate.polarity()
                + sum_polarity(choice_set.iter().map(|&i| &main_pool[i]));
            ttl_polarity.is_neutral().then_some(choice_set)
        });
        match found {
            Some(choice_set) => {
                let (mut group, rest) = take_sectors(main_pool, &choice_set);
                main_pool = rest;
                group.push(candidate);
                neutral_choices.push(group);
            }
            None => failed_pool.push(candidate),
        }
    }
    Ok(neutral_choices)
}

fn valid_assignment(world: &World, builder: &DungeonBuilder, sector_list: &[&Sector]) -> GenResult<bool> {
    if !valid_polarized_assignment(builder, sector_list) {
        return Ok(false);
    }
    Ok(resolve_equations(world, builder, sector_list)?.is_empty())
}

fn valid_connected_assignment(builder: &DungeonBuilder, sector_list: &[&Sector]) -> bool {
    let full_list: Vec<&Sector> = sector_list
        .iter()
        .copied()
        .chain(builder.sectors.iter())
        .collect();
    for (i, sector) in full_list.iter().enumerate() {
        let other_mag = sector_magnitudes(
            full_list
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, s)| *s),
        );
        let sector_mag = sector.magnitude();
        let hookable = (0..3).any(|k| sector_mag[k] > 0 && other_mag[k] > 0);
        if !hookable {
            return false;
        }
    }
    true
}

fn valid_polarized_assignment(builder: &DungeonBuilder, sector_list: &[&Sector]) -> bool {
    if !valid_connected_assignment(builder, sector_list) {
        return false;
    }
    (sum_polarity(sector_list.iter().copied()) + builder.polarity()).is_neutral()
}

fn assign_the_rest<R: Rng>(
    builders: &mut [DungeonBuilder],
    mut neutral_sectors: Vec<Sector>,
    global_pole: &mut GlobalPolarity,
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<()> {
    let mut attempts = 0;
    while !neutral_sectors.is_empty() {
        attempts += 1;
        if attempts > settings.max_balance_attempts {
            return Err(GenerationError::balance(format!(
                "unable to place {} neutral sectors",
                neutral_sectors.len()
            )));
        }
        let mut remaining = vec![];
        for sector in neutral_sectors {
            let choice = rng.gen_range(0..builders.len());
            if valid_polarized_assignment(&builders[choice], &[&sector]) {
                assign_sector(sector, &mut builders[choice], global_pole)?;
            } else {
                remaining.push(sector);
            }
        }
        neutral_sectors = remaining;
    }
    Ok(())
}

/// Break a dungeon with several independent entrance groups into one builder per group.
pub fn split_dungeon_builder<R: Rng>(
    world: &World,
    builder: DungeonBuilder,
    splits: &[DungeonSplit],
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<Vec<DungeonBuilder>> {
    info!("Splitting up {}", builder.name);
    let mut pool = builder.sectors;
    let mut global_pole = GlobalPolarity::new(pool.iter());
    let mut sub_builders = vec![];
    for split in splits {
        let mut sub_builder =
            DungeonBuilder::new(&format!("{} {}", builder.name, split.name), split.dead_end_allowance);
        sub_builder.split_flag = true;
        sub_builder.all_entrances = region_indices(world, &split.entrances)?;
        for r in sub_builder.all_entrances.clone() {
            assign_by_region(r, &mut pool, &mut sub_builder, &mut global_pole)?;
        }
        sub_builders.push(sub_builder);
    }
    balance_split(world, pool, sub_builders, global_pole, settings, rng)
}

fn balance_split<R: Rng>(
    world: &World,
    candidate_sectors: Vec<Sector>,
    mut builders: Vec<DungeonBuilder>,
    mut global_pole: GlobalPolarity,
    settings: &RandomizerSettings,
    rng: &mut R,
) -> GenResult<Vec<DungeonBuilder>> {
    let (crystal_switches, crystal_barriers, mut neutral_sectors, mut polarized_sectors) =
        categorize_sectors(candidate_sectors);
    let assign_one = !crystal_barriers.is_empty();
    let leftover =
        assign_crystal_switch_sectors(&mut builders, crystal_switches, &mut global_pole, assign_one, rng)?;
    for sector in leftover {
        if sector.polarity().is_neutral() {
            neutral_sectors.push(sector);
        } else {
            polarized_sectors.push(sector);
        }
    }
    assign_crystal_barrier_sectors(&mut builders, crystal_barriers, &mut global_pole, rng)?;
    if let Some(first) = builders.first() {
        info!("-Re-balancing {} et al", first.name);
    }
    assign_polarized_sectors(world, &mut builders, polarized_sectors, &mut global_pole, settings, rng)?;
    assign_the_rest(&mut builders, neutral_sectors, &mut global_pole, settings, rng)?;
    Ok(builders)
}

type SectorGroups = (Vec<Sector>, Vec<Sector>, Vec<Sector>, Vec<Sector>);

fn categorize_sectors(candidate_sectors: Vec<Sector>) -> SectorGroups {
    let mut crystal_switches = vec![];
    let mut crystal_barriers = vec![];
    let mut neutral_sectors = vec![];
    let mut polarized_sectors = vec![];
    for sector in candidate_sectors {
        if sector.c_switch {
            crystal_switches.push(sector);
        } else if sector.blue_barrier {
            crystal_barriers.push(sector);
        } else if sector.polarity().is_neutral() {
            neutral_sectors.push(sector);
        } else {
            polarized_sectors.push(sector);
        }
    }
    (crystal_switches, crystal_barriers, neutral_sectors, polarized_sectors)
}

/// Cost (the hanger type a door consumes) and benefit (hook types reachable inside the sector
/// after entering through it) of using one outstanding door.
#[derive(Clone, Debug, Default)]
pub struct DoorEquation {
    pub door: DoorIdx,
    pub cost: [Vec<DoorIdx>; NUM_HOOKS],
    pub benefit: [Vec<DoorIdx>; NUM_HOOKS],
    pub required: bool,
}

impl DoorEquation {
    fn new(door: DoorIdx) -> DoorEquation {
        DoorEquation {
            door,
            ..DoorEquation::default()
        }
    }

    pub fn total_cost(&self) -> i32 {
        self.cost.iter().map(|d| d.len() as i32).sum()
    }

    pub fn profit(&self) -> i32 {
        self.benefit.iter().map(|d| d.len() as i32).sum::<i32>() - self.total_cost()
    }

    pub fn neutral(&self) -> bool {
        (0..NUM_HOOKS).all(|h| self.cost[h].len() == self.benefit[h].len())
    }

    pub fn can_cover_cost(&self, current_access: &HookCounts) -> bool {
        (0..NUM_HOOKS).all(|h| self.cost[h].len() as i32 <= current_access[h])
    }

    fn touches(&self, door: DoorIdx) -> bool {
        self.benefit.iter().chain(self.cost.iter()).any(|d| d.contains(&door))
    }
}

// Remaining equations of each sector, keyed by the sector's position in the candidate list
type Equations = Vec<(usize, Vec<DoorEquation>)>;

fn identify_branching_issues_2(
    world: &World,
    builders: &mut [DungeonBuilder],
    subset: &[usize],
) -> GenResult<Vec<usize>> {
    let mut unconnected = vec![];
    for &b in subset {
        let unreached_doors = resolve_equations(world, &builders[b], &[])?;
        if !unreached_doors.is_empty() {
            for (hook, doors) in unreached_doors {
                builders[b].unfulfilled[hook.idx()] += doors.len() as i32;
            }
            unconnected.push(b);
        }
    }
    Ok(unconnected)
}

/// Greedily spend and gain door access across all equations; what cannot be paid for is
/// returned per hook type.
pub fn resolve_equations(
    world: &World,
    builder: &DungeonBuilder,
    sector_list: &[&Sector],
) -> GenResult<BTreeMap<Hook, Vec<DoorIdx>>> {
    let mut unreached_doors: BTreeMap<Hook, Vec<DoorIdx>> = BTreeMap::new();
    let mut equations = copy_door_equations(world, builder, sector_list);
    let mut current_access: HookCounts = [0; NUM_HOOKS];
    let mut reached_doors: BTreeSet<DoorIdx> = BTreeSet::new();
    while let Some((pos, eq_idx)) = find_free_equation(&equations) {
        resolve_equation(pos, eq_idx, &mut current_access, &mut reached_doors, &mut equations, &builder.name)?;
    }
    while !equations.is_empty() {
        match find_priority_equation(&mut equations, &current_access) {
            Some((pos, eq_idx)) => resolve_equation(
                pos,
                eq_idx,
                &mut current_access,
                &mut reached_doors,
                &mut equations,
                &builder.name,
            )?,
            None => {
                for (_, eq_list) in &equations {
                    for eq in eq_list {
                        if let Some(hook) = hook_from_door(world.doors[eq.door].kind) {
                            unreached_doors.entry(hook).or_default().push(eq.door);
                        }
                    }
                }
                return Ok(unreached_doors);
            }
        }
    }
    Ok(unreached_doors)
}

fn find_priority_equation(
    equations: &mut Equations,
    current_access: &HookCounts,
) -> Option<(usize, usize)> {
    let flex = calc_flex(equations, current_access);
    let required = calc_required(equations, current_access);
    let mut best_profit: Option<i32> = None;
    let mut triplet_candidates: Vec<(usize, usize)> = vec![];
    let mut local_profit_map: Vec<i32> = vec![];
    for (pos, (_, eq_list)) in equations.iter_mut().enumerate() {
        eq_list.sort_by_key(|eq| Reverse(eq.profit()));
        let mut best_local_profit: Option<i32> = None;
        for (i, eq) in eq_list.iter().enumerate() {
            let profit = eq.profit();
            if best_local_profit.is_none_or(|b| profit > b) {
                best_local_profit = Some(profit);
            }
            if eq.can_cover_cost(current_access) {
                if eq.neutral() {
                    return Some((pos, i));
                }
                match best_profit {
                    Some(b) if profit < b => {}
                    Some(b) if profit == b => triplet_candidates.push((pos, i)),
                    _ => {
                        triplet_candidates = vec![(pos, i)];
                        best_profit = Some(profit);
                    }
                }
            }
        }
        local_profit_map.push(best_local_profit.unwrap_or(0));
    }
    let get = |c: &(usize, usize)| &equations[c.0].1[c.1];
    let mut filtered = filter_requirements(&triplet_candidates, equations, &required, current_access);
    if filtered.is_empty() {
        filtered = triplet_candidates;
    }
    if filtered.len() <= 1 {
        return filtered.first().copied();
    }
    let mut required_candidates: Vec<(usize, usize)> =
        filtered.iter().copied().filter(|c| get(c).required).collect();
    if required_candidates.is_empty() {
        required_candidates = filtered;
    }
    if required_candidates.len() == 1 {
        return Some(required_candidates[0]);
    }
    let mut flexible_candidates: Vec<(usize, usize)> = required_candidates
        .iter()
        .copied()
        .filter(|c| get(c).can_cover_cost(&flex))
        .collect();
    if flexible_candidates.is_empty() {
        flexible_candidates = required_candidates;
    }
    if flexible_candidates.len() == 1 {
        return Some(flexible_candidates[0]);
    }
    let good_local_candidates: Vec<(usize, usize)> = flexible_candidates
        .iter()
        .copied()
        .filter(|c| local_profit_map[c.0] == get(c).profit())
        .collect();
    good_local_candidates
        .first()
        .or(flexible_candidates.first())
        .copied()
}

fn calc_required(equations: &mut Equations, current_access: &HookCounts) -> (HookCounts, HookCounts) {
    let mut ttl: i32 = current_access.iter().sum();
    let mut local_profit_map = vec![];
    for (_, eq_list) in equations.iter() {
        let best = eq_list.iter().map(|eq| eq.profit()).max().unwrap_or(0);
        local_profit_map.push(best);
        ttl += best;
    }
    if ttl == 0 {
        for (pos, (_, eq_list)) in equations.iter_mut().enumerate() {
            if eq_list.len() > 1 && eq_list.iter().any(|eq| eq.profit() < local_profit_map[pos]) {
                eq_list.retain(|eq| eq.profit() >= local_profit_map[pos]);
                if eq_list.len() <= 1 {
                    for eq in eq_list.iter_mut() {
                        eq.required = true;
                    }
                }
            }
        }
    }
    let mut required_costs = [0; NUM_HOOKS];
    let mut required_benefits = [0; NUM_HOOKS];
    for (_, eq_list) in equations.iter() {
        for eq in eq_list.iter().filter(|eq| eq.required) {
            for h in 0..NUM_HOOKS {
                required_costs[h] += eq.cost[h].len() as i32;
                required_benefits[h] += eq.benefit[h].len() as i32;
            }
        }
    }
    (required_costs, required_benefits)
}

fn calc_flex(equations: &Equations, current_access: &HookCounts) -> HookCounts {
    let mut required_costs = [0; NUM_HOOKS];
    for (_, eq_list) in equations {
        for eq in eq_list.iter().filter(|eq| eq.required) {
            for h in 0..NUM_HOOKS {
                required_costs[h] += eq.cost[h].len() as i32;
            }
        }
    }
    let mut flex_spending = [0; NUM_HOOKS];
    for h in 0..NUM_HOOKS {
        flex_spending[h] = (current_access[h] - required_costs[h]).max(0);
    }
    flex_spending
}

/// Drop candidates that would leave the required equations unpayable.
fn filter_requirements(
    triplet_candidates: &[(usize, usize)],
    equations: &Equations,
    required: &(HookCounts, HookCounts),
    current_access: &HookCounts,
) -> Vec<(usize, usize)> {
    let (r_costs, r_exits) = required;
    let mut valid_candidates = vec![];
    for &(pos, i) in triplet_candidates {
        let cand = &equations[pos].1[i];
        let mut valid = true;
        if !cand.required {
            let mut potential_benefit = [0; NUM_HOOKS];
            let mut potential_costs = [0; NUM_HOOKS];
            for h in 0..NUM_HOOKS {
                let leftover = current_access[h] - cand.cost[h].len() as i32;
                if leftover > 0 {
                    potential_benefit[h] += leftover;
                }
                potential_benefit[h] += cand.benefit[h].len() as i32;
            }
            for (other_pos, (_, eq_list)) in equations.iter().enumerate() {
                for eq in eq_list {
                    if other_pos == pos && cand.touches(eq.door) {
                        continue;
                    }
                    for h in 0..NUM_HOOKS {
                        potential_benefit[h] += eq.benefit[h].len() as i32;
                        potential_costs[h] += eq.cost[h].len() as i32;
                    }
                }
            }
            valid = (0..NUM_HOOKS).all(|h| r_costs[h] <= 0 || potential_benefit[h] >= r_costs[h])
                && (0..NUM_HOOKS).all(|h| r_exits[h] <= 0 || potential_costs[h] >= r_exits[h]);
        }
        if valid {
            valid_candidates.push((pos, i));
        }
    }
    valid_candidates
}

fn resolve_equation(
    pos: usize,
    eq_idx: usize,
    current_access: &mut HookCounts,
    reached_doors: &mut BTreeSet<DoorIdx>,
    equations: &mut Equations,
    dungeon: &str,
) -> GenResult<()> {
    let equation = equations[pos].1.remove(eq_idx);
    for h in 0..NUM_HOOKS {
        let cost = equation.cost[h].len() as i32;
        if current_access[h] - cost < 0 {
            return Err(GenerationError::balance(format!(
                "cannot pay for a connection in {dungeon}"
            )));
        }
        current_access[h] -= cost;
        reached_doors.extend(equation.cost[h].iter().copied());
    }
    for h in 0..NUM_HOOKS {
        current_access[h] += equation.benefit[h].len() as i32;
        reached_doors.extend(equation.benefit[h].iter().copied());
    }
    let eq_list = &mut equations[pos].1;
    eq_list.retain_mut(|r_eq| {
        if !reached_doors.contains(&r_eq.door) {
            return true;
        }
        let mut all_benefits_met = true;
        for h in 0..NUM_HOOKS {
            let fringe: Vec<DoorIdx> = r_eq.benefit[h]
                .iter()
                .copied()
                .filter(|d| !reached_doors.contains(d))
                .collect();
            if !fringe.is_empty() {
                all_benefits_met = false;
                r_eq.benefit[h] = fringe;
            }
        }
        !all_benefits_met
    });
    if eq_list.is_empty() {
        equations.remove(pos);
    }
    Ok(())
}

fn find_free_equation(equations: &Equations) -> Option<(usize, usize)> {
    for (pos, (_, eq_list)) in equations.iter().enumerate() {
        if let Some(i) = eq_list.iter().position(|eq| eq.total_cost() <= 0) {
            return Some((pos, i));
        }
    }
    None
}

fn copy_door_equations(world: &World, builder: &DungeonBuilder, sector_list: &[&Sector]) -> Equations {
    builder
        .sectors
        .iter()
        .chain(sector_list.iter().copied())
        .enumerate()
        .map(|(i, sector)| (i, calc_sector_equations(world, sector, builder)))
        .filter(|(_, eqs)| !eqs.is_empty())
        .collect()
}

fn calc_sector_equations(world: &World, sector: &Sector, builder: &DungeonBuilder) -> Vec<DoorEquation> {
    let mut equations = vec![];
    if builder.is_entrance_sector(sector) {
        let mut flagged = vec![];
        for &door in &sector.outstanding_doors {
            let (equation, flag) = calc_door_equation(world, door, sector, true);
            if flag {
                flagged.push((equations.len(), door));
            }
            equations.push(equation);
        }
        for &(flagged_idx, flagged_door) in &flagged {
            for (i, equation) in equations.iter_mut().enumerate() {
                if i != flagged_idx {
                    for door_list in equation.benefit.iter_mut() {
                        if let Some(p) = door_list.iter().position(|&d| d == flagged_door) {
                            door_list.remove(p);
                        }
                    }
                }
            }
        }
    } else {
        for &door in &sector.outstanding_doors {
            equations.push(calc_door_equation(world, door, sector, false).0);
        }
    }
    equations
}

fn calc_door_equation(
    world: &World,
    door: DoorIdx,
    sector: &Sector,
    look_for_entrance: bool,
) -> (DoorEquation, bool) {
    let d = &world.doors[door];
    let (Some(hook), Some(hanger)) = (hook_from_door(d.kind), hanger_from_door(d.kind)) else {
        return (DoorEquation::new(door), false);
    };
    if look_for_entrance && !d.blocked && sector.is_entrance_sector() {
        let mut eq = DoorEquation::new(door);
        eq.benefit[hook.idx()].push(door);
        eq.required = true;
        return (eq, true);
    }
    let mut eq = DoorEquation::new(door);
    eq.required = d.blocked || d.dead;
    eq.cost[hanger.idx()].push(door);
    if !d.stonewall {
        let start_region = d.region;
        let mut visited: BTreeSet<RegionIdx> = BTreeSet::from([start_region]);
        let mut queue: VecDeque<RegionIdx> = VecDeque::from([start_region]);
        let mut found_events: BTreeSet<LocationIdx> = BTreeSet::new();
        let mut event_doors: Vec<DoorIdx> = vec![];
        while let Some(region) = queue.pop_front() {
            for &loc in &world.regions[region].locations {
                if world.locations[loc].is_event() {
                    found_events.insert(loc);
                    for &ed in &event_doors {
                        if world.doors[ed].req_event == Some(loc) {
                            if let Some(c) = world.doors[ed].connected {
                                if world.is_dungeon_region(c) && visited.insert(c) {
                                    queue.push_back(c);
                                }
                            }
                        }
                    }
                }
            }
            for &exit in &world.regions[region].exits {
                let other = world.doors[exit].controller.unwrap_or(exit);
                let od = &world.doors[other];
                if other != door && sector.outstanding_doors.contains(&other) && !od.blocked {
                    if let Some(h) = hook_from_door(od.kind) {
                        let list = &mut eq.benefit[h.idx()];
                        if !list.contains(&other) {
                            list.push(other);
                        }
                    }
                }
                if od.req_event.is_some_and(|e| !found_events.contains(&e)) {
                    if !event_doors.contains(&other) {
                        event_doors.push(other);
                    }
                } else if let Some(c) = world.doors[exit].connected {
                    if world.is_dungeon_region(c) && visited.insert(c) {
                        queue.push_back(c);
                    }
                }
            }
        }
    }
    if eq.benefit.iter().all(|b| b.is_empty()) {
        eq.required = true;
    }
    (eq, false)
}

/// The `k`-th (0-based, lexicographic) `r`-element combination of `l`.
pub fn kth_combination<T: Clone>(mut k: usize, l: &[T], mut r: usize) -> Vec<T> {
    let mut result = Vec::with_capacity(r);
    let mut rest = l;
    while r > 0 {
        if rest.len() == r {
            result.extend_from_slice(rest);
            break;
        }
        let i = ncr(rest.len() - 1, r - 1);
        if k < i {
            result.push(rest[0].clone());
            r -= 1;
        } else {
            k -= i;
        }
        rest = &rest[1..];
    }
    result
}

pub fn ncr(n: usize, r: usize) -> usize {
    if r > n {
        return 0;
    }
    let r = r.min(n - r);
    let mut result: u128 = 1;
    for i in 0..r {
        result = result * (n - i) as u128 / (i + 1) as u128;
    }
    usize::try_from(result).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ncr() {
        assert_eq!(ncr(5, 0), 1);
        assert_eq!(ncr(5, 2), 10);
        assert_eq!(ncr(6, 3), 20);
        assert_eq!(ncr(3, 4), 0);
    }

    #[test]
    fn test_kth_combination_enumerates_in_order() {
        let l = ['a', 'b', 'c', 'd'];
        let all: Vec<Vec<char>> = (0..ncr(4, 2)).map(|k| kth_combination(k, &l, 2)).collect();
        assert_eq!(
            all,
            vec![
                vec!['a', 'b'],
                vec!['a', 'c'],
                vec!['a', 'd'],
                vec!['b', 'c'],
                vec!['b', 'd'],
                vec!['c', 'd'],
            ]
        );
        assert_eq!(kth_combination(0, &l, 0), Vec::<char>::new());
        assert_eq!(kth_combination(0, &l, 4), l.to_vec());
    }

    #[test]
    fn test_product_order() {
        assert_eq!(
            product(2, 2),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert_eq!(product(3, 0), vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_door_equation_profit() {
        let mut eq = DoorEquation::new(0);
        eq.cost[Hook::South.idx()].push(0);
        eq.benefit[Hook::North.idx()].extend([1, 2]);
        assert_eq!(eq.total_cost(), 1);
        assert_eq!(eq.profit(), 1);
        assert!(!eq.neutral());
        let mut access = [0; NUM_HOOKS];
        assert!(!eq.can_cover_cost(&access));
        access[Hook::South.idx()] = 1;
        assert!(eq.can_cover_cost(&access));
    }
}
