use doorrando_game::sector::{Sector, convert_to_sectors};
use doorrando_game::{DoorIdx, DungeonDef, RegionIdx, World};
use doorrando_logic::{ItemPlacementView, KeyLogic};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::balance::{
    DungeonBuilder, create_dungeon_builders, simple_dungeon_builder, split_dungeon_builder,
};
use crate::error::{GenResult, GenerationError};
use crate::generate::generate_dungeon;
use crate::key_logic::{
    KeyContext, KeyLayout, analyze_dungeon, build_key_layout, count_unique_sm_doors,
    find_key_door_proposal, validate_key_placement,
};
use crate::settings::{DoorShuffle, RandomizerSettings};
use crate::spoiler_log::{SpoilerLog, create_spoiler_log};

pub fn rng_from_seed(seed: u64) -> StdRng {
    let mut rng_seed = [0u8; 32];
    rng_seed[..8].copy_from_slice(&seed.to_le_bytes());
    StdRng::from_seed(rng_seed)
}

/// One generated (sub-)dungeon.
#[derive(Clone, Debug)]
pub struct GeneratedDungeon {
    pub name: String,
    pub seed: u64,
    pub regions: Vec<RegionIdx>,
    // (hanger, hook) pairs in the order they were chosen
    pub connections: Vec<(DoorIdx, DoorIdx)>,
    pub pre_open_stonewall: Option<DoorIdx>,
    pub key_doors_num: usize,
}

pub struct Randomization {
    pub seed: u64,
    // The world with every generated connection applied
    pub world: World,
    pub dungeons: Vec<GeneratedDungeon>,
    pub key_layouts: Vec<KeyLayout>,
    pub spoiler_log: SpoilerLog,
}

impl Randomization {
    pub fn key_logic(&self, dungeon: &str) -> Option<&KeyLogic> {
        self.key_layouts
            .iter()
            .find(|layout| layout.dungeon == dungeon)
            .map(|layout| &layout.key_logic)
    }

    /// Check a (partial) item placement against the key layout of one dungeon.
    pub fn validate_key_placement(
        &self,
        settings: &RandomizerSettings,
        dungeon: &str,
        view: &impl ItemPlacementView,
    ) -> GenResult<bool> {
        let Some(key_layout) = self.key_layouts.iter().find(|layout| layout.dungeon == dungeon) else {
            return Err(GenerationError::logic(dungeon, "", "no key layout for dungeon"));
        };
        let ctx = KeyContext {
            world: &self.world,
            settings,
        };
        validate_key_placement(&ctx, key_layout, view)
    }
}

pub struct Randomizer<'a> {
    pub world: &'a World,
    pub settings: &'a RandomizerSettings,
}

impl<'a> Randomizer<'a> {
    pub fn new(world: &'a World, settings: &'a RandomizerSettings) -> Randomizer<'a> {
        Randomizer { world, settings }
    }

    pub fn randomize(&self, attempt_num: usize, seed: u64) -> GenResult<Randomization> {
        info!(
            "[attempt {attempt_num}] Door shuffle: {}, seed={seed}",
            self.settings.door_shuffle
        );
        let mut rng = rng_from_seed(seed);
        let mut world = self.world.clone();
        let mut builders = self.create_builders(&mut world, &mut rng)?;

        // Every dungeon gets its own generator, drawn up front in name order, so one dungeon's
        // backtracking does not shift the choices of the next
        builders.sort_by(|a, b| a.name.cmp(&b.name));
        let sub_seeds: Vec<u64> = builders.iter().map(|_| rng.next_u64()).collect();

        let mut dungeons = vec![];
        for (builder, &sub_seed) in builders.iter_mut().zip(&sub_seeds) {
            let mut sub_rng = rng_from_seed(sub_seed);
            let split_dungeon = builder.split_flag;
            let connections =
                generate_dungeon(&mut world, builder, split_dungeon, self.settings, &mut sub_rng)?;
            if let Some(master_sector) = &builder.master_sector {
                let proposal = find_key_door_proposal(&world, master_sector);
                builder.key_doors_num = count_unique_sm_doors(&world, &proposal);
            }
            dungeons.push(GeneratedDungeon {
                name: builder.name.clone(),
                seed: sub_seed,
                regions: builder
                    .sectors
                    .iter()
                    .flat_map(|s| s.regions.iter().copied())
                    .collect(),
                connections,
                pre_open_stonewall: builder.pre_open_stonewall,
                key_doors_num: builder.key_doors_num,
            });
        }

        let mut key_layouts = vec![];
        for def in &world.dungeons {
            if let Some(key_layout) = self.analyze_key_logic(&world, def, &builders)? {
                key_layouts.push(key_layout);
            }
        }
        let spoiler_log = create_spoiler_log(&world, seed, &dungeons, &key_layouts);
        Ok(Randomization {
            seed,
            world,
            dungeons,
            key_layouts,
            spoiler_log,
        })
    }

    fn create_builders<R: Rng>(&self, world: &mut World, rng: &mut R) -> GenResult<Vec<DungeonBuilder>> {
        let settings = self.settings;
        let builders = match settings.door_shuffle {
            DoorShuffle::Basic => {
                let mut builders = vec![];
                for def in &world.dungeons {
                    let sectors = convert_to_sectors(world, &world.dungeon_regions(&def.name));
                    let mut builder =
                        simple_dungeon_builder(&def.name, def.dead_end_allowance, sectors)?;
                    builder.location_weight = def.location_weight;
                    builder.all_entrances = entrance_regions(world, def)?;
                    builders.push(builder);
                }
                builders
            }
            DoorShuffle::Crossed => {
                let all_sectors: Vec<Sector> = world
                    .dungeons
                    .iter()
                    .flat_map(|def| convert_to_sectors(world, &world.dungeon_regions(&def.name)))
                    .collect();
                let builders = create_dungeon_builders(world, all_sectors, settings, rng)?;
                // Regions now belong to whichever dungeon they were balanced into
                for builder in &builders {
                    for sector in &builder.sectors {
                        for &r in &sector.regions {
                            world.regions[r].dungeon = Some(builder.name.clone());
                        }
                    }
                }
                builders
            }
        };

        let mut all_builders = vec![];
        for builder in builders {
            let splits = world
                .dungeons
                .iter()
                .find(|d| d.name == builder.name)
                .map(|d| d.splits.clone())
                .unwrap_or_default();
            if splits.is_empty() {
                all_builders.push(builder);
            } else {
                all_builders.extend(split_dungeon_builder(world, builder, &splits, settings, rng)?);
            }
        }
        Ok(all_builders)
    }

    /// Key logic is derived per dungeon, over the merged result of its sub-dungeons.
    fn analyze_key_logic(
        &self,
        world: &World,
        def: &DungeonDef,
        builders: &[DungeonBuilder],
    ) -> GenResult<Option<KeyLayout>> {
        let prefix = format!("{} ", def.name);
        let mut master_sectors: Vec<Sector> = builders
            .iter()
            .filter(|b| b.name == def.name || b.name.starts_with(&prefix))
            .filter_map(|b| b.master_sector.clone())
            .collect();
        let Some(mut sector) = master_sectors.pop() else {
            return Ok(None);
        };
        if !master_sectors.is_empty() {
            sector.absorb(world, master_sectors);
        }
        let ctx = KeyContext {
            world,
            settings: self.settings,
        };
        let start_regions = entrance_regions(world, def)?;
        let proposal = find_key_door_proposal(world, &sector);
        let key_doors_num = count_unique_sm_doors(world, &proposal);
        let mut key_layout = build_key_layout(&ctx, &def.name, &sector, &start_regions, key_doors_num)?;
        analyze_dungeon(&ctx, &mut key_layout)?;
        Ok(Some(key_layout))
    }
}

fn entrance_regions(world: &World, def: &DungeonDef) -> GenResult<Vec<RegionIdx>> {
    world
        .region_indices(&def.entrances)
        .map_err(|e| GenerationError::structural(&def.name, e.to_string()))
}
