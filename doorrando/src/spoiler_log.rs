use doorrando_game::World;
use doorrando_logic::{DoorRules, LocationSet, PlacementRule};
use serde_derive::{Deserialize, Serialize};

use crate::key_logic::KeyLayout;
use crate::randomize::GeneratedDungeon;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoilerConnection {
    pub from: String,
    pub to: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoilerDungeon {
    pub name: String,
    pub seed: u64,
    pub connections: Vec<SpoilerConnection>,
    pub pre_open_stonewall: Option<String>,
    pub key_doors_num: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoilerDoorRule {
    pub door: String,
    pub small_key_num: i32,
    pub alternate_small_key: Option<i32>,
    pub alternate_big_key_loc: Vec<String>,
    pub allow_small: bool,
    pub small_location: Option<String>,
    pub opposite: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoilerPlacementRule {
    pub door_reference: String,
    pub needed_keys_w_bk: Option<i32>,
    pub check_locations_w_bk: Option<Vec<String>>,
    pub needed_keys_wo_bk: Option<i32>,
    pub check_locations_wo_bk: Option<Vec<String>>,
    pub bk_conditional_set: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoilerKeyLogic {
    pub dungeon: String,
    pub max_chests: i32,
    pub key_doors: Vec<String>,
    pub door_rules: Vec<SpoilerDoorRule>,
    pub bk_restricted: Vec<String>,
    pub sm_restricted: Vec<String>,
    pub placement_rules: Vec<SpoilerPlacementRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpoilerLog {
    pub seed: u64,
    pub dungeons: Vec<SpoilerDungeon>,
    pub key_logic: Vec<SpoilerKeyLogic>,
}

fn location_names(world: &World, locs: &LocationSet) -> Vec<String> {
    locs.iter().map(|&l| world.location_name(l).to_string()).collect()
}

fn get_spoiler_door_rule(world: &World, door: usize, rule: &DoorRules) -> SpoilerDoorRule {
    SpoilerDoorRule {
        door: world.door_name(door).to_string(),
        small_key_num: rule.small_key_num,
        alternate_small_key: rule.alternate_small_key,
        alternate_big_key_loc: location_names(world, &rule.alternate_big_key_loc),
        allow_small: rule.allow_small,
        small_location: rule.small_location.map(|l| world.location_name(l).to_string()),
        opposite: rule.opposite.map(|d| world.door_name(d).to_string()),
    }
}

fn get_spoiler_placement_rule(world: &World, rule: &PlacementRule) -> SpoilerPlacementRule {
    let names = |set: &Option<LocationSet>| set.as_ref().map(|s| location_names(world, s));
    SpoilerPlacementRule {
        door_reference: rule.door_reference.clone(),
        needed_keys_w_bk: rule.needed_keys_w_bk,
        check_locations_w_bk: names(&rule.check_locations_w_bk),
        needed_keys_wo_bk: rule.needed_keys_wo_bk,
        check_locations_wo_bk: names(&rule.check_locations_wo_bk),
        bk_conditional_set: names(&rule.bk_conditional_set),
    }
}

pub fn create_spoiler_log(
    world: &World,
    seed: u64,
    dungeons: &[GeneratedDungeon],
    key_layouts: &[KeyLayout],
) -> SpoilerLog {
    let dungeons = dungeons
        .iter()
        .map(|d| SpoilerDungeon {
            name: d.name.clone(),
            seed: d.seed,
            connections: d
                .connections
                .iter()
                .map(|&(a, b)| SpoilerConnection {
                    from: world.door_name(a).to_string(),
                    to: world.door_name(b).to_string(),
                })
                .collect(),
            pre_open_stonewall: d.pre_open_stonewall.map(|s| world.door_name(s).to_string()),
            key_doors_num: d.key_doors_num,
        })
        .collect();
    let key_logic = key_layouts
        .iter()
        .map(|layout| {
            let logic = &layout.key_logic;
            SpoilerKeyLogic {
                dungeon: layout.dungeon.clone(),
                max_chests: layout.max_chests,
                key_doors: layout
                    .proposal
                    .iter()
                    .map(|&d| world.door_name(d).to_string())
                    .collect(),
                door_rules: logic
                    .door_rules
                    .iter()
                    .map(|(&door, rule)| get_spoiler_door_rule(world, door, rule))
                    .collect(),
                bk_restricted: location_names(world, &logic.bk_restricted),
                sm_restricted: location_names(world, &logic.sm_restricted),
                placement_rules: logic
                    .placement_rules
                    .iter()
                    .map(|rule| get_spoiler_placement_rule(world, rule))
                    .collect(),
            }
        })
        .collect();
    SpoilerLog {
        seed,
        dungeons,
        key_logic,
    }
}
