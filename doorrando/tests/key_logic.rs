use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use doorrando::key_logic::{
    KeyContext, KeyLayout, analyze_dungeon, build_key_layout, count_unique_sm_doors,
    find_key_door_proposal, validate_key_placement,
};
use doorrando::settings::{Accessibility, RandomizerSettings};
use doorrando_game::World;
use doorrando_game::sector::convert_to_sectors;
use doorrando_logic::{LocationSet, PlacedItem};
use proptest::prelude::*;
use serde_json::json;

fn analyze(
    world: &World,
    settings: &RandomizerSettings,
    dungeon: &str,
    lobby: &str,
) -> Result<KeyLayout> {
    let regions = world.dungeon_regions(dungeon);
    let mut sectors = convert_to_sectors(world, &regions);
    assert_eq!(sectors.len(), 1, "{dungeon} should already be one sector");
    let sector = sectors.remove(0);
    let ctx = KeyContext { world, settings };
    let start_regions = world.region_indices(&[lobby.to_string()])?;
    let key_doors_num = count_unique_sm_doors(world, &find_key_door_proposal(world, &sector));
    let mut key_layout = build_key_layout(&ctx, dungeon, &sector, &start_regions, key_doors_num)?;
    analyze_dungeon(&ctx, &mut key_layout)?;
    Ok(key_layout)
}

fn analyze_keep(world: &World, settings: &RandomizerSettings) -> Result<KeyLayout> {
    analyze(world, settings, "Keep", "Keep Lobby")
}

// A straight run of rooms joined by key doors; room i holds `chests` chests and `drops` key drops
fn chain_world(rooms: &[(usize, usize)]) -> World {
    let mut regions = vec![json!({"name": "Run Approach"})];
    let mut doors = vec![json!({
        "name": "Run Entrance",
        "region": "Run Approach",
        "kind": {"type": "Logical"},
        "connects_to": "Run Room 0"
    })];
    for (i, &(chests, drops)) in rooms.iter().enumerate() {
        let mut locations = vec![];
        for c in 0..chests {
            locations.push(json!({"name": format!("Run Room {i} Chest {c}")}));
        }
        for d in 0..drops {
            locations.push(json!({"name": format!("Run Room {i} Drop {d}"), "kind": "KeyDrop"}));
        }
        if i + 1 == rooms.len() {
            locations.push(json!({"name": "Run Prize", "kind": "Prize"}));
        }
        regions.push(json!({
            "name": format!("Run Room {i}"),
            "dungeon": "Run",
            "overworld_entrance": i == 0,
            "locations": locations
        }));
        if i > 0 {
            doors.push(json!({
                "name": format!("Run Room {} N", i - 1),
                "region": format!("Run Room {}", i - 1),
                "kind": {"type": "Normal", "direction": "North"},
                "pair": format!("Run Room {i} S"),
                "small_key": true
            }));
            doors.push(json!({
                "name": format!("Run Room {i} S"),
                "region": format!("Run Room {i}"),
                "kind": {"type": "Normal", "direction": "South"},
                "small_key": true
            }));
        }
    }
    let data = json!({
        "regions": regions,
        "doors": doors,
        "dungeons": [{
            "name": "Run",
            "entrances": ["Run Room 0"],
            "small_keys": rooms.len() - 1
        }]
    });
    World::from_json(&data.to_string()).unwrap()
}

#[test]
fn single_key_door_needs_one_key() -> Result<()> {
    let world = World::load(Path::new("tests/data/keep.json"))?;
    let settings = RandomizerSettings::default();
    let key_layout = analyze_keep(&world, &settings)?;
    let key_logic = &key_layout.key_logic;

    let lobby_n = world.get_door_idx("Keep Lobby N")?;
    let hall_s = world.get_door_idx("Keep Hall S")?;
    assert_eq!(key_layout.proposal, vec![lobby_n, hall_s]);
    assert_eq!(key_layout.max_chests, 1);
    assert_eq!(key_logic.door_rules.len(), 1);
    let rule = &key_logic.door_rules[&lobby_n];
    assert_eq!(rule.small_key_num, 1);

    // The boss sits behind the big key door, so the big chest may not hold the big key
    let big_chest = world.get_location_idx("Keep Big Chest")?;
    assert_eq!(key_logic.bk_restricted, LocationSet::from([big_chest]));
    assert_eq!(key_logic.bk_chests, LocationSet::from([big_chest]));
    assert!(key_logic.sm_restricted.is_empty());
    assert!(key_logic.placement_rules.is_empty());

    let hall_n = world.get_door_idx("Keep Hall N")?;
    assert!(key_logic.bk_doors.contains(&hall_n));
    Ok(())
}

#[test]
fn state_graph_covers_every_key_combination() -> Result<()> {
    let world = World::load(Path::new("tests/data/keep.json"))?;
    let settings = RandomizerSettings::default();
    let key_layout = analyze_keep(&world, &settings)?;
    // Nothing opened, the key door opened, and the big key door opened as well
    assert_eq!(key_layout.key_counters.len(), 3);
    let used: Vec<i32> = key_layout.key_counters.iter().map(|c| c.used_keys).collect();
    assert_eq!(used, vec![0, 1, 1]);
    let last = &key_layout.key_counters[2];
    assert!(last.big_key_opened);
    assert!(last.important_location);
    assert!(last.child_doors.is_empty());
    Ok(())
}

#[test]
fn big_chest_restricted_when_all_locations_required() -> Result<()> {
    let world = World::load(Path::new("tests/data/keep.json"))?;
    let settings = RandomizerSettings {
        accessibility: Accessibility::Locations,
        ..RandomizerSettings::default()
    };
    let key_layout = analyze_keep(&world, &settings)?;
    let big_chest = world.get_location_idx("Keep Big Chest")?;
    assert!(key_layout.key_logic.bk_restricted.contains(&big_chest));
    Ok(())
}

#[test]
fn placement_validation_detects_missing_big_key() -> Result<()> {
    let world = World::load(Path::new("tests/data/keep.json"))?;
    let settings = RandomizerSettings::default();
    let key_layout = analyze_keep(&world, &settings)?;
    let ctx = KeyContext {
        world: &world,
        settings: &settings,
    };
    let lobby_chest = world.get_location_idx("Keep Lobby Chest")?;
    let hall_chest = world.get_location_idx("Keep Hall Chest")?;
    let big_chest = world.get_location_idx("Keep Big Chest")?;

    let good: BTreeMap<usize, PlacedItem> = BTreeMap::from([
        (lobby_chest, PlacedItem::BigKey { dungeon: "Keep" }),
        (hall_chest, PlacedItem::Other),
        (big_chest, PlacedItem::Other),
    ]);
    assert!(validate_key_placement(&ctx, &key_layout, &good)?);

    let no_big_key: BTreeMap<usize, PlacedItem> = BTreeMap::from([
        (lobby_chest, PlacedItem::Other),
        (hall_chest, PlacedItem::Other),
        (big_chest, PlacedItem::Other),
    ]);
    assert!(!validate_key_placement(&ctx, &key_layout, &no_big_key)?);
    Ok(())
}

#[test]
fn check_placement_rejects_restricted_big_key() -> Result<()> {
    let world = World::load(Path::new("tests/data/keep.json"))?;
    let settings = RandomizerSettings::default();
    let key_layout = analyze_keep(&world, &settings)?;
    let view: BTreeMap<usize, PlacedItem> = BTreeMap::new();
    let big_chest = world.get_location_idx("Keep Big Chest")?;
    let lobby_chest = world.get_location_idx("Keep Lobby Chest")?;
    assert!(!key_layout.key_logic.check_placement(&view, 1, Some(big_chest)));
    assert!(key_layout.key_logic.check_placement(&view, 1, Some(lobby_chest)));
    Ok(())
}

#[test]
fn two_key_chain_counts_up() -> Result<()> {
    let world = World::load(Path::new("tests/data/chain.json"))?;
    let settings = RandomizerSettings::default();
    let key_layout = analyze(&world, &settings, "Chain", "Chain Lobby")?;
    let key_logic = &key_layout.key_logic;

    let lobby_n = world.get_door_idx("Chain Lobby N")?;
    let hall_n = world.get_door_idx("Chain Hall N")?;
    assert_eq!(key_layout.max_chests, 2);
    assert_eq!(key_logic.door_rules[&lobby_n].small_key_num, 1);
    assert_eq!(key_logic.door_rules[&hall_n].small_key_num, 2);

    let used: Vec<i32> = key_layout.key_counters.iter().map(|c| c.used_keys).collect();
    assert_eq!(used, vec![0, 1, 2, 2]);

    // Any of these would leave a key door shut with the big key behind it
    let lobby_chest = world.get_location_idx("Chain Lobby Chest")?;
    let hall_chest = world.get_location_idx("Chain Hall Chest")?;
    let big_chest = world.get_location_idx("Chain Big Chest")?;
    assert_eq!(
        key_logic.bk_restricted,
        LocationSet::from([lobby_chest, hall_chest, big_chest])
    );
    let view: BTreeMap<usize, PlacedItem> = BTreeMap::new();
    assert!(!key_logic.check_placement(&view, 2, Some(lobby_chest)));
    assert!(!key_logic.check_placement(&view, 2, Some(hall_chest)));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn door_rules_match_reachable_key_counts(
        rooms in prop::collection::vec((1usize..=3, 0usize..=1), 2..=5)
    ) {
        let world = chain_world(&rooms);
        let settings = RandomizerSettings::default();
        let key_layout = analyze(&world, &settings, "Run", "Run Room 0").unwrap();
        prop_assert_eq!(key_layout.key_logic.door_rules.len(), rooms.len() - 1);
        for (&door, rule) in &key_layout.key_logic.door_rules {
            let k = rule.small_key_num;
            // With one key fewer the door is still shut somewhere reachable
            prop_assert!(key_layout
                .key_counters
                .iter()
                .any(|c| c.used_keys == k - 1 && c.child_doors.contains(&door)));
            // With k keys spent it has been opened
            prop_assert!(key_layout
                .key_counters
                .iter()
                .any(|c| c.used_keys == k && c.open_doors.contains(&door)));
        }
    }
}
