use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use doorrando::error::GenerationError;
use doorrando::randomize::{Randomization, Randomizer};
use doorrando::settings::{RandomizerSettings, load_randomizer_settings};
use doorrando_game::hook::{hanger_from_door, hook_from_door};
use doorrando_game::{RegionIdx, World};
use proptest::prelude::*;

fn load_world(name: &str) -> Result<World> {
    World::load(&Path::new("tests/data").join(name))
}

fn reachable_regions(world: &World, start: RegionIdx) -> BTreeSet<RegionIdx> {
    let mut visited = BTreeSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(r) = queue.pop_front() {
        for &d in &world.regions[r].exits {
            if let Some(next) = world.doors[d].connected {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    visited
}

fn check_connected(
    original: &World,
    randomization: &Randomization,
    dungeon: &str,
    lobby: &str,
) -> Result<()> {
    let world = &randomization.world;
    let lobby = world.get_region_idx(lobby)?;
    let reachable = reachable_regions(world, lobby);
    for r in original.dungeon_regions(dungeon) {
        assert!(
            reachable.contains(&r),
            "{} is not reachable",
            world.region_name(r)
        );
    }
    for (d, door) in original.doors.iter().enumerate() {
        if door.kind.is_attachable() {
            let partner = world.doors[d].dest.context("door left without a partner")?;
            assert_eq!(world.doors[partner].dest, Some(d));
        }
    }
    Ok(())
}

#[test]
fn tower_is_fully_connected() -> Result<()> {
    let world = load_world("tower.json")?;
    let settings = RandomizerSettings::default();
    let randomizer = Randomizer::new(&world, &settings);
    let randomization = randomizer.randomize(1, 12345)?;
    assert_eq!(randomization.dungeons.len(), 1);
    assert_eq!(randomization.dungeons[0].connections.len(), 4);
    check_connected(&world, &randomization, "Tower", "Tower Lobby")
}

#[test]
fn tower_has_no_dangling_hooks() -> Result<()> {
    let world = load_world("tower.json")?;
    let settings = RandomizerSettings::default();
    let randomization = Randomizer::new(&world, &settings).randomize(1, 777)?;
    let result = &randomization.world;
    for dungeon in &randomization.dungeons {
        for &(hanger, hook) in &dungeon.connections {
            assert_eq!(
                hanger_from_door(result.doors[hanger].kind),
                hook_from_door(result.doors[hook].kind),
                "{} linked to incompatible {}",
                result.door_name(hanger),
                result.door_name(hook)
            );
        }
    }
    // The lobby only opens north, onto the hall
    let lobby_n = result.get_door_idx("Tower Lobby N")?;
    let hall_s = result.get_door_idx("Tower Hall S")?;
    assert_eq!(result.doors[lobby_n].dest, Some(hall_s));
    Ok(())
}

#[test]
fn tower_spoiler_log_names_connections() -> Result<()> {
    let world = load_world("tower.json")?;
    let settings = RandomizerSettings::default();
    let randomization = Randomizer::new(&world, &settings).randomize(1, 4)?;
    let spoiler = &randomization.spoiler_log;
    assert_eq!(spoiler.seed, 4);
    assert_eq!(spoiler.dungeons[0].name, "Tower");
    assert!(
        spoiler.dungeons[0]
            .connections
            .iter()
            .all(|c| c.from.starts_with("Tower ") && c.to.starts_with("Tower "))
    );
    assert_eq!(spoiler.key_logic.len(), 1);
    assert!(spoiler.key_logic[0].door_rules.is_empty());
    Ok(())
}

#[test]
fn mismatched_polarity_is_a_balance_failure() -> Result<()> {
    let world = load_world("mismatched.json")?;
    let settings = load_randomizer_settings(Path::new("tests/data/crossed.json"))?;
    let result = Randomizer::new(&world, &settings).randomize(1, 99);
    match result {
        Err(e @ GenerationError::BalanceInfeasibility { .. }) => {
            assert!(e.is_retryable());
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("unbalanced sector pool was accepted"),
    }
    Ok(())
}

fn assert_linked(world: &World, a: &str, b: &str) -> Result<()> {
    let a_idx = world.get_door_idx(a)?;
    let b_idx = world.get_door_idx(b)?;
    assert_eq!(world.doors[a_idx].dest, Some(b_idx), "{a} should lead to {b}");
    assert_eq!(world.doors[b_idx].dest, Some(a_idx), "{b} should lead to {a}");
    Ok(())
}

#[test]
fn fort_switch_room_reaches_blue_pen() -> Result<()> {
    let world = load_world("fort.json")?;
    let settings = RandomizerSettings::default();
    let randomizer = Randomizer::new(&world, &settings);
    for seed in 0..20 {
        let randomization = randomizer.randomize(1, seed)?;
        assert_eq!(randomization.dungeons[0].connections.len(), 4);
        check_connected(&world, &randomization, "Fort", "Fort Lobby")?;
        let result = &randomization.world;
        // Each door type has exactly one partner on offer
        assert_linked(result, "Fort Lobby N", "Fort Hall S")?;
        assert_linked(result, "Fort Hall E", "Fort Gallery W")?;
        assert_linked(result, "Fort Gallery Edge E", "Fort Terrace Edge W")?;
        assert_linked(result, "Fort Hall Up Stairs", "Fort Cellar Down Stairs")?;
    }
    Ok(())
}

#[test]
fn unreachable_island_exhausts_the_search() -> Result<()> {
    let world = load_world("island.json")?;
    let settings = RandomizerSettings::default();
    let result = Randomizer::new(&world, &settings).randomize(1, 5);
    match result {
        Err(e @ GenerationError::StructuralInfeasibility { .. }) => {
            assert!(e.is_retryable());
            assert!(e.to_string().contains("Isle"));
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("a detached pair of rooms was accepted"),
    }
    Ok(())
}

#[test]
fn crossed_twins_keep_their_pinned_sectors() -> Result<()> {
    let world = load_world("twins.json")?;
    let settings = load_randomizer_settings(Path::new("tests/data/crossed.json"))?;
    let randomization = Randomizer::new(&world, &settings).randomize(1, 31)?;
    assert_eq!(randomization.dungeons.len(), 2);
    for name in ["Fen", "Mire"] {
        let dungeon = randomization
            .dungeons
            .iter()
            .find(|d| d.name == name)
            .context("dungeon missing from the result")?;
        assert_eq!(dungeon.connections.len(), 1);
        for &r in &dungeon.regions {
            assert!(randomization.world.region_name(r).starts_with(name));
        }
        check_connected(&world, &randomization, name, &format!("{name} Lobby"))?;
        assert_linked(
            &randomization.world,
            &format!("{name} Lobby N"),
            &format!("{name} Boss S"),
        )?;
    }
    Ok(())
}

#[test]
fn cli_output_is_consistent() -> Result<()> {
    let cli_path = env!("CARGO_BIN_EXE_doorrando-cli");
    let out_dir = std::env::temp_dir();
    let spoiler1 = out_dir.join("doorrando_consistency_1.json");
    let spoiler2 = out_dir.join("doorrando_consistency_2.json");
    let common_args = ["--world", "tests/data/tower.json", "--random-seed", "12345"];

    let status1 = Command::new(cli_path)
        .args(common_args)
        .arg("--output-spoiler-log")
        .arg(&spoiler1)
        .status()?;
    assert!(status1.success());
    let status2 = Command::new(cli_path)
        .args(common_args)
        .arg("--output-spoiler-log")
        .arg(&spoiler2)
        .status()?;
    assert!(status2.success());

    let log1 = std::fs::read_to_string(&spoiler1)?;
    let log2 = std::fs::read_to_string(&spoiler2)?;
    assert_eq!(log1, log2, "same seed produced different spoiler logs");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn generation_is_deterministic_and_connected(seed in 0u64..(1 << 32)) {
        let world = load_world("tower.json").unwrap();
        let settings = RandomizerSettings::default();
        let randomizer = Randomizer::new(&world, &settings);
        let first = randomizer.randomize(1, seed).unwrap();
        let second = randomizer.randomize(1, seed).unwrap();
        prop_assert_eq!(&first.spoiler_log, &second.spoiler_log);
        prop_assert_eq!(&first.dungeons[0].connections, &second.dungeons[0].connections);
        check_connected(&world, &first, "Tower", "Tower Lobby").unwrap();
    }
}
