use std::path::Path;

use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum DoorShuffle {
    // Each dungeon keeps its own sectors
    Basic,
    // Sectors are pooled and re-balanced across all dungeons
    Crossed,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum GameMode {
    Open,
    Standard,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum Accessibility {
    Items,
    Locations,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RandomizerSettings {
    pub door_shuffle: DoorShuffle,
    #[serde(default)]
    pub key_shuffle: bool,
    #[serde(default)]
    pub big_key_shuffle: bool,
    #[serde(default)]
    pub retro: bool,
    pub mode: GameMode,
    pub accessibility: Accessibility,
    #[serde(default = "default_max_search_iterations")]
    pub max_search_iterations: usize,
    #[serde(default = "default_max_balance_attempts")]
    pub max_balance_attempts: usize,
}

fn default_max_search_iterations() -> usize {
    20000
}

fn default_max_balance_attempts() -> usize {
    1000
}

impl Default for RandomizerSettings {
    fn default() -> Self {
        RandomizerSettings {
            door_shuffle: DoorShuffle::Basic,
            key_shuffle: false,
            big_key_shuffle: false,
            retro: false,
            mode: GameMode::Open,
            accessibility: Accessibility::Items,
            max_search_iterations: default_max_search_iterations(),
            max_balance_attempts: default_max_balance_attempts(),
        }
    }
}

pub fn parse_randomizer_settings(settings_json: &str) -> Result<RandomizerSettings> {
    let mut des = serde_json::Deserializer::from_str(settings_json);
    let settings = serde_path_to_error::deserialize(&mut des)?;
    Ok(settings)
}

pub fn load_randomizer_settings(path: &Path) -> Result<RandomizerSettings> {
    let settings_str = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read settings at {}", path.display()))?;
    parse_randomizer_settings(&settings_str)
        .with_context(|| format!("Unable to parse settings at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_settings_defaults() {
        let settings = parse_randomizer_settings(
            r#"{"door_shuffle": "Crossed", "mode": "Standard", "accessibility": "Locations"}"#,
        )
        .unwrap();
        assert_eq!(settings.door_shuffle, DoorShuffle::Crossed);
        assert_eq!(settings.mode, GameMode::Standard);
        assert!(!settings.retro);
        assert_eq!(settings.max_search_iterations, 20000);
    }

    #[test]
    fn test_parse_error_names_field() {
        let err = parse_randomizer_settings(
            r#"{"door_shuffle": "Sideways", "mode": "Open", "accessibility": "Items"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("door_shuffle"));
    }
}
