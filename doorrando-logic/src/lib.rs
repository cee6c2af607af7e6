use doorrando_game::{DoorIdx, LocationIdx};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type KeyCount = i32;
pub type LocationSet = BTreeSet<LocationIdx>;

/// What an item placement process currently has at a location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlacedItem<'a> {
    Empty,
    SmallKey { dungeon: &'a str },
    BigKey { dungeon: &'a str },
    Other,
}

/// Read access to a partial item placement, supplied by the item placement process.
pub trait ItemPlacementView {
    fn item_at(&self, loc: LocationIdx) -> PlacedItem<'_>;
}

impl ItemPlacementView for BTreeMap<LocationIdx, PlacedItem<'_>> {
    fn item_at(&self, loc: LocationIdx) -> PlacedItem<'_> {
        self.get(&loc).copied().unwrap_or(PlacedItem::Empty)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoorRules {
    // Small keys that must be collectible before this door can be opened
    pub small_key_num: KeyCount,
    pub is_valid: bool,
    // Relaxed threshold, usable when the big key is in `alternate_big_key_loc`
    pub alternate_small_key: Option<KeyCount>,
    pub alternate_big_key_loc: LocationSet,
    // A single location behind the door may hold the key for the door itself
    pub allow_small: bool,
    pub small_location: Option<LocationIdx>,
    // Door on the other side of this one, if it is also key-locked
    pub opposite: Option<DoorIdx>,
}

impl DoorRules {
    pub fn new(small_key_num: KeyCount, is_valid: bool) -> DoorRules {
        DoorRules {
            small_key_num,
            is_valid,
            alternate_small_key: None,
            alternate_big_key_loc: LocationSet::new(),
            allow_small: false,
            small_location: None,
            opposite: None,
        }
    }
}

/// A constraint on how many small keys must end up in a set of locations. The `w_bk` half
/// applies when the big key is not in `bk_conditional_set`; the `wo_bk` half when it is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementRule {
    // Id of the key counter (or ids joined by ',') that produced the rule
    pub door_reference: String,
    pub dungeon: String,
    pub bk_conditional_set: Option<LocationSet>,
    pub needed_keys_w_bk: Option<KeyCount>,
    pub needed_keys_wo_bk: Option<KeyCount>,
    pub check_locations_w_bk: Option<LocationSet>,
    pub check_locations_wo_bk: Option<LocationSet>,
    pub bk_relevant: bool,
}

fn is_nonempty(set: &Option<LocationSet>) -> bool {
    set.as_ref().is_some_and(|s| !s.is_empty())
}

impl PlacementRule {
    pub fn new(door_reference: String, dungeon: &str) -> PlacementRule {
        PlacementRule {
            door_reference,
            dungeon: dungeon.to_string(),
            bk_relevant: true,
            ..PlacementRule::default()
        }
    }

    pub fn has_w_bk(&self) -> bool {
        is_nonempty(&self.check_locations_w_bk)
    }

    pub fn has_wo_bk(&self) -> bool {
        is_nonempty(&self.check_locations_wo_bk)
    }

    pub fn has_bk_conditional(&self) -> bool {
        is_nonempty(&self.bk_conditional_set)
    }

    fn bk_blocked_by(&self, big_key_loc: LocationIdx) -> bool {
        self.bk_conditional_set
            .as_ref()
            .is_some_and(|s| s.contains(&big_key_loc))
    }

    fn active_half(&self, bk_blocked: bool) -> (Option<&LocationSet>, Option<KeyCount>) {
        if bk_blocked {
            (self.check_locations_wo_bk.as_ref(), self.needed_keys_wo_bk)
        } else {
            (self.check_locations_w_bk.as_ref(), self.needed_keys_w_bk)
        }
    }

    /// True if, with the big key at `big_key_loc`, this rule and `rule` cannot both be met with
    /// the remaining keys because they compete for the same locations.
    pub fn contradicts(
        &self,
        rule: &PlacementRule,
        unplaced_keys: KeyCount,
        big_key_loc: LocationIdx,
    ) -> bool {
        let (check_locations, threshold) = self.active_half(self.bk_blocked_by(big_key_loc));
        let (rule_locations, rule_threshold) = rule.active_half(rule.bk_blocked_by(big_key_loc));
        let (Some(check_locations), Some(rule_locations)) = (check_locations, rule_locations)
        else {
            return false;
        };
        let threshold = threshold.unwrap_or(0);
        let rule_threshold = rule_threshold.unwrap_or(0);
        let mut check_locations = check_locations.clone();
        let mut rule_locations = rule_locations.clone();
        check_locations.remove(&big_key_loc);
        rule_locations.remove(&big_key_loc);
        let common: LocationSet = check_locations
            .intersection(&rule_locations)
            .copied()
            .collect();
        let shared = common.len() as KeyCount;
        if threshold.min(rule_threshold) - shared > 0 {
            let mut left = unplaced_keys - shared;
            let check_only = check_locations.difference(&common).count() as KeyCount;
            let check_needed = threshold - shared;
            if check_only < check_needed || left < check_needed {
                return true;
            }
            left -= check_needed;
            let rule_only = rule_locations.difference(&common).count() as KeyCount;
            let rule_needed = rule_threshold - shared;
            if rule_only < rule_needed || left < rule_needed {
                return true;
            }
        }
        false
    }

    pub fn is_satisfiable(
        &self,
        view: &impl ItemPlacementView,
        outside_keys: KeyCount,
        unplaced_keys: KeyCount,
    ) -> bool {
        let bk_blocked = self.bk_conditional_set.as_ref().is_some_and(|set| {
            set.iter().any(|&loc| {
                matches!(view.item_at(loc), PlacedItem::BigKey { dungeon } if dungeon == self.dungeon)
            })
        });
        let (check_locations, threshold) = self.active_half(bk_blocked);
        let Some(check_locations) = check_locations else {
            return true;
        };
        let mut available_keys = outside_keys;
        let mut empty_chests = 0;
        for &loc in check_locations {
            match view.item_at(loc) {
                PlacedItem::Empty => empty_chests += 1,
                PlacedItem::SmallKey { dungeon } if dungeon == self.dungeon => available_keys += 1,
                _ => {}
            }
        }
        available_keys += empty_chests.min(unplaced_keys);
        available_keys >= threshold.unwrap_or(0)
    }
}

/// Key-safety rules for one dungeon, consumed by the item placement process.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyLogic {
    pub dungeon: String,
    pub door_rules: BTreeMap<DoorIdx, DoorRules>,
    // Locations that may never hold the big key
    pub bk_restricted: LocationSet,
    // Locations that may never hold a small key
    pub sm_restricted: LocationSet,
    pub bk_doors: BTreeSet<DoorIdx>,
    pub bk_chests: LocationSet,
    pub placement_rules: Vec<PlacementRule>,
    // Small keys of this dungeon already placed outside of it
    pub outside_keys: KeyCount,
}

impl KeyLogic {
    pub fn new(dungeon: &str) -> KeyLogic {
        KeyLogic {
            dungeon: dungeon.to_string(),
            ..KeyLogic::default()
        }
    }

    /// Whether the current partial placement can still be completed with `unplaced_keys`
    /// small keys. Pass `big_key_loc` when checking a tentative big key placement.
    pub fn check_placement(
        &self,
        view: &impl ItemPlacementView,
        unplaced_keys: KeyCount,
        big_key_loc: Option<LocationIdx>,
    ) -> bool {
        if let Some(loc) = big_key_loc {
            if self.bk_restricted.contains(&loc) {
                return false;
            }
        }
        if !self
            .placement_rules
            .iter()
            .all(|rule| rule.is_satisfiable(view, self.outside_keys, unplaced_keys))
        {
            return false;
        }
        if let Some(loc) = big_key_loc {
            for (i, rule_a) in self.placement_rules.iter().enumerate() {
                for rule_b in &self.placement_rules[i + 1..] {
                    if rule_a.contradicts(rule_b, unplaced_keys, loc) {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn rule(&self, door: DoorIdx) -> Option<&DoorRules> {
        self.door_rules.get(&door)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(locs: &[LocationIdx]) -> LocationSet {
        locs.iter().copied().collect()
    }

    #[test]
    fn test_satisfiable_counts_empty_and_placed_keys() {
        let mut rule = PlacementRule::new("ctr".to_string(), "D");
        rule.needed_keys_w_bk = Some(2);
        rule.check_locations_w_bk = Some(set(&[1, 2, 3]));
        let mut view: BTreeMap<LocationIdx, PlacedItem> = BTreeMap::new();
        view.insert(1, PlacedItem::Other);
        view.insert(2, PlacedItem::Other);
        assert!(!rule.is_satisfiable(&view, 0, 5));
        assert!(rule.is_satisfiable(&view, 1, 5));
        view.insert(2, PlacedItem::SmallKey { dungeon: "D" });
        assert!(rule.is_satisfiable(&view, 0, 1));
        view.insert(2, PlacedItem::SmallKey { dungeon: "Other" });
        assert!(!rule.is_satisfiable(&view, 0, 1));
    }

    #[test]
    fn test_bk_conditional_switches_half() {
        let mut rule = PlacementRule::new("ctr".to_string(), "D");
        rule.bk_conditional_set = Some(set(&[7]));
        rule.needed_keys_wo_bk = Some(1);
        rule.check_locations_wo_bk = Some(set(&[1]));
        let mut view: BTreeMap<LocationIdx, PlacedItem> = BTreeMap::new();
        assert!(rule.is_satisfiable(&view, 0, 0));
        view.insert(7, PlacedItem::BigKey { dungeon: "D" });
        assert!(!rule.is_satisfiable(&view, 0, 0));
        view.insert(1, PlacedItem::SmallKey { dungeon: "D" });
        assert!(rule.is_satisfiable(&view, 0, 0));
    }

    #[test]
    fn test_contradicting_rules() {
        let mut a = PlacementRule::new("a".to_string(), "D");
        a.needed_keys_w_bk = Some(2);
        a.check_locations_w_bk = Some(set(&[1, 2]));
        let mut b = PlacementRule::new("b".to_string(), "D");
        b.needed_keys_w_bk = Some(2);
        b.check_locations_w_bk = Some(set(&[2, 3]));
        // Big key in location 1 leaves a single spot for two keys
        assert!(a.contradicts(&b, 4, 1));
        assert!(!a.contradicts(&b, 4, 9));

        let mut logic = KeyLogic::new("D");
        logic.placement_rules = vec![a, b];
        let view: BTreeMap<LocationIdx, PlacedItem> = BTreeMap::new();
        assert!(logic.check_placement(&view, 4, Some(9)));
        assert!(!logic.check_placement(&view, 4, Some(1)));
        logic.bk_restricted.insert(9);
        assert!(!logic.check_placement(&view, 4, Some(9)));
    }
}
