use crate::{Direction, DoorKind};
use serde_derive::{Deserialize, Serialize};
use strum_macros::{EnumIter, EnumString, VariantNames};

pub const NUM_HOOKS: usize = 9;

/// Attachment role exposed by an unmatched door. A door's hook is what it offers, its hanger is
/// the hook it needs on the other side.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
pub enum Hook {
    North = 0,
    West = 1,
    South = 2,
    East = 3,
    Stairs = 4,
    NEdge = 5,
    SEdge = 6,
    WEdge = 7,
    EEdge = 8,
}

impl Hook {
    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn opposite(self) -> Hook {
        match self {
            Hook::Stairs => Hook::Stairs,
            Hook::North => Hook::South,
            Hook::South => Hook::North,
            Hook::West => Hook::East,
            Hook::East => Hook::West,
            Hook::NEdge => Hook::SEdge,
            Hook::SEdge => Hook::NEdge,
            Hook::EEdge => Hook::WEdge,
            Hook::WEdge => Hook::EEdge,
        }
    }
}

fn edge_hook(direction: Direction) -> Hook {
    match direction {
        Direction::North => Hook::NEdge,
        Direction::South => Hook::SEdge,
        Direction::West => Hook::WEdge,
        Direction::East => Hook::EEdge,
    }
}

fn normal_hook(direction: Direction) -> Hook {
    match direction {
        Direction::North => Hook::North,
        Direction::South => Hook::South,
        Direction::West => Hook::West,
        Direction::East => Hook::East,
    }
}

pub fn hook_from_door(kind: DoorKind) -> Option<Hook> {
    match kind {
        DoorKind::SpiralStairs(_) => Some(Hook::Stairs),
        DoorKind::Normal(d) => Some(normal_hook(d)),
        DoorKind::OpenEdge(d) => Some(edge_hook(d)),
        DoorKind::Interior | DoorKind::Logical | DoorKind::OneWay => None,
    }
}

pub fn hanger_from_door(kind: DoorKind) -> Option<Hook> {
    hook_from_door(kind).map(Hook::opposite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vertical;
    use strum::IntoEnumIterator;

    #[test]
    fn test_opposite_is_involution() {
        for h in Hook::iter() {
            assert_eq!(h.opposite().opposite(), h);
        }
        assert_eq!(Hook::iter().count(), NUM_HOOKS);
    }

    #[test]
    fn test_door_roles() {
        let north = DoorKind::Normal(Direction::North);
        assert_eq!(hook_from_door(north), Some(Hook::North));
        assert_eq!(hanger_from_door(north), Some(Hook::South));
        let edge = DoorKind::OpenEdge(Direction::West);
        assert_eq!(hook_from_door(edge), Some(Hook::WEdge));
        assert_eq!(hanger_from_door(edge), Some(Hook::EEdge));
        let up = DoorKind::SpiralStairs(Vertical::Up);
        assert_eq!(hook_from_door(up), Some(Hook::Stairs));
        assert_eq!(hanger_from_door(up), Some(Hook::Stairs));
        assert_eq!(hook_from_door(DoorKind::Interior), None);
        assert_eq!(hanger_from_door(DoorKind::OneWay), None);
    }
}
