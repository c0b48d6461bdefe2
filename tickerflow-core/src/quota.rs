//! Quota partitioning.
//!
//! The remote source caps requests per hour. Two runs scheduled one hour apart
//! each take one half of the entity set, picked by the parity of the current
//! hour, so that together they cover every entity exactly once.

use crate::clock::Clock;
use crate::entity::EntityId;
use chrono::Timelike;

/// Which half of an entity sequence to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    /// `entities[..mid]`; receives the extra element on odd lengths.
    Lower,
    /// `entities[mid..]`.
    Upper,
}

impl Half {
    /// Even hours take the lower half, odd hours the upper.
    pub fn for_hour(hour: u32) -> Self {
        if hour % 2 == 0 {
            Half::Lower
        } else {
            Half::Upper
        }
    }

    pub fn from_clock(clock: &dyn Clock) -> Self {
        Self::for_hour(clock.now().hour())
    }

    pub fn is_upper(self) -> bool {
        self == Half::Upper
    }
}

/// Return one half of `entities`.
///
/// `mid = ceil(len / 2)`, so for odd lengths the lower half is one longer.
pub fn half(entities: &[EntityId], select_upper: bool) -> &[EntityId] {
    let mid = entities.len().div_ceil(2);
    if select_upper {
        &entities[mid..]
    } else {
        &entities[..mid]
    }
}

/// Pick the half for the current hour of `clock`.
pub fn half_for_clock<'a>(entities: &'a [EntityId], clock: &dyn Clock) -> &'a [EntityId] {
    half(entities, Half::from_clock(clock).is_upper())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::entity::normalize;

    #[test]
    fn odd_length_gives_lower_half_the_extra() {
        let ids = normalize(&["A", "B", "C", "D", "E"]);
        assert_eq!(half(&ids, false), &ids[..3]);
        assert_eq!(half(&ids, true), &ids[3..]);
    }

    #[test]
    fn empty_and_single() {
        let empty: Vec<EntityId> = Vec::new();
        assert!(half(&empty, false).is_empty());
        assert!(half(&empty, true).is_empty());

        let one = normalize(&["A"]);
        assert_eq!(half(&one, false).len(), 1);
        assert!(half(&one, true).is_empty());
    }

    #[test]
    fn hour_parity_selects_half() {
        let ids = normalize(&["A", "B", "C", "D"]);
        let even = FixedClock::at_hour(10).unwrap();
        let odd = FixedClock::at_hour(11).unwrap();
        assert_eq!(half_for_clock(&ids, &even), &ids[..2]);
        assert_eq!(half_for_clock(&ids, &odd), &ids[2..]);
    }
}
