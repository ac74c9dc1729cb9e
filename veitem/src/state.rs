//! Synchronization state of an item value or text

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Synchronization state of an item's value (and, independently, its text)
///
/// ```text
/// Idle ──get──▶ Requested ──produce──▶ Synchronized ──set──▶ Storing
///   ▲               │                       │                  │
///   └──retry── Offline ◀──────unreachable───┴──────────────────┘
/// ```
///
/// `Preview` is an overlay entered from `Synchronized` while a caller stages
/// an unconfirmed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[default]
    Idle,
    Offline,
    Requested,
    Storing,
    Synchronized,
    Preview,
}

impl State {
    pub fn is_online(self) -> bool {
        !matches!(self, State::Idle | State::Offline)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Offline => "offline",
            State::Requested => "requested",
            State::Storing => "storing",
            State::Synchronized => "synchronized",
            State::Preview => "preview",
        };
        f.write_str(name)
    }
}

/// Bitmask over the facets of an item a transport carries
///
/// Used to coalesce change notifications per item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Facets(u8);

impl Facets {
    pub const NONE: Facets = Facets(0);
    pub const VALUE: Facets = Facets(1);
    pub const TEXT: Facets = Facets(2);
    pub const MIN: Facets = Facets(4);
    pub const MAX: Facets = Facets(8);
    pub const DEFAULT: Facets = Facets(16);
    pub const ALL: Facets = Facets(31);

    pub fn contains(self, other: Facets) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Clear `other`, returning whether any of it was set
    pub fn remove(&mut self, other: Facets) -> bool {
        let had = self.0 & other.0 != 0;
        self.0 &= !other.0;
        had
    }

    /// The facet carrying a named item property, if any
    pub fn for_property(name: &str) -> Facets {
        match name {
            crate::item::MIN => Facets::MIN,
            crate::item::MAX => Facets::MAX,
            crate::item::DEFAULT => Facets::DEFAULT,
            _ => Facets::NONE,
        }
    }
}

impl BitOr for Facets {
    type Output = Facets;

    fn bitor(self, rhs: Facets) -> Facets {
        Facets(self.0 | rhs.0)
    }
}

impl BitOrAssign for Facets {
    fn bitor_assign(&mut self, rhs: Facets) {
        self.0 |= rhs.0;
    }
}
