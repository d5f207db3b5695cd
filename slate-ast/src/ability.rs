#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// A capability tag attached to a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ability {
    Copy,
    Drop,
    Store,
    Key,
}

impl Ability {
    pub const ALL: [Ability; 4] = [Ability::Copy, Ability::Drop, Ability::Store, Ability::Key];

    fn bit(self) -> u8 {
        match self {
            Ability::Copy => 0b0001,
            Ability::Drop => 0b0010,
            Ability::Store => 0b0100,
            Ability::Key => 0b1000,
        }
    }

    /// The ability every type argument (and every field) must carry for a
    /// struct to keep `self`: `key` needs `store`, the others need themselves.
    pub fn requirement(self) -> Ability {
        match self {
            Ability::Key => Ability::Store,
            other => other,
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            Ability::Copy => "copy",
            Ability::Drop => "drop",
            Ability::Store => "store",
            Ability::Key => "key",
        }
    }
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display())
    }
}

/// Set over {copy, drop, store, key}. Serializes as a list of ability names.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Vec<Ability>", into = "Vec<Ability>")]
pub struct AbilitySet(u8);

impl AbilitySet {
    pub const EMPTY: AbilitySet = AbilitySet(0);
    pub const ALL: AbilitySet = AbilitySet(0b1111);
    /// Abilities of `bool`, the integer types and `address`.
    pub const PRIMITIVES: AbilitySet = AbilitySet(0b0111);
    /// Abilities of references.
    pub const REFERENCES: AbilitySet = AbilitySet(0b0011);
    pub const SIGNER: AbilitySet = AbilitySet(0b0010);

    pub fn singleton(ability: Ability) -> Self {
        AbilitySet(ability.bit())
    }

    pub fn has(&self, ability: Ability) -> bool {
        self.0 & ability.bit() != 0
    }

    pub fn with(mut self, ability: Ability) -> Self {
        self.0 |= ability.bit();
        self
    }

    pub fn remove(&mut self, ability: Ability) {
        self.0 &= !ability.bit();
    }

    pub fn union(self, other: AbilitySet) -> Self {
        AbilitySet(self.0 | other.0)
    }

    pub fn intersect(self, other: AbilitySet) -> Self {
        AbilitySet(self.0 & other.0)
    }

    pub fn difference(self, other: AbilitySet) -> Self {
        AbilitySet(self.0 & !other.0)
    }

    pub fn is_subset_of(&self, other: AbilitySet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Ability> {
        Ability::ALL.into_iter().filter(move |a| self.has(*a))
    }
}

impl FromIterator<Ability> for AbilitySet {
    fn from_iter<I: IntoIterator<Item = Ability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(AbilitySet::EMPTY, |set, ability| set.with(ability))
    }
}

impl From<Vec<Ability>> for AbilitySet {
    fn from(value: Vec<Ability>) -> Self {
        value.into_iter().collect()
    }
}

impl From<AbilitySet> for Vec<Ability> {
    fn from(value: AbilitySet) -> Self {
        value.iter().collect()
    }
}

impl<const N: usize> From<[Ability; N]> for AbilitySet {
    fn from(value: [Ability; N]) -> Self {
        value.into_iter().collect()
    }
}

impl fmt::Display for AbilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        let names = self
            .iter()
            .map(|a| a.display())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{{names}}}")
    }
}

impl fmt::Debug for AbilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AbilitySet{self}")
    }
}
