//! Small typed sets of symbolic options.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A member of a [`FlagSet`]: a closed enumeration with stable names.
pub trait Flag: Copy + Eq + fmt::Debug + 'static {
    const ALL: &'static [Self];

    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }
}

/// Set of flags with explicit membership operations.
///
/// Members are kept in insertion order, without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet<F> {
    members: Vec<F>,
}

impl<F: Flag> FlagSet<F> {
    pub fn new() -> Self {
        Self { members: Vec::new() }
    }

    pub fn contains(&self, flag: F) -> bool {
        self.members.contains(&flag)
    }

    /// Adds `flag`; returns `false` if it was already present.
    pub fn insert(&mut self, flag: F) -> bool {
        if self.contains(flag) {
            return false;
        }
        self.members.push(flag);
        true
    }

    /// Removes `flag`; returns `true` if it was present.
    pub fn remove(&mut self, flag: F) -> bool {
        let before = self.members.len();
        self.members.retain(|f| *f != flag);
        self.members.len() != before
    }

    /// Removes every member matching `pred`, returning what was removed.
    pub fn remove_where(&mut self, pred: impl Fn(F) -> bool) -> Vec<F> {
        let (removed, kept): (Vec<F>, Vec<F>) = self.members.iter().partition(|f| pred(**f));
        self.members = kept;
        removed
    }

    pub fn any(&self, pred: impl Fn(F) -> bool) -> bool {
        self.members.iter().any(|f| pred(*f))
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.members.iter().copied()
    }

    /// Parses a comma separated list of flag names, e.g. `"hwts,plain"`.
    pub fn parse_list(list: &str) -> Result<Self> {
        let mut set = Self::new();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let flag = F::from_name(name).ok_or_else(|| {
                let known: Vec<&str> = F::ALL.iter().map(|f| f.name()).collect();
                Error::Parse(format!(
                    "unknown option \"{}\", expected one of: {}",
                    name,
                    known.join(", ")
                ))
            })?;
            set.insert(flag);
        }
        Ok(set)
    }
}

impl<F: Flag> Default for FlagSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Flag> FromIterator<F> for FlagSet<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        let mut set = Self::new();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl<F: Flag> fmt::Display for FlagSet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.members.iter().map(|m| m.name()).collect();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Colour {
        Red,
        Green,
        Blue,
    }

    impl Flag for Colour {
        const ALL: &'static [Self] = &[Colour::Red, Colour::Green, Colour::Blue];

        fn name(&self) -> &'static str {
            match self {
                Colour::Red => "red",
                Colour::Green => "green",
                Colour::Blue => "blue",
            }
        }
    }

    #[test]
    fn test_insert_remove() {
        let mut set = FlagSet::new();
        assert!(set.insert(Colour::Red));
        assert!(!set.insert(Colour::Red));
        assert!(set.contains(Colour::Red));
        assert!(!set.contains(Colour::Blue));

        assert!(set.remove(Colour::Red));
        assert!(!set.remove(Colour::Red));
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_list() {
        let set: FlagSet<Colour> = FlagSet::parse_list("blue, red,,").unwrap();
        assert!(set.contains(Colour::Blue));
        assert!(set.contains(Colour::Red));
        assert!(!set.contains(Colour::Green));
        assert_eq!(set.to_string(), "blue,red");

        assert!(FlagSet::<Colour>::parse_list("purple").is_err());
    }

    #[test]
    fn test_remove_where() {
        let mut set: FlagSet<Colour> = [Colour::Red, Colour::Green, Colour::Blue]
            .into_iter()
            .collect();
        let removed = set.remove_where(|c| c != Colour::Green);
        assert_eq!(removed, vec![Colour::Red, Colour::Blue]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Colour::Green]);
    }
}
