//! Process-wide string interning.
//!
//! Tag bodies repeat heavily across entities; the tag index and dictionary
//! hold interned symbols so each distinct string is stored once regardless of
//! how many entities carry it.

use std::{
    borrow::Borrow,
    collections::HashSet,
    ops::Deref,
    sync::{Arc, RwLock},
};

lazy_static::lazy_static! {
    static ref INTERNER: RwLock<HashSet<Arc<str>>> = RwLock::new(HashSet::new());
}

/// A canonical, cheap-to-clone handle to an interned string.
///
/// Equality first compares pointers; ordering and hashing go through the
/// underlying string so symbols can key ordered maps.
#[derive(Debug, Clone)]
pub struct Sym(Arc<str>);

impl Sym {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn intern(value: &str) -> Sym {
    {
        let set = INTERNER.read().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = set.get(value) {
            return Sym(existing.clone());
        }
    }

    let mut set = INTERNER.write().unwrap_or_else(|e| e.into_inner());

    if let Some(existing) = set.get(value) {
        return Sym(existing.clone());
    }

    let entry: Arc<str> = Arc::from(value);
    set.insert(entry.clone());
    Sym(entry)
}

/// Number of distinct strings currently interned.
pub fn interned_count() -> usize {
    INTERNER.read().unwrap_or_else(|e| e.into_inner()).len()
}

impl Deref for Sym {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Sym {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Sym {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Sym {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Sym {}

impl PartialEq<str> for Sym {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl std::hash::Hash for Sym {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl PartialOrd for Sym {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sym {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::fmt::Display for Sym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Sym {
    fn from(value: &str) -> Self {
        intern(value)
    }
}
