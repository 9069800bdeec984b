//! The purchasable level catalog.
//!
//! Levels follow the CEFR scale (A1..C2). Each level maps to a base price in
//! minor currency units. The catalog is loaded once at startup and treated as
//! process-wide read-only configuration; prices never change while the
//! service is running.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

/// A purchasable entitlement: one CEFR level unlock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::A1,
        Level::A2,
        Level::B1,
        Level::B2,
        Level::C1,
        Level::C2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::A1 => "A1",
            Level::A2 => "A2",
            Level::B1 => "B1",
            Level::B2 => "B2",
            Level::C1 => "C1",
            Level::C2 => "C2",
        }
    }

    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A1" => Some(Level::A1),
            "A2" => Some(Level::A2),
            "B1" => Some(Level::B1),
            "B2" => Some(Level::B2),
            "C1" => Some(Level::C1),
            "C2" => Some(Level::C2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CatalogEntry {
    level: Level,
    base_price: i64,
}

/// Static mapping from level to base price in minor currency units.
#[derive(Clone, Debug)]
pub struct LevelCatalog {
    prices: BTreeMap<Level, i64>,
}

impl LevelCatalog {
    /// The built-in price list used when no catalog file is configured.
    pub fn builtin() -> Self {
        Self::from_prices([
            (Level::A1, 1999),
            (Level::A2, 2999),
            (Level::B1, 4999),
            (Level::B2, 6999),
            (Level::C1, 9999),
            (Level::C2, 12999),
        ])
    }

    pub fn from_prices(prices: impl IntoIterator<Item = (Level, i64)>) -> Self {
        let mut map = BTreeMap::new();
        for (level, base_price) in prices {
            if base_price <= 0 {
                panic!(
                    "invalid base_price {} for level {} in catalog",
                    base_price, level
                );
            }
            if map.insert(level, base_price).is_some() {
                panic!("duplicate level {} in catalog", level);
            }
        }
        Self { prices: map }
    }

    /// Load a catalog from a JSON file of `[{"level": "A2", "base_price": 2999}, ...]`.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path_ref = path.as_ref();
        let bytes = fs::read(path_ref).unwrap_or_else(|err| {
            panic!(
                "failed to read level catalog from {}: {}",
                path_ref.display(),
                err
            )
        });
        let entries: Vec<CatalogEntry> = serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            panic!(
                "failed to parse level catalog from {}: {}",
                path_ref.display(),
                err
            )
        });
        Self::from_prices(entries.into_iter().map(|e| (e.level, e.base_price)))
    }

    pub fn base_price(&self, level: Level) -> Option<i64> {
        self.prices.get(&level).copied()
    }

    pub fn contains(&self, level: Level) -> bool {
        self.prices.contains_key(&level)
    }

    pub fn levels(&self) -> impl Iterator<Item = Level> + '_ {
        self.prices.keys().copied()
    }
}
