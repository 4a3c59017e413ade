//! Canonical class taxonomy and the raw-label normalizer.
//!
//! Detector labels arrive in any case, with stray whitespace, and in English or
//! Indonesian. They are folded into a closed set of classes; anything not in
//! the table becomes [`CanonicalClass::Unknown`] rather than a guessed class,
//! so unrecognized labels never inflate the counts of a real class.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Bicycle,
    Person,
    Animal,
    Unknown,
}

impl CanonicalClass {
    pub const ALL: [CanonicalClass; 8] = [
        CanonicalClass::Car,
        CanonicalClass::Motorcycle,
        CanonicalClass::Bus,
        CanonicalClass::Truck,
        CanonicalClass::Bicycle,
        CanonicalClass::Person,
        CanonicalClass::Animal,
        CanonicalClass::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalClass::Car => "car",
            CanonicalClass::Motorcycle => "motorcycle",
            CanonicalClass::Bus => "bus",
            CanonicalClass::Truck => "truck",
            CanonicalClass::Bicycle => "bicycle",
            CanonicalClass::Person => "person",
            CanonicalClass::Animal => "animal",
            CanonicalClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CanonicalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0:?} is not a canonical class")]
pub struct UnknownClassName(pub String);

/// Strict parse of a canonical class name (case-insensitive, trimmed).
/// Synonyms are not accepted here; use [`LabelNormalizer`] for raw labels.
impl FromStr for CanonicalClass {
    type Err = UnknownClassName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        CanonicalClass::ALL
            .into_iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| UnknownClassName(s.to_string()))
    }
}

const BUILTIN_LABELS: &[(&str, CanonicalClass)] = &[
    // car
    ("car", CanonicalClass::Car),
    ("cars", CanonicalClass::Car),
    ("automobile", CanonicalClass::Car),
    ("sedan", CanonicalClass::Car),
    ("suv", CanonicalClass::Car),
    ("van", CanonicalClass::Car),
    ("minivan", CanonicalClass::Car),
    ("taxi", CanonicalClass::Car),
    ("jeep", CanonicalClass::Car),
    ("mobil", CanonicalClass::Car),
    ("mobil penumpang", CanonicalClass::Car),
    // motorcycle
    ("motorcycle", CanonicalClass::Motorcycle),
    ("motorcycles", CanonicalClass::Motorcycle),
    ("motorbike", CanonicalClass::Motorcycle),
    ("motor bike", CanonicalClass::Motorcycle),
    ("scooter", CanonicalClass::Motorcycle),
    ("moped", CanonicalClass::Motorcycle),
    ("motor", CanonicalClass::Motorcycle),
    ("sepeda motor", CanonicalClass::Motorcycle),
    ("motor cycle", CanonicalClass::Motorcycle),
    // bus
    ("bus", CanonicalClass::Bus),
    ("buses", CanonicalClass::Bus),
    ("minibus", CanonicalClass::Bus),
    ("coach", CanonicalClass::Bus),
    ("bis", CanonicalClass::Bus),
    ("bus kota", CanonicalClass::Bus),
    // truck
    ("truck", CanonicalClass::Truck),
    ("trucks", CanonicalClass::Truck),
    ("lorry", CanonicalClass::Truck),
    ("pickup", CanonicalClass::Truck),
    ("pickup truck", CanonicalClass::Truck),
    ("truk", CanonicalClass::Truck),
    ("mobil barang", CanonicalClass::Truck),
    // bicycle
    ("bicycle", CanonicalClass::Bicycle),
    ("bicycles", CanonicalClass::Bicycle),
    ("bike", CanonicalClass::Bicycle),
    ("cycle", CanonicalClass::Bicycle),
    ("sepeda", CanonicalClass::Bicycle),
    // person
    ("person", CanonicalClass::Person),
    ("people", CanonicalClass::Person),
    ("pedestrian", CanonicalClass::Person),
    ("human", CanonicalClass::Person),
    ("man", CanonicalClass::Person),
    ("woman", CanonicalClass::Person),
    ("child", CanonicalClass::Person),
    ("orang", CanonicalClass::Person),
    ("manusia", CanonicalClass::Person),
    ("pejalan kaki", CanonicalClass::Person),
    // animal
    ("animal", CanonicalClass::Animal),
    ("bird", CanonicalClass::Animal),
    ("cat", CanonicalClass::Animal),
    ("dog", CanonicalClass::Animal),
    ("horse", CanonicalClass::Animal),
    ("sheep", CanonicalClass::Animal),
    ("cow", CanonicalClass::Animal),
    ("goat", CanonicalClass::Animal),
    ("hewan", CanonicalClass::Animal),
    ("binatang", CanonicalClass::Animal),
    ("burung", CanonicalClass::Animal),
    ("kucing", CanonicalClass::Animal),
    ("anjing", CanonicalClass::Animal),
    ("kuda", CanonicalClass::Animal),
    ("domba", CanonicalClass::Animal),
    ("sapi", CanonicalClass::Animal),
    ("kambing", CanonicalClass::Animal),
    ("unknown", CanonicalClass::Unknown),
];

/// Maps raw detector labels to canonical classes.
#[derive(Debug, Clone)]
pub struct LabelNormalizer {
    table: HashMap<String, CanonicalClass>,
}

impl Default for LabelNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelNormalizer {
    /// Normalizer with the built-in table only.
    pub fn new() -> Self {
        let table = BUILTIN_LABELS
            .iter()
            .map(|(raw, class)| (label_key(raw), *class))
            .collect();
        Self { table }
    }

    /// Built-in table plus configured aliases. Aliases win on conflict.
    pub fn with_aliases(aliases: &BTreeMap<String, CanonicalClass>) -> Self {
        let mut normalizer = Self::new();
        for (raw, class) in aliases {
            normalizer.table.insert(label_key(raw), *class);
        }
        normalizer
    }

    pub fn normalize(&self, raw: &str) -> CanonicalClass {
        match self.table.get(&label_key(raw)) {
            Some(class) => *class,
            None => {
                debug!(label = %raw, "unrecognized detector label, recording as unknown");
                CanonicalClass::Unknown
            }
        }
    }
}

/// Lowercase, treat `_` and `-` as spaces, collapse runs of whitespace.
fn label_key(raw: &str) -> String {
    raw.to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
