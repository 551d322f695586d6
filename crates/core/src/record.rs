//! Lead records flowing through the pipeline.
//!
//! A record is an open field map. Each stage only ever adds fields
//! (enrichment results, compliance flags); nothing upstream is removed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::denylist::normalize_phone;

/// Field set by the litigator screen.
pub const IN_LITIGATOR_LIST: &str = "in_litigator_list";

/// Field set by the DNC screen when any phone matched.
pub const IN_DNC_LIST: &str = "in_dnc_list";

const PHONE_PREFIX: &str = "phone_";

/// One lead flowing through a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Position of the record in the fetched source batch.
    pub row_index: usize,
    /// Open field map (name, address, phones, emails, stage outputs).
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create an empty record.
    pub fn new(row_index: usize) -> Self {
        Self {
            row_index,
            fields: Map::new(),
        }
    }

    /// Create a record from an existing field map.
    pub fn from_fields(row_index: usize, fields: Map<String, Value>) -> Self {
        Self { row_index, fields }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Get a raw field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a field as a string slice, if it is a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Get a field as a bool, if it is a JSON bool.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// Set a field, overwriting any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Merge stage output into the record.
    ///
    /// Existing non-null fields are kept; only new or null fields are filled.
    pub fn merge(&mut self, other: Map<String, Value>) {
        for (key, value) in other {
            match self.fields.get(&key) {
                Some(existing) if !existing.is_null() => {}
                _ => {
                    self.fields.insert(key, value);
                }
            }
        }
    }

    /// Phone fields (`phone_<n>`) in slot order, normalized.
    ///
    /// Empty or non-string values are skipped, as are numbers that do not
    /// normalize to a dialable length.
    pub fn phones(&self) -> Vec<(u32, String)> {
        let mut phones: Vec<(u32, String)> = self
            .fields
            .iter()
            .filter_map(|(key, value)| {
                let slot = phone_slot(key)?;
                let raw = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                normalize_phone(&raw).map(|phone| (slot, phone))
            })
            .collect();
        phones.sort_by_key(|(slot, _)| *slot);
        phones
    }

    /// Whether the litigator screen flagged this record.
    pub fn is_litigator(&self) -> bool {
        self.get_bool(IN_LITIGATOR_LIST).unwrap_or(false)
    }

    /// Whether the DNC screen flagged any of this record's phones.
    pub fn is_dnc(&self) -> bool {
        self.get_bool(IN_DNC_LIST).unwrap_or(false)
    }
}

/// Field name for the DNC flag of a phone slot.
pub fn dnc_field(slot: u32) -> String {
    format!("{}{}_in_dnc", PHONE_PREFIX, slot)
}

/// Parse `phone_<n>` into `n`. Anything else (including `phone_1_in_dnc`) is not a phone slot.
fn phone_slot(key: &str) -> Option<u32> {
    let rest = key.strip_prefix(PHONE_PREFIX)?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().filter(|n| *n > 0)
}

/// Compliance classification of a fully processed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    Clean,
    Litigator,
    Dnc,
    Both,
}

impl Compliance {
    /// Classify from the two screen outcomes.
    pub fn classify(litigator: bool, dnc: bool) -> Self {
        match (litigator, dnc) {
            (false, false) => Compliance::Clean,
            (true, false) => Compliance::Litigator,
            (false, true) => Compliance::Dnc,
            (true, true) => Compliance::Both,
        }
    }

    /// Classify a record from the flags set by the screening stages.
    pub fn of(record: &Record) -> Self {
        Self::classify(record.is_litigator(), record.is_dnc())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compliance::Clean => "clean",
            Compliance::Litigator => "litigator",
            Compliance::Dnc => "dnc",
            Compliance::Both => "both",
        }
    }
}
