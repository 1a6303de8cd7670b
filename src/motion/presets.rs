//! Named head positions.

use std::collections::BTreeMap;

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::config::PresetName;
use crate::error::{Error, Result};

/// Stored form of a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetRecord {
    /// Head position in steps.
    pub position: i64,
}

/// Registry of named positions. Saving an existing name overwrites it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresetBook {
    presets: BTreeMap<PresetName, i64>,
}

impl PresetBook {
    /// Create a new empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a book from configured presets.
    pub fn from_map(presets: &BTreeMap<PresetName, i64>) -> Self {
        Self {
            presets: presets.clone(),
        }
    }

    /// Validate a preset name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the name is empty, blank or
    /// longer than 32 bytes.
    pub fn name(name: &str) -> Result<PresetName> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("preset name is empty"));
        }
        String::try_from(name).map_err(|_| Error::InvalidArgument("preset name longer than 32 bytes"))
    }

    /// Save a position under a name (last write wins).
    pub fn save(&mut self, name: &str, position: i64) -> Result<Option<i64>> {
        let key = Self::name(name)?;
        Ok(self.presets.insert(key, position))
    }

    /// Get a preset by name.
    pub fn get(&self, name: &str) -> Option<i64> {
        let key = String::<32>::try_from(name).ok()?;
        self.presets.get(&key).copied()
    }

    /// Check if a preset exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove a preset by name.
    pub fn remove(&mut self, name: &str) -> Option<i64> {
        let key = String::<32>::try_from(name).ok()?;
        self.presets.remove(&key)
    }

    /// Get the number of presets.
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    /// Check if the book is empty.
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Get an iterator over preset names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(|s| s.as_str())
    }

    /// Get an iterator over presets, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.presets.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
