// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across reelpool.
//!
//! This module provides unified type definitions to avoid duplication.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Position in the ordered content sequence.
pub type SlotIndex = usize;

/// Opaque, stable identifier of one content item.
///
/// Used as the cache key, the download identity key and the listener dedup
/// key. Equality is exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentLocator(String);

impl ContentLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentLocator {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContentLocator {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ContentLocator {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The immutable, ordered list of locators a pool/scheduler pairing works on.
///
/// Cheap to clone; all clones share the same backing list.
#[derive(Debug, Clone)]
pub struct Feed {
    items: Arc<[ContentLocator]>,
}

impl Feed {
    pub fn new<I, L>(items: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<ContentLocator>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Locator at `slot`, or `None` when the slot is out of bounds.
    pub fn get(&self, slot: SlotIndex) -> Option<&ContentLocator> {
        self.items.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentLocator> {
        self.items.iter()
    }
}
