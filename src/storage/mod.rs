// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends and the tiered store built on top of them.

pub mod bounded;
pub mod file;
pub mod item;
pub mod memory;
pub mod tiered;
pub mod traits;

pub use bounded::{BoundedMap, BoundedMemoryBackend};
pub use file::FileBackend;
pub use item::{SetOptions, StorageItem};
pub use memory::InMemoryBackend;
pub use tiered::{MigrationReport, StoreEvent, StoreStats, TierChange, TieredStore};
pub use traits::{StorageBackend, StorageError, StorageTier};
