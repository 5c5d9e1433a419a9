//! Durable counters and flags that survive resets.
//!
//! Slots are addressed by a configured index and bit width. Names only exist in
//! configuration: [`StoreLayout::resolve`] turns them into typed handles once
//! at boot, so the rest of the core never deals with raw addresses.

use crate::config::{ConfigError, StorageConfig};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

pub const WORD_BITS: u8 = 32;
pub const MEMORY_STORAGE_WORDS: usize = 64;
pub const FILE_STORAGE_WORDS: u16 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("slot index {0} is outside the storage medium")]
    OutOfRange(u16),
    #[error("bit index {0} is outside a 32-bit word")]
    BitOutOfRange(u8),
    #[error("storage medium I/O failure: {0}")]
    Io(String),
    #[error("storage medium contents are corrupt: {0}")]
    Corrupt(String),
}

/// Word-addressed medium that keeps its contents across resets.
pub trait DurableStorage {
    fn read(&self, index: u16) -> Result<u32, StorageError>;

    fn write(&mut self, index: u16, value: u32) -> Result<(), StorageError>;

    fn read_bit(&self, index: u16, bit: u8) -> Result<bool, StorageError> {
        if bit >= WORD_BITS {
            return Err(StorageError::BitOutOfRange(bit));
        }
        Ok((self.read(index)? >> bit) & 1 == 1)
    }

    /// Read-modify-write of one bit. Other bits of the word are preserved.
    fn write_bit(&mut self, index: u16, bit: u8, value: bool) -> Result<(), StorageError> {
        if bit >= WORD_BITS {
            return Err(StorageError::BitOutOfRange(bit));
        }
        let word = self.read(index)?;
        let mask = 1u32 << bit;
        let next = if value { word | mask } else { word & !mask };
        self.write(index, next)
    }
}

/// A counter slot: index plus bit width in `1..=32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Counter {
    index: u16,
    width_bits: u8,
}

impl Counter {
    pub fn new(index: u16, width_bits: u8) -> Option<Self> {
        if width_bits == 0 || width_bits > WORD_BITS {
            return None;
        }
        Some(Self { index, width_bits })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn width_bits(&self) -> u8 {
        self.width_bits
    }

    /// Largest value the slot can hold.
    pub fn max_value(&self) -> u32 {
        if self.width_bits == WORD_BITS {
            u32::MAX
        } else {
            (1u32 << self.width_bits) - 1
        }
    }
}

/// One bit of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flag {
    index: u16,
    bit: u8,
}

impl Flag {
    pub fn new(index: u16, bit: u8) -> Option<Self> {
        if bit >= WORD_BITS {
            return None;
        }
        Some(Self { index, bit })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn bit(&self) -> u8 {
        self.bit
    }
}

/// Counter and flag operations over a [`DurableStorage`] medium.
#[derive(Debug)]
pub struct PersistentStore<S> {
    storage: S,
}

impl<S: DurableStorage> PersistentStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Add one, wrapping modulo `2^width`. Returns the stored value.
    pub fn increment(&mut self, counter: Counter) -> Result<u32, StorageError> {
        let current = self.get(counter)?;
        let next = current.wrapping_add(1) & counter.max_value();
        self.storage.write(counter.index, next)?;
        Ok(next)
    }

    pub fn get(&self, counter: Counter) -> Result<u32, StorageError> {
        Ok(self.storage.read(counter.index)? & counter.max_value())
    }

    /// Store `value` truncated to the slot width.
    pub fn set(&mut self, counter: Counter, value: u32) -> Result<(), StorageError> {
        self.storage.write(counter.index, value & counter.max_value())
    }

    pub fn get_flag(&self, flag: Flag) -> Result<bool, StorageError> {
        self.storage.read_bit(flag.index, flag.bit)
    }

    pub fn set_flag(&mut self, flag: Flag, value: bool) -> Result<(), StorageError> {
        self.storage.write_bit(flag.index, flag.bit, value)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

/// Typed handles for every slot the flight core uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    pub boot_count: Counter,
    pub error_count: Counter,
    pub message_count: Counter,
    pub last_reset: Counter,
    pub wake_override: Flag,
    pub radio_fsk: Flag,
}

impl StoreLayout {
    pub fn resolve(config: &StorageConfig) -> Result<Self, ConfigError> {
        let mut seen = BTreeMap::new();
        for slot in &config.slots {
            if let Some(previous) = seen.insert(slot.index, slot.name.as_str()) {
                return Err(ConfigError::invalid(
                    "storage.slots",
                    format!("`{}` and `{}` share index {}", previous, slot.name, slot.index),
                ));
            }
        }

        let counter = |name: &str| -> Result<Counter, ConfigError> {
            let slot = config
                .slots
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| ConfigError::invalid("storage.slots", format!("missing slot `{}`", name)))?;
            Counter::new(slot.index, slot.width_bits).ok_or_else(|| {
                ConfigError::invalid(
                    "storage.slots",
                    format!("slot `{}` has width {} outside 1..=32", name, slot.width_bits),
                )
            })
        };

        let flag = |name: &str| -> Result<Flag, ConfigError> {
            let entry = config
                .flags
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| ConfigError::invalid("storage.flags", format!("missing flag `{}`", name)))?;
            let slot = config.slots.iter().find(|s| s.name == entry.slot).ok_or_else(|| {
                ConfigError::invalid(
                    "storage.flags",
                    format!("flag `{}` refers to unknown slot `{}`", name, entry.slot),
                )
            })?;
            if entry.bit >= slot.width_bits {
                return Err(ConfigError::invalid(
                    "storage.flags",
                    format!("flag `{}` bit {} exceeds width of slot `{}`", name, entry.bit, slot.name),
                ));
            }
            Flag::new(slot.index, entry.bit)
                .ok_or_else(|| ConfigError::invalid("storage.flags", format!("flag `{}` bit out of range", name)))
        };

        let layout = Self {
            boot_count: counter("boot_count")?,
            error_count: counter("error_count")?,
            message_count: counter("message_count")?,
            last_reset: counter("last_reset")?,
            wake_override: flag("wake_override")?,
            radio_fsk: flag("radio_fsk")?,
        };

        let counter_indices = [
            layout.boot_count.index,
            layout.error_count.index,
            layout.message_count.index,
            layout.last_reset.index,
        ];
        for flag in [layout.wake_override, layout.radio_fsk] {
            if counter_indices.contains(&flag.index) {
                return Err(ConfigError::invalid(
                    "storage.flags",
                    format!("flag bit {} lives in a counter slot", flag.bit),
                ));
            }
        }
        if layout.wake_override == layout.radio_fsk {
            return Err(ConfigError::invalid("storage.flags", "wake_override and radio_fsk share a bit"));
        }

        Ok(layout)
    }
}

/// Volatile medium for tests. Clones share the same words, so a test can keep
/// a handle across a simulated reset.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    words: Rc<RefCell<[u32; MEMORY_STORAGE_WORDS]>>,
    failing: Rc<RefCell<Option<u16>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            words: Rc::new(RefCell::new([0; MEMORY_STORAGE_WORDS])),
            failing: Rc::new(RefCell::new(None)),
        }
    }

    /// Make every access to `index` fail with an I/O error.
    pub fn fail_slot(&self, index: Option<u16>) {
        *self.failing.borrow_mut() = index;
    }

    fn check(&self, index: u16) -> Result<usize, StorageError> {
        if *self.failing.borrow() == Some(index) {
            return Err(StorageError::Io(format!("injected failure on slot {}", index)));
        }
        let slot = usize::from(index);
        if slot >= MEMORY_STORAGE_WORDS {
            return Err(StorageError::OutOfRange(index));
        }
        Ok(slot)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStorage for MemoryStorage {
    fn read(&self, index: u16) -> Result<u32, StorageError> {
        let slot = self.check(index)?;
        Ok(self.words.borrow()[slot])
    }

    fn write(&mut self, index: u16, value: u32) -> Result<(), StorageError> {
        let slot = self.check(index)?;
        self.words.borrow_mut()[slot] = value;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileImage {
    words: BTreeMap<u16, u32>,
}

/// JSON file medium with write-through semantics. Unwritten words read as zero.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    image: FileImage,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let image = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Creating new storage image");
                FileImage::default()
            }
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        Ok(Self { path, image })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StorageError> {
        let contents = serde_json::to_string_pretty(&self.image).map_err(|e| StorageError::Io(e.to_string()))?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, contents).map_err(|e| StorageError::Io(e.to_string()))?;
        fs::rename(&staging, &self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Storage image rename failed");
            StorageError::Io(e.to_string())
        })
    }
}

impl DurableStorage for FileStorage {
    fn read(&self, index: u16) -> Result<u32, StorageError> {
        if index >= FILE_STORAGE_WORDS {
            return Err(StorageError::OutOfRange(index));
        }
        Ok(self.image.words.get(&index).copied().unwrap_or(0))
    }

    fn write(&mut self, index: u16, value: u32) -> Result<(), StorageError> {
        if index >= FILE_STORAGE_WORDS {
            return Err(StorageError::OutOfRange(index));
        }
        self.image.words.insert(index, value);
        self.flush()
    }
}
