use satcore::config::{ConfigError, FlagConfig, SlotConfig, StorageConfig};
use satcore::storage::*;
use std::path::PathBuf;

fn scratch_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("satcore-{}-{}.json", name, std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn test_sixteen_bit_counter_wraps_to_zero() {
    let mut store = PersistentStore::new(MemoryStorage::new());
    let counter = Counter::new(0, 16).unwrap();

    store.set(counter, 65_534).unwrap();
    assert_eq!(store.increment(counter).unwrap(), 65_535);
    assert_eq!(store.increment(counter).unwrap(), 0);
    assert_eq!(store.get(counter).unwrap(), 0);
}

#[test]
fn test_set_truncates_to_slot_width() {
    let mut store = PersistentStore::new(MemoryStorage::new());
    let counter = Counter::new(5, 8).unwrap();

    store.set(counter, 0x1234).unwrap();

    assert_eq!(store.get(counter).unwrap(), 0x34);
}

#[test]
fn test_flags_share_a_word_without_clobbering() {
    let mut store = PersistentStore::new(MemoryStorage::new());
    let low = Flag::new(4, 0).unwrap();
    let high = Flag::new(4, 7).unwrap();

    store.set_flag(low, true).unwrap();
    store.set_flag(high, true).unwrap();
    store.set_flag(low, false).unwrap();

    assert!(!store.get_flag(low).unwrap());
    assert!(store.get_flag(high).unwrap());
    assert_eq!(store.storage().read(4).unwrap(), 0x80);
}

#[test]
fn test_memory_storage_clones_share_contents() {
    let storage = MemoryStorage::new();
    let mut store = PersistentStore::new(storage.clone());
    let counter = Counter::new(0, 16).unwrap();

    store.increment(counter).unwrap();
    drop(store);

    let store = PersistentStore::new(storage);
    assert_eq!(store.get(counter).unwrap(), 1);
}

#[test]
fn test_default_layout_resolves() {
    let layout = StoreLayout::resolve(&StorageConfig::default()).unwrap();

    assert_eq!(layout.boot_count.index(), 0);
    assert_eq!(layout.boot_count.width_bits(), 16);
    assert_eq!(layout.last_reset.width_bits(), 8);
    assert_eq!(layout.wake_override.index(), layout.radio_fsk.index());
    assert_ne!(layout.wake_override.bit(), layout.radio_fsk.bit());
}

fn slot_mut<'a>(config: &'a mut StorageConfig, name: &str) -> &'a mut SlotConfig {
    config.slots.iter_mut().find(|s| s.name == name).unwrap()
}

fn flag_mut<'a>(config: &'a mut StorageConfig, name: &str) -> &'a mut FlagConfig {
    config.flags.iter_mut().find(|f| f.name == name).unwrap()
}

#[test]
fn test_layout_rejects_shared_index() {
    let mut config = StorageConfig::default();
    slot_mut(&mut config, "error_count").index = 0;

    assert!(matches!(
        StoreLayout::resolve(&config),
        Err(ConfigError::Invalid { .. })
    ));
}

#[test]
fn test_layout_rejects_bad_width() {
    let mut config = StorageConfig::default();
    slot_mut(&mut config, "message_count").width_bits = 40;
    assert!(StoreLayout::resolve(&config).is_err());

    let mut config = StorageConfig::default();
    slot_mut(&mut config, "last_reset").width_bits = 0;
    assert!(StoreLayout::resolve(&config).is_err());
}

#[test]
fn test_layout_rejects_bad_flags() {
    let mut config = StorageConfig::default();
    flag_mut(&mut config, "wake_override").slot = "boot_count".to_string();
    assert!(StoreLayout::resolve(&config).is_err());

    let mut config = StorageConfig::default();
    flag_mut(&mut config, "radio_fsk").bit = 32;
    assert!(StoreLayout::resolve(&config).is_err());

    let mut config = StorageConfig::default();
    flag_mut(&mut config, "radio_fsk").bit = 0;
    assert!(StoreLayout::resolve(&config).is_err());

    let mut config = StorageConfig::default();
    flag_mut(&mut config, "wake_override").slot = "scratch".to_string();
    assert!(StoreLayout::resolve(&config).is_err());
}

#[test]
fn test_layout_requires_every_named_slot() {
    let mut config = StorageConfig::default();
    config.slots.retain(|s| s.name != "message_count");

    assert!(StoreLayout::resolve(&config).is_err());
}

#[test]
fn test_layout_follows_configured_indices() {
    let mut config = StorageConfig::default();
    slot_mut(&mut config, "boot_count").index = 10;
    slot_mut(&mut config, "flags").index = 11;

    let layout = StoreLayout::resolve(&config).unwrap();
    assert_eq!(layout.boot_count.index(), 10);
    assert_eq!(layout.wake_override.index(), 11);
}

#[test]
fn test_file_storage_survives_reopen() {
    let path = scratch_path("reopen");
    let counter = Counter::new(2, 16).unwrap();
    let flag = Flag::new(4, 7).unwrap();

    {
        let mut store = PersistentStore::new(FileStorage::open(&path).unwrap());
        assert_eq!(store.get(counter).unwrap(), 0);
        store.increment(counter).unwrap();
        store.increment(counter).unwrap();
        store.set_flag(flag, true).unwrap();
    }

    let store = PersistentStore::new(FileStorage::open(&path).unwrap());
    assert_eq!(store.get(counter).unwrap(), 2);
    assert!(store.get_flag(flag).unwrap());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_file_storage_rejects_corrupt_image() {
    let path = scratch_path("corrupt");
    std::fs::write(&path, "not json").unwrap();

    assert!(matches!(FileStorage::open(&path), Err(StorageError::Corrupt(_))));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_file_storage_bounds() {
    let path = scratch_path("bounds");
    let mut storage = FileStorage::open(&path).unwrap();

    assert_eq!(storage.read(FILE_STORAGE_WORDS), Err(StorageError::OutOfRange(FILE_STORAGE_WORDS)));
    assert_eq!(storage.write(FILE_STORAGE_WORDS, 1), Err(StorageError::OutOfRange(FILE_STORAGE_WORDS)));

    let _ = std::fs::remove_file(&path);
}
