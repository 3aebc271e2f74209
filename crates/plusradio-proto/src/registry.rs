//! Station registry: favorites, recently played and broken stations, plus a
//! couple of display preferences.  Every mutation is written through to the
//! backing [`KeyValueStore`] immediately.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::{Scope, Station, StationId};
use crate::store::KeyValueStore;

pub const FAVORITES_KEY: &str = "plusRadio_favorites";
pub const RECENTLY_PLAYED_KEY: &str = "plusRadio_recentlyPlayed";
pub const BROKEN_KEY: &str = "plusRadio_brokenStations";
pub const VOLUME_KEY: &str = "plusRadio_volume";
pub const SCOPE_KEY: &str = "plusRadio_scope";

/// Maximum length of the recently-played list.
pub const RECENTLY_PLAYED_CAP: usize = 20;

pub struct StationRegistry {
    store: Box<dyn KeyValueStore>,
    favorites: Vec<StationId>,
    /// Most recent first.
    recently_played: Vec<StationId>,
    broken: BTreeSet<StationId>,
}

impl StationRegistry {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        let mut favorites: Vec<StationId> = read_slot(store.as_ref(), FAVORITES_KEY);
        dedup_keep_first(&mut favorites);
        let mut recently_played: Vec<StationId> = read_slot(store.as_ref(), RECENTLY_PLAYED_KEY);
        dedup_keep_first(&mut recently_played);
        recently_played.truncate(RECENTLY_PLAYED_CAP);
        let broken: BTreeSet<StationId> = read_slot(store.as_ref(), BROKEN_KEY);

        debug!(
            "Registry loaded: {} favorites, {} recent, {} broken",
            favorites.len(),
            recently_played.len(),
            broken.len()
        );

        Self {
            store,
            favorites,
            recently_played,
            broken,
        }
    }

    // ── favorites ─────────────────────────────────────────────────────────────

    /// Add or remove `station` from favorites.  Returns the new membership.
    pub fn toggle_favorite(&mut self, station: &Station) -> bool {
        self.toggle_favorite_id(&station.id())
    }

    pub fn toggle_favorite_id(&mut self, id: &StationId) -> bool {
        let now_favorite = match self.favorites.iter().position(|f| f == id) {
            Some(idx) => {
                self.favorites.remove(idx);
                false
            }
            None => {
                self.favorites.push(id.clone());
                true
            }
        };
        write_slot(self.store.as_mut(), FAVORITES_KEY, &self.favorites);
        now_favorite
    }

    pub fn is_favorite(&self, station: &Station) -> bool {
        self.favorites.iter().any(|f| station.is(f))
    }

    pub fn favorites(&self) -> &[StationId] {
        &self.favorites
    }

    // ── recently played ───────────────────────────────────────────────────────

    /// Move (or insert) `station` to the front, keeping at most
    /// [`RECENTLY_PLAYED_CAP`] entries.
    pub fn add_to_recently_played(&mut self, station: &Station) {
        self.recently_played.retain(|r| !station.is(r));
        self.recently_played.insert(0, station.id());
        self.recently_played.truncate(RECENTLY_PLAYED_CAP);
        write_slot(self.store.as_mut(), RECENTLY_PLAYED_KEY, &self.recently_played);
    }

    pub fn is_recent(&self, station: &Station) -> bool {
        self.recently_played.iter().any(|r| station.is(r))
    }

    pub fn recently_played(&self) -> &[StationId] {
        &self.recently_played
    }

    // ── broken ────────────────────────────────────────────────────────────────

    /// Add `station` to the broken set.  Returns false (and writes nothing)
    /// when it was already there.
    pub fn mark_broken(&mut self, station: &Station) -> bool {
        if !self.broken.insert(station.id()) {
            return false;
        }
        write_slot(self.store.as_mut(), BROKEN_KEY, &self.broken);
        true
    }

    pub fn is_broken(&self, station: &Station) -> bool {
        self.broken.contains(&station.id())
    }

    pub fn broken(&self) -> &BTreeSet<StationId> {
        &self.broken
    }

    /// Forget every broken station.  Operator-only; not reachable from the
    /// client command surface.
    pub fn reset_broken(&mut self) {
        self.broken.clear();
        write_slot(self.store.as_mut(), BROKEN_KEY, &self.broken);
    }

    // ── display preferences ───────────────────────────────────────────────────

    pub fn volume(&self) -> Option<f32> {
        read_optional(self.store.as_ref(), VOLUME_KEY)
    }

    pub fn set_volume(&mut self, volume: f32) {
        write_slot(self.store.as_mut(), VOLUME_KEY, &volume);
    }

    pub fn scope(&self) -> Option<Scope> {
        read_optional(self.store.as_ref(), SCOPE_KEY)
    }

    pub fn set_scope(&mut self, scope: &Scope) {
        write_slot(self.store.as_mut(), SCOPE_KEY, scope);
    }
}

/// Write failures are logged and swallowed.
fn write_slot<T: Serialize + ?Sized>(store: &mut dyn KeyValueStore, key: &str, value: &T) {
    let json = match serde_json::to_string(value) {
        Ok(j) => j,
        Err(e) => {
            warn!("Registry: cannot serialise {}: {}", key, e);
            return;
        }
    };
    if let Err(e) = store.set(key, &json) {
        warn!("Registry: failed to persist {}: {}", key, e);
    }
}

fn read_slot<T: DeserializeOwned + Default>(store: &dyn KeyValueStore, key: &str) -> T {
    read_optional(store, key).unwrap_or_default()
}

/// Absent and corrupt slots both read as `None`.
fn read_optional<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Registry: ignoring corrupt slot {}: {}", key, e);
            None
        }
    }
}

fn dedup_keep_first(ids: &mut Vec<StationId>) {
    let mut seen = BTreeSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn station(n: usize) -> Station {
        Station {
            name: format!("Station {}", n),
            url: format!("http://s/{}", n),
            group: "Pop".into(),
            ..Station::default()
        }
    }

    fn registry() -> (StationRegistry, MemoryStore) {
        let store = MemoryStore::new();
        (StationRegistry::new(Box::new(store.clone())), store)
    }

    #[test]
    fn test_toggle_favorite_twice_restores() {
        let (mut reg, store) = registry();
        let s = station(1);
        assert!(!reg.is_favorite(&s));
        assert!(reg.toggle_favorite(&s));
        assert!(reg.is_favorite(&s));
        assert!(!reg.toggle_favorite(&s));
        assert!(!reg.is_favorite(&s));
        assert!(reg.favorites().is_empty());
        assert_eq!(store.get(FAVORITES_KEY).as_deref(), Some("[]"));
    }

    #[test]
    fn test_favorites_never_duplicate() {
        let (mut reg, _) = registry();
        let a = station(1);
        let b = station(2);
        for _ in 0..5 {
            reg.toggle_favorite(&a);
            reg.toggle_favorite(&b);
        }
        reg.toggle_favorite(&a);
        assert_eq!(reg.favorites(), &[a.id()]);
        assert!(!reg.is_favorite(&b));
    }

    #[test]
    fn test_recently_played_moves_to_front() {
        let (mut reg, _) = registry();
        reg.add_to_recently_played(&station(1));
        reg.add_to_recently_played(&station(2));
        reg.add_to_recently_played(&station(1));
        assert_eq!(reg.recently_played(), &[station(1).id(), station(2).id()]);
    }

    #[test]
    fn test_recently_played_capped() {
        let (mut reg, _) = registry();
        for n in 0..21 {
            reg.add_to_recently_played(&station(n));
        }
        assert_eq!(reg.recently_played().len(), RECENTLY_PLAYED_CAP);
        assert_eq!(reg.recently_played()[0], station(20).id());
        assert!(!reg.is_recent(&station(0)));
        assert!(reg.is_recent(&station(1)));
    }

    #[test]
    fn test_mark_broken_idempotent() {
        let (mut reg, _) = registry();
        let s = station(3);
        assert!(reg.mark_broken(&s));
        assert!(!reg.mark_broken(&s));
        assert!(reg.is_broken(&s));
        assert_eq!(reg.broken().len(), 1);
    }

    #[test]
    fn test_broken_does_not_touch_other_sets() {
        let (mut reg, _) = registry();
        let s = station(4);
        reg.toggle_favorite(&s);
        reg.add_to_recently_played(&s);
        reg.mark_broken(&s);
        assert!(reg.is_favorite(&s));
        assert!(reg.is_recent(&s));
    }

    #[test]
    fn test_persists_across_sessions() {
        let (mut reg, store) = registry();
        reg.toggle_favorite(&station(1));
        reg.add_to_recently_played(&station(2));
        reg.mark_broken(&station(3));
        reg.set_volume(0.25);
        reg.set_scope(&Scope::Category("Jazz".into()));
        drop(reg);

        let reg = StationRegistry::new(Box::new(store));
        assert!(reg.is_favorite(&station(1)));
        assert!(reg.is_recent(&station(2)));
        assert!(reg.is_broken(&station(3)));
        assert_eq!(reg.volume(), Some(0.25));
        assert_eq!(reg.scope(), Some(Scope::Category("Jazz".into())));
    }

    #[test]
    fn test_corrupt_slots_read_as_empty() {
        let mut store = MemoryStore::new();
        store.set(FAVORITES_KEY, "not json").unwrap();
        store.set(RECENTLY_PLAYED_KEY, "{\"a\":1}").unwrap();
        store.set(BROKEN_KEY, "[1,2").unwrap();
        store.set(VOLUME_KEY, "loud").unwrap();
        let reg = StationRegistry::new(Box::new(store));
        assert!(reg.favorites().is_empty());
        assert!(reg.recently_played().is_empty());
        assert!(reg.broken().is_empty());
        assert_eq!(reg.volume(), None);
    }

    #[test]
    fn test_reset_broken() {
        let (mut reg, store) = registry();
        reg.mark_broken(&station(1));
        reg.reset_broken();
        assert!(!reg.is_broken(&station(1)));
        assert_eq!(store.get(BROKEN_KEY).as_deref(), Some("[]"));
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }

        fn set(&mut self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn test_write_failures_are_swallowed() {
        let mut reg = StationRegistry::new(Box::new(FailingStore));
        assert!(reg.toggle_favorite(&station(1)));
        reg.add_to_recently_played(&station(1));
        assert!(reg.mark_broken(&station(1)));
        assert!(reg.is_favorite(&station(1)));
    }
}
