use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use core_types::{NOTES_STORAGE_KEY, Note, NoteId, NoteUpdate};
use parking_lot::{Mutex, MutexGuard};
use storage_kv::KeyValueStorage;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum NoteStoreError {
    #[error("note store is not initialized")]
    NotInitialized,
    #[error("failed to read persisted notes")]
    StorageRead(#[source] anyhow::Error),
}

/// Tuning for the deferred persistence task.
///
/// `quiet_period` is the debounce window: a write happens once no mutation
/// has arrived for this long. `max_staleness` bounds how far the persisted
/// blob may lag behind memory under sustained mutation; a recurring timer
/// flushes whenever unflushed changes exist, so a busy editing session can
/// never starve persistence.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub quiet_period: Duration,
    pub max_staleness: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(500),
            max_staleness: Duration::from_secs(5),
        }
    }
}

impl FlushPolicy {
    pub fn from_millis(quiet_period_ms: u64, max_staleness_ms: u64) -> Self {
        Self {
            quiet_period: Duration::from_millis(quiet_period_ms),
            max_staleness: Duration::from_millis(max_staleness_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    Failed,
}

struct CacheState {
    lifecycle: Lifecycle,
    notes: Vec<Note>,
}

#[derive(Default)]
struct FlushSignal {
    dirty: AtomicBool,
    changed: Notify,
}

struct Inner {
    storage: Arc<dyn KeyValueStorage>,
    cache: Mutex<CacheState>,
    signal: Arc<FlushSignal>,
    flusher: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

/// In-memory note collection with debounced write-back to a key-value store.
///
/// The collection is the single source of truth for the process lifetime;
/// the persisted blob is an at-most-effort mirror whose staleness is bounded
/// by [`FlushPolicy`]. Callers always receive copies, never the live cache.
///
/// Must be constructed inside a tokio runtime (the flusher task is spawned
/// at construction). Clones share one cache and one flusher.
#[derive(Clone)]
pub struct NoteStore {
    inner: Arc<Inner>,
}

impl NoteStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_policy(storage, FlushPolicy::default())
    }

    pub fn with_policy(storage: Arc<dyn KeyValueStorage>, policy: FlushPolicy) -> Self {
        let signal = Arc::new(FlushSignal::default());
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let flusher = tokio::spawn(flush_loop(Arc::clone(&signal), weak.clone(), policy));
            Inner {
                storage,
                cache: Mutex::new(CacheState {
                    lifecycle: Lifecycle::Uninitialized,
                    notes: Vec::new(),
                }),
                signal: Arc::clone(&signal),
                flusher,
            }
        });
        Self { inner }
    }

    /// Load the persisted collection. A missing blob is an empty collection;
    /// an unparseable blob is discarded and the persisted state healed back
    /// to `[]`. Only a failing storage *read* leaves the store `Failed`, and
    /// the caller may retry. Idempotent once `Ready`.
    pub async fn initialize(&self) -> Result<(), NoteStoreError> {
        if self.inner.cache.lock().lifecycle == Lifecycle::Ready {
            return Ok(());
        }

        let raw = match self.inner.storage.get(NOTES_STORAGE_KEY).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "note store initialization failed");
                self.inner.cache.lock().lifecycle = Lifecycle::Failed;
                return Err(NoteStoreError::StorageRead(err));
            }
        };

        let mut corrupt = false;
        let notes = match raw {
            None => Vec::new(),
            Some(raw) => serde_json::from_str::<Vec<Note>>(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "corrupt note storage detected, resetting to empty");
                corrupt = true;
                Vec::new()
            }),
        };

        if corrupt {
            // Self-heal the persisted blob. A failing write is not fatal:
            // the dirty flag keeps the flusher retrying.
            if let Err(err) = self.inner.storage.set(NOTES_STORAGE_KEY, "[]").await {
                warn!(error = %err, "failed to heal corrupt note storage");
                self.schedule_flush();
            }
        }

        let mut cache = self.inner.cache.lock();
        info!(count = notes.len(), "note store initialized");
        cache.notes = notes;
        cache.lifecycle = Lifecycle::Ready;
        Ok(())
    }

    /// Create a note and place it at the front of the collection.
    pub fn add_note(
        &self,
        title: &str,
        content: impl Into<String>,
        tag: Option<&str>,
    ) -> Result<Note, NoteStoreError> {
        let note = Note::new(title, content, tag);
        let mut cache = self.ready_cache()?;
        cache.notes.insert(0, note.clone());
        drop(cache);
        self.schedule_flush();
        Ok(note)
    }

    /// Convenience wrapper: a blank note with the fixed defaults.
    pub fn create_blank_note(&self) -> Result<Note, NoteStoreError> {
        self.add_note(core_types::DEFAULT_NOTE_TITLE, "", None)
    }

    pub fn get_note_by_id(&self, id: NoteId) -> Result<Option<Note>, NoteStoreError> {
        let cache = self.ready_cache()?;
        Ok(cache.notes.iter().find(|note| note.id == id).cloned())
    }

    /// Snapshot of the whole collection in current order.
    pub fn get_all_notes(&self) -> Result<Vec<Note>, NoteStoreError> {
        let cache = self.ready_cache()?;
        Ok(cache.notes.clone())
    }

    /// Shallow overwrite of the provided fields. Returns `None` when no note
    /// has this id. The note keeps its position in the collection.
    pub fn update_note(
        &self,
        id: NoteId,
        update: NoteUpdate,
    ) -> Result<Option<Note>, NoteStoreError> {
        let mut cache = self.ready_cache()?;
        let Some(note) = cache.notes.iter_mut().find(|note| note.id == id) else {
            return Ok(None);
        };

        if let Some(title) = update.title {
            note.title = title;
        }
        if let Some(content) = update.content {
            note.content = content;
        }
        if let Some(tag) = update.tag {
            note.tag = tag;
        }
        if let Some(is_pinned) = update.is_pinned {
            note.is_pinned = is_pinned;
        }
        note.updated_at = Utc::now();
        let updated = note.clone();

        drop(cache);
        self.schedule_flush();
        Ok(Some(updated))
    }

    /// Returns whether a removal occurred; a flush is scheduled only then.
    pub fn delete_note(&self, id: NoteId) -> Result<bool, NoteStoreError> {
        let mut cache = self.ready_cache()?;
        let before = cache.notes.len();
        cache.notes.retain(|note| note.id != id);
        let removed = cache.notes.len() != before;
        drop(cache);

        if removed {
            self.schedule_flush();
        }
        Ok(removed)
    }

    pub fn toggle_pin_note(&self, id: NoteId) -> Result<Option<Note>, NoteStoreError> {
        let Some(note) = self.get_note_by_id(id)? else {
            return Ok(None);
        };
        self.update_note(id, NoteUpdate::default().pinned(!note.is_pinned))
    }

    /// Case- and punctuation-insensitive substring search over title and
    /// content. An empty query matches every note.
    pub fn search_notes(&self, query: &str) -> Result<Vec<Note>, NoteStoreError> {
        let term = normalize_for_search(query);
        let cache = self.ready_cache()?;
        Ok(cache
            .notes
            .iter()
            .filter(|note| {
                normalize_for_search(&note.title).contains(&term)
                    || normalize_for_search(&note.content).contains(&term)
            })
            .cloned()
            .collect())
    }

    /// Empty the collection and persist immediately, bypassing the debounce.
    /// Returns success as a boolean and never fails the caller.
    pub async fn clear_all_notes(&self) -> bool {
        {
            let mut cache = match self.ready_cache() {
                Ok(cache) => cache,
                Err(_) => {
                    warn!("clear_all_notes called before initialization");
                    return false;
                }
            };
            cache.notes.clear();
            // Claim the pending work while still holding the lock. A mutation
            // that lands during the write below sets the flag again and gets
            // flushed on its own schedule; clearing it after the await would
            // erase that and leave a stale blob with nothing re-arming.
            self.inner.signal.dirty.store(false, Ordering::SeqCst);
        }

        match self.inner.storage.set(NOTES_STORAGE_KEY, "[]").await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "failed to clear persisted notes");
                self.schedule_flush();
                false
            }
        }
    }

    /// Persist whatever the cache currently holds, regardless of debounce
    /// state. Returns success as a boolean.
    pub async fn force_sync_storage(&self) -> bool {
        // Same claim-before-snapshot ordering as the flusher: the flag comes
        // down under the cache lock, so any mutation not captured in the
        // payload re-marks it afterwards.
        let payload = {
            let cache = self.inner.cache.lock();
            self.inner.signal.dirty.store(false, Ordering::SeqCst);
            serde_json::to_string(&cache.notes)
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to serialize notes for sync");
                self.schedule_flush();
                return false;
            }
        };

        match self.inner.storage.set(NOTES_STORAGE_KEY, &payload).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "force sync failed");
                self.schedule_flush();
                false
            }
        }
    }

    fn ready_cache(&self) -> Result<MutexGuard<'_, CacheState>, NoteStoreError> {
        let cache = self.inner.cache.lock();
        if cache.lifecycle != Lifecycle::Ready {
            return Err(NoteStoreError::NotInitialized);
        }
        Ok(cache)
    }

    fn schedule_flush(&self) {
        self.inner.signal.dirty.store(true, Ordering::SeqCst);
        self.inner.signal.changed.notify_one();
    }
}

/// Background persistence task. Two timers: a resettable quiet-period wait
/// coalescing mutation bursts, and a recurring max-staleness interval that
/// flushes whenever unflushed changes exist. The task holds only a weak
/// handle to the store and is aborted when the last store clone drops.
async fn flush_loop(signal: Arc<FlushSignal>, inner: Weak<Inner>, policy: FlushPolicy) {
    // interval() panics on a zero period; a hand-edited config can hold one
    let mut staleness = time::interval(policy.max_staleness.max(Duration::from_millis(1)));
    staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    staleness.tick().await;

    let mut quiet_deadline: Option<time::Instant> = None;

    loop {
        tokio::select! {
            _ = signal.changed.notified() => {
                // every mutation re-arms the quiet period
                quiet_deadline = Some(time::Instant::now() + policy.quiet_period);
            }
            _ = quiet_elapsed(quiet_deadline) => {
                quiet_deadline = None;
                flush_if_dirty(&signal, &inner).await;
                staleness.reset();
            }
            _ = staleness.tick() => {
                // bounds staleness under sustained mutation, when the quiet
                // period never gets a chance to elapse
                flush_if_dirty(&signal, &inner).await;
            }
        }
    }
}

async fn quiet_elapsed(deadline: Option<time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn flush_if_dirty(signal: &FlushSignal, inner: &Weak<Inner>) {
    if !signal.dirty.swap(false, Ordering::SeqCst) {
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };

    // Serialize whatever the cache holds right now, not a snapshot from
    // scheduling time.
    let payload = {
        let cache = inner.cache.lock();
        serde_json::to_string(&cache.notes)
    };
    let payload = match payload {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to serialize notes for flush");
            return;
        }
    };

    match inner.storage.set(NOTES_STORAGE_KEY, &payload).await {
        Ok(()) => debug!(bytes = payload.len(), "flushed notes to storage"),
        Err(err) => {
            // In-memory state is unaffected; re-arm so the staleness timer
            // retries on its next tick.
            warn!(error = %err, "deferred note flush failed");
            signal.dirty.store(true, Ordering::SeqCst);
        }
    }
}

fn normalize_for_search(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use storage_kv::MemoryKvStorage;

    use super::*;

    /// Wraps the in-memory storage with write counting and fault injection.
    #[derive(Default)]
    struct RecordingStorage {
        inner: MemoryKvStorage,
        writes: AtomicUsize,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl RecordingStorage {
        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyValueStorage for RecordingStorage {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                anyhow::bail!("injected read failure");
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("injected write failure");
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key).await
        }
    }

    /// Holds the next `set` call at its entry until the test releases it,
    /// so a mutation can be interleaved with an in-flight write.
    #[derive(Default)]
    struct GatedStorage {
        inner: MemoryKvStorage,
        gate_armed: AtomicBool,
        write_entered: Notify,
        release: Notify,
    }

    impl GatedStorage {
        fn arm_gate(&self) {
            self.gate_armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KeyValueStorage for GatedStorage {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            if self.gate_armed.swap(false, Ordering::SeqCst) {
                self.write_entered.notify_one();
                self.release.notified().await;
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key).await
        }
    }

    async fn ready_store() -> (NoteStore, Arc<MemoryKvStorage>) {
        let storage = Arc::new(MemoryKvStorage::new());
        let store = NoteStore::new(storage.clone());
        store.initialize().await.expect("initialize");
        (store, storage)
    }

    fn burst_policy() -> FlushPolicy {
        // short quiet period, staleness effectively disabled
        FlushPolicy::from_millis(25, 60_000)
    }

    #[tokio::test]
    async fn operations_fail_before_initialization() {
        let store = NoteStore::new(Arc::new(MemoryKvStorage::new()));

        assert!(matches!(
            store.add_note("a", "b", None),
            Err(NoteStoreError::NotInitialized)
        ));
        assert!(matches!(
            store.get_all_notes(),
            Err(NoteStoreError::NotInitialized)
        ));
        assert!(matches!(
            store.search_notes("x"),
            Err(NoteStoreError::NotInitialized)
        ));
        assert!(matches!(
            store.delete_note(NoteId::new_v4()),
            Err(NoteStoreError::NotInitialized)
        ));
        assert!(!store.clear_all_notes().await);
    }

    #[tokio::test]
    async fn initialize_with_missing_blob_starts_empty() {
        let (store, _) = ready_store().await;
        assert!(store.get_all_notes().expect("get all").is_empty());

        // idempotent
        store.initialize().await.expect("re-initialize");
    }

    #[tokio::test]
    async fn add_note_applies_defaults_and_front_ordering() {
        let (store, _) = ready_store().await;

        let blank = store.add_note("  ", "body", None).expect("add blank");
        assert_eq!(blank.title, "Untitled");
        assert_eq!(blank.tag, "personal");
        assert!(!blank.is_pinned);

        let a = store.add_note("A", "", None).expect("add a");
        let b = store.add_note("B", "", None).expect("add b");

        let all = store.get_all_notes().expect("get all");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, b.id);
        assert_eq!(all[1].id, a.id);

        let mut ids: Vec<NoteId> = all.iter().map(|note| note.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn update_preserves_identity_and_position() {
        let (store, _) = ready_store().await;
        let a = store.add_note("A", "", None).expect("add a");
        let b = store.add_note("B", "", None).expect("add b");
        let _c = store.add_note("C", "", None).expect("add c");

        std::thread::sleep(Duration::from_millis(5));
        let updated = store
            .update_note(b.id, NoteUpdate::default().content("edited"))
            .expect("update")
            .expect("note exists");

        assert_eq!(updated.id, b.id);
        assert_eq!(updated.created_at, b.created_at);
        assert!(updated.updated_at > b.updated_at);
        assert_eq!(updated.content, "edited");
        assert_eq!(updated.title, "B");

        let all = store.get_all_notes().expect("get all");
        assert_eq!(all[1].id, b.id);
        assert_eq!(all[1].content, "edited");
        assert_eq!(all[2].id, a.id);

        assert!(
            store
                .update_note(NoteId::new_v4(), NoteUpdate::default().title("x"))
                .expect("update missing")
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_reports_whether_a_removal_occurred() {
        let (store, _) = ready_store().await;
        let note = store.add_note("A", "", None).expect("add");

        assert!(!store.delete_note(NoteId::new_v4()).expect("delete missing"));
        assert_eq!(store.get_all_notes().expect("get all").len(), 1);

        assert!(store.delete_note(note.id).expect("delete"));
        assert!(store.get_all_notes().expect("get all").is_empty());
    }

    #[tokio::test]
    async fn get_all_notes_returns_a_defensive_copy() {
        let (store, _) = ready_store().await;
        store.add_note("A", "body", None).expect("add");

        let mut copy = store.get_all_notes().expect("get all");
        copy[0].title = "mutated".to_owned();
        copy.clear();

        let again = store.get_all_notes().expect("get all again");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].title, "A");
    }

    #[tokio::test]
    async fn toggle_pin_twice_restores_original_state() {
        let (store, _) = ready_store().await;
        let note = store.add_note("A", "", None).expect("add");

        let once = store
            .toggle_pin_note(note.id)
            .expect("toggle")
            .expect("exists");
        assert!(once.is_pinned);

        let twice = store
            .toggle_pin_note(note.id)
            .expect("toggle again")
            .expect("exists");
        assert!(!twice.is_pinned);

        assert!(
            store
                .toggle_pin_note(NoteId::new_v4())
                .expect("toggle missing")
                .is_none()
        );
    }

    #[tokio::test]
    async fn search_is_case_and_punctuation_insensitive() {
        let (store, _) = ready_store().await;
        store
            .add_note("Hello, World!", "greeting", None)
            .expect("add hello");
        store
            .add_note("Shopping", "buy MILK and eggs", None)
            .expect("add shopping");

        let hits = store.search_notes("hello world").expect("search title");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Hello, World!");

        let hits = store.search_notes("milk").expect("search content");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Shopping");

        assert_eq!(store.search_notes("").expect("empty query").len(), 2);
        assert!(store.search_notes("absent").expect("no hits").is_empty());
    }

    #[tokio::test]
    async fn round_trip_reproduces_identical_notes() {
        let (store, storage) = ready_store().await;
        store.add_note("A", "first", Some("work")).expect("add a");
        let b = store.add_note("B", "second", None).expect("add b");
        store.toggle_pin_note(b.id).expect("pin b");
        assert!(store.force_sync_storage().await);

        let reopened = NoteStore::new(storage);
        reopened.initialize().await.expect("re-initialize");
        assert_eq!(
            reopened.get_all_notes().expect("reopened notes"),
            store.get_all_notes().expect("original notes")
        );
    }

    #[tokio::test]
    async fn corrupt_blob_resets_and_heals_persisted_state() {
        let storage = Arc::new(MemoryKvStorage::new());
        storage
            .set(NOTES_STORAGE_KEY, r#"{"not":"an array"}"#)
            .await
            .expect("seed corrupt blob");

        let store = NoteStore::new(storage.clone());
        store.initialize().await.expect("initialize heals");
        assert!(store.get_all_notes().expect("get all").is_empty());
        assert_eq!(
            storage.get(NOTES_STORAGE_KEY).await.expect("read healed"),
            Some("[]".to_owned())
        );
    }

    #[tokio::test]
    async fn read_failure_fails_initialization_until_retried() {
        let storage = Arc::new(RecordingStorage::default());
        storage.fail_reads.store(true, Ordering::SeqCst);

        let store = NoteStore::new(storage.clone());
        assert!(matches!(
            store.initialize().await,
            Err(NoteStoreError::StorageRead(_))
        ));
        assert!(matches!(
            store.add_note("a", "", None),
            Err(NoteStoreError::NotInitialized)
        ));

        storage.fail_reads.store(false, Ordering::SeqCst);
        store.initialize().await.expect("retry succeeds");
        store.add_note("a", "", None).expect("add after retry");
    }

    #[tokio::test]
    async fn burst_of_mutations_coalesces_into_one_write() {
        let storage = Arc::new(RecordingStorage::default());
        let store = NoteStore::with_policy(storage.clone(), burst_policy());
        store.initialize().await.expect("initialize");

        for n in 0..5 {
            store.add_note(&format!("note {n}"), "", None).expect("add");
        }
        assert_eq!(storage.writes(), 0);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.writes(), 1);

        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("blob present");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 5);
    }

    #[tokio::test]
    async fn sustained_mutation_still_flushes_within_staleness_bound() {
        let storage = Arc::new(RecordingStorage::default());
        let store =
            NoteStore::with_policy(storage.clone(), FlushPolicy::from_millis(40, 120));
        store.initialize().await.expect("initialize");

        // mutate faster than the quiet period for well past max_staleness
        for n in 0..20 {
            store.add_note(&format!("note {n}"), "", None).expect("add");
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(
            storage.writes() >= 1,
            "staleness timer should have flushed during sustained mutation"
        );

        // once the burst ends, everything lands
        time::sleep(Duration::from_millis(200)).await;
        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("blob present");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 20);
    }

    #[tokio::test]
    async fn write_failure_keeps_memory_intact_and_retries() {
        let storage = Arc::new(RecordingStorage::default());
        let store =
            NoteStore::with_policy(storage.clone(), FlushPolicy::from_millis(20, 80));
        store.initialize().await.expect("initialize");

        storage.fail_writes.store(true, Ordering::SeqCst);
        store.add_note("A", "survives", None).expect("add");
        time::sleep(Duration::from_millis(60)).await;

        // flush failed but the cache did not roll back
        assert!(storage.writes() >= 1);
        assert_eq!(store.get_all_notes().expect("get all").len(), 1);
        assert!(!store.force_sync_storage().await);

        storage.fail_writes.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_millis(200)).await;

        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("retried flush landed");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].title, "A");
    }

    #[tokio::test]
    async fn clear_all_persists_immediately() {
        let (store, storage) = ready_store().await;
        store.add_note("A", "", None).expect("add a");
        store.add_note("B", "", None).expect("add b");

        assert!(store.clear_all_notes().await);
        assert!(store.get_all_notes().expect("get all").is_empty());
        assert_eq!(
            storage.get(NOTES_STORAGE_KEY).await.expect("read blob"),
            Some("[]".to_owned())
        );
    }

    #[tokio::test]
    async fn force_sync_writes_current_collection() {
        let (store, storage) = ready_store().await;
        store.add_note("A", "", None).expect("add");

        assert!(store.force_sync_storage().await);
        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("blob present");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn mutation_during_forced_sync_is_flushed_afterwards() {
        let storage = Arc::new(GatedStorage::default());
        let store = NoteStore::with_policy(storage.clone(), FlushPolicy::from_millis(20, 60));
        store.initialize().await.expect("initialize");
        store.add_note("first", "", None).expect("add first");

        storage.arm_gate();
        let sync = tokio::spawn({
            let store = store.clone();
            async move { store.force_sync_storage().await }
        });
        storage.write_entered.notified().await;

        // lands while the forced write is parked in flight
        store.add_note("second", "", None).expect("add second");

        storage.release.notify_one();
        assert!(sync.await.expect("join sync task"));

        // the racing mutation must reach storage on its own schedule
        time::sleep(Duration::from_millis(200)).await;
        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("blob present");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn mutation_during_clear_is_flushed_afterwards() {
        let storage = Arc::new(GatedStorage::default());
        let store = NoteStore::with_policy(storage.clone(), FlushPolicy::from_millis(20, 60));
        store.initialize().await.expect("initialize");
        store.add_note("doomed", "", None).expect("add doomed");

        storage.arm_gate();
        let clear = tokio::spawn({
            let store = store.clone();
            async move { store.clear_all_notes().await }
        });
        storage.write_entered.notified().await;

        let survivor = store.add_note("survivor", "", None).expect("add survivor");

        storage.release.notify_one();
        assert!(clear.await.expect("join clear task"));
        assert_eq!(store.get_all_notes().expect("get all").len(), 1);

        time::sleep(Duration::from_millis(200)).await;
        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("blob present");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, survivor.id);
    }

    #[tokio::test]
    async fn zero_staleness_window_does_not_panic_the_flusher() {
        let storage = Arc::new(RecordingStorage::default());
        let store = NoteStore::with_policy(storage.clone(), FlushPolicy::from_millis(0, 0));
        store.initialize().await.expect("initialize");

        store.add_note("A", "", None).expect("add");
        time::sleep(Duration::from_millis(100)).await;

        assert!(storage.writes() >= 1);
        let blob = storage
            .get(NOTES_STORAGE_KEY)
            .await
            .expect("read blob")
            .expect("blob present");
        let persisted: Vec<Note> = serde_json::from_str(&blob).expect("parse blob");
        assert_eq!(persisted.len(), 1);
    }
}
