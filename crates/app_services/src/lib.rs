use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use config::{AppConfig, ConfigStore, SignInCredentials};
use core_types::{
    AUTH_TOKEN_STORAGE_KEY, Note, NoteId, NoteUpdate, THEME_STORAGE_KEY, ThemePreference,
};
use note_store::{FlushPolicy, NoteStore};
use parking_lot::Mutex;
use storage_kv::{FileKvStorage, KeyValueStorage};
use tracing::{info, warn};
use uuid::Uuid;

pub struct AppServicesBuilder {
    pub data_dir: PathBuf,
}

impl AppServicesBuilder {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Wire config, key-value storage and the note store together. The note
    /// store is initialized here; a failing storage read fails the build and
    /// the caller may retry.
    pub async fn build(self) -> Result<AppServices> {
        let config_store = ConfigStore::from_dir(self.data_dir.join("config"));
        let config = config_store.load_or_init()?;
        AppServices::with_config(
            Arc::new(FileKvStorage::new(self.data_dir.join("kv"))),
            config,
        )
        .await
    }
}

#[derive(Clone)]
pub struct AppServices {
    storage: Arc<dyn KeyValueStorage>,
    notes: NoteStore,
    theme: Arc<Mutex<ThemePreference>>,
    credentials: SignInCredentials,
}

impl AppServices {
    pub async fn with_config(
        storage: Arc<dyn KeyValueStorage>,
        config: AppConfig,
    ) -> Result<Self> {
        let policy =
            FlushPolicy::from_millis(config.flush.quiet_period_ms, config.flush.max_staleness_ms);
        let notes = NoteStore::with_policy(Arc::clone(&storage), policy);
        notes.initialize().await?;

        let theme = match storage.get(THEME_STORAGE_KEY).await {
            Ok(Some(raw)) => ThemePreference::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown persisted theme, falling back to default");
                config.default_theme
            }),
            Ok(None) => config.default_theme,
            Err(err) => {
                warn!(error = %err, "failed to load theme preference");
                config.default_theme
            }
        };

        Ok(Self {
            storage,
            notes,
            theme: Arc::new(Mutex::new(theme)),
            credentials: config.credentials,
        })
    }

    pub fn note_store(&self) -> &NoteStore {
        &self.notes
    }

    // ----- notes -----

    pub fn add_note(
        &self,
        title: &str,
        content: impl Into<String>,
        tag: Option<&str>,
    ) -> Result<Note> {
        Ok(self.notes.add_note(title, content, tag)?)
    }

    pub fn create_blank_note(&self) -> Result<Note> {
        Ok(self.notes.create_blank_note()?)
    }

    pub fn get_note_by_id(&self, id: NoteId) -> Result<Option<Note>> {
        Ok(self.notes.get_note_by_id(id)?)
    }

    pub fn get_all_notes(&self) -> Result<Vec<Note>> {
        Ok(self.notes.get_all_notes()?)
    }

    pub fn update_note(&self, id: NoteId, update: NoteUpdate) -> Result<Option<Note>> {
        Ok(self.notes.update_note(id, update)?)
    }

    pub fn delete_note(&self, id: NoteId) -> Result<bool> {
        Ok(self.notes.delete_note(id)?)
    }

    pub fn toggle_pin_note(&self, id: NoteId) -> Result<Option<Note>> {
        Ok(self.notes.toggle_pin_note(id)?)
    }

    pub fn search_notes(&self, query: &str) -> Result<Vec<Note>> {
        Ok(self.notes.search_notes(query)?)
    }

    pub async fn clear_all_notes(&self) -> bool {
        self.notes.clear_all_notes().await
    }

    pub async fn force_sync_storage(&self) -> bool {
        self.notes.force_sync_storage().await
    }

    // ----- theme -----

    pub fn theme_preference(&self) -> ThemePreference {
        *self.theme.lock()
    }

    pub fn is_dark_mode(&self, system_is_dark: bool) -> bool {
        self.theme_preference().resolve(system_is_dark)
    }

    pub async fn set_theme_preference(&self, theme: ThemePreference) -> Result<()> {
        self.storage.set(THEME_STORAGE_KEY, theme.as_str()).await?;
        *self.theme.lock() = theme;
        Ok(())
    }

    /// Flip between light and dark, resolving `system` against the device
    /// theme first.
    pub async fn toggle_theme(&self, system_is_dark: bool) -> Result<ThemePreference> {
        let next = if self.is_dark_mode(system_is_dark) {
            ThemePreference::Light
        } else {
            ThemePreference::Dark
        };
        self.set_theme_preference(next).await?;
        Ok(next)
    }

    // ----- auth -----

    /// Check credentials and persist a fresh session token. Bad credentials
    /// are a clean `false`; only storage trouble is an error.
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<bool> {
        if username != self.credentials.username || password != self.credentials.password {
            info!("sign-in rejected: invalid credentials");
            return Ok(false);
        }

        let token = Uuid::new_v4().to_string();
        self.storage.set(AUTH_TOKEN_STORAGE_KEY, &token).await?;
        info!("sign-in accepted");
        Ok(true)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.storage.remove(AUTH_TOKEN_STORAGE_KEY).await
    }

    pub async fn is_signed_in(&self) -> Result<bool> {
        Ok(self.storage.get(AUTH_TOKEN_STORAGE_KEY).await?.is_some())
    }
}
