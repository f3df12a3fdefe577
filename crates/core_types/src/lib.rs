use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type NoteId = Uuid;

/// Fixed keys in the persistent key-value store. The note collection is a
/// single JSON array blob under `NOTES_STORAGE_KEY`.
pub const NOTES_STORAGE_KEY: &str = "user_notes";
pub const THEME_STORAGE_KEY: &str = "theme";
pub const AUTH_TOKEN_STORAGE_KEY: &str = "auth_token";

pub const DEFAULT_NOTE_TITLE: &str = "Untitled";
pub const DEFAULT_NOTE_TAG: &str = "personal";

/// A single user-authored note. Field names serialize as camelCase to stay
/// byte-compatible with the persisted blob written by earlier app versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub content: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_pinned: bool,
}

impl Note {
    /// Build a fresh note. A blank or whitespace-only title becomes
    /// `Untitled`; a missing tag becomes `personal`.
    pub fn new(title: &str, content: impl Into<String>, tag: Option<&str>) -> Self {
        let trimmed = title.trim();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: if trimmed.is_empty() {
                DEFAULT_NOTE_TITLE.to_owned()
            } else {
                trimmed.to_owned()
            },
            content: content.into(),
            tag: tag
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(DEFAULT_NOTE_TAG)
                .to_owned(),
            created_at: now,
            updated_at: now,
            is_pinned: false,
        }
    }
}

/// Partial overwrite applied by `update_note`. `None` fields keep the
/// existing value; `id` and `created_at` can never change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tag: Option<String>,
    pub is_pinned: Option<bool>,
}

impl NoteUpdate {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.is_pinned = Some(pinned);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.tag.is_none()
            && self.is_pinned.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThemePreference {
    Light,
    Dark,
    #[default]
    System,
}

impl ThemePreference {
    pub fn as_str(self) -> &'static str {
        match self {
            ThemePreference::Light => "light",
            ThemePreference::Dark => "dark",
            ThemePreference::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "light" => Some(ThemePreference::Light),
            "dark" => Some(ThemePreference::Dark),
            "system" => Some(ThemePreference::System),
            _ => None,
        }
    }

    /// Resolve to a concrete dark/light decision given the device theme.
    pub fn resolve(self, system_is_dark: bool) -> bool {
        match self {
            ThemePreference::Light => false,
            ThemePreference::Dark => true,
            ThemePreference::System => system_is_dark,
        }
    }
}
