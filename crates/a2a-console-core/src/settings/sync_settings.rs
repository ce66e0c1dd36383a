use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for persistence and synchronization.
///
/// Every field has a default so partial files load cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub persistence_enabled: bool,
    /// Remote store root; `None` keeps everything in memory
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    #[serde(default = "default_periodic_save_threshold")]
    pub periodic_save_threshold: usize,
    #[serde(default = "default_load_cooldown_ms")]
    pub load_cooldown_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_debug_events")]
    pub max_debug_events: usize,
}

fn default_true() -> bool {
    true
}

fn default_save_debounce_ms() -> u64 {
    500
}

fn default_periodic_save_threshold() -> usize {
    20
}

fn default_load_cooldown_ms() -> u64 {
    2_000
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    50
}

fn default_max_debug_events() -> usize {
    500
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            persistence_enabled: default_true(),
            base_url: None,
            api_token: None,
            save_debounce_ms: default_save_debounce_ms(),
            periodic_save_threshold: default_periodic_save_threshold(),
            load_cooldown_ms: default_load_cooldown_ms(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            max_debug_events: default_max_debug_events(),
        }
    }
}

impl SyncSettings {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn load_cooldown(&self) -> Duration {
        Duration::from_millis(self.load_cooldown_ms)
    }

    /// Same settings with persistence turned off
    pub fn disabled() -> Self {
        Self {
            persistence_enabled: false,
            ..Self::default()
        }
    }
}
