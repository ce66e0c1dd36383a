pub mod json_repository;
pub mod repository;
pub mod sync_settings;

pub use json_repository::SyncSettingsJsonRepository;
pub use repository::{SettingsError, SettingsResult, SyncSettingsRepository};
pub use sync_settings::SyncSettings;
