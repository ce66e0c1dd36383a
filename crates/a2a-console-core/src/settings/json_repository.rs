use std::path::PathBuf;

use super::repository::{BoxFuture, SettingsError, SettingsResult, SyncSettingsRepository};
use super::sync_settings::SyncSettings;

pub struct SyncSettingsJsonRepository {
    file_path: PathBuf,
}

impl SyncSettingsJsonRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::PathError("Cannot determine config directory".into()))?;

        let file_path = config_dir.join("a2a-console").join("settings.json");
        Ok(Self { file_path })
    }

    /// Create repository with custom path (for testing)
    pub fn with_path(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    pub fn storage_path(&self) -> String {
        self.file_path.to_string_lossy().to_string()
    }
}

impl SyncSettingsRepository for SyncSettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, SettingsResult<SyncSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            // First run: nothing stored yet
            if !tokio::fs::try_exists(&path).await? {
                return Ok(SyncSettings::default());
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            Ok(serde_json::from_str(&contents)?)
        })
    }

    fn save(&self, settings: SyncSettings) -> BoxFuture<'static, SettingsResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let json = serde_json::to_string_pretty(&settings)?;

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }
}
