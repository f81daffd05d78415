use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::model::{ArchivedInstance, ProcessModel};

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryStorage;
pub use self::redis::RedisStorage;

/// Persistence behind deployments and instance archives. Process models are
/// stored as their serialized text so the stored bytes survive round trips
/// between machines unchanged.
#[async_trait]
pub trait ProcessStorage: Send + Sync {
    async fn save_process_version(
        &self,
        definition_id: &str,
        version: u64,
        model_text: &str,
    ) -> Result<()>;

    async fn get_process_version(&self, definition_id: &str, version: u64)
        -> Result<Option<String>>;

    /// Ids of all definitions with at least one stored version.
    async fn get_all_processes(&self) -> Result<Vec<String>>;

    /// Drops a definition with all versions, html files and archives.
    async fn delete_process(&self, definition_id: &str) -> Result<()>;

    async fn save_html(&self, definition_id: &str, file_name: &str, html: &str) -> Result<()>;

    async fn get_html(&self, definition_id: &str, file_name: &str) -> Result<Option<String>>;

    async fn get_all_user_task_files(&self, definition_id: &str) -> Result<Vec<String>>;

    async fn archive_instance(
        &self,
        definition_id: &str,
        instance_id: &str,
        archive: &ArchivedInstance,
    ) -> Result<()>;

    async fn get_archived_instances(
        &self,
        definition_id: &str,
    ) -> Result<HashMap<String, ArchivedInstance>>;

    async fn delete_archived_instance(&self, definition_id: &str, instance_id: &str) -> Result<()>;

    async fn get_archived_instance(
        &self,
        definition_id: &str,
        instance_id: &str,
    ) -> Result<Option<ArchivedInstance>> {
        let mut all = self.get_archived_instances(definition_id).await?;
        Ok(all.remove(instance_id))
    }

    /// A version is executable once every user task file and every imported
    /// process version it references is stored too.
    async fn is_process_version_valid(&self, definition_id: &str, version: u64) -> Result<bool> {
        let Some(text) = self.get_process_version(definition_id, version).await? else {
            return Ok(false);
        };
        let Ok(model) = ProcessModel::parse(&text) else {
            return Ok(false);
        };
        let stored_files = self.get_all_user_task_files(definition_id).await?;
        for file in model.user_task_files() {
            if !stored_files.contains(&file) {
                return Ok(false);
            }
        }
        for import in &model.imports {
            if self
                .get_process_version(&import.definition_id, import.version)
                .await?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
