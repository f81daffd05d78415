use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use super::ProcessStorage;
use crate::model::ArchivedInstance;

/// Default storage backend. Everything lives in process memory, which is
/// enough for single-machine runs and for tests; crash recovery needs the
/// redis backend instead.
#[derive(Default)]
pub struct InMemoryStorage {
    versions: DashMap<String, HashMap<u64, String>>,
    html: DashMap<String, HashMap<String, String>>,
    archives: DashMap<String, HashMap<String, ArchivedInstance>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStorage for InMemoryStorage {
    async fn save_process_version(
        &self,
        definition_id: &str,
        version: u64,
        model_text: &str,
    ) -> Result<()> {
        self.versions
            .entry(definition_id.to_string())
            .or_default()
            .insert(version, model_text.to_string());
        Ok(())
    }

    async fn get_process_version(
        &self,
        definition_id: &str,
        version: u64,
    ) -> Result<Option<String>> {
        Ok(self
            .versions
            .get(definition_id)
            .and_then(|v| v.get(&version).cloned()))
    }

    async fn get_all_processes(&self) -> Result<Vec<String>> {
        Ok(self.versions.iter().map(|e| e.key().clone()).collect())
    }

    async fn delete_process(&self, definition_id: &str) -> Result<()> {
        self.versions.remove(definition_id);
        self.html.remove(definition_id);
        self.archives.remove(definition_id);
        Ok(())
    }

    async fn save_html(&self, definition_id: &str, file_name: &str, html: &str) -> Result<()> {
        self.html
            .entry(definition_id.to_string())
            .or_default()
            .insert(file_name.to_string(), html.to_string());
        Ok(())
    }

    async fn get_html(&self, definition_id: &str, file_name: &str) -> Result<Option<String>> {
        Ok(self
            .html
            .get(definition_id)
            .and_then(|files| files.get(file_name).cloned()))
    }

    async fn get_all_user_task_files(&self, definition_id: &str) -> Result<Vec<String>> {
        Ok(self
            .html
            .get(definition_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn archive_instance(
        &self,
        definition_id: &str,
        instance_id: &str,
        archive: &ArchivedInstance,
    ) -> Result<()> {
        self.archives
            .entry(definition_id.to_string())
            .or_default()
            .insert(instance_id.to_string(), archive.clone());
        Ok(())
    }

    async fn get_archived_instances(
        &self,
        definition_id: &str,
    ) -> Result<HashMap<String, ArchivedInstance>> {
        Ok(self
            .archives
            .get(definition_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }

    async fn delete_archived_instance(&self, definition_id: &str, instance_id: &str) -> Result<()> {
        if let Some(mut archives) = self.archives.get_mut(definition_id) {
            archives.remove(instance_id);
        }
        Ok(())
    }
}
