use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;

use super::ProcessStorage;
use crate::model::ArchivedInstance;

/// Redis-backed storage. Deployments and archives written here survive engine
/// restarts, which is what makes `restore_interrupted_instances` useful.
///
/// Key layout:
///   prozess:processes                    set of definition ids
///   prozess:proc:{def}:versions          hash version -> model text
///   prozess:proc:{def}:html              hash file name -> html
///   prozess:proc:{def}:instances         hash instance id -> archive json
pub struct RedisStorage {
    client: redis::Client,
}

impl RedisStorage {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        Ok(RedisStorage { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")
    }

    fn versions_key(definition_id: &str) -> String {
        format!("prozess:proc:{definition_id}:versions")
    }

    fn html_key(definition_id: &str) -> String {
        format!("prozess:proc:{definition_id}:html")
    }

    fn instances_key(definition_id: &str) -> String {
        format!("prozess:proc:{definition_id}:instances")
    }

    const PROCESSES_KEY: &'static str = "prozess:processes";
}

#[async_trait]
impl ProcessStorage for RedisStorage {
    async fn save_process_version(
        &self,
        definition_id: &str,
        version: u64,
        model_text: &str,
    ) -> Result<()> {
        let mut con = self.conn().await?;
        let _: () = con
            .hset(Self::versions_key(definition_id), version, model_text)
            .await?;
        let _: () = con.sadd(Self::PROCESSES_KEY, definition_id).await?;
        Ok(())
    }

    async fn get_process_version(
        &self,
        definition_id: &str,
        version: u64,
    ) -> Result<Option<String>> {
        let mut con = self.conn().await?;
        let text: Option<String> = con.hget(Self::versions_key(definition_id), version).await?;
        Ok(text)
    }

    async fn get_all_processes(&self) -> Result<Vec<String>> {
        let mut con = self.conn().await?;
        let ids: Vec<String> = con.smembers(Self::PROCESSES_KEY).await?;
        Ok(ids)
    }

    async fn delete_process(&self, definition_id: &str) -> Result<()> {
        let mut con = self.conn().await?;
        let keys = [
            Self::versions_key(definition_id),
            Self::html_key(definition_id),
            Self::instances_key(definition_id),
        ];
        let _: () = con.del(&keys).await?;
        let _: () = con.srem(Self::PROCESSES_KEY, definition_id).await?;
        Ok(())
    }

    async fn save_html(&self, definition_id: &str, file_name: &str, html: &str) -> Result<()> {
        let mut con = self.conn().await?;
        let _: () = con
            .hset(Self::html_key(definition_id), file_name, html)
            .await?;
        Ok(())
    }

    async fn get_html(&self, definition_id: &str, file_name: &str) -> Result<Option<String>> {
        let mut con = self.conn().await?;
        let html: Option<String> = con.hget(Self::html_key(definition_id), file_name).await?;
        Ok(html)
    }

    async fn get_all_user_task_files(&self, definition_id: &str) -> Result<Vec<String>> {
        let mut con = self.conn().await?;
        let files: Vec<String> = con.hkeys(Self::html_key(definition_id)).await?;
        Ok(files)
    }

    async fn archive_instance(
        &self,
        definition_id: &str,
        instance_id: &str,
        archive: &ArchivedInstance,
    ) -> Result<()> {
        let json = serde_json::to_string(archive)?;
        let mut con = self.conn().await?;
        let _: () = con
            .hset(Self::instances_key(definition_id), instance_id, json)
            .await?;
        Ok(())
    }

    async fn get_archived_instances(
        &self,
        definition_id: &str,
    ) -> Result<HashMap<String, ArchivedInstance>> {
        let mut con = self.conn().await?;
        let raw: HashMap<String, String> = con.hgetall(Self::instances_key(definition_id)).await?;
        let mut archives = HashMap::with_capacity(raw.len());
        for (id, json) in raw {
            let archive: ArchivedInstance = serde_json::from_str(&json)
                .with_context(|| format!("corrupt archive for instance {id}"))?;
            archives.insert(id, archive);
        }
        Ok(archives)
    }

    async fn delete_archived_instance(&self, definition_id: &str, instance_id: &str) -> Result<()> {
        let mut con = self.conn().await?;
        let _: () = con
            .hdel(Self::instances_key(definition_id), instance_id)
            .await?;
        Ok(())
    }
}
