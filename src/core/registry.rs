/// Instance registry: authoritative mapping of instance ID to metadata
use crate::core::InstanceMeta;
use crate::error::RegistryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Storage of instance metadata
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Get metadata of one instance
    async fn get(&self, id: u32) -> Result<InstanceMeta, RegistryError>;

    /// List IDs of all instances in ascending order
    async fn list(&self) -> Result<Vec<u32>, RegistryError>;

    /// Return the lowest free ID
    async fn allocate_id(&self) -> Result<u32, RegistryError>;

    /// Create or replace instance metadata
    async fn save(&self, meta: &InstanceMeta) -> Result<(), RegistryError>;

    /// Remove instance metadata
    async fn delete(&self, id: u32) -> Result<(), RegistryError>;

    /// Get metadata if the instance exists
    async fn find(&self, id: u32) -> Result<Option<InstanceMeta>, RegistryError> {
        match self.get(id).await {
            Ok(meta) => Ok(Some(meta)),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Metadata of every instance
    async fn all(&self) -> Result<Vec<InstanceMeta>, RegistryError> {
        let mut metas = Vec::new();
        for id in self.list().await? {
            if let Some(meta) = self.find(id).await? {
                metas.push(meta);
            }
        }
        Ok(metas)
    }
}

fn lowest_free_id(used: &[u32], max: u32) -> Result<u32, RegistryError> {
    (1..=max)
        .find(|id| used.binary_search(id).is_err())
        .ok_or(RegistryError::Exhausted(max))
}

/// In-memory registry used by tests and tooling
pub struct MemoryRegistry {
    instances: RwLock<BTreeMap<u32, InstanceMeta>>,
    max_instances: u32,
}

impl MemoryRegistry {
    pub fn new(max_instances: u32) -> Self {
        Self {
            instances: RwLock::new(BTreeMap::new()),
            max_instances,
        }
    }

    pub fn with_instances(max_instances: u32, metas: Vec<InstanceMeta>) -> Self {
        Self {
            instances: RwLock::new(metas.into_iter().map(|m| (m.id, m)).collect()),
            max_instances,
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl InstanceRegistry for MemoryRegistry {
    async fn get(&self, id: u32) -> Result<InstanceMeta, RegistryError> {
        let instances = self.instances.read().await;
        instances.get(&id).cloned().ok_or(RegistryError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<u32>, RegistryError> {
        let instances = self.instances.read().await;
        Ok(instances.keys().copied().collect())
    }

    async fn allocate_id(&self) -> Result<u32, RegistryError> {
        let instances = self.instances.read().await;
        let used: Vec<u32> = instances.keys().copied().collect();
        lowest_free_id(&used, self.max_instances)
    }

    async fn save(&self, meta: &InstanceMeta) -> Result<(), RegistryError> {
        let mut instances = self.instances.write().await;
        instances.insert(meta.id, meta.clone());
        Ok(())
    }

    async fn delete(&self, id: u32) -> Result<(), RegistryError> {
        let mut instances = self.instances.write().await;
        instances
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }
}

/// Registry storing one JSON document per instance under `<root>/instances`
pub struct DirRegistry {
    root: PathBuf,
    max_instances: u32,
}

impl DirRegistry {
    pub fn new<P: AsRef<Path>>(data_dir: P, max_instances: u32) -> Self {
        Self {
            root: data_dir.as_ref().join("instances"),
            max_instances,
        }
    }

    fn meta_file(&self, id: u32) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

#[async_trait]
impl InstanceRegistry for DirRegistry {
    async fn get(&self, id: u32) -> Result<InstanceMeta, RegistryError> {
        let content = match tokio::fs::read(self.meta_file(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::NotFound(id))
            }
            Err(e) => return Err(RegistryError::storage(e.to_string())),
        };

        serde_json::from_slice(&content).map_err(|e| {
            RegistryError::storage(format!("corrupted metadata of instance {}: {}", id, e))
        })
    }

    async fn list(&self) -> Result<Vec<u32>, RegistryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::storage(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RegistryError::storage(e.to_string()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_suffix(".json")
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    async fn allocate_id(&self) -> Result<u32, RegistryError> {
        let used = self.list().await?;
        lowest_free_id(&used, self.max_instances)
    }

    async fn save(&self, meta: &InstanceMeta) -> Result<(), RegistryError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RegistryError::storage(e.to_string()))?;

        let content = serde_json::to_vec_pretty(meta)
            .map_err(|e| RegistryError::storage(e.to_string()))?;

        // Write-then-rename so readers never see a half-written document
        let target = self.meta_file(meta.id);
        let temp = self.root.join(format!(".{}.json.tmp", meta.id));
        tokio::fs::write(&temp, content)
            .await
            .map_err(|e| RegistryError::storage(e.to_string()))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| RegistryError::storage(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, id: u32) -> Result<(), RegistryError> {
        match tokio::fs::remove_file(self.meta_file(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RegistryError::NotFound(id)),
            Err(e) => Err(RegistryError::storage(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_registry_allocation() {
        let registry = MemoryRegistry::new(3);
        assert_eq!(registry.allocate_id().await.unwrap(), 1);

        registry.save(&InstanceMeta::new(1, "a", "", "p")).await.unwrap();
        registry.save(&InstanceMeta::new(3, "a", "", "p")).await.unwrap();
        assert_eq!(registry.allocate_id().await.unwrap(), 2);

        registry.save(&InstanceMeta::new(2, "a", "", "p")).await.unwrap();
        assert!(matches!(
            registry.allocate_id().await,
            Err(RegistryError::Exhausted(3))
        ));
    }

    #[tokio::test]
    async fn test_dir_registry_persistence() {
        let dir = TempDir::new().unwrap();
        let registry = DirRegistry::new(dir.path(), 16);

        assert!(registry.list().await.unwrap().is_empty());

        let meta = InstanceMeta::new(5, "ops", "queue", "pass");
        registry.save(&meta).await.unwrap();
        registry.save(&InstanceMeta::new(2, "ops", "", "pass")).await.unwrap();

        assert_eq!(registry.list().await.unwrap(), vec![2, 5]);
        assert_eq!(registry.get(5).await.unwrap(), meta);
        assert_eq!(registry.allocate_id().await.unwrap(), 1);

        // A fresh handle over the same directory sees the same data
        let reopened = DirRegistry::new(dir.path(), 16);
        assert_eq!(reopened.get(5).await.unwrap().uuid, meta.uuid);
    }

    #[tokio::test]
    async fn test_dir_registry_delete() {
        let dir = TempDir::new().unwrap();
        let registry = DirRegistry::new(dir.path(), 16);

        registry.save(&InstanceMeta::new(1, "ops", "", "pass")).await.unwrap();
        registry.delete(1).await.unwrap();

        assert!(registry.find(1).await.unwrap().is_none());
        assert!(matches!(
            registry.delete(1).await,
            Err(RegistryError::NotFound(1))
        ));
    }
}
