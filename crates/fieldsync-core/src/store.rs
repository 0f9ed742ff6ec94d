use crate::model::{Owner, Partition, PartitionKind};
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store contents are not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("record {record_id} appears twice in partition ({layer_id}, {owner_id})")]
    DuplicateRecordId {
        layer_id: String,
        owner_id: Owner,
        record_id: String,
    },
    #[error("partition ({layer_id}, {owner_id}) written twice in one update")]
    DuplicatePartition { layer_id: String, owner_id: Owner },
}

/// Repository over the three partition slices.
///
/// `write_partitions` replaces the records of every stored partition with the
/// same `(layer_id, owner_id)` wholesale and inserts the rest, so writing an
/// empty partition clears that bucket.
#[async_trait::async_trait]
pub trait PartitionStore: Send + Sync {
    async fn read_partitions(&self, kind: PartitionKind) -> Result<Vec<Partition>, StoreError>;

    async fn write_partitions(
        &self,
        kind: PartitionKind,
        partitions: Vec<Partition>,
    ) -> Result<(), StoreError>;
}

/// Reject updates that would break per-partition id uniqueness or name the
/// same bucket twice.
pub fn validate_update(partitions: &[Partition]) -> Result<(), StoreError> {
    let mut keys = HashSet::new();
    for partition in partitions {
        if let Some(record_id) = partition.duplicate_record_id() {
            return Err(StoreError::DuplicateRecordId {
                layer_id: partition.layer_id.clone(),
                owner_id: partition.owner_id.clone(),
                record_id: record_id.to_string(),
            });
        }
        if !keys.insert(partition.key()) {
            return Err(StoreError::DuplicatePartition {
                layer_id: partition.layer_id.clone(),
                owner_id: partition.owner_id.clone(),
            });
        }
    }
    Ok(())
}

/// Apply an already-validated update to one slice.
pub fn apply_update(slice: &mut Vec<Partition>, partitions: Vec<Partition>) {
    for partition in partitions {
        match slice.iter_mut().find(|p| p.key() == partition.key()) {
            Some(existing) => existing.records = partition.records,
            None => slice.push(partition),
        }
    }
}

/// In-memory store. Keeps a log of every accepted write so callers can audit
/// dispatch order.
#[derive(Default)]
pub struct MemoryStore {
    slices: RwLock<HashMap<PartitionKind, Vec<Partition>>>,
    log: Mutex<Vec<(PartitionKind, Vec<Partition>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, kind: PartitionKind, partitions: Vec<Partition>) {
        self.slices.write().await.insert(kind, partitions);
    }

    /// Every accepted write in dispatch order.
    pub async fn writes(&self) -> Vec<(PartitionKind, Vec<Partition>)> {
        self.log.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PartitionStore for MemoryStore {
    async fn read_partitions(&self, kind: PartitionKind) -> Result<Vec<Partition>, StoreError> {
        Ok(self
            .slices
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_partitions(
        &self,
        kind: PartitionKind,
        partitions: Vec<Partition>,
    ) -> Result<(), StoreError> {
        validate_update(&partitions)?;
        self.log.lock().await.push((kind, partitions.clone()));
        let mut slices = self.slices.write().await;
        apply_update(slices.entry(kind).or_default(), partitions);
        Ok(())
    }
}

/// Store backed by one JSON file per partition kind inside a directory.
pub struct JsonDirStore {
    base: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self {
            base,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, kind: PartitionKind) -> PathBuf {
        self.base.join(format!("{}.json", kind.as_str()))
    }

    async fn load(&self, kind: PartitionKind) -> Result<Vec<Partition>, StoreError> {
        let path = self.path_for(kind);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to parse partition file");
            StoreError::Serde(e)
        })
    }

    /// Uses tmp+rename so readers never see a half-written slice.
    async fn persist(&self, kind: PartitionKind, slice: &[Partition]) -> Result<(), StoreError> {
        let path = self.path_for(kind);
        let tmp = self.base.join(format!(".{}.json.tmp", kind.as_str()));
        let content = serde_json::to_string_pretty(slice)?;
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PartitionStore for JsonDirStore {
    async fn read_partitions(&self, kind: PartitionKind) -> Result<Vec<Partition>, StoreError> {
        self.load(kind).await
    }

    async fn write_partitions(
        &self,
        kind: PartitionKind,
        partitions: Vec<Partition>,
    ) -> Result<(), StoreError> {
        validate_update(&partitions)?;
        let _guard = self.write_lock.lock().await;
        let mut slice = self.load(kind).await?;
        let count = partitions.len();
        apply_update(&mut slice, partitions);
        self.persist(kind, &slice).await?;
        tracing::debug!(kind = %kind, partitions = count, "Partitions written");
        Ok(())
    }
}
