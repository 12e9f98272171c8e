//! Filesystem provider: one JSON file per record

use crate::cursor::Cursor;
use crate::{
    check_new, DeleteTarget, IndexDefinition, ProviderError, ProviderKind, Result,
    StorageProvider,
};
use async_trait::async_trait;
use shardstore_core::{Query, Record};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Name of the file holding the running id counter
pub const COUNTER_FILE: &str = "counter";

/// Records live at `<root>/<id>.json`, the counter at `<root>/counter`
pub struct FileSystemProvider {
    root: PathBuf,
    opened: OnceCell<()>,
    counter: Mutex<()>,
}

impl FileSystemProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            opened: OnceCell::new(),
            counter: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    async fn ensure_open(&self) -> Result<()> {
        self.opened
            .get_or_try_init(|| async {
                fs::create_dir_all(&self.root).await.map_err(|e| {
                    ProviderError::BackendUnavailable(format!(
                        "cannot open {}: {}",
                        self.root.display(),
                        e
                    ))
                })?;
                info!(root = %self.root.display(), "opened filesystem provider");
                Ok::<(), ProviderError>(())
            })
            .await
            .map(|_| ())
    }

    async fn write_record(&self, id: u64, record: &Record) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.record_path(id), &bytes).await
    }

    async fn exists(&self, id: u64) -> Result<bool> {
        Ok(fs::try_exists(self.record_path(id)).await?)
    }
}

#[async_trait]
impl StorageProvider for FileSystemProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::FileSystem
    }

    async fn open(&self) -> Result<()> {
        self.ensure_open().await
    }

    async fn generate_id(&self) -> Result<u64> {
        self.ensure_open().await?;
        let _guard = self.counter.lock().await;
        let path = self.root.join(COUNTER_FILE);
        let current = match fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                ProviderError::Serialization(format!("corrupt counter file: {}", e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let next = current + 1;
        write_atomic(&path, next.to_string().as_bytes()).await?;
        Ok(next)
    }

    #[instrument(skip(self, record), fields(root = %self.root.display()))]
    async fn create(&self, mut record: Record) -> Result<u64> {
        check_new(&record)?;
        let id = self.generate_id().await?;
        record.set_id(id);
        self.write_record(id, &record).await?;
        debug!(id, "created record");
        Ok(id)
    }

    #[instrument(skip(self, record), fields(root = %self.root.display()))]
    async fn insert(&self, record: Record) -> Result<u64> {
        self.ensure_open().await?;
        let id = record.require_id("insert")?;
        if self.exists(id).await? {
            return Err(ProviderError::DuplicateKey(format!("id {}", id)));
        }
        self.write_record(id, &record).await?;
        debug!(id, "inserted record");
        Ok(id)
    }

    async fn get(&self, id: u64) -> Result<Record> {
        self.ensure_open().await?;
        read_record(&self.record_path(id)).await?.ok_or(ProviderError::NotFound(id))
    }

    #[instrument(skip(self, record), fields(root = %self.root.display()))]
    async fn update(&self, record: Record) -> Result<()> {
        self.ensure_open().await?;
        let id = record.require_id("update")?;
        if !self.exists(id).await? {
            return Err(ProviderError::NotFound(id));
        }
        self.write_record(id, &record).await
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        self.ensure_open().await?;
        match target {
            DeleteTarget::Id(id) => remove_if_present(&self.record_path(id)).await,
            DeleteTarget::Query(query) => {
                let predicate = query.predicate()?;
                let mut removed = 0;
                for record in scan(&self.root).await? {
                    if !predicate.matches(&record) {
                        continue;
                    }
                    if let Some(id) = record.id() {
                        removed += remove_if_present(&self.record_path(id)).await?;
                    }
                }
                Ok(removed)
            }
        }
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        let root = self.root.clone();
        Ok(Cursor::postponed(move || {
            let root = root.clone();
            Box::pin(async move { scan(&root).await })
        })
        .matching(query))
    }

    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        debug!(fields = ?definition.fields, "filesystem provider ignores index");
        Ok(())
    }
}

/// Write through a sibling temp file so readers never see a partial value.
/// Each write gets its own temp name; concurrent writers of one path race
/// only on the final rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let written = match fs::write(&tmp, bytes).await {
        Ok(()) => fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&tmp).await {
            if cleanup.kind() != ErrorKind::NotFound {
                warn!(tmp = %tmp.display(), error = %cleanup, "could not remove temp file");
            }
        }
        return Err(e.into());
    }
    Ok(())
}

async fn read_record(path: &Path) -> Result<Option<Record>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_present(path: &Path) -> Result<usize> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(1),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Every record under `root`, ordered by id
async fn scan(root: &Path) -> Result<Vec<Record>> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();

    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        // a concurrent delete may win the race against the directory listing
        if let Some(record) = read_record(&root.join(format!("{}.json", id))).await? {
            records.push(record);
        }
    }
    Ok(records)
}
