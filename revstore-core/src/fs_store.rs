//! Content store on the local filesystem
//!
//! Objects live under `objects/<first two hex chars>/<rest>` like git loose
//! objects. Writes stream into a temporary file while hashing and are renamed
//! into place only once the digest is known and verified.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::object::Hash;
use crate::storage::{check_digest, ContentReader, ContentStore, Result, StoreError, CHUNK_SIZE};

pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Open or create a store rooted at `root`
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("incoming"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn incoming_path(&self) -> PathBuf {
        self.root
            .join("incoming")
            .join(format!("{}.tmp", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn open(&self, hash: Hash) -> Result<ContentReader> {
        match tokio::fs::File::open(self.object_path(&hash)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::UnknownContent(hash)),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, mut reader: ContentReader, expected: Option<Hash>) -> Result<(Hash, u64)> {
        let tmp = self.incoming_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut length = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];

        let copied: Result<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                length += n as u64;
            }
            file.sync_all().await?;
            Ok::<(), StoreError>(())
        }
        .await;
        drop(file);

        let hash = Hash::from_hasher(hasher);
        if let Err(e) = copied.and_then(|_| check_digest(expected, hash)) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        let target = self.object_path(&hash);
        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_file(&tmp).await?;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&tmp, &target).await?;
        }
        Ok((hash, length))
    }

    async fn delete(&self, hash: Hash) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(&hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::UnknownContent(hash)),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, hash: Hash) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(&hash)).await?)
    }
}
