use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use super::blob::{BlobError, BlobResult, BlobStore, CompletedPart};
use crate::digest::{ContentDigest, DigestAlgorithm};

const UPLOADS_DIR: &str = ".uploads";

/// Blob store backed by a directory, e.g. a mounted backup volume. Multipart
/// uploads are staged under `.uploads/<upload_id>/` and assembled on
/// completion with a rename, so readers never see a partial object.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> BlobResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(part) if part != UPLOADS_DIR));
        if !safe {
            return Err(BlobError::Rejected(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }

    fn upload_dir(&self, upload_id: &str) -> BlobResult<PathBuf> {
        if Uuid::parse_str(upload_id).is_err() {
            return Err(BlobError::NotFound(format!("unknown upload id '{}'", upload_id)));
        }
        Ok(self.root.join(UPLOADS_DIR).join(upload_id))
    }

    async fn write_atomically(&self, path: &Path, parts: Vec<PathBuf>) -> BlobResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| BlobError::Rejected(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent).await?;

        let temp = tempfile::Builder::new()
            .prefix(".blob-")
            .suffix(".partial")
            .tempfile_in(parent)?;
        let mut out = fs::File::from_std(temp.as_file().try_clone()?);
        for part in parts {
            let mut input = fs::File::open(&part).await?;
            tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        temp.persist(path).map_err(|e| BlobError::from(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn describe(&self, key: &str) -> String {
        format!("file://{}/{}", self.root.display(), key)
    }

    fn key_for_locator(&self, locator: &str) -> Option<String> {
        let prefix = format!("file://{}/", self.root.display());
        locator
            .strip_prefix(&prefix)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> BlobResult<()> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| BlobError::Rejected(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent).await?;
        let mut temp = tempfile::Builder::new()
            .prefix(".blob-")
            .suffix(".partial")
            .tempfile_in(parent)?;
        std::io::Write::write_all(&mut temp, &body)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| BlobError::from(e.error))?;
        Ok(())
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BlobResult<Vec<u8>> {
        let path = self.object_path(key)?;
        let mut file = fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn stat(&self, key: &str) -> BlobResult<Option<u64>> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn begin_upload(&self, key: &str) -> BlobResult<String> {
        self.object_path(key)?;
        let upload_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.upload_dir(&upload_id)?).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        body: Vec<u8>,
    ) -> BlobResult<CompletedPart> {
        self.object_path(key)?;
        let dir = self.upload_dir(upload_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(BlobError::NotFound(format!("no such upload '{}'", upload_id)));
        }
        let etag = ContentDigest::of_bytes(DigestAlgorithm::Sha256, &body).hex;
        let size = body.len() as u64;
        fs::write(dir.join(format!("{}.part", number)), &body).await?;
        Ok(CompletedPart { number, etag, size })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<()> {
        let path = self.object_path(key)?;
        let dir = self.upload_dir(upload_id)?;
        let mut files = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            if part.number as usize != index + 1 {
                return Err(BlobError::Rejected(format!(
                    "part {} listed out of order",
                    part.number
                )));
            }
            let file = dir.join(format!("{}.part", part.number));
            let on_disk = fs::read(&file).await?;
            if ContentDigest::of_bytes(DigestAlgorithm::Sha256, &on_disk).hex != part.etag {
                return Err(BlobError::Rejected(format!(
                    "etag mismatch for part {}",
                    part.number
                )));
            }
            files.push(file);
        }
        self.write_atomically(&path, files).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> BlobResult<()> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn promote(&self, from: &str, to: &str) -> BlobResult<()> {
        let source = self.object_path(from)?;
        let destination = self.object_path(to)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &destination).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_upload_is_invisible_until_complete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsBlobStore::new(dir.path());
        let key = "svc-a/snap.sql";

        let upload_id = store.begin_upload(key).await?;
        let first = store.upload_part(key, &upload_id, 1, b"hello ".to_vec()).await?;
        let second = store.upload_part(key, &upload_id, 2, b"world".to_vec()).await?;
        assert!(!store.exists(key).await?);

        store.complete_upload(key, &upload_id, &[first, second]).await?;
        assert_eq!(store.stat(key).await?, Some(11));
        assert_eq!(store.get_range(key, 6, 100).await?, b"world");
        assert!(!dir.path().join(UPLOADS_DIR).join(&upload_id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_discards_parts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsBlobStore::new(dir.path());
        let upload_id = store.begin_upload("k").await?;
        store.upload_part("k", &upload_id, 1, b"data".to_vec()).await?;
        store.abort_upload("k", &upload_id).await?;

        assert!(!store.exists("k").await?);
        assert!(matches!(
            store.upload_part("k", &upload_id, 2, b"more".to_vec()).await,
            Err(BlobError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(store.put("../escape", vec![1]).await, Err(BlobError::Rejected(_))));
        assert!(matches!(store.put("/abs", vec![1]).await, Err(BlobError::Rejected(_))));
        assert!(matches!(store.get_range("missing", 0, 1).await, Err(BlobError::NotFound(_))));
        store.delete("missing").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_promote_moves_object() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsBlobStore::new(dir.path());
        store.put("svc-a/x.sql.incoming", b"data".to_vec()).await?;
        store.put("svc-a/x.sql", b"old".to_vec()).await?;

        store.promote("svc-a/x.sql.incoming", "svc-a/x.sql").await?;
        assert!(!store.exists("svc-a/x.sql.incoming").await?);
        assert_eq!(store.get_range("svc-a/x.sql", 0, 16).await?, b"data");
        assert!(matches!(
            store.promote("svc-a/missing", "svc-a/y.sql").await,
            Err(BlobError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_locator_round_trip() {
        let store = FsBlobStore::new("/mnt/backups");
        let locator = store.describe("svc-a/x.sql");
        assert_eq!(locator, "file:///mnt/backups/svc-a/x.sql");
        assert_eq!(store.key_for_locator(&locator).as_deref(), Some("svc-a/x.sql"));
        assert_eq!(store.key_for_locator("s3://bucket/x"), None);
    }
}
