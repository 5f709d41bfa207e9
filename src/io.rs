use std::path::{Component, Path, PathBuf};

use anyhow::bail;
use tokio::fs::{create_dir_all, remove_file, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Directory-backed store for uploads, receipts and the mail outbox.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub async fn prepare(&self) -> anyhow::Result<()> {
        for dir in ["uploads", "receipts", "outbox"] {
            create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    fn resolve(&self, rel: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(rel);
        if rel.as_os_str().is_empty() {
            bail!("Empty storage path");
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("Storage path `{}` escapes the store", rel.display()),
            }
        }
        Ok(self.root.join(rel))
    }

    pub async fn write<S: AsRef<str>>(&self, rel: S, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.resolve(rel.as_ref())?;
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        let mut writer = BufWriter::new(File::create(&path).await?);
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read<S: AsRef<str>>(&self, rel: S) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(rel.as_ref())?;
        if !path.exists() {
            bail!("Tried to read nonexistent file `{}`", rel.as_ref());
        }
        let mut bytes = Vec::new();
        BufReader::new(File::open(path).await?)
            .read_to_end(&mut bytes)
            .await?;
        Ok(bytes)
    }

    pub fn exists<S: AsRef<str>>(&self, rel: S) -> bool {
        self.resolve(rel.as_ref())
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Removes a stored file; a file that is already gone is not an error.
    pub async fn remove<S: AsRef<str>>(&self, rel: S) -> anyhow::Result<()> {
        let path = self.resolve(rel.as_ref())?;
        if path.exists() {
            remove_file(path).await?;
        }
        Ok(())
    }
}

pub fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
