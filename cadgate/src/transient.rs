//! Request-scoped copies of uploaded files.
//!
//! The geometry kernel reads from a filesystem path, so every upload is streamed into a uniquely
//! named file first. The file is owned by exactly one request and removed when that request is
//! done with it: explicitly through [`TransientFile::close`], or on drop along any other exit path
//! (early returns, panics unwinding through the conversion task, dropped futures).

use std::io;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempPath};
use tokio::io::AsyncWriteExt;

const PREFIX: &str = "cadgate-upload-";

/// Upload being streamed to disk.
///
/// Dropping it before [`finish`](TransientUpload::finish) removes the partial file.
pub struct TransientUpload {
    file: tokio::fs::File,
    path: TempPath,
    written: u64,
}

impl TransientUpload {
    /// Create an empty, uniquely named file carrying `extension` (e.g. `.step`, possibly empty).
    ///
    /// Uses `dir` when given, otherwise the system temp directory.
    pub fn create(dir: Option<&Path>, extension: &str) -> io::Result<Self> {
        let mut builder = Builder::new();
        builder.prefix(PREFIX).suffix(extension);

        let named = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = named.into_parts();

        Ok(Self {
            file: tokio::fs::File::from_std(file),
            path,
            written: 0,
        })
    }

    /// Append a chunk of the upload.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and close the handle, leaving a file the kernel can open by path.
    pub async fn finish(mut self) -> io::Result<TransientFile> {
        self.file.flush().await?;
        drop(self.file);

        Ok(TransientFile {
            path: self.path,
            size: self.written,
        })
    }
}

/// Complete upload copy on disk. Deleted on [`close`](TransientFile::close) or drop.
#[derive(Debug)]
pub struct TransientFile {
    path: TempPath,
    size: u64,
}

impl TransientFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the file now.
    ///
    /// A failed delete is logged and swallowed: the caller's response does not depend on it.
    pub fn close(self) {
        let path: PathBuf = self.path.to_path_buf();
        match self.path.close() {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed transient upload"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove transient upload"),
        }
    }
}
