//! Storage for received files.
//!
//! Files land in a downloads directory under a fixed prefix
//! (`recv_report.txt`). When that name is taken an incrementing suffix is
//! appended to the full name (`recv_report.txt(1)`, `recv_report.txt(2)`, ...).
//! Files are created with `create_new`, so an existing file is never
//! overwritten even when two transfers race for the same name.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Upper bound on collision suffixes tried before giving up
const MAX_COLLISIONS: u32 = 10_000;

/// Directory plus prefix for received files
#[derive(Debug, Clone)]
pub struct DownloadStore {
    dir: PathBuf,
    prefix: String,
}

impl DownloadStore {
    /// Create a store rooted at `dir` using `prefix` for every file name
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Directory files are written to
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for the `n`th collision of `name` (0 = no suffix)
    fn candidate(&self, name: &str, n: u32) -> PathBuf {
        if n == 0 {
            self.dir.join(format!("{}{}", self.prefix, name))
        } else {
            self.dir.join(format!("{}{}({})", self.prefix, name, n))
        }
    }

    /// Write `data` under a fresh name derived from `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the file cannot be
    /// written, or every collision suffix is taken.
    pub async fn save(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let name = sanitize_file_name(name);

        for n in 0..MAX_COLLISIONS {
            let path = self.candidate(&name, n);
            let mut file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };

            if let Err(e) = write_all(&mut file, data).await {
                drop(file);
                let _ = fs::remove_file(&path).await;
                return Err(e);
            }
            return Ok(path);
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {name}"),
        ))
    }
}

async fn write_all(file: &mut fs::File, data: &[u8]) -> io::Result<()> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Strip any directory components a sender put in a file name.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    match base {
        "" | "." | ".." => "file".to_string(),
        other => other.to_string(),
    }
}
