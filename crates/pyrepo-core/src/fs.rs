//! Atomic file writes.
//!
//! Readers of a published tree must never observe a half-written file, so
//! every write lands in a sibling temporary file first and is then renamed
//! over the destination. `rename` within one directory is atomic on POSIX
//! filesystems.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary sibling path for `dest`, unique within this process.
fn temp_path(dest: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.tmp-{}-{}", file_name, std::process::id(), n))
}

/// Writes `data` to `dest` via write-temp-then-rename.
///
/// Parent directories are created as needed. On failure the temporary file
/// is removed and `dest` is left untouched.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> std::io::Result<()> {
/// pyrepo_core::fs::write_atomic("/srv/index/simple/index.html".as_ref(), b"<html/>").await?;
/// # Ok(())
/// # }
/// ```
pub async fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(dest);
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, dest).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}
