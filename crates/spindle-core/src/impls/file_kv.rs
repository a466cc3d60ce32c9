//! File-backed key/value store: one file per key under a directory.
//!
//! キーは hex エンコードしてファイル名にする（`:` や `/` を含んでも安全）。
//! 長すぎるキーは sha256 の hex にする。
//! 書き込みは一時ファイル + rename で、途中まで書かれた値は読まれない。
//! `lock` は `{name}.lock` に OS の排他ロック（flock / LockFileEx）を取るので、
//! 同じディレクトリを使う別プロセスとも排他になる。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::domain::QueueError;
use crate::ports::{KeyValueStore, KvLock};

/// Longest hex name used as is. Leaves room for the temp and lock suffixes
/// under the usual 255 byte file name limit.
const MAX_PLAIN_NAME: usize = 200;

#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

fn encode_key(key: &str) -> String {
    let plain = hex::encode(key);
    if plain.len() <= MAX_PLAIN_NAME {
        return plain;
    }
    // hex は偶数長かつ [0-9a-f] のみなので "h" 始まりとは衝突しない
    format!("h{}", hex::encode(Sha256::digest(key.as_bytes())))
}

#[async_trait]
impl KeyValueStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), QueueError> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, QueueError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock(&self, name: &str) -> Result<KvLock, QueueError> {
        let path = self.dir.join(format!("{}.lock", encode_key(name)));
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| QueueError::Unavailable(format!("lock task failed: {e}")))??;
        // file を閉じるとロックも外れる
        Ok(KvLock::holding(file))
    }
}
