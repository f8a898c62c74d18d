//! 临时写入与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// 同目录下的临时文件，成功后改名覆盖目标，失败时删除。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "upload".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            writer: BufWriter::new(file),
        })
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }

    /// 刷盘但不改名，之后可经 `temp_path` 读取已写入的内容。
    pub async fn sync(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.writer);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷盘并原子替换目标文件。
    pub async fn finalize(mut self) -> io::Result<()> {
        if let Err(err) = self.sync().await {
            self.cleanup().await;
            return Err(err);
        }
        drop(self.writer);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    return fs::rename(&self.temp_path, &self.target).await;
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        Ok(())
    }
}
