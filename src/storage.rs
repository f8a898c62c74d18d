//! 请求路径到文件系统路径的映射与沙箱校验。

use percent_encoding::percent_decode_str;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// 以规范化后的根目录创建存储；根目录必须已存在。
    pub async fn open(root: PathBuf) -> io::Result<Self> {
        let root = fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 将请求路径解析为根目录下的绝对路径，并校验其未逃出根目录。
    pub async fn resolve(&self, request_path: &str) -> Result<PathBuf, StorageError> {
        let target = self.root.join(normalize_request_path(request_path));
        self.ensure_contained(&target, false).await?;
        Ok(target)
    }

    /// 上传目标：`dir` 下名为 `name` 的文件，允许尚不存在，但不能是符号链接。
    pub async fn resolve_child(&self, dir: &Path, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        let (Some(Component::Normal(segment)), None) = (components.next(), components.next())
        else {
            return Err(StorageError::OutsideRoot);
        };
        let target = dir.join(segment);
        match fs::symlink_metadata(&target).await {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(StorageError::OutsideRoot);
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        self.ensure_contained(&target, true).await?;
        Ok(target)
    }

    /// 规范化（跟随符号链接）后必须仍位于根目录之下。
    pub async fn ensure_contained(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let canonical = match fs::canonicalize(target).await {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                let parent = target.parent().ok_or(StorageError::OutsideRoot)?;
                fs::canonicalize(parent).await?
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        if !canonical.starts_with(&self.root) {
            return Err(StorageError::OutsideRoot);
        }
        Ok(())
    }

    pub async fn list_dir(&self, dir: &Path) -> Result<Vec<DirectoryEntry>, StorageError> {
        self.ensure_contained(dir, false).await?;
        let mut reader = fs::read_dir(dir).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let file_type = entry.file_type().await?;
            // 与 is_symlink 不同，目录判断跟随链接
            let is_dir = fs::metadata(entry.path())
                .await
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false);
            entries.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir,
                is_symlink: file_type.is_symlink(),
            });
        }

        entries.sort_by_key(|entry| entry.name.to_lowercase());
        Ok(entries)
    }
}

/// 解码并按字面规范化请求路径，返回相对路径。
///
/// `..` 只会弹出已有的段，不会越过根；每段只保留最后一个普通组件，
/// 从而丢弃盘符前缀与反斜杠分隔的内容。
pub fn normalize_request_path(request_path: &str) -> PathBuf {
    let path = request_path.split(['?', '#']).next().unwrap_or_default();
    let decoded = percent_decode_str(path).decode_utf8_lossy();

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized = PathBuf::new();
    for segment in segments {
        let last_normal = segment
            .split('\\')
            .flat_map(|part| Path::new(part).components())
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .next_back();
        if let Some(name) = last_normal {
            normalized.push(name);
        }
    }
    normalized
}

#[derive(Debug)]
pub enum StorageError {
    OutsideRoot,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
}
