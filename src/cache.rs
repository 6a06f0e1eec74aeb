use crate::compiler::CompileResult;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// 缓存条目：编译产物加有效性依据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: CompileResult,
    /// 文件源的修改时间（Unix 秒）；字符串源为 None，恒有效
    pub mtime: Option<i64>,
    pub compiled_at: DateTime<Utc>,
}

/// 编译产物缓存
///
/// 键为（源标识，文件/字符串标记）：文件源以路径为标识、mtime 判有效；
/// 字符串源以内容 SHA-256 为标识、恒有效。编译失败不得入缓存。
pub struct ArtifactCache {
    entries: HashMap<String, CacheEntry>,
    cache_path: PathBuf,
}

impl ArtifactCache {
    /// 从缓存文件加载，不存在或损坏则返回空表
    pub fn load(cache_dir: &Path) -> Self {
        let cache_path = cache_dir.join("artifacts.json");
        let entries = std::fs::read_to_string(&cache_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            entries,
            cache_path,
        }
    }

    /// 持久化当前缓存表
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.cache_path, json)?;
        Ok(())
    }

    /// 计算任意字节数据的 SHA-256 哈希（十六进制）
    pub fn hash_bytes(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    fn file_key(path: &Path) -> String {
        format!("file:{}", path.display())
    }

    fn string_key(source: &str) -> String {
        format!("str:{}", Self::hash_bytes(source.as_bytes()))
    }

    /// 查文件源缓存；mtime 不一致视为失效
    pub fn get_file(&self, path: &Path) -> Option<&CompileResult> {
        let entry = self.entries.get(&Self::file_key(path))?;
        let current = file_mtime(path)?;
        if entry.mtime == Some(current) {
            Some(&entry.result)
        } else {
            None
        }
    }

    pub fn put_file(&mut self, path: &Path, result: CompileResult) {
        self.entries.insert(
            Self::file_key(path),
            CacheEntry {
                result,
                mtime: file_mtime(path),
                compiled_at: Utc::now(),
            },
        );
    }

    /// 查字符串源缓存；字符串标识即内容哈希，命中恒有效
    pub fn get_string(&self, source: &str) -> Option<&CompileResult> {
        self.entries
            .get(&Self::string_key(source))
            .map(|e| &e.result)
    }

    pub fn put_string(&mut self, source: &str, result: CompileResult) {
        self.entries.insert(
            Self::string_key(source),
            CacheEntry {
                result,
                mtime: None,
                compiled_at: Utc::now(),
            },
        );
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn file_mtime(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}
