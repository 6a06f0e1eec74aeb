use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct SpyceConfig {
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct CompilerConfig {
    /// 模板目录（.spy 文件）
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
    /// 生成代码输出目录
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// include 嵌套上限
    #[serde(default = "default_include_depth")]
    pub max_include_depth: usize,
    /// 批量编译是否并行
    #[serde(default = "default_true")]
    pub parallel: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            output_dir: default_output_dir(),
            cache_dir: default_cache_dir(),
            max_include_depth: default_include_depth(),
            parallel: default_true(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SpyceConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SpyceConfig {
    /// 加载项目根目录下的 spyce.toml；文件不存在时使用默认配置
    pub fn load(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join("spyce.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("无法读取 {}：{e}", config_path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("spyce.toml 解析失败：{e}"))?;
        Ok(config)
    }
}

fn default_source_dir() -> String {
    "templates".to_string()
}

fn default_output_dir() -> String {
    "generated".to_string()
}

fn default_cache_dir() -> String {
    ".spyce-cache".to_string()
}

fn default_include_depth() -> usize {
    crate::compiler::DEFAULT_INCLUDE_DEPTH
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
