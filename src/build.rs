use crate::cache::ArtifactCache;
use crate::compiler::{self, CompileResult};
use crate::config::SpyceConfig;
use crate::taglib::BasicTagChecker;
use anyhow::Result;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// 批量编译统计
#[derive(Debug, Default, Clone)]
pub struct BuildStats {
    pub total: usize,
    pub compiled: usize,
    pub cached: usize,
    pub failed: usize,
}

/// 编译模板目录下全部 .spy 文件
///
/// `force` 为 true 时跳过缓存全量重编。每个模板使用独立的编译器实例，
/// 并行与否由配置决定；失败的模板不写出、不入缓存。
pub fn run(project_root: &Path, config: &SpyceConfig, force: bool) -> Result<BuildStats> {
    tracing::info!("开始编译...");
    let start = std::time::Instant::now();

    let source_dir = project_root.join(&config.compiler.source_dir);
    anyhow::ensure!(
        source_dir.exists(),
        "模板目录 {} 不存在",
        source_dir.display()
    );
    let output_dir = project_root.join(&config.compiler.output_dir);
    let cache_dir = project_root.join(&config.compiler.cache_dir);
    let mut cache = ArtifactCache::load(&cache_dir);

    let mut templates = Vec::new();
    scan_templates(&source_dir, &source_dir, &mut templates);

    let mut stats = BuildStats {
        total: templates.len(),
        ..Default::default()
    };

    // 先按缓存分流，只有脏模板进编译
    let mut dirty: Vec<PathBuf> = Vec::new();
    for rel in &templates {
        let path = source_dir.join(rel);
        if !force && let Some(result) = cache.get_file(&path) {
            write_outputs(&output_dir, rel, result)?;
            stats.cached += 1;
        } else {
            dirty.push(rel.clone());
        }
    }

    // 编译核心无跨调用状态，并行时每个任务持有独立实例
    let max_depth = config.compiler.max_include_depth;
    let compile_one = |rel: &PathBuf| -> (PathBuf, Result<CompileResult>) {
        let path = source_dir.join(rel);
        (rel.clone(), compile_template(&path, max_depth))
    };
    let outcomes: Vec<(PathBuf, Result<CompileResult>)> = if config.compiler.parallel {
        dirty.par_iter().map(compile_one).collect()
    } else {
        dirty.iter().map(compile_one).collect()
    };

    for (rel, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                write_outputs(&output_dir, &rel, &result)?;
                cache.put_file(&source_dir.join(&rel), result);
                stats.compiled += 1;
            }
            Err(e) => {
                tracing::error!("{} 编译失败：\n{e}", rel.display());
                stats.failed += 1;
            }
        }
    }

    cache.save()?;
    tracing::info!(
        "编译完成：共 {} 个，重编 {}，缓存命中 {}，失败 {}，耗时 {:.2?}",
        stats.total,
        stats.compiled,
        stats.cached,
        stats.failed,
        start.elapsed()
    );
    Ok(stats)
}

fn compile_template(path: &Path, max_include_depth: usize) -> Result<CompileResult> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("无法读取模板 {}：{e}", path.display()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut checker = BasicTagChecker::new();
    compiler::compile(
        &source,
        &path.display().to_string(),
        dir,
        &mut checker,
        max_include_depth,
    )
}

/// 递归收集模板目录下的 .spy 文件（相对路径）
pub fn scan_templates(base_dir: &Path, current_dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(current_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_templates(base_dir, &path, out);
        } else if path.extension().is_some_and(|ext| ext == "spy") {
            if let Ok(rel) = path.strip_prefix(base_dir) {
                out.push(rel.to_path_buf());
            }
        }
    }
}

/// 写出生成代码与行号映射（<名字>.py 与 <名字>.lines.json）
fn write_outputs(output_dir: &Path, rel: &Path, result: &CompileResult) -> Result<()> {
    let code_path = output_dir.join(rel).with_extension("py");
    if let Some(parent) = code_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&code_path, &result.code)?;

    let map_path = output_dir.join(rel).with_extension("lines.json");
    let map_json = serde_json::to_string_pretty(&result.line_refs)?;
    std::fs::write(&map_path, map_json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spyce-build-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("templates/sub")).unwrap();
        dir
    }

    #[test]
    fn build_writes_code_and_line_maps() {
        let root = project("basic");
        fs::write(root.join("templates/index.spy"), "Hello [[=1+1]]").unwrap();
        fs::write(root.join("templates/sub/page.spy"), "page").unwrap();

        let config = SpyceConfig::default();
        let stats = run(&root, &config, false).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.compiled, 2);
        assert_eq!(stats.failed, 0);

        let code = fs::read_to_string(root.join("generated/index.py")).unwrap();
        assert!(code.contains("response.write_expr((1+1))"));
        assert!(root.join("generated/index.lines.json").exists());
        assert!(root.join("generated/sub/page.py").exists());
    }

    #[test]
    fn second_build_hits_cache() {
        let root = project("cache");
        fs::write(root.join("templates/index.spy"), "cached").unwrap();

        let config = SpyceConfig::default();
        let first = run(&root, &config, false).unwrap();
        assert_eq!(first.compiled, 1);

        let second = run(&root, &config, false).unwrap();
        assert_eq!(second.cached, 1);
        assert_eq!(second.compiled, 0);
    }

    #[test]
    fn broken_template_counts_as_failed_and_is_not_written() {
        let root = project("failed");
        fs::write(root.join("templates/bad.spy"), "[[= ]]").unwrap();

        let config = SpyceConfig::default();
        let stats = run(&root, &config, false).unwrap();
        assert_eq!(stats.failed, 1);
        assert!(!root.join("generated/bad.py").exists());
    }

    #[test]
    fn force_skips_cache() {
        let root = project("force");
        fs::write(root.join("templates/index.spy"), "x").unwrap();

        let config = SpyceConfig::default();
        run(&root, &config, false).unwrap();
        let stats = run(&root, &config, true).unwrap();
        assert_eq!(stats.compiled, 1);
        assert_eq!(stats.cached, 0);
    }
}
