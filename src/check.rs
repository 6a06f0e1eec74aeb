use crate::config::SpyceConfig;
use crate::taglib::BasicTagChecker;
use anyhow::Result;
use std::path::Path;

pub struct CheckResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// 执行项目完整性检查，依次验证配置、模板目录与全部模板的可编译性
pub fn run(project_root: &Path) -> Result<CheckResult> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !project_root.join("spyce.toml").exists() {
        warnings.push("缺少 spyce.toml，使用默认配置".to_string());
    }
    let config = match SpyceConfig::load(project_root) {
        Ok(c) => c,
        Err(e) => {
            errors.push(format!("spyce.toml 解析失败: {e}"));
            return Ok(CheckResult { errors, warnings });
        }
    };

    let source_dir = project_root.join(&config.compiler.source_dir);
    if !source_dir.exists() {
        errors.push(format!("模板目录 {}/ 不存在", config.compiler.source_dir));
        return Ok(CheckResult { errors, warnings });
    }

    let mut templates = Vec::new();
    crate::build::scan_templates(&source_dir, &source_dir, &mut templates);
    if templates.is_empty() {
        warnings.push(format!("模板目录 {}/ 下没有 .spy 模板", config.compiler.source_dir));
    }

    for rel in &templates {
        let path = source_dir.join(rel);
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                errors.push(format!("无法读取 {}：{e}", rel.display()));
                continue;
            }
        };
        let mut checker = BasicTagChecker::new();
        let dir = path.parent().unwrap_or(Path::new("."));
        if let Err(e) = crate::compiler::compile(
            &source,
            &path.display().to_string(),
            dir,
            &mut checker,
            config.compiler.max_include_depth,
        ) {
            errors.push(format!("{} 编译失败：\n{e}", rel.display()));
        }
    }

    Ok(CheckResult { errors, warnings })
}
