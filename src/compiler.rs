pub mod ast;
pub mod directive;
pub mod emit;
pub mod error;
pub mod optimize;
pub mod parser;
pub mod token;

use crate::compiler::ast::SourceRef;
use crate::compiler::parser::{ModuleDecl, TaglibDecl};
use crate::taglib::{FragmentRegistry, TagChecker};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// include 嵌套默认上限（显式栈深度检查，防自包含模板无界递归）
pub const DEFAULT_INCLUDE_DEPTH: usize = 64;

/// 单次编译的产物
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResult {
    /// 生成的 Python 源码
    pub code: String,
    /// 最终输出行号（从 1 起）到源引用的映射
    pub line_refs: BTreeMap<usize, SourceRef>,
    /// `.module` 声明，按别名有序去重
    pub modules: Vec<ModuleDecl>,
    /// `.taglib` 声明，按别名有序去重
    pub taglibs: Vec<TaglibDecl>,
}

/// 编译 Spyce 模板源码为 Python 源码
///
/// 流水线：统一换行 → 词法 → 解析 → 窥孔优化 → Stage A 事件渲染 →
/// 结构平衡校验 → Stage B 缩进回放。任一阶段失败即整体失败，不重试；
/// 编译器自身不持有跨调用状态，并发编译各用独立实例。
pub fn compile(
    source: &str,
    file_name: &str,
    dir: &Path,
    checker: &mut dyn TagChecker,
    max_include_depth: usize,
) -> Result<CompileResult> {
    compile_with_fragments(
        source,
        file_name,
        dir,
        checker,
        &FragmentRegistry::default(),
        max_include_depth,
    )
}

/// 同 compile，另带调用方预填的库片段注册表（`.include fragment=...` 查询它）
pub fn compile_with_fragments(
    source: &str,
    file_name: &str,
    dir: &Path,
    checker: &mut dyn TagChecker,
    fragments: &FragmentRegistry,
    max_include_depth: usize,
) -> Result<CompileResult> {
    let source = normalize_newlines(source);

    let parsed = parser::parse(&source, file_name, dir, checker, fragments, max_include_depth)?;
    let mut arena = parsed.arena;
    optimize::optimize(&mut arena, parsed.root);

    let events = emit::emit_events(&arena, parsed.root);
    emit::validate_balance(&events)?;
    let (code, line_refs) = emit::format_events(&events);

    Ok(CompileResult {
        code,
        line_refs,
        modules: parsed.modules,
        taglibs: parsed.taglibs,
    })
}

/// 编译模板文件，include 以文件所在目录为相对基准
pub fn compile_file(path: &Path, checker: &mut dyn TagChecker) -> Result<CompileResult> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("无法读取模板 {}：{e}", path.display()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    compile(
        &source,
        &path.display().to_string(),
        dir,
        checker,
        DEFAULT_INCLUDE_DEPTH,
    )
}

/// 行结束符统一为 \n
pub(crate) fn normalize_newlines(source: &str) -> String {
    source.replace("\r\n", "\n").replace('\r', "\n")
}
