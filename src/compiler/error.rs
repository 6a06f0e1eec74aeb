use crate::compiler::ast::SourceRef;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpyceError {
    #[error("{}", format_error("语法错误", file, *line, *col, context, message, hint))]
    SyntaxError {
        file: String,
        line: usize,
        col: usize,
        message: String,
        context: String,
        hint: Option<String>,
    },

    /// AST 不变量被破坏，属编译器自身缺陷而非模板问题
    #[error("spyce 内部错误：{message}")]
    InternalError { message: String },
}

fn format_error(
    kind: &str,
    file: &str,
    line: usize,
    col: usize,
    context: &str,
    message: &str,
    hint: &Option<String>,
) -> String {
    let mut out = format!("spyce {kind}\n  → {file}:{line}:{col}\n\n");
    if !context.is_empty() {
        out.push_str(context);
    }
    out.push_str(&format!("  错误：{message}"));
    if let Some(h) = hint {
        out.push_str(&format!("\n  提示：{h}"));
    }
    out
}

impl SpyceError {
    /// 在有源码的上下文中创建语法错误（如 parser 主循环），包含上下文行
    pub fn syntax_with_source(
        file: &str,
        line: usize,
        col: usize,
        message: impl Into<String>,
        source: &str,
    ) -> Self {
        let context = build_error_context(source, line);
        Self::SyntaxError {
            file: file.to_string(),
            line,
            col,
            message: message.into(),
            context,
            hint: None,
        }
    }

    /// 在无源码的上下文中创建语法错误，仅标注行列号
    #[allow(dead_code)]
    pub fn syntax(file: &str, line: usize, col: usize, message: impl Into<String>) -> Self {
        Self::SyntaxError {
            file: file.to_string(),
            line,
            col,
            message: message.into(),
            context: String::new(),
            hint: None,
        }
    }

    /// 从源码引用创建语法错误，引用缺失时退化为无位置错误
    pub fn syntax_at(message: impl Into<String>, rref: Option<&SourceRef>) -> Self {
        match rref {
            Some(r) => Self::SyntaxError {
                file: r.file.clone(),
                line: r.begin.row,
                col: r.begin.col,
                message: message.into(),
                context: String::new(),
                hint: None,
            },
            None => Self::SyntaxError {
                file: "<unknown>".to_string(),
                line: 0,
                col: 0,
                message: message.into(),
                context: String::new(),
                hint: None,
            },
        }
    }

    #[allow(dead_code)]
    pub fn syntax_with_hint(
        file: &str,
        line: usize,
        col: usize,
        message: impl Into<String>,
        hint: impl fmt::Display,
        source: &str,
    ) -> Self {
        let context = build_error_context(source, line);
        Self::SyntaxError {
            file: file.to_string(),
            line,
            col,
            message: message.into(),
            context,
            hint: Some(hint.to_string()),
        }
    }

    /// AST 不变量破坏时的快速失败；枚举叶类型在 Rust 侧穷尽匹配，
    /// 正常流程不会触达
    #[allow(dead_code)]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

fn build_error_context(source: &str, error_line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let start = error_line.saturating_sub(3);
    let end = (error_line + 2).min(lines.len());

    let mut ctx = String::new();
    let width = format!("{}", end).len();
    for i in start..end {
        let marker = if i + 1 == error_line { ">" } else { " " };
        ctx.push_str(&format!(
            "  {} {:>width$} | {}\n",
            marker,
            i + 1,
            lines.get(i).unwrap_or(&""),
            width = width,
        ));
    }
    ctx
}
