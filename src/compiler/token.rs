use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// 标记位置：行号从 1 开始，列号从 0 开始
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pos {
    pub row: usize,
    pub col: usize,
}

impl Pos {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Spyce 词法标记类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// 普通文本
    Text,
    /// `[[=` 表达式开始
    Eval,
    /// `[[` 语句开始
    Stmt,
    /// `[[\` 代码块开始
    Chunk,
    /// `[[\\` 全局代码块开始
    GlobalChunk,
    /// `[[.` 指令开始
    Directive,
    /// `[[spy` lambda 开始
    Lambda,
    /// `]]` 结束
    End,
    /// `[[--` 注释开始
    Comment,
    /// `--]]` 注释结束
    CommentEnd,
    /// 输入结束
    Eof,
}

impl TokenKind {
    /// 对应的标记文本，用于错误信息
    pub fn marker(self) -> &'static str {
        match self {
            TokenKind::Text => "文本",
            TokenKind::Eval => "[[=",
            TokenKind::Stmt => "[[",
            TokenKind::Chunk => "[[\\",
            TokenKind::GlobalChunk => "[[\\\\",
            TokenKind::Directive => "[[.",
            TokenKind::Lambda => "[[spy",
            TokenKind::End => "]]",
            TokenKind::Comment => "[[--",
            TokenKind::CommentEnd => "--]]",
            TokenKind::Eof => "EOF",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub begin: Pos,
    pub end: Pos,
}

/// 转义标记 `\[[`，在扫描后立即降级为字面量 `[[` 文本
const ESCAPE_MARKER: &str = "\\[[";

/// 标记表按优先级排列：更长、更具体的标记必须先于与其前缀重叠的短标记
/// （regex 的多分支在同一起点按分支顺序取第一个命中）
fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\\\[\[|\[\[\\\\|\[\[\\|\[\[=|\[\[\.|\[\[spy|\[\[--|--\]\]|\[\[|\]\]",
        )
        .expect("标记表正则非法")
    })
}

fn marker_kind(text: &str) -> TokenKind {
    match text {
        "[[\\\\" => TokenKind::GlobalChunk,
        "[[\\" => TokenKind::Chunk,
        "[[=" => TokenKind::Eval,
        "[[." => TokenKind::Directive,
        "[[spy" => TokenKind::Lambda,
        "[[--" => TokenKind::Comment,
        "--]]" => TokenKind::CommentEnd,
        "[[" => TokenKind::Stmt,
        "]]" => TokenKind::End,
        _ => TokenKind::Text,
    }
}

/// 将 Spyce 模板源码切分为标记序列
///
/// 词法分析不会失败：无法识别的文本一律作为 Text 标记，
/// 序列始终以零长度的 EOF 标记收尾。
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = scan_markers(source);
    // 转义降级：`\[[` 变为字面量 `[[` 文本
    for t in &mut tokens {
        if t.kind == TokenKind::Text && t.text == ESCAPE_MARKER {
            t.text = "[[".to_string();
        }
    }
    assign_positions(&mut tokens);
    tokens
}

/// 第一遍扫描：切分标记，转义标记暂以原文（含反斜杠）保留，
/// 保证全部标记文本按序拼接可还原输入
fn scan_markers(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut last = 0;

    for m in marker_regex().find_iter(source) {
        if m.start() > last {
            tokens.push(raw_token(TokenKind::Text, &source[last..m.start()]));
        }
        let text = m.as_str();
        if text == ESCAPE_MARKER {
            // 降级推迟到扫描结束，先保留原文以维持位置推算
            tokens.push(raw_token(TokenKind::Text, text));
        } else {
            tokens.push(raw_token(marker_kind(text), text));
        }
        last = m.end();
    }

    if last < source.len() {
        tokens.push(raw_token(TokenKind::Text, &source[last..]));
    }
    tokens.push(raw_token(TokenKind::Eof, ""));
    tokens
}

fn raw_token(kind: TokenKind, text: &str) -> Token {
    Token {
        kind,
        text: text.to_string(),
        begin: Pos::new(0, 0),
        end: Pos::new(0, 0),
    }
}

/// 第二遍：逐标记推算行列跨度
///
/// 约定：以换行结尾的标记把下一起点置为 (末行 + 1, 0)；
/// 非换行结尾的标记把列号进位 len + 1 —— 多出的 1 是既有约定，
/// 下游位置运算一致按此补偿，不要"修正"。
fn assign_positions(tokens: &mut [Token]) {
    let mut row = 1usize;
    let mut col = 0usize;

    for t in tokens.iter_mut() {
        t.begin = Pos::new(row, col);

        let mut r = row;
        let mut c = col;
        for ch in t.text.chars() {
            if ch == '\n' {
                r += 1;
                c = 0;
            } else {
                c += 1;
            }
        }
        t.end = Pos::new(r, c);

        if t.text.ends_with('\n') {
            row = r;
            col = 0;
        } else {
            row = r;
            col = c + 1;
        }
    }
}

/// 沿文本推进位置（与 assign_positions 相同的行列规则，不含列进位）
pub fn advance_pos(start: Pos, text: &str) -> Pos {
    let mut r = start.row;
    let mut c = start.col;
    for ch in text.chars() {
        if ch == '\n' {
            r += 1;
            c = 0;
        } else {
            c += 1;
        }
    }
    Pos::new(r, c)
}
