use crate::compiler::ast::{Arena, CompactMode, Leaf, NodeId, SourceRef, GLOBALS, PROCESS};
use crate::compiler::directive::{parse_directive, TagMatch, TagScanner};
use crate::compiler::emit::py_str;
use crate::compiler::error::SpyceError;
use crate::compiler::token::{advance_pos, tokenize, Pos, Token, TokenKind};
use crate::taglib::{FragmentRegistry, TagChecker};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 块内保留相对缩进的占位字符，Stage B 输出时还原为空格
pub const INDENT_HOLD: char = '\x01';

/// `.module` 声明：`(name, from, as)`，按 as 名去重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
    pub from: Option<String>,
    pub as_name: String,
}

/// `.taglib` 声明：`(name, from, as)`，按 as 名去重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaglibDecl {
    pub name: String,
    pub from: Option<String>,
    pub as_name: String,
}

#[derive(Debug)]
pub struct ParseResult {
    pub arena: Arena,
    pub root: NodeId,
    pub modules: Vec<ModuleDecl>,
    pub taglibs: Vec<TaglibDecl>,
}

/// include 解析栈帧：弹出后在父文件中断点处继续
struct Frame {
    dir: PathBuf,
    file: String,
    source: String,
    tokens: Vec<Token>,
    cursor: usize,
}

pub struct Parser<'a> {
    checker: &'a mut dyn TagChecker,
    fragments: &'a FragmentRegistry,
    arena: Arena,
    globals: NodeId,
    process: NodeId,
    /// 当前叶子落点
    current: NodeId,
    frames: Vec<Frame>,
    scanner: TagScanner,
    modules: Vec<ModuleDecl>,
    taglibs: Vec<TaglibDecl>,
    uses_lambda: bool,
    max_include_depth: usize,
}

/// 将模板源码解析为 codepoint 树与声明列表
///
/// 调度按标记类型穷尽匹配；首个语法错误即中止，不做恢复。
pub fn parse(
    source: &str,
    file_name: &str,
    dir: &Path,
    checker: &mut dyn TagChecker,
    fragments: &FragmentRegistry,
    max_include_depth: usize,
) -> Result<ParseResult, SpyceError> {
    let mut arena = Arena::new();
    let root = arena.add(None, false);
    let globals = arena.add_child(root, GLOBALS, false);
    let process = arena.add_child(root, PROCESS, true);

    let mut parser = Parser {
        checker,
        fragments,
        arena,
        globals,
        process,
        current: process,
        frames: vec![Frame {
            dir: dir.to_path_buf(),
            file: file_name.to_string(),
            source: source.to_string(),
            tokens: tokenize(source),
            cursor: 0,
        }],
        scanner: TagScanner::new(),
        modules: Vec::new(),
        taglibs: Vec::new(),
        uses_lambda: false,
        max_include_depth,
    };

    parser.seed();
    parser.run()?;
    parser.finish()?;

    Ok(ParseResult {
        arena: parser.arena,
        root,
        modules: parser.modules,
        taglibs: parser.taglibs,
    })
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Token {
        let frame = self.frames.last_mut().expect("解析栈不可为空");
        if frame.cursor < frame.tokens.len() {
            let t = frame.tokens[frame.cursor].clone();
            frame.cursor += 1;
            t
        } else {
            frame.tokens.last().cloned().expect("标记流至少含 EOF")
        }
    }

    fn cur_file(&self) -> String {
        self.frames.last().expect("解析栈不可为空").file.clone()
    }

    fn err_at(&self, pos: Pos, message: impl Into<String>) -> SpyceError {
        let frame = self.frames.last().expect("解析栈不可为空");
        SpyceError::syntax_with_source(&frame.file, pos.row, pos.col, message, &frame.source)
    }

    fn make_ref(&self, begin: Pos, end: Pos, text: &str) -> SourceRef {
        SourceRef::new(begin, end, text, self.cur_file())
    }

    fn code_leaf(&mut self, target: NodeId, text: impl Into<String>, rref: Option<SourceRef>) {
        self.arena.push_leaf(
            target,
            Leaf::Code {
                text: text.into(),
                rref,
            },
        );
    }

    /// 主体固定前缀：签名行与 try 块开头
    fn seed(&mut self) {
        self.code_leaf(self.process, "def spyce_process(response, taglib):", None);
        self.code_leaf(self.process, "try: {", None);
    }

    /// 主体固定后缀与全局前导 import；两类控制信号穿透，取消信号重抛，
    /// 其余异常带执行上下文重新包装
    fn finish(&mut self) -> Result<(), SpyceError> {
        self.checker.finish()?;

        self.code_leaf(self.process, "} except SpyceDone: pass", None);
        self.code_leaf(self.process, "except SpyceRedirect: raise", None);
        self.code_leaf(self.process, "except KeyboardInterrupt: raise", None);
        self.code_leaf(
            self.process,
            "except Exception: raise SpyceRuntimeError(response)",
            None,
        );

        let mut imports: Vec<Leaf> = Vec::new();
        imports.push(Leaf::Code {
            text: "from spyce_runtime import SpyceDone, SpyceRedirect, SpyceRuntimeError"
                .to_string(),
            rref: None,
        });
        if self.uses_lambda {
            imports.push(Leaf::Code {
                text: "from spyce_runtime import lazy_call".to_string(),
                rref: None,
            });
        }
        for m in &self.modules {
            imports.push(Leaf::Code {
                text: import_line(&m.name, m.from.as_deref(), &m.as_name),
                rref: None,
            });
        }
        for t in &self.taglibs {
            // from 属性供运行期 load 调用使用，import 只看模块名
            imports.push(Leaf::Code {
                text: import_line(&t.name, None, &t.as_name),
                rref: None,
            });
        }

        let globals = self.arena.get_mut(self.globals);
        globals.leaves.splice(0..0, imports);
        Ok(())
    }

    fn run(&mut self) -> Result<(), SpyceError> {
        loop {
            let tok = self.next();
            match tok.kind {
                TokenKind::Eof => {
                    if self.frames.len() > 1 {
                        // include 文件耗尽，回到父文件断点
                        self.frames.pop();
                        continue;
                    }
                    break;
                }
                TokenKind::Text => self.on_text(tok)?,
                TokenKind::Eval => self.on_eval(tok)?,
                TokenKind::Stmt => self.on_stmt(tok)?,
                TokenKind::Chunk => self.on_chunk(tok, false)?,
                TokenKind::GlobalChunk => self.on_chunk(tok, true)?,
                TokenKind::Directive => self.on_directive(tok)?,
                TokenKind::Comment => self.on_comment(tok)?,
                TokenKind::Lambda | TokenKind::End | TokenKind::CommentEnd => {
                    return Err(
                        self.err_at(tok.begin, format!("意外的标记 '{}'", tok.kind.marker()))
                    );
                }
            }
        }
        Ok(())
    }

    /// 文本：先切出行内库标签，标签前后的纯文本各自成叶
    fn on_text(&mut self, tok: Token) -> Result<(), SpyceError> {
        let mut cur = tok.begin;
        let mut remaining = tok.text.as_str();

        while let Some(m) = self.scanner.find(remaining) {
            let before = &remaining[..m.start];
            if !before.is_empty() {
                let end = advance_pos(cur, before);
                let rref = self.make_ref(cur, end, before);
                self.arena.push_leaf(
                    self.current,
                    Leaf::Text {
                        text: before.to_string(),
                        rref: Some(rref),
                    },
                );
                cur = end;
            }

            let tag_text = &remaining[m.start..m.end];
            let tag_end = advance_pos(cur, tag_text);
            let rref = self.make_ref(cur, tag_end, tag_text);
            if m.closing {
                self.emit_close_tag(&m, &rref)?;
            } else {
                self.emit_open_tag(&m, &rref)?;
            }
            cur = tag_end;
            remaining = &remaining[m.end..];
        }

        if !remaining.is_empty() {
            let end = advance_pos(cur, remaining);
            let rref = self.make_ref(cur, end, remaining);
            self.arena.push_leaf(
                self.current,
                Leaf::Text {
                    text: remaining.to_string(),
                    rref: Some(rref),
                },
            );
        }
        Ok(())
    }

    /// 标签展开：push / begin / [loop] / end / pop，按能力标志取舍
    fn emit_open_tag(&mut self, m: &TagMatch, rref: &SourceRef) -> Result<(), SpyceError> {
        let class = self.checker.tag_class(&m.prefix, &m.name, rref)?;
        if m.singleton && class.mustend {
            return Err(SpyceError::syntax_at(
                format!("标签 <{}:{}> 必须成对出现", m.prefix, m.name),
                Some(rref),
            ));
        }
        self.checker.start_tag(&m.prefix, &m.name, m.singleton, rref)?;

        let attrs = python_attr_dict(&m.attrs);
        self.code_leaf(
            self.current,
            format!("taglib.tag_push('{}', '{}', {})", m.prefix, m.name, attrs),
            Some(rref.clone()),
        );
        if class.catches {
            self.code_leaf(self.current, "try: {", Some(rref.clone()));
        }
        if class.conditional {
            self.code_leaf(self.current, "if taglib.tag_begin(): {", Some(rref.clone()));
        } else {
            self.code_leaf(self.current, "taglib.tag_begin()", Some(rref.clone()));
        }
        if class.loops {
            self.code_leaf(self.current, "while 1: {", Some(rref.clone()));
        }

        if m.singleton {
            self.emit_tag_epilogue(&class, rref);
        }
        Ok(())
    }

    fn emit_close_tag(&mut self, m: &TagMatch, rref: &SourceRef) -> Result<(), SpyceError> {
        self.checker.end_tag(&m.prefix, &m.name, rref)?;
        let class = self.checker.tag_class(&m.prefix, &m.name, rref)?;
        self.emit_tag_epilogue(&class, rref);
        Ok(())
    }

    fn emit_tag_epilogue(&mut self, class: &crate::taglib::TagClass, rref: &SourceRef) {
        if class.loops {
            self.code_leaf(
                self.current,
                "if not taglib.tag_loop(): break",
                Some(rref.clone()),
            );
            self.code_leaf(self.current, "}", Some(rref.clone()));
        }
        if class.conditional {
            self.code_leaf(self.current, "}", Some(rref.clone()));
        }
        self.code_leaf(self.current, "taglib.tag_end()", Some(rref.clone()));
        if class.catches {
            self.code_leaf(
                self.current,
                "} except Exception: taglib.tag_catch()",
                Some(rref.clone()),
            );
        }
        self.code_leaf(self.current, "taglib.tag_pop()", Some(rref.clone()));
    }

    /// 收集 open 标记之后直到配对 End 的内容；允许嵌套 lambda
    ///
    /// 返回（收集文本，内容起点，End 标记）
    fn collect_body(&mut self, what: &str, open: &Token) -> Result<(String, Pos, Token), SpyceError> {
        let mut text = String::new();
        let mut begin: Option<Pos> = None;
        loop {
            let t = self.next();
            match t.kind {
                TokenKind::End => {
                    let begin = begin.unwrap_or(t.begin);
                    return Ok((text, begin, t));
                }
                TokenKind::Text => {
                    begin.get_or_insert(t.begin);
                    text.push_str(&t.text);
                }
                TokenKind::Lambda => {
                    begin.get_or_insert(t.begin);
                    let call = self.collect_lambda(&t)?;
                    text.push_str(&call);
                }
                TokenKind::Eof => {
                    return Err(self.err_at(open.begin, format!("{what}未闭合，缺少 ']]'")));
                }
                _ => {
                    return Err(
                        self.err_at(t.begin, format!("意外的标记 '{}'", t.kind.marker()))
                    );
                }
            }
        }
    }

    /// 表达式：`[[= expr ]]`
    fn on_eval(&mut self, tok: Token) -> Result<(), SpyceError> {
        let (raw, _, end_tok) = self.collect_body("表达式", &tok)?;
        if raw.trim().is_empty() {
            return Err(self.err_at(tok.begin, "空表达式"));
        }
        let (normalized, _) = normalize_multiline(&raw);
        // 括号内换行替换为空格，保证表达式落在单一输出行上
        let expr = normalized.trim().replace('\n', " ");
        let rref = SourceRef::new(tok.begin, end_tok.end, raw.trim(), self.cur_file());
        self.arena.push_leaf(
            self.current,
            Leaf::Eval {
                expr,
                rref: Some(rref),
            },
        );
        Ok(())
    }

    /// 语句：`[[ code ]]`，逐行成叶，每行独立引用源位置
    fn on_stmt(&mut self, tok: Token) -> Result<(), SpyceError> {
        let (raw, begin, end_tok) = self.collect_body("语句", &tok)?;
        let (normalized, line_map) = normalize_multiline(&raw);
        let lines: Vec<&str> = normalized.split('\n').collect();
        let total = lines.len();

        for (i, line) in lines.iter().enumerate() {
            let stripped = line.trim();
            if stripped.is_empty() {
                continue;
            }
            let row = begin.row + line_map.get(i).copied().unwrap_or(i);
            // 首行保留起始列，末行保留结束列，中间行取整行宽度
            let col_start = if i == 0 { begin.col } else { 0 };
            let col_end = if i + 1 == total {
                end_tok.begin.col
            } else {
                col_start + line.chars().count()
            };
            let rref = SourceRef::new(
                Pos::new(row, col_start),
                Pos::new(row, col_end),
                stripped,
                self.cur_file(),
            );
            self.code_leaf(self.current, stripped.to_string(), Some(rref));
        }
        Ok(())
    }

    /// 代码块：`[[\ code ]]`（global 为真时进全局前导）
    fn on_chunk(&mut self, tok: Token, global: bool) -> Result<(), SpyceError> {
        let (raw, begin, _end_tok) = self.collect_body("代码块", &tok)?;
        let target = if global { self.globals } else { self.current };

        // 去掉开头空行，修正首行行号
        let mut lines: Vec<String> = raw.split('\n').map(str::to_string).collect();
        let mut start_row = begin.row;
        while lines.len() > 1 && lines[0].trim().is_empty() {
            lines.remove(0);
            start_row += 1;
        }

        // 以首个非空行的前导空白为统一退缩进基准
        let outdent: String = lines
            .iter()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.chars().take_while(|c| c.is_whitespace()).collect())
            .unwrap_or_default();
        for line in &mut lines {
            if let Some(stripped) = line.strip_prefix(&outdent) {
                *line = stripped.to_string();
            } else {
                *line = line.trim_start().to_string();
            }
        }

        let (normalized, line_map) = normalize_multiline(&lines.join("\n"));
        for (i, line) in normalized.split('\n').enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // 剩余相对缩进换成占位字符，避免被输出阶段的修剪吞掉
            let kept: String = line.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
            let body = &line[kept.len()..];
            let held: String = std::iter::repeat(INDENT_HOLD).take(kept.chars().count()).collect();

            let row = start_row + line_map.get(i).copied().unwrap_or(i);
            let rref = SourceRef::new(
                Pos::new(row, 0),
                Pos::new(row, line.chars().count()),
                line,
                self.cur_file(),
            );
            self.code_leaf(target, format!("{held}{body}"), Some(rref));
        }
        Ok(())
    }

    /// lambda：`[[spy [!]params: body ]]`，展开为惰性可调用构造
    fn collect_lambda(&mut self, open: &Token) -> Result<String, SpyceError> {
        self.uses_lambda = true;
        let mut depth = 1usize;
        let mut text = String::new();
        loop {
            let t = self.next();
            match t.kind {
                TokenKind::Eof => {
                    return Err(self.err_at(open.begin, "lambda 未闭合，缺少 ']]'"));
                }
                TokenKind::End => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    text.push_str(&t.text);
                }
                TokenKind::Stmt
                | TokenKind::Eval
                | TokenKind::Chunk
                | TokenKind::GlobalChunk
                | TokenKind::Directive
                | TokenKind::Lambda
                | TokenKind::Comment => {
                    depth += 1;
                    text.push_str(&t.text);
                }
                TokenKind::Text | TokenKind::CommentEnd => {
                    text.push_str(&t.text);
                }
            }
        }

        let Some((params, body)) = text.split_once(':') else {
            return Err(self.err_at(open.begin, "lambda 缺少 ':' 分隔参数与函数体"));
        };
        let mut params = params.trim();
        let mut memoize = false;
        if let Some(rest) = params.strip_prefix('!') {
            memoize = true;
            params = rest.trim_start();
        }
        let (normalized, _) = normalize_multiline(body);
        let body = normalized.trim().replace('\n', " ");
        if body.is_empty() {
            return Err(self.err_at(open.begin, "lambda 函数体为空"));
        }

        Ok(if memoize {
            format!("lazy_call(lambda {params}: ({body}), memoize=1)")
        } else {
            format!("lazy_call(lambda {params}: ({body}))")
        })
    }

    /// 注释：跳过到 `--]]`；EOF 落在注释里是语法错误
    fn on_comment(&mut self, tok: Token) -> Result<(), SpyceError> {
        loop {
            let t = self.next();
            match t.kind {
                TokenKind::CommentEnd => return Ok(()),
                TokenKind::Eof => {
                    return Err(self.err_at(tok.begin, "注释未闭合，缺少 '--]]'"));
                }
                _ => {}
            }
        }
    }

    /// 指令：`[[. name attr=value ... ]]`
    fn on_directive(&mut self, tok: Token) -> Result<(), SpyceError> {
        let mut body = String::new();
        let end_tok;
        loop {
            let t = self.next();
            match t.kind {
                TokenKind::End => {
                    end_tok = t;
                    break;
                }
                TokenKind::Text => body.push_str(&t.text),
                TokenKind::Eof => {
                    return Err(self.err_at(tok.begin, "指令未闭合，缺少 ']]'"));
                }
                _ => {
                    return Err(
                        self.err_at(t.begin, format!("意外的标记 '{}'", t.kind.marker()))
                    );
                }
            }
        }

        let rref = self.make_ref(tok.begin, end_tok.end, &format!("[[.{body}]]"));
        let Some((name, attrs)) = parse_directive(&body) else {
            return Err(self.err_at(tok.begin, "无法解析指令"));
        };

        match name.as_str() {
            "compact" => self.directive_compact(&attrs, &tok, rref),
            "module" | "import" => self.directive_module(&attrs, &tok, rref),
            "taglib" => self.directive_taglib(&attrs, &tok, rref),
            "include" => self.directive_include(&attrs, &tok),
            other => Err(self.err_at(tok.begin, format!("未知指令 '.{other}'"))),
        }
    }

    fn directive_compact(
        &mut self,
        attrs: &HashMap<String, String>,
        tok: &Token,
        rref: SourceRef,
    ) -> Result<(), SpyceError> {
        let Some(value) = attrs.get("mode") else {
            return Err(self.err_at(tok.begin, "compact 指令缺少 mode 属性"));
        };
        let Some(mode) = CompactMode::parse(value) else {
            return Err(self.err_at(tok.begin, format!("无效的压缩模式 '{value}'")));
        };
        self.arena.push_leaf(
            self.current,
            Leaf::Compact {
                mode,
                rref: Some(rref),
            },
        );
        Ok(())
    }

    /// name / names 属性展开为 (name, from, as) 三元组序列
    fn decl_entries(
        &self,
        attrs: &HashMap<String, String>,
        tok: &Token,
        what: &str,
    ) -> Result<Vec<(String, Option<String>, String)>, SpyceError> {
        if let Some(n) = attrs.get("name") {
            let as_name = attrs.get("as").cloned().unwrap_or_else(|| n.clone());
            Ok(vec![(n.clone(), attrs.get("from").cloned(), as_name)])
        } else if let Some(ns) = attrs.get("names") {
            Ok(ns
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|n| (n.to_string(), None, n.to_string()))
                .collect())
        } else {
            Err(self.err_at(tok.begin, format!("{what} 指令缺少 name 属性")))
        }
    }

    fn directive_module(
        &mut self,
        attrs: &HashMap<String, String>,
        tok: &Token,
        rref: SourceRef,
    ) -> Result<(), SpyceError> {
        for (name, from, as_name) in self.decl_entries(attrs, tok, "module")? {
            if self.modules.iter().any(|m| m.as_name == as_name) {
                continue;
            }
            self.code_leaf(
                self.current,
                format!("{as_name}.spyce_init(response)"),
                Some(rref.clone()),
            );
            self.modules.push(ModuleDecl {
                name,
                from,
                as_name,
            });
        }
        Ok(())
    }

    fn directive_taglib(
        &mut self,
        attrs: &HashMap<String, String>,
        tok: &Token,
        rref: SourceRef,
    ) -> Result<(), SpyceError> {
        let containing = self.cur_file();
        for (name, from, as_name) in self.decl_entries(attrs, tok, "taglib")? {
            if self.taglibs.iter().any(|t| t.as_name == as_name) {
                continue;
            }
            self.checker
                .load_library(&name, from.as_deref(), &as_name, &containing, &rref)?;
            self.scanner.add_prefix(&as_name);
            let load_from = from.clone().unwrap_or_else(|| name.clone());
            self.code_leaf(
                self.current,
                format!("taglib.load_library('{as_name}', {})", py_str(&load_from)),
                Some(rref.clone()),
            );
            self.taglibs.push(TaglibDecl {
                name,
                from,
                as_name,
            });
        }
        Ok(())
    }

    /// include：在解析期就地拼接被包含内容的标记流
    ///
    /// `file` 指向文件，以当前目录为相对基准并切换目录上下文；
    /// `fragment` 查调用方预填的库片段注册表，占位处递归替换
    fn directive_include(
        &mut self,
        attrs: &HashMap<String, String>,
        tok: &Token,
    ) -> Result<(), SpyceError> {
        if self.frames.len() >= self.max_include_depth {
            return Err(self.err_at(
                tok.begin,
                format!("include 嵌套超过 {} 层上限", self.max_include_depth),
            ));
        }

        if let Some(name) = attrs.get("fragment") {
            let Some(text) = self.fragments.get(name) else {
                return Err(self.err_at(tok.begin, format!("未注册的库片段 '{name}'")));
            };
            let source = crate::compiler::normalize_newlines(text);
            let tokens = tokenize(&source);
            let dir = self.frames.last().expect("解析栈不可为空").dir.clone();
            self.frames.push(Frame {
                dir,
                file: format!("<fragment:{name}>"),
                source,
                tokens,
                cursor: 0,
            });
            return Ok(());
        }

        let Some(file) = attrs.get("file") else {
            return Err(self.err_at(tok.begin, "include 指令缺少 file 或 fragment 属性"));
        };

        let path = self.frames.last().expect("解析栈不可为空").dir.join(file);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            self.err_at(tok.begin, format!("无法读取 include 文件 {}：{e}", path.display()))
        })?;
        let source = crate::compiler::normalize_newlines(&text);
        let tokens = tokenize(&source);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        self.frames.push(Frame {
            dir,
            file: path.display().to_string(),
            source,
            tokens,
            cursor: 0,
        });
        Ok(())
    }
}

fn import_line(name: &str, from: Option<&str>, as_name: &str) -> String {
    match from {
        Some(f) if as_name == name => format!("from {f} import {name}"),
        Some(f) => format!("from {f} import {name} as {as_name}"),
        None if as_name == name => format!("import {name}"),
        None => format!("import {name} as {as_name}"),
    }
}

fn python_attr_dict(attrs: &[(String, String)]) -> String {
    if attrs.is_empty() {
        return "{}".to_string();
    }
    let pairs: Vec<String> = attrs
        .iter()
        .map(|(k, v)| format!("{}: {}", py_str(k), py_str(v)))
        .collect();
    format!("{{{}}}", pairs.join(", "))
}

/// 折叠跨行三引号字符串为单行转义字面量
///
/// 返回（新文本，每个输出行对应的源行偏移）；折叠造成的行数变化
/// 通过偏移表传给调用方，保证后续行引用仍对得上源行。
pub(crate) fn normalize_multiline(text: &str) -> (String, Vec<usize>) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut map = vec![0usize];
    let mut src_line = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // 三引号字符串
        if (c == '"' || c == '\'') && i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c
        {
            let quote = c;
            i += 3;
            let mut content = String::new();
            while i < chars.len() {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    if chars[i + 1] == '\n' {
                        src_line += 1;
                    }
                    content.push(chars[i]);
                    content.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if chars[i] == quote
                    && i + 2 < chars.len()
                    && chars[i + 1] == quote
                    && chars[i + 2] == quote
                {
                    i += 3;
                    break;
                }
                if chars[i] == '\n' {
                    src_line += 1;
                }
                content.push(chars[i]);
                i += 1;
            }
            out.push_str(&escape_single_line(&content));
            continue;
        }

        // 单行字符串：跳过内部字符以免误判引号与井号
        if c == '"' || c == '\'' {
            let quote = c;
            out.push(c);
            i += 1;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    out.push(ch);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                out.push(ch);
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\n' {
                    // 未闭合字符串：按普通换行处理
                    src_line += 1;
                    map.push(src_line);
                    break;
                }
            }
            continue;
        }

        // 注释延续到行尾
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                out.push(chars[i]);
                i += 1;
            }
            continue;
        }

        if c == '\n' {
            out.push('\n');
            src_line += 1;
            map.push(src_line);
            i += 1;
            continue;
        }

        out.push(c);
        i += 1;
    }

    (out, map)
}

/// 把原始字符串内容转成等价的单行单引号字面量
fn escape_single_line(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let mut out = String::from("'");
    let mut j = 0;
    while j < chars.len() {
        match chars[j] {
            '\\' if j + 1 < chars.len() => {
                // 续行折叠，其余既有转义原样保留
                if chars[j + 1] != '\n' {
                    out.push('\\');
                    out.push(chars[j + 1]);
                }
                j += 2;
            }
            '\\' => {
                out.push_str("\\\\");
                j += 1;
            }
            '\n' => {
                out.push_str("\\n");
                j += 1;
            }
            '\r' => {
                out.push_str("\\r");
                j += 1;
            }
            '\t' => {
                out.push_str("\\t");
                j += 1;
            }
            '\'' => {
                out.push_str("\\'");
                j += 1;
            }
            ch => {
                out.push(ch);
                j += 1;
            }
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Leaf;
    use crate::taglib::{BasicTagChecker, TagClass};
    use std::fs;
    use std::path::PathBuf;

    fn parse_with(
        source: &str,
        dir: &Path,
        checker: &mut BasicTagChecker,
        fragments: &FragmentRegistry,
        max_depth: usize,
    ) -> Result<ParseResult, SpyceError> {
        parse(source, "test.spy", dir, checker, fragments, max_depth)
    }

    fn parse_str(source: &str) -> ParseResult {
        let mut checker = BasicTagChecker::new();
        parse_with(
            source,
            Path::new("."),
            &mut checker,
            &FragmentRegistry::default(),
            64,
        )
        .expect("解析应当成功")
    }

    fn parse_err(source: &str) -> SpyceError {
        let mut checker = BasicTagChecker::new();
        parse_with(
            source,
            Path::new("."),
            &mut checker,
            &FragmentRegistry::default(),
            64,
        )
        .unwrap_err()
    }

    /// process 体内去掉固定前后缀的叶子
    fn body_leaves(result: &ParseResult) -> Vec<Leaf> {
        let process = result.arena.child(result.root, PROCESS).unwrap();
        let leaves = &result.arena.get(process).leaves;
        leaves[2..leaves.len() - 4].to_vec()
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spyce-parser-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn statement_lines_get_independent_refs() {
        let result = parse_str("[[\nx = 1\ny = 2\nz = x + y\n]]");
        let leaves = body_leaves(&result);
        let refs: Vec<(String, usize)> = leaves
            .iter()
            .filter_map(|l| match l {
                Leaf::Code { text, rref } => {
                    rref.as_ref().map(|r| (text.clone(), r.begin.row))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            refs,
            vec![
                ("x = 1".to_string(), 2),
                ("y = 2".to_string(), 3),
                ("z = x + y".to_string(), 4),
            ]
        );
    }

    #[test]
    fn eval_leaf_keeps_expression() {
        let result = parse_str("Hello [[= 1+1 ]] World");
        let leaves = body_leaves(&result);
        assert_eq!(leaves.len(), 3);
        match &leaves[1] {
            Leaf::Eval { expr, rref } => {
                assert_eq!(expr, "1+1");
                assert_eq!(rref.as_ref().unwrap().text, "1+1");
            }
            other => panic!("期望 Eval 叶，实际 {other:?}"),
        }
    }

    #[test]
    fn empty_eval_is_a_syntax_error() {
        let err = parse_err("[[=   ]]");
        assert!(err.to_string().contains("空表达式"));
    }

    #[test]
    fn unterminated_comment_is_a_syntax_error() {
        let err = parse_err("[[-- never closed");
        assert!(err.to_string().contains("注释未闭合"));
    }

    #[test]
    fn stray_end_is_unexpected() {
        let err = parse_err("text ]] more");
        assert!(err.to_string().contains("意外的标记"));
    }

    #[test]
    fn global_chunk_routes_to_globals() {
        let result = parse_str("[[\\\\\nHELPER = 1\n]]body");
        let globals = result.arena.child(result.root, GLOBALS).unwrap();
        let has_helper = result.arena.get(globals).leaves.iter().any(|l| {
            matches!(l, Leaf::Code { text, .. } if text == "HELPER = 1")
        });
        assert!(has_helper);
    }

    #[test]
    fn chunk_outdent_keeps_relative_indent_with_placeholder() {
        let result = parse_str("[[\\\n    if x: {\n        y()\n    }\n]]");
        let leaves = body_leaves(&result);
        let texts: Vec<String> = leaves
            .iter()
            .filter_map(|l| match l {
                Leaf::Code { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts[0], "if x: {");
        assert_eq!(texts[1], format!("{}y()", INDENT_HOLD.to_string().repeat(4)));
        assert_eq!(texts[2], "}");
    }

    #[test]
    fn lambda_expands_to_lazy_call() {
        let result = parse_str("[[= [[spy x: x+1]] ]]");
        let leaves = body_leaves(&result);
        match &leaves[0] {
            Leaf::Eval { expr, .. } => assert_eq!(expr, "lazy_call(lambda x: (x+1))"),
            other => panic!("期望 Eval 叶，实际 {other:?}"),
        }
    }

    #[test]
    fn lambda_bang_sets_memoize() {
        let result = parse_str("[[= [[spy !x: x*2]] ]]");
        let leaves = body_leaves(&result);
        match &leaves[0] {
            Leaf::Eval { expr, .. } => {
                assert_eq!(expr, "lazy_call(lambda x: (x*2), memoize=1)")
            }
            other => panic!("期望 Eval 叶，实际 {other:?}"),
        }
    }

    #[test]
    fn lambda_at_top_level_is_unexpected() {
        let err = parse_err("plain [[spy x: x]] text");
        assert!(err.to_string().contains("意外的标记"));
    }

    #[test]
    fn compact_directive_becomes_leaf() {
        let result = parse_str("[[.compact mode=full]]text");
        let leaves = body_leaves(&result);
        assert!(matches!(
            leaves[0],
            Leaf::Compact {
                mode: CompactMode::Full,
                ..
            }
        ));
    }

    #[test]
    fn invalid_compact_mode_is_a_syntax_error() {
        let err = parse_err("[[.compact mode=tight]]");
        assert!(err.to_string().contains("无效的压缩模式"));
    }

    #[test]
    fn module_directive_dedups_by_alias() {
        let result = parse_str("[[.module name=auth]][[.module name=auth]]");
        assert_eq!(result.modules.len(), 1);
        assert_eq!(result.modules[0].as_name, "auth");
    }

    #[test]
    fn module_without_name_is_a_syntax_error() {
        let err = parse_err("[[.module]]");
        assert!(err.to_string().contains("缺少 name 属性"));
    }

    #[test]
    fn include_splices_in_document_order() {
        let dir = temp_dir("splice");
        fs::write(dir.join("a.spy"), "MIDDLE").unwrap();
        let main = "BEFORE[[.include file=a.spy]]AFTER";

        let mut checker = BasicTagChecker::new();
        let result =
            parse_with(main, &dir, &mut checker, &FragmentRegistry::default(), 64).unwrap();
        let leaves = body_leaves(&result);
        let texts: Vec<String> = leaves
            .iter()
            .filter_map(|l| match l {
                Leaf::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["BEFORE", "MIDDLE", "AFTER"]);
    }

    #[test]
    fn self_include_hits_depth_limit() {
        let dir = temp_dir("selfinc");
        fs::write(dir.join("loop.spy"), "[[.include file=loop.spy]]").unwrap();

        let mut checker = BasicTagChecker::new();
        let err = parse_with(
            "[[.include file=loop.spy]]",
            &dir,
            &mut checker,
            &FragmentRegistry::default(),
            8,
        )
        .unwrap_err();
        assert!(err.to_string().contains("嵌套超过"));
    }

    #[test]
    fn fragment_include_splices_registry_content() {
        let mut registry = FragmentRegistry::new();
        registry.register("header", "HEAD [[=version]] ");

        let mut checker = BasicTagChecker::new();
        let result = parse_with(
            "[[.include fragment=header]]body",
            Path::new("."),
            &mut checker,
            &registry,
            64,
        )
        .unwrap();
        let leaves = body_leaves(&result);
        assert!(matches!(&leaves[0], Leaf::Text { text, .. } if text == "HEAD "));
        assert!(matches!(&leaves[1], Leaf::Eval { expr, .. } if expr == "version"));
        assert!(matches!(&leaves[2], Leaf::Text { text, .. } if text == " "));
        assert!(matches!(&leaves[3], Leaf::Text { text, .. } if text == "body"));
    }

    #[test]
    fn nested_fragments_resolve_recursively() {
        let mut registry = FragmentRegistry::new();
        registry.register("outer", "A[[.include fragment=inner]]C");
        registry.register("inner", "B");

        let mut checker = BasicTagChecker::new();
        let result = parse_with(
            "[[.include fragment=outer]]",
            Path::new("."),
            &mut checker,
            &registry,
            64,
        )
        .unwrap();
        let texts: Vec<String> = body_leaves(&result)
            .iter()
            .filter_map(|l| match l {
                Leaf::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }

    #[test]
    fn unregistered_fragment_is_a_syntax_error() {
        let err = parse_err("[[.include fragment=missing]]");
        assert!(err.to_string().contains("未注册的库片段"));
    }

    #[test]
    fn missing_include_file_is_a_syntax_error() {
        let err = parse_err("[[.include file=no-such-file.spy]]");
        assert!(err.to_string().contains("无法读取 include 文件"));
    }

    #[test]
    fn undeclared_tag_passes_through_as_text() {
        let result = parse_str("a <foo:bar/> b");
        let leaves = body_leaves(&result);
        assert_eq!(leaves.len(), 1);
        assert!(matches!(
            &leaves[0],
            Leaf::Text { text, .. } if text == "a <foo:bar/> b"
        ));
    }

    #[test]
    fn declared_tag_expands_to_protocol_code() {
        let mut checker = BasicTagChecker::new();
        checker.register_library(
            "ui",
            &[(
                "item",
                TagClass {
                    catches: false,
                    conditional: true,
                    mustend: true,
                    loops: true,
                },
            )],
        );
        let result = parse_with(
            "[[.taglib name=ui]]<ui:item>body</ui:item>",
            Path::new("."),
            &mut checker,
            &FragmentRegistry::default(),
            64,
        )
        .unwrap();
        let leaves = body_leaves(&result);
        let codes: Vec<String> = leaves
            .iter()
            .filter_map(|l| match l {
                Leaf::Code { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert!(codes.iter().any(|c| c.starts_with("taglib.tag_push('ui', 'item'")));
        assert!(codes.contains(&"if taglib.tag_begin(): {".to_string()));
        assert!(codes.contains(&"while 1: {".to_string()));
        assert!(codes.contains(&"if not taglib.tag_loop(): break".to_string()));
        assert!(codes.contains(&"taglib.tag_end()".to_string()));
        assert!(codes.contains(&"taglib.tag_pop()".to_string()));
    }

    #[test]
    fn mustend_singleton_is_a_syntax_error() {
        let mut checker = BasicTagChecker::new();
        checker.register_library(
            "ui",
            &[(
                "item",
                TagClass {
                    mustend: true,
                    ..TagClass::default()
                },
            )],
        );
        let err = parse_with(
            "[[.taglib name=ui]]<ui:item/>",
            Path::new("."),
            &mut checker,
            &FragmentRegistry::default(),
            64,
        )
        .unwrap_err();
        assert!(err.to_string().contains("必须成对出现"));
    }

    #[test]
    fn normalize_collapses_triple_quoted_strings() {
        let (out, map) = normalize_multiline("x = \"\"\"a\nb\"\"\"\ny = 2");
        assert_eq!(out, "x = 'a\\nb'\ny = 2");
        // 折叠后第二个输出行对应源第三行（偏移 2）
        assert_eq!(map, vec![0, 2]);
    }

    #[test]
    fn wrapper_exception_arms_are_ordered() {
        let result = parse_str("hi");
        let process = result.arena.child(result.root, PROCESS).unwrap();
        let leaves = &result.arena.get(process).leaves;
        let tail: Vec<String> = leaves[leaves.len() - 4..]
            .iter()
            .filter_map(|l| match l {
                Leaf::Code { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            tail,
            vec![
                "} except SpyceDone: pass".to_string(),
                "except SpyceRedirect: raise".to_string(),
                "except KeyboardInterrupt: raise".to_string(),
                "except Exception: raise SpyceRuntimeError(response)".to_string(),
            ]
        );
    }

    #[test]
    fn runtime_import_is_first_global_leaf() {
        let result = parse_str("hi");
        let globals = result.arena.child(result.root, GLOBALS).unwrap();
        match &result.arena.get(globals).leaves[0] {
            Leaf::Code { text, .. } => {
                assert!(text.starts_with("from spyce_runtime import SpyceDone"))
            }
            other => panic!("期望 Code 叶，实际 {other:?}"),
        }
    }
}
