use crate::compiler::ast::{Arena, Leaf, NodeId, SourceRef};
use crate::compiler::error::SpyceError;
use crate::compiler::parser::INDENT_HOLD;
use std::collections::BTreeMap;

/// Stage A 的中间表示：行事件与块深度增减事件，
/// 取代字面花括号文本，省去二次完整词法扫描
#[derive(Debug, Clone, PartialEq)]
pub enum EmitEvent {
    Line {
        text: String,
        rref: Option<SourceRef>,
    },
    Open,
    Close,
}

/// Stage A：深度优先渲染 codepoint 树为事件列表
///
/// 带块标记的节点先出首叶签名行再开块；全局前导子块总是最先；
/// 叶子按序渲染（Text → 写字面量，Eval → 写表达式，Code → 原样拆分，
/// 模式叶只改状态、不产出）。
pub fn emit_events(arena: &Arena, root: NodeId) -> Vec<EmitEvent> {
    let mut events = Vec::new();
    emit_codepoint(arena, root, &mut events);
    events
}

fn emit_codepoint(arena: &Arena, id: NodeId, events: &mut Vec<EmitEvent>) {
    let cp = arena.get(id);
    let mut leaves = cp.leaves.iter();

    if cp.braced {
        if let Some(header) = leaves.next() {
            emit_leaf(header, events);
        }
        events.push(EmitEvent::Open);
    }

    for child in arena.ordered_children(id) {
        emit_codepoint(arena, child, events);
    }

    for leaf in leaves {
        emit_leaf(leaf, events);
    }

    if cp.braced {
        events.push(EmitEvent::Close);
    }
}

fn emit_leaf(leaf: &Leaf, events: &mut Vec<EmitEvent>) {
    match leaf {
        Leaf::Text { text, rref } => events.push(EmitEvent::Line {
            text: format!("response.write_static({})", py_str(text)),
            rref: rref.clone(),
        }),
        Leaf::Eval { expr, rref } => events.push(EmitEvent::Line {
            text: format!("response.write_expr(({expr}))"),
            rref: rref.clone(),
        }),
        Leaf::Code { text, rref } => split_code(text, rref, events),
        Leaf::Compact { .. } => {}
    }
}

/// 把一行代码按块花括号拆为事件
///
/// 块花括号的判定：前一个有效字符是冒号、且不处于字面量花括号上下文
/// 之内的 `{` 开块；其余 `{`/`}` 是字典/集合字面量，原样保留。
/// 字符串与 `#` 注释里的花括号不参与判定。
fn split_code(text: &str, rref: &Option<SourceRef>, events: &mut Vec<EmitEvent>) {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut brace_lit = 0usize;
    let mut last_sig: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                // 字符串整体收入当前行
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
                    if ch == c {
                        break;
                    }
                }
                last_sig = Some(c);
            }
            '#' => {
                // 注释延续到行尾，花括号失效
                while i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '{' => {
                if brace_lit == 0 && last_sig == Some(':') {
                    flush_line(&mut out, rref, events);
                    events.push(EmitEvent::Open);
                    last_sig = None;
                } else {
                    brace_lit += 1;
                    out.push('{');
                    last_sig = Some('{');
                }
                i += 1;
            }
            '}' => {
                if brace_lit > 0 {
                    brace_lit -= 1;
                    out.push('}');
                    last_sig = Some('}');
                } else {
                    flush_line(&mut out, rref, events);
                    events.push(EmitEvent::Close);
                    last_sig = None;
                }
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c => {
                out.push(c);
                last_sig = Some(c);
                i += 1;
            }
        }
    }
    flush_line(&mut out, rref, events);
}

fn flush_line(out: &mut String, rref: &Option<SourceRef>, events: &mut Vec<EmitEvent>) {
    let line = out.trim();
    if !line.is_empty() {
        events.push(EmitEvent::Line {
            text: line.to_string(),
            rref: rref.clone(),
        });
    }
    out.clear();
}

/// 结构平衡校验：Stage B 之前的快速失败层
///
/// 深度为负或终止非零都按语法错误上报，引用取最近一个带引用的行事件。
pub fn validate_balance(events: &[EmitEvent]) -> Result<(), SpyceError> {
    let mut depth: i64 = 0;
    let mut last_ref: Option<&SourceRef> = None;

    for ev in events {
        match ev {
            EmitEvent::Line { rref, .. } => {
                if rref.is_some() {
                    last_ref = rref.as_ref();
                }
            }
            EmitEvent::Open => depth += 1,
            EmitEvent::Close => {
                depth -= 1;
                if depth < 0 {
                    return Err(SpyceError::syntax_at(
                        "生成代码块结构不平衡：多余的块闭合".to_string(),
                        last_ref,
                    ));
                }
            }
        }
    }

    if depth != 0 {
        return Err(SpyceError::syntax_at(
            format!("生成代码块结构不平衡：缺少 {depth} 个块闭合"),
            last_ref,
        ));
    }
    Ok(())
}

/// Stage B：按事件回放生成缩进代码，并重建最终行号到源引用的映射
pub fn format_events(events: &[EmitEvent]) -> (String, BTreeMap<usize, SourceRef>) {
    let mut out = String::new();
    let mut map = BTreeMap::new();
    let mut depth = 0usize;
    let mut line_no = 1usize;
    // 各层已输出行数，空块在闭合时补 pass
    let mut block_lines = vec![0usize];

    for ev in events {
        match ev {
            EmitEvent::Line { text, rref } => {
                out.push_str(&"    ".repeat(depth));
                out.push_str(&restore_held_indent(text));
                out.push('\n');
                if let Some(r) = rref {
                    map.insert(line_no, r.clone());
                }
                line_no += 1;
                if let Some(n) = block_lines.last_mut() {
                    *n += 1;
                }
            }
            EmitEvent::Open => {
                block_lines.push(0);
                depth += 1;
            }
            EmitEvent::Close => {
                if block_lines.pop() == Some(0) {
                    out.push_str(&"    ".repeat(depth));
                    out.push_str("pass\n");
                    line_no += 1;
                }
                depth = depth.saturating_sub(1);
                if let Some(n) = block_lines.last_mut() {
                    *n += 1;
                }
            }
        }
    }

    (out, map)
}

/// 块内缩进占位字符还原为空格
fn restore_held_indent(text: &str) -> String {
    if text.contains(INDENT_HOLD) {
        text.replace(INDENT_HOLD, " ")
    } else {
        text.to_string()
    }
}

/// 文本转等价的 Python 单引号字面量
pub(crate) fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
