use crate::compiler::ast::{Arena, CompactMode, Leaf, NodeId};
use regex::Regex;
use std::sync::OnceLock;

/// 三遍独立改写：压缩、相邻文本合并（行拆分遍存在但未启用）
pub fn optimize(arena: &mut Arena, root: NodeId) {
    compact_walk(arena, root, CompactMode::Line);
    merge_walk(arena, root);
}

/// 压缩遍：深度优先，全局前导子块优先，随后本节点叶子按序处理
///
/// 当前模式是显式累加器，随遍历折叠传递并返回给调用方，
/// 兄弟顺序由此保持，无隐藏全局状态。
fn compact_walk(arena: &mut Arena, node: NodeId, mode: CompactMode) -> CompactMode {
    let mut mode = mode;
    for child in arena.ordered_children(node) {
        mode = compact_walk(arena, child, mode);
    }

    let mut leaves = std::mem::take(&mut arena.get_mut(node).leaves);
    let mut i = 0;
    while i < leaves.len() {
        match &leaves[i] {
            Leaf::Compact { mode: m, .. } => {
                mode = *m;
                i += 1;
            }
            Leaf::Text { .. } => {
                let new_text = compact_text(&leaves, i, mode);
                if new_text.is_empty() {
                    // 压缩后为空的文本叶直接删除
                    leaves.remove(i);
                } else {
                    if let Leaf::Text { text, .. } = &mut leaves[i] {
                        *text = new_text;
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    arena.get_mut(node).leaves = leaves;
    mode
}

fn compact_text(leaves: &[Leaf], i: usize, mode: CompactMode) -> String {
    let Leaf::Text { text, .. } = &leaves[i] else {
        return String::new();
    };
    match mode {
        CompactMode::Off => text.clone(),
        CompactMode::Line => gobble_and_trim(leaves, i, text),
        CompactMode::Space => space_compact(text),
        CompactMode::Full => space_compact(&gobble_and_trim(leaves, i, text)),
    }
}

/// Line/Full 模式：整行空白吞并 + 完整行的行尾空白修剪
///
/// 吞并条件：该片段整体是空白，且同文件同一行上相邻叶子的其余部分
/// 也全是空白（Eval 叶算"有内容"，阻断吞并；语句与模式叶不产出，透明）。
fn gobble_and_trim(leaves: &[Leaf], i: usize, text: &str) -> String {
    let mut s = text.to_string();

    if let Some(head_len) = s.find('\n') {
        // 行首空白片段吞并（连同换行）
        let head = &s[..head_len];
        if head.trim().is_empty() && row_clear_behind(leaves, i) {
            s.drain(..=head_len);
        }
    } else if s.trim().is_empty() && row_clear_behind(leaves, i) && row_clear_ahead(leaves, i) {
        // 整叶即一个空白行片段
        return String::new();
    }

    if let Some(tail_start) = s.rfind('\n') {
        // 行尾空白片段吞并（不含换行，换行属于已完成的上一行）
        let tail = &s[tail_start + 1..];
        if !tail.is_empty() && tail.trim().is_empty() && row_clear_ahead(leaves, i) {
            s.truncate(tail_start + 1);
        }
    }

    // 完整行（以换行收尾的片段）修剪行尾空白
    let parts: Vec<&str> = s.split('\n').collect();
    let total = parts.len();
    let mut out = String::with_capacity(s.len());
    for (k, part) in parts.iter().enumerate() {
        if k + 1 < total {
            out.push_str(part.trim_end_matches([' ', '\t']));
            out.push('\n');
        } else {
            out.push_str(part);
        }
    }
    out
}

fn leaf_file(leaf: &Leaf) -> Option<&str> {
    let (Leaf::Code { rref, .. }
    | Leaf::Eval { rref, .. }
    | Leaf::Text { rref, .. }
    | Leaf::Compact { rref, .. }) = leaf;
    rref.as_ref().map(|r| r.file.as_str())
}

/// 向前回看：本行在当前叶之前是否只有空白
fn row_clear_behind(leaves: &[Leaf], i: usize) -> bool {
    let file = leaf_file(&leaves[i]);
    for j in (0..i).rev() {
        match &leaves[j] {
            Leaf::Compact { .. } | Leaf::Code { .. } => continue,
            Leaf::Eval { .. } => return false,
            Leaf::Text { text, .. } => {
                if leaf_file(&leaves[j]) != file {
                    // include 边界即行边界
                    return true;
                }
                let tail = text.rsplit('\n').next().unwrap_or("");
                if !tail.trim().is_empty() {
                    return false;
                }
                if text.contains('\n') {
                    return true;
                }
            }
        }
    }
    true
}

/// 向后预看：本行在当前叶之后是否只有空白
fn row_clear_ahead(leaves: &[Leaf], i: usize) -> bool {
    let file = leaf_file(&leaves[i]);
    for leaf in &leaves[i + 1..] {
        match leaf {
            Leaf::Compact { .. } | Leaf::Code { .. } => continue,
            Leaf::Eval { .. } => return false,
            Leaf::Text { text, .. } => {
                if leaf_file(leaf) != file {
                    return true;
                }
                let head = text.split('\n').next().unwrap_or("");
                if !head.trim().is_empty() {
                    return false;
                }
                if text.contains('\n') {
                    return true;
                }
            }
        }
    }
    true
}

/// 连续空白折叠为单个空格（不碰换行）
pub(crate) fn space_compact(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[ \t]+").expect("空白折叠正则非法"));
    re.replace_all(s, " ").into_owned()
}

/// 相邻文本合并遍：同文件的连续 Text 叶并为一个，减少写调用次数
fn merge_walk(arena: &mut Arena, node: NodeId) {
    for child in arena.ordered_children(node) {
        merge_walk(arena, child);
    }

    let leaves = &mut arena.get_mut(node).leaves;
    let mut k = 0;
    while k + 1 < leaves.len() {
        let mergeable = matches!(
            (&leaves[k], &leaves[k + 1]),
            (
                Leaf::Text { rref: Some(a), .. },
                Leaf::Text { rref: Some(b), .. },
            ) if a.file == b.file
        );
        if !mergeable {
            k += 1;
            continue;
        }
        let Leaf::Text { text: t2, rref: r2 } = leaves.remove(k + 1) else {
            unreachable!("合并判定已确认为 Text 叶");
        };
        if let Leaf::Text { text, rref } = &mut leaves[k] {
            text.push_str(&t2);
            if let (Some(r), Some(r2)) = (rref.as_mut(), r2) {
                // 保留首叶起点与次叶终点
                r.end = r2.end;
                r.text.push_str(&r2.text);
            }
        }
    }
}

/// 把含换行的 Code 叶拆为逐行叶子
/// TODO!!! 与压缩遍的先后交互未验证，暂不接入 optimize 流水线
#[allow(dead_code)]
fn split_code_lines(arena: &mut Arena, node: NodeId) {
    for child in arena.ordered_children(node) {
        split_code_lines(arena, child);
    }

    let leaves = std::mem::take(&mut arena.get_mut(node).leaves);
    let mut out = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        match leaf {
            Leaf::Code { text, rref } if text.contains('\n') => {
                for line in text.split('\n') {
                    if line.trim().is_empty() {
                        continue;
                    }
                    out.push(Leaf::Code {
                        text: line.to_string(),
                        rref: rref.clone(),
                    });
                }
            }
            other => out.push(other),
        }
    }
    arena.get_mut(node).leaves = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::SourceRef;
    use crate::compiler::token::Pos;

    fn rref(file: &str, text: &str) -> Option<SourceRef> {
        Some(SourceRef::new(Pos::new(1, 0), Pos::new(1, 0), text, file))
    }

    fn text_leaf(s: &str) -> Leaf {
        Leaf::Text {
            text: s.to_string(),
            rref: rref("t.spy", s),
        }
    }

    fn build(leaves: Vec<Leaf>) -> (Arena, NodeId) {
        let mut arena = Arena::new();
        let root = arena.add(None, false);
        for l in leaves {
            arena.push_leaf(root, l);
        }
        (arena, root)
    }

    fn texts(arena: &Arena, root: NodeId) -> Vec<String> {
        arena
            .get(root)
            .leaves
            .iter()
            .filter_map(|l| match l {
                Leaf::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn line_mode_trims_trailing_whitespace_of_complete_lines() {
        let (mut arena, root) = build(vec![text_leaf("a  \nb")]);
        compact_walk(&mut arena, root, CompactMode::Line);
        assert_eq!(texts(&arena, root), vec!["a\nb"]);
    }

    #[test]
    fn line_mode_keeps_inline_fragment_whitespace() {
        // "Hello " 与 " World" 夹着一个 Eval：任何空白都不能动
        let (mut arena, root) = build(vec![
            text_leaf("Hello "),
            Leaf::Eval {
                expr: "1+1".to_string(),
                rref: rref("t.spy", "1+1"),
            },
            text_leaf(" World"),
        ]);
        compact_walk(&mut arena, root, CompactMode::Line);
        assert_eq!(texts(&arena, root), vec!["Hello ", " World"]);
    }

    #[test]
    fn statement_only_line_is_gobbled() {
        // 源 "  [[x]]  \nnext"：语句叶透明，两侧空白片段整行吞并
        let (mut arena, root) = build(vec![
            text_leaf("  "),
            Leaf::Code {
                text: "x()".to_string(),
                rref: rref("t.spy", "x()"),
            },
            text_leaf("  \nnext"),
        ]);
        compact_walk(&mut arena, root, CompactMode::Line);
        assert_eq!(texts(&arena, root), vec!["next"]);
    }

    #[test]
    fn eval_blocks_gobbling() {
        let (mut arena, root) = build(vec![
            text_leaf("  "),
            Leaf::Eval {
                expr: "x".to_string(),
                rref: rref("t.spy", "x"),
            },
            text_leaf("\nnext"),
        ]);
        compact_walk(&mut arena, root, CompactMode::Line);
        // Eval 有输出，行首空白保留
        assert_eq!(texts(&arena, root), vec!["  ", "\nnext"]);
    }

    #[test]
    fn space_mode_collapses_runs() {
        let (mut arena, root) = build(vec![
            Leaf::Compact {
                mode: CompactMode::Space,
                rref: None,
            },
            text_leaf("a   b\t\tc\nd  e"),
        ]);
        compact_walk(&mut arena, root, CompactMode::Line);
        assert_eq!(texts(&arena, root), vec!["a b c\nd e"]);
    }

    #[test]
    fn full_mode_is_idempotent() {
        let source = vec![
            text_leaf("  title   text  \n"),
            text_leaf("   \n"),
            text_leaf("tail  line\n"),
        ];
        let (mut arena1, root1) = build(source.clone());
        compact_walk(&mut arena1, root1, CompactMode::Full);
        let once = texts(&arena1, root1);

        let again: Vec<Leaf> = arena1.get(root1).leaves.clone();
        let (mut arena2, root2) = build(again);
        compact_walk(&mut arena2, root2, CompactMode::Full);
        assert_eq!(texts(&arena2, root2), once);
    }

    #[test]
    fn compact_mode_leaf_switches_state_in_order() {
        let (mut arena, root) = build(vec![
            text_leaf("a  \n"),
            Leaf::Compact {
                mode: CompactMode::Off,
                rref: None,
            },
            text_leaf("b  \n"),
        ]);
        compact_walk(&mut arena, root, CompactMode::Line);
        assert_eq!(texts(&arena, root), vec!["a\n", "b  \n"]);
    }

    #[test]
    fn merge_joins_adjacent_text_from_same_file() {
        let (mut arena, root) = build(vec![text_leaf("ab"), text_leaf("cd")]);
        merge_walk(&mut arena, root);
        assert_eq!(texts(&arena, root), vec!["abcd"]);
    }

    #[test]
    fn merge_respects_file_boundaries() {
        let other = Leaf::Text {
            text: "cd".to_string(),
            rref: rref("included.spy", "cd"),
        };
        let (mut arena, root) = build(vec![text_leaf("ab"), other]);
        merge_walk(&mut arena, root);
        assert_eq!(texts(&arena, root), vec!["ab", "cd"]);
    }

    #[test]
    fn off_mode_changes_nothing() {
        let (mut arena, root) = build(vec![
            Leaf::Compact {
                mode: CompactMode::Off,
                rref: None,
            },
            text_leaf("  a  \n  "),
        ]);
        compact_walk(&mut arena, root, CompactMode::Line);
        assert_eq!(texts(&arena, root), vec!["  a  \n  "]);
    }
}
