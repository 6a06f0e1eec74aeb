use crate::compiler::token::Pos;
use serde::{Deserialize, Serialize};

/// 全局前导 codepoint 名称（import 与全局代码块，总是最先输出）
pub const GLOBALS: &str = "globals";
/// 主处理函数体 codepoint 名称
pub const PROCESS: &str = "process";

/// 源码引用：仅用于诊断与行号映射，不参与编译语义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub begin: Pos,
    pub end: Pos,
    /// 原始源码片段
    pub text: String,
    pub file: String,
}

impl SourceRef {
    pub fn new(begin: Pos, end: Pos, text: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            begin,
            end,
            text: text.into(),
            file: file.into(),
        }
    }
}

/// 压缩模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMode {
    Off,
    Line,
    Space,
    Full,
}

impl CompactMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "line" => Some(Self::Line),
            "space" => Some(Self::Space),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// 叶子记录：叶子顺序即生成顺序
#[derive(Debug, Clone)]
pub enum Leaf {
    /// 不透明代码行
    Code {
        text: String,
        rref: Option<SourceRef>,
    },
    /// 求值后写出的表达式
    Eval {
        expr: String,
        rref: Option<SourceRef>,
    },
    /// 字面文本输出
    Text {
        text: String,
        rref: Option<SourceRef>,
    },
    /// 切换压缩模式（按遍历顺序生效的状态指令）
    Compact {
        mode: CompactMode,
        rref: Option<SourceRef>,
    },
}

/// codepoint 句柄：arena 内的不透明下标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

/// 树节点：命名嵌套点（函数体、全局前导等作用域单元）
#[derive(Debug)]
pub struct Codepoint {
    #[allow(dead_code)]
    pub parent: Option<NodeId>,
    /// 命名子节点，名字唯一，按插入顺序保存
    pub children: Vec<(String, NodeId)>,
    pub leaves: Vec<Leaf>,
    /// 是否作为缩进子块输出；为真时首叶持有块的签名行
    pub braced: bool,
}

/// codepoint 树的 arena：句柄寻址，父子关系用句柄表达
#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<Codepoint>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parent: Option<NodeId>, braced: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Codepoint {
            parent,
            children: Vec::new(),
            leaves: Vec::new(),
            braced,
        });
        id
    }

    /// 新建命名子节点；同名子节点已存在时返回已有句柄
    pub fn add_child(&mut self, parent: NodeId, name: &str, braced: bool) -> NodeId {
        if let Some(existing) = self.child(parent, name) {
            return existing;
        }
        let id = self.add(Some(parent), braced);
        self.nodes[parent.0].children.push((name.to_string(), id));
        id
    }

    pub fn child(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[node.0]
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    pub fn get(&self, id: NodeId) -> &Codepoint {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Codepoint {
        &mut self.nodes[id.0]
    }

    pub fn push_leaf(&mut self, id: NodeId, leaf: Leaf) {
        self.nodes[id.0].leaves.push(leaf);
    }

    /// 子节点遍历顺序：全局前导优先，其余按插入顺序
    pub fn ordered_children(&self, id: NodeId) -> Vec<NodeId> {
        let cp = self.get(id);
        let mut out = Vec::with_capacity(cp.children.len());
        for (name, child) in &cp.children {
            if name == GLOBALS {
                out.insert(0, *child);
            } else {
                out.push(*child);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_child_is_idempotent_by_name() {
        let mut arena = Arena::new();
        let root = arena.add(None, false);
        let a = arena.add_child(root, "body", true);
        let b = arena.add_child(root, "body", true);
        assert_eq!(a, b);
        assert_eq!(arena.get(root).children.len(), 1);
        assert_eq!(arena.get(a).parent, Some(root));
    }

    #[test]
    fn globals_child_is_ordered_first() {
        let mut arena = Arena::new();
        let root = arena.add(None, false);
        let p = arena.add_child(root, PROCESS, true);
        let g = arena.add_child(root, GLOBALS, false);
        assert_eq!(arena.ordered_children(root), vec![g, p]);
    }
}
