use crate::compiler::ast::SourceRef;
use crate::compiler::error::SpyceError;
use std::collections::HashMap;

/// 标签类能力标志：编译器据此生成结构化代码，不解释标签语义
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagClass {
    /// 标签体包在 try 中，异常交给标签库处理
    pub catches: bool,
    /// 标签体是否执行由运行期 begin 调用决定
    pub conditional: bool,
    /// 标签必须成对出现，不允许单体形式
    pub mustend: bool,
    /// 标签体可循环执行
    pub loops: bool,
}

/// 标签库能力检查协作者
///
/// 编译核心只发起这些调用；标签的真正语义属运行期，核心不关心。
pub trait TagChecker {
    /// `.taglib` 指令声明一个库
    fn load_library(
        &mut self,
        name: &str,
        from: Option<&str>,
        as_name: &str,
        containing_file: &str,
        rref: &SourceRef,
    ) -> Result<(), SpyceError>;

    /// 查询标签类能力标志
    fn tag_class(&mut self, prefix: &str, name: &str, rref: &SourceRef)
    -> Result<TagClass, SpyceError>;

    /// 遇到开标签（或单体标签）时的结构校验
    fn start_tag(
        &mut self,
        prefix: &str,
        name: &str,
        singleton: bool,
        rref: &SourceRef,
    ) -> Result<(), SpyceError>;

    /// 遇到闭标签时的结构校验
    fn end_tag(&mut self, prefix: &str, name: &str, rref: &SourceRef) -> Result<(), SpyceError>;

    /// 解析结束时校验是否仍有未闭合标签
    fn finish(&mut self) -> Result<(), SpyceError>;
}

/// 库片段注册表：片段名 → 可拼接的模板片段文本
///
/// 编译开始前由调用方一次性填充，解析期间只读，编译结束即弃。
/// `.include fragment=名字` 在占位处递归替换片段内容（片段可再引用
/// 其他片段，环路由 include 深度上限兜底）。
#[derive(Debug, Default, Clone)]
pub struct FragmentRegistry {
    fragments: HashMap<String, String>,
}

impl FragmentRegistry {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn register(&mut self, name: &str, template_text: &str) {
        self.fragments
            .insert(name.to_string(), template_text.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fragments.get(name).map(String::as_str)
    }
}

/// 基于注册表的默认实现：栈式校验标签配对
///
/// 库内容可由调用方预注册（CLI、测试）；`.taglib` 声明未预注册的库时
/// 按空库接受，标签类回退为全 false 的默认能力。
#[derive(Debug, Default)]
pub struct BasicTagChecker {
    libraries: HashMap<String, HashMap<String, TagClass>>,
    open_stack: Vec<(String, String, SourceRef)>,
}

impl BasicTagChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预注册一个库及其标签类
    #[allow(dead_code)]
    pub fn register_library(&mut self, prefix: &str, tags: &[(&str, TagClass)]) {
        let entry = self.libraries.entry(prefix.to_string()).or_default();
        for (name, class) in tags {
            entry.insert((*name).to_string(), *class);
        }
    }
}

impl TagChecker for BasicTagChecker {
    fn load_library(
        &mut self,
        _name: &str,
        _from: Option<&str>,
        as_name: &str,
        _containing_file: &str,
        _rref: &SourceRef,
    ) -> Result<(), SpyceError> {
        self.libraries.entry(as_name.to_string()).or_default();
        Ok(())
    }

    fn tag_class(
        &mut self,
        prefix: &str,
        name: &str,
        rref: &SourceRef,
    ) -> Result<TagClass, SpyceError> {
        let lib = self.libraries.get(prefix).ok_or_else(|| {
            SpyceError::syntax_at(format!("标签库 '{prefix}' 未经 .taglib 声明"), Some(rref))
        })?;
        Ok(lib.get(name).copied().unwrap_or_default())
    }

    fn start_tag(
        &mut self,
        prefix: &str,
        name: &str,
        singleton: bool,
        rref: &SourceRef,
    ) -> Result<(), SpyceError> {
        if !singleton {
            self.open_stack
                .push((prefix.to_string(), name.to_string(), rref.clone()));
        }
        Ok(())
    }

    fn end_tag(&mut self, prefix: &str, name: &str, rref: &SourceRef) -> Result<(), SpyceError> {
        match self.open_stack.pop() {
            Some((p, n, _)) if p == prefix && n == name => Ok(()),
            Some((p, n, _)) => Err(SpyceError::syntax_at(
                format!("标签闭合不匹配：期待 </{p}:{n}>，实际 </{prefix}:{name}>"),
                Some(rref),
            )),
            None => Err(SpyceError::syntax_at(
                format!("多余的闭合标签 </{prefix}:{name}>"),
                Some(rref),
            )),
        }
    }

    fn finish(&mut self) -> Result<(), SpyceError> {
        match self.open_stack.pop() {
            Some((p, n, rref)) => Err(SpyceError::syntax_at(
                format!("标签 <{p}:{n}> 未闭合"),
                Some(&rref),
            )),
            None => Ok(()),
        }
    }
}
