use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// 指令名：首字符为字母，后续允许字母、数字、连字符、冒号、下划线
fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z][A-Za-z0-9_:\-]*)").expect("指令名正则非法"))
}

/// 属性对：name[=value]，value 为单引号、双引号或受限裸词
fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s+([A-Za-z][A-Za-z0-9_:\-]*)(?:\s*=\s*("[^"]*"|'[^']*'|[A-Za-z0-9_.:/\\\-]+))?"#)
            .expect("指令属性正则非法")
    })
}

/// 解析指令体为（小写指令名，属性表）
///
/// 首个无法匹配的尾部文本被静默丢弃；整体不成指令形时返回 None
pub fn parse_directive(body: &str) -> Option<(String, HashMap<String, String>)> {
    let caps = name_regex().captures(body)?;
    let name = caps[1].to_lowercase();
    let mut rest = &body[caps.get(0).unwrap().end()..];

    let mut attrs = HashMap::new();
    while let Some(c) = attr_regex().captures(rest) {
        let key = c[1].to_lowercase();
        let value = c.get(2).map(|m| unquote(m.as_str())).unwrap_or_default();
        attrs.entry(key).or_insert(value);
        rest = &rest[c.get(0).unwrap().end()..];
    }
    Some((name, attrs))
}

fn unquote(s: &str) -> String {
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// 文本中识别到的一个库标签
#[derive(Debug, Clone)]
pub struct TagMatch {
    /// 在被扫描文本中的字节区间
    pub start: usize,
    pub end: usize,
    /// `</pfx:name>` 闭合形式
    pub closing: bool,
    /// `<pfx:name .../>` 单体形式
    pub singleton: bool,
    pub prefix: String,
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

/// 行内库标签扫描器
///
/// 只识别经 `.taglib` 声明过的前缀；每次新增前缀后重建匹配模式。
/// 未声明前缀的 `<foo:bar>` 保持字面文本原样输出——这是刻意的回退而非错误。
#[derive(Debug, Default)]
pub struct TagScanner {
    prefixes: Vec<String>,
    re: Option<Regex>,
}

/// 标签内属性对
fn tag_attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z][A-Za-z0-9_:\-]*)(?:\s*=\s*("[^"]*"|'[^']*'))?"#)
            .expect("标签属性正则非法")
    })
}

impl TagScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_prefix(&mut self, prefix: &str) {
        if self.prefixes.iter().any(|p| p == prefix) {
            return;
        }
        self.prefixes.push(prefix.to_string());
        self.rebuild();
    }

    fn rebuild(&mut self) {
        let alternation = self
            .prefixes
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(
            r#"<(/?)({alternation}):([A-Za-z_][A-Za-z0-9_\-]*)((?:\s+[A-Za-z][A-Za-z0-9_:\-]*(?:\s*=\s*(?:"[^"]*"|'[^']*'))?)*)\s*(/?)\s*>"#
        );
        self.re = Some(Regex::new(&pattern).expect("标签扫描正则非法"));
    }

    /// 在文本中查找下一个已声明前缀的标签
    pub fn find(&self, text: &str) -> Option<TagMatch> {
        let re = self.re.as_ref()?;
        let caps = re.captures(text)?;
        let whole = caps.get(0).unwrap();

        let mut attrs = Vec::new();
        for a in tag_attr_regex().captures_iter(&caps[4]) {
            let key = a[1].to_lowercase();
            let value = a.get(2).map(|m| unquote(m.as_str())).unwrap_or_default();
            attrs.push((key, value));
        }

        Some(TagMatch {
            start: whole.start(),
            end: whole.end(),
            closing: !caps[1].is_empty(),
            singleton: !caps[5].is_empty(),
            prefix: caps[2].to_string(),
            name: caps[3].to_string(),
            attrs,
        })
    }
}
