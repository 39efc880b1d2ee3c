/// 操作签名（Schema）与注册表
///
/// Schema 描述一个操作种类的参数个数、返回个数，以及每个参数的别名标注
/// （无 / 只读 / 可写）。文本格式沿用 TorchScript 风格：
///
/// ```text
/// aten::add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)
/// ```

use std::collections::HashMap;
use std::fmt;

use crate::error::FusionError;
use crate::graph::{Graph, NodeData, NodeId, OpKind};

/// 参数别名标注
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AliasAnnotation {
    /// 无标注：不与任何其他值共享存储
    #[default]
    None,
    /// `Tensor(a)`：可能与同集合的值共享存储，只读
    Read(Vec<String>),
    /// `Tensor(a!)`：可能与同集合的值共享存储，且会被写入
    Write(Vec<String>),
}

impl AliasAnnotation {
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, AliasAnnotation::Write(_))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, AliasAnnotation::None)
    }

    pub fn sets(&self) -> &[String] {
        match self {
            AliasAnnotation::None => &[],
            AliasAnnotation::Read(sets) | AliasAnnotation::Write(sets) => sets,
        }
    }

    /// 两个标注是否有公共的别名集合
    pub fn shares_set_with(&self, other: &AliasAnnotation) -> bool {
        self.sets().iter().any(|s| other.sets().contains(s))
    }

    fn parse(inner: &str) -> Self {
        let inner = inner.trim();
        let (body, write) = match inner.strip_suffix('!') {
            Some(body) => (body, true),
            None => (inner, false),
        };
        let sets: Vec<String> = body
            .split('|')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if write {
            AliasAnnotation::Write(sets)
        } else {
            AliasAnnotation::Read(sets)
        }
    }
}

/// 参数或返回值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub type_name: String,
    pub alias: AliasAnnotation,
    pub default: Option<String>,
    pub kwarg_only: bool,
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name)?;
        match &self.alias {
            AliasAnnotation::None => {}
            AliasAnnotation::Read(sets) => write!(f, "({})", sets.join("|"))?,
            AliasAnnotation::Write(sets) => write!(f, "({}!)", sets.join("|"))?,
        }
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        if let Some(default) = &self.default {
            write!(f, "={}", default)?;
        }
        Ok(())
    }
}

/// 操作签名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSchema {
    pub name: OpKind,
    pub overload: String,
    pub arguments: Vec<Argument>,
    pub returns: Vec<Argument>,
}

impl FunctionSchema {
    /// 解析 TorchScript 风格的签名文本
    pub fn parse(text: &str) -> Result<Self, FusionError> {
        let err = |reason: &str| FusionError::SchemaParse {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let open = text.find('(').ok_or_else(|| err("missing argument list"))?;
        let head = text[..open].trim();
        if !head.contains("::") {
            return Err(err("operator name must be namespace-qualified"));
        }
        let (name, overload) = match head.rfind('.') {
            Some(dot) if dot > head.rfind("::").unwrap_or(0) => (&head[..dot], &head[dot + 1..]),
            _ => (head, ""),
        };
        if name.ends_with("::") {
            return Err(err("empty operator name"));
        }

        let close = matching_paren(text, open).ok_or_else(|| err("unbalanced parentheses"))?;
        let args_text = &text[open + 1..close];
        let rest = text[close + 1..].trim();
        let returns_text = rest
            .strip_prefix("->")
            .ok_or_else(|| err("missing `->` before returns"))?
            .trim();

        let mut arguments = Vec::new();
        let mut kwarg_only = false;
        for piece in split_top_level(args_text) {
            if piece == "*" {
                kwarg_only = true;
                continue;
            }
            let mut arg = parse_argument(piece).map_err(|r| err(r))?;
            arg.kwarg_only = kwarg_only;
            arguments.push(arg);
        }

        let returns_inner = if returns_text.starts_with('(') {
            let end = matching_paren(returns_text, 0).ok_or_else(|| err("unbalanced returns"))?;
            if end + 1 != returns_text.len() {
                return Err(err("trailing text after returns"));
            }
            &returns_text[1..end]
        } else {
            returns_text
        };
        let returns = split_top_level(returns_inner)
            .into_iter()
            .map(parse_argument)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|r| err(r))?;

        Ok(FunctionSchema {
            name: OpKind::new(name),
            overload: overload.to_string(),
            arguments,
            returns,
        })
    }

    /// `Tensor(a!)` 写入标注所在的参数下标
    pub fn written_arguments(&self) -> impl Iterator<Item = usize> + '_ {
        self.arguments
            .iter()
            .enumerate()
            .filter(|(_, a)| a.alias.is_write())
            .map(|(i, _)| i)
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.overload.is_empty() {
            write!(f, ".{}", self.overload)?;
        }
        f.write_str("(")?;
        let mut star_written = false;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if arg.kwarg_only && !star_written {
                f.write_str("*, ")?;
                star_written = true;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(") -> ")?;
        if self.returns.len() == 1 {
            write!(f, "{}", self.returns[0])
        } else {
            f.write_str("(")?;
            for (i, ret) in self.returns.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", ret)?;
            }
            f.write_str(")")
        }
    }
}

/// 给定 `open` 处的 '('，返回与之匹配的 ')' 下标
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ch) in text.char_indices().skip_while(|(i, _)| *i < open) {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (ch == ')').then_some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// 按顶层逗号切分（忽略括号内的逗号）
fn split_top_level(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last);
    }
    out
}

fn parse_argument(text: &str) -> Result<Argument, &'static str> {
    if text.is_empty() {
        return Err("empty argument");
    }
    let (decl, default) = match top_level_find(text, '=') {
        Some(eq) => (text[..eq].trim(), Some(text[eq + 1..].trim().to_string())),
        None => (text, None),
    };

    // 类型与名字以最后一个顶层空白分隔；返回值可以没有名字
    let (type_text, name) = match top_level_rfind_whitespace(decl) {
        Some(ws) => (decl[..ws].trim(), decl[ws..].trim()),
        None => (decl, ""),
    };
    if type_text.is_empty() {
        return Err("missing argument type");
    }

    let (type_name, alias) = match type_text.find('(') {
        Some(open) => {
            let close = type_text[open..]
                .find(')')
                .map(|c| c + open)
                .ok_or("unterminated alias annotation")?;
            let mut base = type_text[..open].to_string();
            base.push_str(&type_text[close + 1..]);
            (base, AliasAnnotation::parse(&type_text[open + 1..close]))
        }
        None => (type_text.to_string(), AliasAnnotation::None),
    };

    Ok(Argument {
        name: name.to_string(),
        type_name,
        alias,
        default,
        kwarg_only: false,
    })
}

fn top_level_find(text: &str, needle: char) -> Option<usize> {
    let mut depth = 0i32;
    for (i, ch) in text.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c == needle && depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn top_level_rfind_whitespace(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut found = None;
    for (i, ch) in text.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c.is_whitespace() && depth == 0 => found = Some(i),
            _ => {}
        }
    }
    found
}

// =========================================================================
// 注册表
// =========================================================================

/// Schema 注册表（外部协作者）
///
/// `resolve` 返回某操作种类的全部重载。
pub trait SchemaRegistry {
    fn resolve(&self, kind: &OpKind) -> &[FunctionSchema];
}

/// 内存中的 Schema 注册表
#[derive(Debug, Clone, Default)]
pub struct SchemaTable {
    schemas: HashMap<OpKind, Vec<FunctionSchema>>,
}

const BUILTIN_SCHEMAS: &[&str] = &[
    "aten::matmul(Tensor self, Tensor other) -> Tensor",
    "aten::div.Tensor(Tensor self, Tensor other) -> Tensor",
    "aten::mul.Tensor(Tensor self, Tensor other) -> Tensor",
    "aten::add.Tensor(Tensor self, Tensor other, *, Scalar alpha=1) -> Tensor",
    "aten::add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)",
    "aten::relu(Tensor self) -> Tensor",
    "aten::relu_(Tensor(a!) self) -> Tensor(a!)",
    "aten::neg(Tensor self) -> Tensor",
    "aten::view(Tensor(a) self, int[] size) -> Tensor(a)",
    "aten::t(Tensor(a) self) -> Tensor(a)",
    "aten::softmax.int(Tensor self, int dim, ScalarType? dtype=None) -> Tensor",
    "aten::dropout(Tensor input, float p, bool train) -> Tensor",
    "aten::conv2d(Tensor input, Tensor weight, Tensor? bias=None, int[2] stride=[1, 1], \
     int[2] padding=[0, 0], int[2] dilation=[1, 1], int groups=1) -> Tensor",
    "aten::quantize_per_tensor(Tensor self, float scale, int zero_point, ScalarType dtype) -> Tensor",
    "aten::dequantize.self(Tensor self) -> Tensor",
    "ipex::matmul_div(Tensor left, Tensor right, Tensor div_input) -> Tensor",
    "ipex::conv2d_relu(Tensor input, Tensor weight, Tensor? bias, int[2] stride, \
     int[2] padding, int[2] dilation, int groups) -> Tensor",
    "ipex::conv2d_sum(Tensor input, Tensor weight, Tensor? bias, int[2] stride, \
     int[2] padding, int[2] dilation, int groups, Tensor(a!) accumu, *, Scalar alpha) -> Tensor(a!)",
];

impl SchemaTable {
    pub fn new() -> Self {
        SchemaTable {
            schemas: HashMap::new(),
        }
    }

    /// 带内置签名的注册表（与内置规则表配套）
    pub fn with_builtins() -> Self {
        let mut table = SchemaTable::new();
        for text in BUILTIN_SCHEMAS {
            // 内置签名在测试中逐条校验过
            if let Ok(schema) = FunctionSchema::parse(text) {
                table.register(schema);
            }
        }
        table
    }

    /// 从 JSON 字符串列表加载
    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        let texts: Vec<String> = serde_json::from_str(json)?;
        let mut table = SchemaTable::new();
        for text in &texts {
            table.register_str(text)?;
        }
        Ok(table)
    }

    pub fn register(&mut self, schema: FunctionSchema) {
        self.schemas.entry(schema.name.clone()).or_default().push(schema);
    }

    pub fn register_str(&mut self, text: &str) -> Result<(), FusionError> {
        let schema = FunctionSchema::parse(text)?;
        self.register(schema);
        Ok(())
    }

    /// 注册的签名总数
    pub fn len(&self) -> usize {
        self.schemas.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl SchemaRegistry for SchemaTable {
    fn resolve(&self, kind: &OpKind) -> &[FunctionSchema] {
        self.schemas.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

// =========================================================================
// SchemaResolver
// =========================================================================

/// 按元数从注册表中挑选签名
#[derive(Clone, Copy)]
pub struct SchemaResolver<'r> {
    registry: &'r dyn SchemaRegistry,
}

impl<'r> SchemaResolver<'r> {
    pub fn new(registry: &'r dyn SchemaRegistry) -> Self {
        SchemaResolver { registry }
    }

    /// 节点自身的签名：参数数与返回数都与节点元数一致的第一个重载
    pub fn schema_of(&self, node: &NodeData) -> Option<&'r FunctionSchema> {
        self.registry.resolve(&node.kind).iter().find(|s| {
            s.arguments.len() == node.inputs.len() && s.returns.len() == node.outputs.len()
        })
    }

    /// 融合目标的签名
    ///
    /// 参数数必须为 `prev.inputs + node.inputs - 1`（连接值被省去），返回数
    /// 必须与 `node.outputs` 一致。找不到即为致命错误 `SchemaNotFound`，
    /// 绝不当作"融合不安全"处理。
    pub fn match_for_fusion(
        &self,
        graph: &Graph,
        fused: &OpKind,
        prev: NodeId,
        node: NodeId,
    ) -> Result<&'r FunctionSchema, FusionError> {
        let prev_data = graph.node(prev);
        let node_data = graph.node(node);
        let arguments = (prev_data.inputs.len() + node_data.inputs.len()).saturating_sub(1);
        let returns = node_data.outputs.len();

        let candidates = self.registry.resolve(fused);
        if let Some(schema) = candidates
            .iter()
            .find(|s| s.arguments.len() == arguments && s.returns.len() == returns)
        {
            return Ok(schema);
        }

        Err(FusionError::SchemaNotFound {
            kind: fused.clone(),
            arguments,
            returns,
            prev: graph.node_to_string(prev),
            node: graph.node_to_string(node),
            candidates: candidates.iter().map(|s| s.to_string()).collect(),
        })
    }
}
