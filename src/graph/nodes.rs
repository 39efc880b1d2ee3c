//! 图节点类型
//!
//! 节点是数据流图中的一个操作：操作种类 + 有序输入 + 有序输出 +
//! 嵌套区域（控制流节点）+ 不透明元数据（scope、源码位置、属性）。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type NodeId = u32;
pub type ValueId = u32;
pub type RegionId = u32;

/// 操作种类标签
///
/// 形如 `namespace::name`，例如 `aten::matmul`、`ipex::matmul_div`。
/// 规则表按精确匹配查找，不支持通配符。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpKind(String);

impl OpKind {
    pub fn new(qualified: &str) -> Self {
        OpKind(qualified.to_string())
    }

    pub fn aten(name: &str) -> Self {
        OpKind(format!("aten::{}", name))
    }

    pub fn prim(name: &str) -> Self {
        OpKind(format!("prim::{}", name))
    }

    pub fn ipex(name: &str) -> Self {
        OpKind(format!("ipex::{}", name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `aten::matmul` -> `aten`
    pub fn namespace(&self) -> &str {
        self.0.split_once("::").map(|(ns, _)| ns).unwrap_or("")
    }

    /// `aten::matmul` -> `matmul`
    pub fn name(&self) -> &str {
        self.0.split_once("::").map(|(_, n)| n).unwrap_or(&self.0)
    }

    pub fn is_prim(&self) -> bool {
        self.namespace() == "prim"
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OpKind {
    fn from(s: &str) -> Self {
        OpKind::new(s)
    }
}

/// 节点属性值（不透明，融合时整体拷贝）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Str(v) => write!(f, "{:?}", v),
            AttributeValue::Ints(v) => write!(f, "{:?}", v),
        }
    }
}

/// 源码位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub file: String,
    pub line: u32,
}

/// 节点数据（存储在 Graph arena 中）
#[derive(Debug, Clone)]
pub struct NodeData {
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    /// 嵌套区域（prim::If 的分支、prim::Loop 的循环体）
    pub blocks: Vec<RegionId>,
    /// 所属区域
    pub owner: RegionId,
    pub scope: String,
    pub source: Option<SourceRange>,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// 已销毁的节点保留为墓碑，id 永不复用
    pub(crate) alive: bool,
}

impl NodeData {
    pub(crate) fn new(kind: OpKind, owner: RegionId) -> Self {
        NodeData {
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            blocks: Vec::new(),
            owner,
            scope: String::new(),
            source: None,
            attributes: BTreeMap::new(),
            alive: true,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// 单输出节点的输出
    pub fn output(&self) -> Option<ValueId> {
        match self.outputs.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    /// 拷贝 scope / 源码位置 / 属性（融合时从 producer 继承）
    pub fn copy_metadata_from(&mut self, other: &NodeData) {
        self.scope = other.scope.clone();
        self.source = other.source.clone();
        self.attributes = other.attributes.clone();
    }
}
