//! Value 类型
//!
//! Value 是某个节点的一个输出槽。使用者以反向索引（`Use` 列表）记录在
//! Value 上，由 Graph 的每个变更操作增量维护，不存在裸指针回引。

use super::nodes::NodeId;

/// 类型提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    Tensor,
    Int,
    Float,
    Bool,
    NoneType,
    Unknown,
}

impl TypeHint {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Tensor" => Some(TypeHint::Tensor),
            "int" => Some(TypeHint::Int),
            "float" => Some(TypeHint::Float),
            "bool" => Some(TypeHint::Bool),
            "NoneType" => Some(TypeHint::NoneType),
            "Any" => Some(TypeHint::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeHint::Tensor => "Tensor",
            TypeHint::Int => "int",
            TypeHint::Float => "float",
            TypeHint::Bool => "bool",
            TypeHint::NoneType => "NoneType",
            TypeHint::Unknown => "Any",
        }
    }
}

/// 一次使用：`user.inputs[offset]` 指向该 Value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: NodeId,
    pub offset: usize,
}

/// Value 数据
#[derive(Debug, Clone)]
pub struct ValueData {
    /// 唯一的生产者节点
    pub producer: NodeId,
    /// 在生产者输出列表中的下标
    pub index: usize,
    pub type_hint: TypeHint,
    pub debug_name: Option<String>,
    pub(crate) uses: Vec<Use>,
}

impl ValueData {
    pub(crate) fn new(producer: NodeId, index: usize, type_hint: TypeHint) -> Self {
        ValueData {
            producer,
            index,
            type_hint,
            debug_name: None,
            uses: Vec::new(),
        }
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn has_uses(&self) -> bool {
        !self.uses.is_empty()
    }

    /// 拷贝类型与调试名（融合输出继承 producer 输出的元数据）
    pub fn copy_metadata_from(&mut self, other: &ValueData) {
        self.type_hint = other.type_hint;
        self.debug_name = other.debug_name.clone();
    }
}
