//! 数据流图模块
//!
//! 区域 / 节点 / Value 三层结构的 arena 表示，以及维护 use 反向索引的
//! 变更原语（插入、RAUW、销毁）。

pub mod arena;
pub mod nodes;
pub mod values;

pub use arena::{Graph, RegionData};
pub use nodes::{AttributeValue, NodeData, NodeId, OpKind, RegionId, SourceRange, ValueId};
pub use values::{TypeHint, Use, ValueData};
