/// OpFuse Rust Backend - 图重写算子融合
///
/// 在数据流图上按 (producer, consumer) -> fused 规则把相邻算子对合并为
/// 一个融合算子，只在别名分析证明安全时才改写。

#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod alias;
pub mod error;
pub mod fuser;
pub mod graph;
pub mod pass;
pub mod rules;
pub mod schema;
pub mod settings;

#[cfg(feature = "python")]
mod bindings;

pub use alias::{AliasAnalysis, AliasDb, AliasOracle, AliasSnapshot, ConservativeAnalysis};
pub use error::FusionError;
pub use fuser::{FuseOutcome, FusionStats, OpFuser};
pub use graph::{Graph, NodeId, OpKind, RegionId, ValueId};
pub use pass::{is_quantized, FnPass, FusionPass, GraphPass};
pub use rules::{FusionRule, FusionRuleTable};
pub use schema::{FunctionSchema, SchemaRegistry, SchemaResolver, SchemaTable};
pub use settings::Settings;

/// Python 模块定义
#[cfg(feature = "python")]
#[pymodule]
fn opfuse_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<bindings::PyGraph>()?;
    m.add_class::<bindings::FusionContext>()?;
    Ok(())
}
