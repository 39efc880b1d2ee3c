/// Python 绑定
///
/// Python 只持有轻量级句柄（NodeId / ValueId / RegionId 都是 u32），
/// 图数据全部在 Rust 侧。使用 RefCell 支持内部可变性（单线程）。

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::cell::RefCell;

use crate::alias::ConservativeAnalysis;
use crate::error::FusionError;
use crate::graph::{Graph, NodeData, NodeId, OpKind, RegionId, TypeHint, ValueId};
use crate::pass::FusionPass;
use crate::rules::{FusionRule, FusionRuleTable};
use crate::schema::SchemaTable;
use crate::settings::Settings;

fn to_py_err(err: FusionError) -> PyErr {
    match err {
        FusionError::SchemaNotFound { .. } | FusionError::InvariantViolation(_) => {
            PyRuntimeError::new_err(err.to_string())
        }
        _ => PyValueError::new_err(err.to_string()),
    }
}

/// 数据流图
#[pyclass(unsendable, name = "Graph")]
pub struct PyGraph {
    graph: RefCell<Graph>,
}

impl PyGraph {
    fn region_or_root(&self, region: Option<RegionId>) -> RegionId {
        region.unwrap_or_else(|| self.graph.borrow().root())
    }

    /// 按 id 读取节点；id 无效时返回 ValueError 而不是 panic
    fn with_node<T>(&self, node: NodeId, f: impl FnOnce(&NodeData) -> T) -> PyResult<T> {
        let graph = self.graph.borrow();
        graph
            .get_node(node)
            .map(f)
            .ok_or_else(|| PyValueError::new_err(format!("unknown node {}", node)))
    }
}

#[pymethods]
impl PyGraph {
    #[new]
    fn new() -> Self {
        PyGraph {
            graph: RefCell::new(Graph::new()),
        }
    }

    /// 添加区域输入
    ///
    /// Args:
    ///     type_hint: "Tensor" | "int" | "float" | "bool" | "NoneType" | "Any"
    ///     name: 调试名
    ///     region: 区域 ID，默认根区域
    ///
    /// Returns:
    ///     int: 新输入的 ValueId
    #[pyo3(signature = (type_hint="Tensor", name=None, region=None))]
    fn add_input(&self, type_hint: &str, name: Option<&str>, region: Option<RegionId>) -> PyResult<ValueId> {
        let hint = TypeHint::from_str(type_hint)
            .ok_or_else(|| PyValueError::new_err(format!("unknown type hint: {}", type_hint)))?;
        let region = self.region_or_root(region);
        self.graph
            .borrow_mut()
            .add_input(region, hint, name)
            .map_err(to_py_err)
    }

    /// 在区域末尾追加节点
    ///
    /// Args:
    ///     kind: 形如 "aten::matmul" 的操作种类
    ///     inputs: 输入 ValueId 列表
    ///     num_outputs: 输出个数
    ///     region: 区域 ID，默认根区域
    ///
    /// Returns:
    ///     int: 新节点的 NodeId
    #[pyo3(signature = (kind, inputs, num_outputs=1, region=None))]
    fn append_node(
        &self,
        kind: &str,
        inputs: Vec<ValueId>,
        num_outputs: usize,
        region: Option<RegionId>,
    ) -> PyResult<NodeId> {
        let region = self.region_or_root(region);
        self.graph
            .borrow_mut()
            .append_node(region, OpKind::new(kind), &inputs, num_outputs)
            .map_err(to_py_err)
    }

    /// 为控制流节点添加嵌套区域，返回 RegionId
    fn add_block(&self, node: NodeId) -> PyResult<RegionId> {
        self.graph.borrow_mut().add_block(node).map_err(to_py_err)
    }

    #[pyo3(signature = (value, region=None))]
    fn register_output(&self, value: ValueId, region: Option<RegionId>) -> PyResult<usize> {
        let region = self.region_or_root(region);
        self.graph
            .borrow_mut()
            .register_output(region, value)
            .map_err(to_py_err)
    }

    fn set_scope(&self, node: NodeId, scope: &str) -> PyResult<()> {
        self.with_node(node, |_| ())?;
        self.graph.borrow_mut().set_scope(node, scope);
        Ok(())
    }

    fn outputs(&self, node: NodeId) -> PyResult<Vec<ValueId>> {
        self.with_node(node, |n| n.outputs.clone())
    }

    fn inputs(&self, node: NodeId) -> PyResult<Vec<ValueId>> {
        self.with_node(node, |n| n.inputs.clone())
    }

    /// 区域中的节点 ID（按当前顺序）
    #[pyo3(signature = (region=None))]
    fn nodes(&self, region: Option<RegionId>) -> PyResult<Vec<NodeId>> {
        let region = self.region_or_root(region);
        let graph = self.graph.borrow();
        graph
            .get_region(region)
            .map(|r| r.nodes.clone())
            .ok_or_else(|| PyValueError::new_err(format!("unknown region {}", region)))
    }

    fn kind(&self, node: NodeId) -> PyResult<String> {
        self.with_node(node, |n| n.kind.to_string())
    }

    #[getter]
    fn root(&self) -> RegionId {
        self.graph.borrow().root()
    }

    fn node_count(&self) -> usize {
        self.graph.borrow().node_count()
    }

    /// 检查图是否良构
    ///
    /// Raises:
    ///     RuntimeError: 图结构损坏
    fn verify(&self) -> PyResult<()> {
        self.graph.borrow().verify().map_err(to_py_err)
    }

    fn __str__(&self) -> String {
        self.graph.borrow().to_string()
    }

    fn __repr__(&self) -> String {
        let graph = self.graph.borrow();
        format!(
            "<Graph nodes={} regions={}>",
            graph.node_count(),
            graph.region_count()
        )
    }
}

/// 融合上下文：规则表 + Schema 注册表 + 启动选项
#[pyclass(unsendable)]
pub struct FusionContext {
    rules: RefCell<FusionRuleTable>,
    schemas: RefCell<SchemaTable>,
    settings: Settings,
}

#[pymethods]
impl FusionContext {
    /// 使用内置规则与签名创建上下文，选项读自环境变量
    #[new]
    fn new() -> Self {
        FusionContext {
            rules: RefCell::new(FusionRuleTable::builtin().clone()),
            schemas: RefCell::new(SchemaTable::with_builtins()),
            settings: Settings::from_env(),
        }
    }

    /// 添加一条融合规则
    ///
    /// Raises:
    ///     ValueError: 与已有规则冲突
    fn add_rule(&self, producer: &str, consumer: &str, fused: &str) -> PyResult<()> {
        let mut rules = self.rules.borrow().rules();
        rules.push(FusionRule {
            producer: OpKind::new(producer),
            consumer: OpKind::new(consumer),
            fused: OpKind::new(fused),
        });
        let table = FusionRuleTable::from_rules(rules).map_err(to_py_err)?;
        *self.rules.borrow_mut() = table;
        Ok(())
    }

    /// 用 JSON 规则列表替换规则表
    fn load_rules(&self, json: &str) -> PyResult<()> {
        let table = FusionRuleTable::from_json(json).map_err(to_py_err)?;
        *self.rules.borrow_mut() = table;
        Ok(())
    }

    /// 注册一条文本签名，如 "ipex::matmul_div(Tensor a, Tensor b, Tensor c) -> Tensor"
    fn register_schema(&self, text: &str) -> PyResult<()> {
        self.schemas.borrow_mut().register_str(text).map_err(to_py_err)
    }

    /// 所有规则：[(producer, consumer, fused), ...]
    fn rules(&self) -> Vec<(String, String, String)> {
        self.rules
            .borrow()
            .rules()
            .into_iter()
            .map(|r| (r.producer.to_string(), r.consumer.to_string(), r.fused.to_string()))
            .collect()
    }

    /// 对图运行融合 pass
    ///
    /// Args:
    ///     graph: 要原地优化的图
    ///     conservative: 使用最保守的别名分析（不会融合任何东西）
    ///
    /// Returns:
    ///     Tuple[int, int, int, int]: (fusions, rejected, rounds, regions)
    ///
    /// Raises:
    ///     RuntimeError: 规则表与签名不一致，或图结构损坏
    #[pyo3(signature = (graph, conservative=false))]
    fn run(&self, graph: &PyGraph, conservative: bool) -> PyResult<(usize, usize, usize, usize)> {
        let rules = self.rules.borrow();
        let schemas = self.schemas.borrow();
        let pass = FusionPass::new(&rules, &*schemas).with_settings(self.settings);
        let mut g = graph.graph.borrow_mut();
        let stats = if conservative {
            pass.run_with_analysis(&mut g, ConservativeAnalysis)
        } else {
            pass.run(&mut g)
        }
        .map_err(to_py_err)?;
        Ok((stats.fusions, stats.rejected, stats.rounds, stats.regions))
    }

    fn __repr__(&self) -> String {
        format!(
            "<FusionContext rules={} schemas={}>",
            self.rules.borrow().len(),
            self.schemas.borrow().len()
        )
    }
}
