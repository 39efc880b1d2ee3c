//! 数据流图 Arena
//!
//! 存储所有节点、Value 和区域的中央仓库。外部只持有 `NodeId` / `ValueId` /
//! `RegionId` 句柄，所有数据在 arena 中。
//!
//! 每个区域有两个不参与排序的边界节点：
//! - `prim::Param`：其输出即区域输入
//! - `prim::Return`：其输入即区域输出
//!
//! 因此每个 Value 都恰好有一个生产者节点，图的输出也只是普通的 use。

use std::fmt;

use super::nodes::{AttributeValue, NodeData, NodeId, OpKind, RegionId, SourceRange, ValueId};
use super::values::{TypeHint, Use, ValueData};
use crate::error::FusionError;

/// 区域（block）：有序节点序列，顺序与数据依赖一致
#[derive(Debug, Clone)]
pub struct RegionData {
    /// 拥有该区域的控制流节点（根区域为 None）
    pub owner: Option<NodeId>,
    pub param: NodeId,
    pub ret: NodeId,
    pub nodes: Vec<NodeId>,
}

/// 数据流图
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<NodeData>,
    values: Vec<ValueData>,
    regions: Vec<RegionData>,
    root: RegionId,
    /// 每次结构变更递增，别名快照据此判断是否过期
    generation: u64,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut graph = Graph {
            nodes: Vec::with_capacity(64),
            values: Vec::with_capacity(64),
            regions: Vec::new(),
            root: 0,
            generation: 0,
        };
        graph.root = graph.new_region(None);
        graph
    }

    // =========================================================================
    // 查询方法
    // =========================================================================

    #[inline]
    pub fn root(&self) -> RegionId {
        self.root
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id as usize]
    }

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id as usize]
    }

    pub fn region(&self, id: RegionId) -> &RegionData {
        &self.regions[id as usize]
    }

    pub fn get_node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id as usize)
    }

    pub fn get_value(&self, id: ValueId) -> Option<&ValueData> {
        self.values.get(id as usize)
    }

    pub fn get_region(&self, id: RegionId) -> Option<&RegionData> {
        self.regions.get(id as usize)
    }

    /// 区域当前的节点顺序
    pub fn region_nodes(&self, region: RegionId) -> &[NodeId] {
        &self.regions[region as usize].nodes
    }

    pub fn region_inputs(&self, region: RegionId) -> &[ValueId] {
        &self.node(self.region(region).param).outputs
    }

    pub fn region_outputs(&self, region: RegionId) -> &[ValueId] {
        &self.node(self.region(region).ret).inputs
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn producer(&self, value: ValueId) -> NodeId {
        self.value(value).producer
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        &self.value(value).uses
    }

    pub fn owning_region(&self, node: NodeId) -> RegionId {
        self.node(node).owner
    }

    /// 是否为区域边界节点（Param / Return）
    pub fn is_boundary(&self, node: NodeId) -> bool {
        let region = self.region(self.node(node).owner);
        region.param == node || region.ret == node
    }

    /// 所有区域中存活的普通节点数（不含边界节点）
    pub fn node_count(&self) -> usize {
        self.regions.iter().map(|r| r.nodes.len()).sum()
    }

    /// 节点槽位数（含已销毁的节点），即下一个 NodeId
    pub(crate) fn node_slots(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn value_slots(&self) -> usize {
        self.values.len()
    }

    pub fn region_node_count(&self, region: RegionId) -> usize {
        self.region(region).nodes.len()
    }

    /// 节点在所属区域中的位置
    pub fn position(&self, node: NodeId) -> Option<usize> {
        let region = self.region(self.node(node).owner);
        region.nodes.iter().position(|&n| n == node)
    }

    /// 区域内的拓扑序号：Param 为 -1，Return 为节点数
    pub(crate) fn order_index(&self, node: NodeId) -> isize {
        let region = self.region(self.node(node).owner);
        if node == region.param {
            -1
        } else if node == region.ret {
            region.nodes.len() as isize
        } else {
            region
                .nodes
                .iter()
                .position(|&n| n == node)
                .map(|p| p as isize)
                .unwrap_or(isize::MIN)
        }
    }

    /// 节点在 `region` 中的祖先（节点自身在该区域时返回自身）
    pub fn ancestor_in(&self, node: NodeId, region: RegionId) -> Option<NodeId> {
        let mut current = node;
        loop {
            let owner_region = self.node(current).owner;
            if owner_region == region {
                return Some(current);
            }
            current = self.region(owner_region).owner?;
        }
    }

    /// `a` 在程序顺序上是否位于 `b` 之后
    ///
    /// 不同区域时提升到公共区域比较；一方嵌套在另一方内部时返回 false。
    pub fn is_after(&self, a: NodeId, b: NodeId) -> bool {
        self.is_after_with(a, b, |n| self.order_index(n))
    }

    pub(crate) fn is_after_with(
        &self,
        a: NodeId,
        b: NodeId,
        order: impl Fn(NodeId) -> isize,
    ) -> bool {
        // 沿 b 的祖先链向上，找到第一个同时包含 a 的区域
        let mut b_anc = b;
        loop {
            let region = self.node(b_anc).owner;
            if let Some(a_anc) = self.ancestor_in(a, region) {
                if a_anc == b_anc {
                    return false;
                }
                return order(a_anc) > order(b_anc);
            }
            match self.region(region).owner {
                Some(owner) => b_anc = owner,
                None => return false,
            }
        }
    }

    // =========================================================================
    // 构建方法
    // =========================================================================

    /// 为区域添加一个输入
    pub fn add_input(
        &mut self,
        region: RegionId,
        type_hint: TypeHint,
        name: Option<&str>,
    ) -> Result<ValueId, FusionError> {
        self.check_region(region)?;
        let param = self.region(region).param;
        let v = self.add_output_value(param, type_hint);
        self.values[v as usize].debug_name = name.map(str::to_string);
        self.generation += 1;
        Ok(v)
    }

    /// 在区域末尾追加节点
    pub fn append_node(
        &mut self,
        region: RegionId,
        kind: OpKind,
        inputs: &[ValueId],
        num_outputs: usize,
    ) -> Result<NodeId, FusionError> {
        self.check_region(region)?;
        let id = self.create_node(kind, region, inputs, num_outputs)?;
        self.regions[region as usize].nodes.push(id);
        self.generation += 1;
        Ok(id)
    }

    /// 在 `anchor` 之前插入节点（同一区域）
    pub fn insert_node_before(
        &mut self,
        anchor: NodeId,
        kind: OpKind,
        inputs: &[ValueId],
        num_outputs: usize,
    ) -> Result<NodeId, FusionError> {
        self.check_live(anchor)?;
        let region = self.node(anchor).owner;
        let pos = self.position(anchor).ok_or_else(|| {
            FusionError::invariant(format!("node {} is not in region {} order", anchor, region))
        })?;
        let id = self.create_node(kind, region, inputs, num_outputs)?;
        self.regions[region as usize].nodes.insert(pos, id);
        self.generation += 1;
        Ok(id)
    }

    /// 为控制流节点添加嵌套区域
    pub fn add_block(&mut self, node: NodeId) -> Result<RegionId, FusionError> {
        self.check_live(node)?;
        if self.is_boundary(node) {
            return Err(FusionError::invariant(format!(
                "boundary node {} cannot own a block",
                node
            )));
        }
        let rid = self.new_region(Some(node));
        self.nodes[node as usize].blocks.push(rid);
        self.generation += 1;
        Ok(rid)
    }

    /// 将 Value 登记为区域输出
    pub fn register_output(&mut self, region: RegionId, value: ValueId) -> Result<usize, FusionError> {
        self.check_region(region)?;
        self.check_value(value)?;
        let ret = self.region(region).ret;
        let offset = self.nodes[ret as usize].inputs.len();
        self.nodes[ret as usize].inputs.push(value);
        self.values[value as usize].uses.push(Use { user: ret, offset });
        self.generation += 1;
        Ok(offset)
    }

    /// 修改某个 Value 的元数据
    pub fn value_mut(&mut self, id: ValueId) -> &mut ValueData {
        &mut self.values[id as usize]
    }

    /// 修改节点的元数据（scope、属性等；拓扑关系只能经由变更方法修改）
    pub fn set_scope(&mut self, node: NodeId, scope: &str) {
        self.nodes[node as usize].scope = scope.to_string();
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: AttributeValue) {
        self.nodes[node as usize]
            .attributes
            .insert(name.to_string(), value);
    }

    pub fn set_source(&mut self, node: NodeId, source: SourceRange) {
        self.nodes[node as usize].source = Some(source);
    }

    /// 拷贝节点元数据：scope、源码位置、属性
    pub fn copy_node_metadata(&mut self, from: NodeId, to: NodeId) {
        let src = self.nodes[from as usize].clone();
        self.nodes[to as usize].copy_metadata_from(&src);
    }

    /// 拷贝 Value 元数据：类型与调试名
    pub fn copy_value_metadata(&mut self, from: ValueId, to: ValueId) {
        let src = self.values[from as usize].clone();
        self.values[to as usize].copy_metadata_from(&src);
    }

    // =========================================================================
    // 变更方法
    // =========================================================================

    /// 将 `from` 的所有使用重定向到 `to`
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) -> Result<(), FusionError> {
        self.check_value(from)?;
        self.check_value(to)?;
        if from == to {
            return Ok(());
        }
        let uses = std::mem::take(&mut self.values[from as usize].uses);
        for u in &uses {
            self.nodes[u.user as usize].inputs[u.offset] = to;
        }
        self.values[to as usize].uses.extend(uses);
        self.generation += 1;
        Ok(())
    }

    /// 将 `old` 每个输出的使用重定向到 `new` 的对应输出
    pub fn replace_node_outputs(&mut self, old: NodeId, new: NodeId) -> Result<(), FusionError> {
        let old_outputs = self.node(old).outputs.clone();
        let new_outputs = self.node(new).outputs.clone();
        if old_outputs.len() != new_outputs.len() {
            return Err(FusionError::invariant(format!(
                "cannot replace outputs of node {} ({} outputs) with node {} ({} outputs)",
                old,
                old_outputs.len(),
                new,
                new_outputs.len()
            )));
        }
        for (from, to) in old_outputs.into_iter().zip(new_outputs) {
            self.replace_all_uses_with(from, to)?;
        }
        Ok(())
    }

    /// 销毁节点：要求其输出已无使用
    ///
    /// 节点从区域顺序中移除，输入上的 use 记录被清除，嵌套区域一并销毁。
    pub fn destroy_node(&mut self, node: NodeId) -> Result<(), FusionError> {
        self.check_live(node)?;
        if self.is_boundary(node) {
            return Err(FusionError::invariant(format!(
                "boundary node {} cannot be destroyed",
                node
            )));
        }
        for &out in &self.node(node).outputs {
            if self.value(out).has_uses() {
                return Err(FusionError::invariant(format!(
                    "destroying node {} whose output %{} still has {} use(s)",
                    node,
                    out,
                    self.value(out).uses.len()
                )));
            }
        }

        let blocks = self.node(node).blocks.clone();
        for block in blocks.into_iter().rev() {
            self.destroy_region_contents(block)?;
        }

        self.drop_input_uses(node);
        let owner = self.node(node).owner as usize;
        self.regions[owner].nodes.retain(|&n| n != node);
        self.nodes[node as usize].alive = false;
        self.generation += 1;
        Ok(())
    }

    // =========================================================================
    // 校验
    // =========================================================================

    /// 检查图是否良构
    ///
    /// - 每个 Value 的生产者存活且输出槽一致
    /// - use 反向索引与节点输入一一对应
    /// - 拓扑顺序：任何节点只使用在它之前（或祖先区域中更早）定义的 Value
    pub fn verify(&self) -> Result<(), FusionError> {
        for (rid, region) in self.regions.iter().enumerate() {
            let owner_alive = match region.owner {
                Some(owner) => self.node(owner).alive,
                None => true,
            };
            if !owner_alive {
                continue;
            }
            for &n in &region.nodes {
                let node = self.node(n);
                if !node.alive {
                    return Err(FusionError::invariant(format!(
                        "region {} lists destroyed node {}",
                        rid, n
                    )));
                }
                if node.owner as usize != rid {
                    return Err(FusionError::invariant(format!(
                        "node {} listed in region {} but owned by region {}",
                        n, rid, node.owner
                    )));
                }
            }
            let mut checked: Vec<NodeId> = region.nodes.clone();
            checked.push(region.ret);
            for n in checked {
                self.verify_node(n)?;
            }
            for &out in &self.node(region.param).outputs {
                self.verify_value(out)?;
            }
        }
        Ok(())
    }

    fn verify_node(&self, n: NodeId) -> Result<(), FusionError> {
        let node = self.node(n);
        for (offset, &v) in node.inputs.iter().enumerate() {
            let value = self.get_value(v).ok_or_else(|| {
                FusionError::invariant(format!("node {} uses unknown value %{}", n, v))
            })?;
            if !self.node(value.producer).alive {
                return Err(FusionError::invariant(format!(
                    "node {} uses %{} whose producer {} was destroyed",
                    n, v, value.producer
                )));
            }
            if !value.uses.contains(&Use { user: n, offset }) {
                return Err(FusionError::invariant(format!(
                    "use index of %{} is missing node {} input {}",
                    v, n, offset
                )));
            }
            let def = value.producer;
            let def_region = self.node(def).owner;
            let Some(anc) = self.ancestor_in(n, def_region) else {
                return Err(FusionError::invariant(format!(
                    "node {} uses %{} defined in a region that does not enclose it",
                    n, v
                )));
            };
            if anc == def || self.order_index(anc) <= self.order_index(def) {
                return Err(FusionError::invariant(format!(
                    "node {} uses %{} before its definition",
                    n, v
                )));
            }
        }
        for &out in &node.outputs {
            self.verify_value(out)?;
        }
        for &block in &node.blocks {
            if self.region(block).owner != Some(n) {
                return Err(FusionError::invariant(format!(
                    "block {} of node {} has a different owner",
                    block, n
                )));
            }
        }
        Ok(())
    }

    fn verify_value(&self, v: ValueId) -> Result<(), FusionError> {
        let value = self.value(v);
        let producer = self.node(value.producer);
        if producer.outputs.get(value.index) != Some(&v) {
            return Err(FusionError::invariant(format!(
                "%{} is not output {} of its producer {}",
                v, value.index, value.producer
            )));
        }
        for u in &value.uses {
            let user = self.node(u.user);
            if !user.alive || user.inputs.get(u.offset) != Some(&v) {
                return Err(FusionError::invariant(format!(
                    "stale use of %{} by node {} input {}",
                    v, u.user, u.offset
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // 内部方法
    // =========================================================================

    fn new_region(&mut self, owner: Option<NodeId>) -> RegionId {
        let rid = self.regions.len() as RegionId;
        let param = self.push_node(NodeData::new(OpKind::prim("Param"), rid));
        let ret = self.push_node(NodeData::new(OpKind::prim("Return"), rid));
        self.regions.push(RegionData {
            owner,
            param,
            ret,
            nodes: Vec::new(),
        });
        rid
    }

    fn push_node(&mut self, data: NodeData) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(data);
        id
    }

    fn add_output_value(&mut self, node: NodeId, type_hint: TypeHint) -> ValueId {
        let id = self.values.len() as ValueId;
        let index = self.nodes[node as usize].outputs.len();
        self.values.push(ValueData::new(node, index, type_hint));
        self.nodes[node as usize].outputs.push(id);
        id
    }

    /// 创建节点（尚未放入区域顺序）
    fn create_node(
        &mut self,
        kind: OpKind,
        region: RegionId,
        inputs: &[ValueId],
        num_outputs: usize,
    ) -> Result<NodeId, FusionError> {
        for &v in inputs {
            self.check_value(v)?;
        }
        let id = self.push_node(NodeData::new(kind, region));
        for (offset, &v) in inputs.iter().enumerate() {
            self.nodes[id as usize].inputs.push(v);
            self.values[v as usize].uses.push(Use { user: id, offset });
        }
        for _ in 0..num_outputs {
            self.add_output_value(id, TypeHint::Tensor);
        }
        Ok(id)
    }

    fn drop_input_uses(&mut self, node: NodeId) {
        let inputs = std::mem::take(&mut self.nodes[node as usize].inputs);
        for (offset, &v) in inputs.iter().enumerate() {
            self.values[v as usize]
                .uses
                .retain(|u| !(u.user == node && u.offset == offset));
        }
        self.nodes[node as usize].inputs = inputs;
    }

    fn destroy_region_contents(&mut self, region: RegionId) -> Result<(), FusionError> {
        let ret = self.region(region).ret;
        self.drop_input_uses(ret);
        let nodes = self.region(region).nodes.clone();
        for n in nodes.into_iter().rev() {
            self.destroy_node(n)?;
        }
        let param = self.region(region).param;
        self.nodes[param as usize].alive = false;
        self.nodes[ret as usize].alive = false;
        Ok(())
    }

    fn check_region(&self, region: RegionId) -> Result<(), FusionError> {
        let r = self
            .get_region(region)
            .ok_or_else(|| FusionError::invariant(format!("unknown region {}", region)))?;
        if !self.node(r.param).alive {
            return Err(FusionError::invariant(format!("region {} was destroyed", region)));
        }
        Ok(())
    }

    fn check_live(&self, node: NodeId) -> Result<(), FusionError> {
        match self.get_node(node) {
            Some(n) if n.alive => Ok(()),
            Some(_) => Err(FusionError::invariant(format!("node {} was destroyed", node))),
            None => Err(FusionError::invariant(format!("unknown node {}", node))),
        }
    }

    fn check_value(&self, value: ValueId) -> Result<(), FusionError> {
        let v = self
            .get_value(value)
            .ok_or_else(|| FusionError::invariant(format!("unknown value %{}", value)))?;
        if !self.node(v.producer).alive {
            return Err(FusionError::invariant(format!(
                "value %{} has no live producer",
                value
            )));
        }
        Ok(())
    }

    // =========================================================================
    // 文本输出
    // =========================================================================

    fn fmt_value_list(&self, f: &mut fmt::Formatter<'_>, values: &[ValueId]) -> fmt::Result {
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "%{}", v)?;
        }
        Ok(())
    }

    fn fmt_typed_values(&self, f: &mut fmt::Formatter<'_>, values: &[ValueId]) -> fmt::Result {
        for (i, &v) in values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "%{} : {}", v, self.value(v).type_hint.as_str())?;
        }
        Ok(())
    }

    /// 单个节点的一行文本（不含嵌套区域）
    pub fn node_to_string(&self, node: NodeId) -> String {
        struct Line<'a>(&'a Graph, NodeId);
        impl fmt::Display for Line<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt_node_line(f, self.1)
            }
        }
        Line(self, node).to_string()
    }

    fn fmt_node_line(&self, f: &mut fmt::Formatter<'_>, n: NodeId) -> fmt::Result {
        let node = self.node(n);
        self.fmt_typed_values(f, &node.outputs)?;
        if !node.outputs.is_empty() {
            f.write_str(" = ")?;
        }
        write!(f, "{}", node.kind)?;
        if !node.attributes.is_empty() {
            f.write_str("[")?;
            for (i, (k, v)) in node.attributes.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}={}", k, v)?;
            }
            f.write_str("]")?;
        }
        f.write_str("(")?;
        self.fmt_value_list(f, &node.inputs)?;
        f.write_str(")")?;
        if !node.scope.is_empty() {
            write!(f, " # scope: {}", node.scope)?;
        }
        Ok(())
    }

    fn fmt_region(&self, f: &mut fmt::Formatter<'_>, region: RegionId, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        for &n in self.region_nodes(region) {
            f.write_str(&pad)?;
            self.fmt_node_line(f, n)?;
            f.write_str("\n")?;
            for (i, &block) in self.node(n).blocks.iter().enumerate() {
                write!(f, "{}  block{}(", pad, i)?;
                self.fmt_typed_values(f, self.region_inputs(block))?;
                f.write_str("):\n")?;
                self.fmt_region(f, block, indent + 2)?;
                write!(f, "{}    -> (", pad)?;
                self.fmt_value_list(f, self.region_outputs(block))?;
                f.write_str(")\n")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("graph(")?;
        self.fmt_typed_values(f, self.region_inputs(self.root))?;
        f.write_str("):\n")?;
        self.fmt_region(f, self.root, 1)?;
        f.write_str("  return (")?;
        self.fmt_value_list(f, self.region_outputs(self.root))?;
        f.write_str(")\n")
    }
}
