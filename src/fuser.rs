/// 算子融合引擎
///
/// 对一个区域反复扫描：每个节点沿某一条输入路径与其生产者按规则表融合，
/// 直到一整轮没有任何变化（不动点），然后递归进入剩余节点的嵌套区域。
///
/// 每个候选依次经过：
/// 1. 规则查找（`is_fusable`）
/// 2. 安全检查（`alias_is_safe_for_fusion`：squash + Y-merge）
/// 3. 图手术（`fuse_nodes`）
///
/// 别名快照每轮开始时重建；同一轮内发生变更后，下一次读取前按 generation
/// 惰性重建，绝不读取过期快照。

use crate::alias::{AliasAnalysis, AliasDb, AliasOracle};
use crate::error::FusionError;
use crate::graph::{Graph, NodeId, OpKind, RegionId, ValueId};
use crate::rules::FusionRuleTable;
use crate::schema::{SchemaRegistry, SchemaResolver};

/// 单个候选的结果；致命错误走 `Err`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseOutcome {
    /// 已融合，携带新节点
    Fused(NodeId),
    /// 无规则或不安全，继续扫描
    NotApplicable,
}

/// 整棵区域树上的累计统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    /// 不动点迭代轮数（含最后一轮无变化的确认轮）
    pub rounds: usize,
    pub fusions: usize,
    /// 有规则但安全检查未通过的候选数
    pub rejected: usize,
    /// 处理过的区域数
    pub regions: usize,
}

pub struct OpFuser<'g, A: AliasAnalysis = AliasDb> {
    graph: &'g mut Graph,
    rules: &'g FusionRuleTable,
    schemas: SchemaResolver<'g>,
    analysis: A,
    snapshot: Option<A::Snapshot>,
    stats: FusionStats,
}

impl<'g> OpFuser<'g, AliasDb> {
    pub fn new(
        graph: &'g mut Graph,
        rules: &'g FusionRuleTable,
        registry: &'g dyn SchemaRegistry,
    ) -> Self {
        Self::with_analysis(graph, rules, registry, AliasDb)
    }
}

impl<'g, A: AliasAnalysis> OpFuser<'g, A> {
    pub fn with_analysis(
        graph: &'g mut Graph,
        rules: &'g FusionRuleTable,
        registry: &'g dyn SchemaRegistry,
        analysis: A,
    ) -> Self {
        OpFuser {
            graph,
            rules,
            schemas: SchemaResolver::new(registry),
            analysis,
            snapshot: None,
            stats: FusionStats::default(),
        }
    }

    pub fn stats(&self) -> FusionStats {
        self.stats
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    // =========================================================================
    // 不动点主循环
    // =========================================================================

    /// 将 `region` 融合到不动点，然后递归处理嵌套区域
    ///
    /// 返回到目前为止的累计统计。出错时已完成的融合保留，不会留下
    /// 半完成的融合。
    pub fn run(&mut self, region: RegionId) -> Result<FusionStats, FusionError> {
        if self.graph.get_region(region).is_none() {
            return Err(FusionError::invariant(format!("unknown region {}", region)));
        }
        self.run_region(region)?;
        Ok(self.stats)
    }

    fn run_region(&mut self, region: RegionId) -> Result<(), FusionError> {
        self.stats.regions += 1;

        let mut any_changed = true;
        while any_changed {
            any_changed = false;
            self.rebuild_snapshot();
            self.stats.rounds += 1;

            let mut pos = 0;
            while pos < self.graph.region_node_count(region) {
                let node = self.graph.region_nodes(region)[pos];
                let (next, changed) = self.process_node(region, node)?;
                any_changed |= changed;
                pos = next;
            }
            log::debug!(
                "region {}: round {} done, {} nodes, changed: {}",
                region,
                self.stats.rounds,
                self.graph.region_node_count(region),
                any_changed
            );
        }

        // 嵌套区域不会影响父区域的不动点
        for node in self.graph.region_nodes(region).to_vec() {
            for block in self.graph.node(node).blocks.clone() {
                self.run_region(block)?;
            }
        }
        Ok(())
    }

    /// 尝试沿 `node` 的某一条输入路径融合
    ///
    /// 返回 (下一个扫描位置, 是否发生变化)。只融合第一条可行路径，
    /// 之后从融合节点的后继继续扫描。
    fn process_node(&mut self, region: RegionId, node: NodeId) -> Result<(usize, bool), FusionError> {
        let inputs = self.graph.node(node).inputs.clone();
        for v in inputs {
            if let FuseOutcome::Fused(fused) = self.try_fuse(region, node, v)? {
                return Ok((self.position_in(region, fused)? + 1, true));
            }
        }
        Ok((self.position_in(region, node)? + 1, false))
    }

    /// 沿 `v` 把 `node` 与 `v` 的生产者融合（如果规则与安全检查允许）
    pub fn try_fuse(&mut self, region: RegionId, node: NodeId, v: ValueId) -> Result<FuseOutcome, FusionError> {
        let prev = self.graph.producer(v);
        if self.graph.is_boundary(prev) {
            return Ok(FuseOutcome::NotApplicable);
        }
        let Some(fused_kind) = self.is_fusable(region, node, prev).cloned() else {
            return Ok(FuseOutcome::NotApplicable);
        };

        self.check_preconditions(prev, node)?;

        // 同一个值被消费多次时无法确定省去哪个参数
        if self.graph.node(node).inputs.iter().filter(|&&i| i == v).count() > 1 {
            log::trace!("skip {} -> {}: %{} consumed more than once", prev, node, v);
            self.stats.rejected += 1;
            return Ok(FuseOutcome::NotApplicable);
        }

        if !self.alias_is_safe_for_fusion(node, v, &fused_kind)? {
            log::trace!(
                "reject {}({}) -> {}({}) along %{}",
                self.graph.node(prev).kind,
                prev,
                self.graph.node(node).kind,
                node,
                v
            );
            self.stats.rejected += 1;
            return Ok(FuseOutcome::NotApplicable);
        }

        let fused = self.fuse_nodes(node, v, fused_kind)?;
        self.stats.fusions += 1;
        Ok(FuseOutcome::Fused(fused))
    }

    // =========================================================================
    // 规则与前置条件
    // =========================================================================

    /// 两个节点都在当前区域时查找规则；跨区域从不融合
    fn is_fusable(&self, region: RegionId, node: NodeId, prev: NodeId) -> Option<&'g OpKind> {
        if self.graph.owning_region(node) != region || self.graph.owning_region(prev) != region {
            return None;
        }
        self.rules
            .lookup(&self.graph.node(prev).kind, &self.graph.node(node).kind)
    }

    fn check_preconditions(&self, prev: NodeId, node: NodeId) -> Result<(), FusionError> {
        for (role, n) in [("producer", prev), ("consumer", node)] {
            let data = self.graph.node(n);
            if !data.is_alive() {
                return Err(FusionError::invariant(format!("{} {} was destroyed", role, n)));
            }
            if data.outputs.len() != 1 {
                return Err(FusionError::invariant(format!(
                    "{} `{}` matched a fusion rule but has {} outputs",
                    role,
                    self.graph.node_to_string(n),
                    data.outputs.len()
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // 安全检查
    // =========================================================================

    fn rebuild_snapshot(&mut self) {
        self.snapshot = Some(self.analysis.analyze(self.graph, self.schemas));
    }

    /// 快照过期时重建，然后返回 (图, 快照)
    fn oracle(&mut self) -> Result<(&Graph, &A::Snapshot), FusionError> {
        let stale = match &self.snapshot {
            Some(s) => s.is_stale(self.graph),
            None => true,
        };
        if stale {
            self.rebuild_snapshot();
        }
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| FusionError::invariant("alias snapshot missing after rebuild"))?;
        Ok((&*self.graph, snapshot))
    }

    /// squash 检查 + Y-merge 检查
    fn alias_is_safe_for_fusion(
        &mut self,
        node: NodeId,
        v: ValueId,
        fused_kind: &OpKind,
    ) -> Result<bool, FusionError> {
        let schemas = self.schemas;
        let (graph, oracle) = self.oracle()?;

        if !alias_is_safe_for_squashing(graph, oracle, node, v) {
            return Ok(false);
        }

        let node_data = graph.node(node);
        if node_data.inputs.len() <= 1 {
            return Ok(true);
        }

        // Y-merge：融合签名的参数依次是 prev 的输入和 node 除 v 以外的输入
        let prev = graph.producer(v);
        let fused = schemas.match_for_fusion(graph, fused_kind, prev, node)?;
        let mut pos = graph.node(prev).inputs.len();
        let mut consumer_schema = None;
        for (i, &input) in node_data.inputs.iter().enumerate() {
            if input == v {
                continue;
            }
            let argument = &fused.arguments[pos];
            pos += 1;
            if !argument.alias.is_write() {
                continue;
            }

            let schema = match consumer_schema {
                Some(s) => s,
                None => {
                    let s = schemas.schema_of(node_data).ok_or_else(|| {
                        FusionError::invariant(format!(
                            "`{}` has no registered schema; cannot check writes introduced by {}",
                            graph.node_to_string(node),
                            fused_kind
                        ))
                    })?;
                    consumer_schema = Some(s);
                    s
                }
            };
            // 融合签名新引入了对该输入的写
            if !schema.arguments[i].alias.is_write()
                && !alias_is_safe_for_inplace(graph, oracle, node, input)
            {
                log::trace!(
                    "{} would write %{} ({}) which is used after node {}",
                    fused_kind,
                    input,
                    argument.name,
                    node
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // 图手术
    // =========================================================================

    /// 在 prev 之前插入融合节点，重定向 v 与 node 输出的所有使用，然后销毁
    /// prev 与 node。调用前安全检查与前置条件已全部通过，新节点在任何
    /// 销毁发生之前就已完整。
    fn fuse_nodes(&mut self, node: NodeId, v: ValueId, kind: OpKind) -> Result<NodeId, FusionError> {
        let prev = self.graph.producer(v);
        let out = self.graph.node(node).outputs[0];

        let mut inputs = self.graph.node(prev).inputs.clone();
        inputs.extend(
            self.graph
                .node(node)
                .inputs
                .iter()
                .copied()
                .filter(|&i| i != v),
        );

        let fused = self.graph.insert_node_before(prev, kind, &inputs, 1)?;
        let fused_out = self.graph.node(fused).outputs[0];
        self.graph.copy_node_metadata(prev, fused);
        self.graph.copy_value_metadata(v, fused_out);

        self.graph.replace_all_uses_with(v, fused_out)?;
        self.graph.replace_all_uses_with(out, fused_out)?;
        self.graph.destroy_node(node)?;
        self.graph.destroy_node(prev)?;

        log::debug!("fused: {}", self.graph.node_to_string(fused));
        Ok(fused)
    }

    fn position_in(&self, region: RegionId, node: NodeId) -> Result<usize, FusionError> {
        self.graph
            .region_nodes(region)
            .iter()
            .position(|&n| n == node)
            .ok_or_else(|| FusionError::invariant(format!("node {} left region {}", node, region)))
    }
}

/// node 能移到 prev 之后，且 v 只有这一个使用或与 node 的输出必然同一存储
fn alias_is_safe_for_squashing<O: AliasOracle>(graph: &Graph, oracle: &O, node: NodeId, v: ValueId) -> bool {
    let prev = graph.producer(v);
    if !oracle.move_after_topologically_valid(graph, node, prev) {
        return false;
    }
    let Some(out) = graph.node(node).output() else {
        return false;
    };
    graph.uses(v).len() == 1 || oracle.must_alias(v, out)
}

/// 把 v 改为原地写是否安全：node 之后不能再有 v 的使用
fn alias_is_safe_for_inplace<O: AliasOracle>(graph: &Graph, oracle: &O, node: NodeId, v: ValueId) -> bool {
    graph
        .uses(v)
        .iter()
        .all(|u| !oracle.is_after(graph, u.user, node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias::ConservativeAnalysis;
    use crate::graph::{AttributeValue, SourceRange, TypeHint, Use};
    use crate::rules::FusionRule;
    use crate::schema::SchemaTable;
    use test_strategy::{proptest, Arbitrary};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn out(g: &Graph, n: NodeId) -> ValueId {
        g.node(n).outputs[0]
    }

    fn inputs(g: &mut Graph, n: usize) -> Vec<ValueId> {
        let root = g.root();
        (0..n)
            .map(|_| g.add_input(root, TypeHint::Tensor, None).unwrap())
            .collect()
    }

    fn run(g: &mut Graph) -> Result<FusionStats, FusionError> {
        let schemas = SchemaTable::with_builtins();
        let root = g.root();
        OpFuser::new(g, FusionRuleTable::builtin(), &schemas).run(root)
    }

    fn kinds(g: &Graph, region: RegionId) -> Vec<String> {
        g.region_nodes(region)
            .iter()
            .map(|&n| g.node(n).kind.to_string())
            .collect()
    }

    /// x, w, bias, stride, padding, dilation, groups -> conv2d
    fn conv2d(g: &mut Graph) -> NodeId {
        let args = inputs(g, 7);
        let root = g.root();
        g.append_node(root, OpKind::aten("conv2d"), &args, 1).unwrap()
    }

    #[test]
    fn test_matmul_div_fused() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        g.set_scope(mm, "attn");
        g.set_attribute(mm, "transpose_b", AttributeValue::Bool(true));
        g.set_source(
            mm,
            SourceRange {
                file: "model.py".to_string(),
                line: 42,
            },
        );
        g.value_mut(out(&g, mm)).debug_name = Some("scores".to_string());
        let div = g.append_node(root, OpKind::aten("div"), &[out(&g, mm), c], 1).unwrap();
        let d = out(&g, div);
        g.register_output(root, d).unwrap();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 1);
        assert_eq!(stats.rounds, 2);
        assert_eq!(kinds(&g, root), ["ipex::matmul_div"]);

        let fused = g.region_nodes(root)[0];
        assert_eq!(g.node(fused).inputs, [a, b, c]);
        assert_eq!(g.node(fused).scope, "attn");
        assert_eq!(
            g.node(fused).attributes.get("transpose_b"),
            Some(&AttributeValue::Bool(true))
        );
        assert_eq!(g.node(fused).source.as_ref().map(|s| s.line), Some(42));
        assert_eq!(g.value(out(&g, fused)).debug_name.as_deref(), Some("scores"));
        assert_eq!(g.region_outputs(root), &[out(&g, fused)]);
        assert!(!g.node(mm).is_alive());
        assert!(!g.node(div).is_alive());
        g.verify().unwrap();
    }

    #[test]
    fn test_second_use_blocks_fusion() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let m = out(&g, mm);
        let div = g.append_node(root, OpKind::aten("div"), &[m, c], 1).unwrap();
        g.register_output(root, out(&g, div)).unwrap();
        g.register_output(root, m).unwrap();
        let before = g.to_string();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(stats.rejected, 1);
        assert_eq!(g.to_string(), before);
    }

    #[test]
    fn test_rejected_path_then_next_input_fused() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c, d] = inputs(&mut g, 4)[..] else { unreachable!() };
        let mm1 = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let mm2 = g.append_node(root, OpKind::aten("matmul"), &[c, d], 1).unwrap();
        let div = g
            .append_node(root, OpKind::aten("div"), &[out(&g, mm1), out(&g, mm2)], 1)
            .unwrap();
        g.register_output(root, out(&g, div)).unwrap();

        // 第一条路径：div 不能越过 mm2 上移；第二条路径可行
        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 1);
        assert!(stats.rejected >= 1);
        assert_eq!(kinds(&g, root), ["aten::matmul", "ipex::matmul_div"]);
        let fused = g.region_nodes(root)[1];
        assert_eq!(g.node(fused).inputs, [c, d, out(&g, mm1)]);
        g.verify().unwrap();
    }

    #[test]
    fn test_inplace_consumer_squashes_shared_value() {
        init();
        let rules = FusionRuleTable::from_rules([FusionRule {
            producer: OpKind::aten("matmul"),
            consumer: OpKind::aten("relu_"),
            fused: OpKind::ipex("matmul_relu_"),
        }])
        .unwrap();
        let schemas = SchemaTable::with_builtins();

        let mut g = Graph::new();
        let root = g.root();
        let [a, b] = inputs(&mut g, 2)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let m = out(&g, mm);
        let relu = g.append_node(root, OpKind::aten("relu_"), &[m], 1).unwrap();
        let neg = g.append_node(root, OpKind::aten("neg"), &[m], 1).unwrap();
        g.register_output(root, out(&g, relu)).unwrap();
        g.register_output(root, out(&g, neg)).unwrap();

        let stats = OpFuser::new(&mut g, &rules, &schemas).run(root).unwrap();
        assert_eq!(stats.fusions, 1);
        let fused = g.region_nodes(root)[0];
        assert_eq!(g.node(fused).kind, OpKind::ipex("matmul_relu_"));
        // neg 现在读取融合输出
        assert_eq!(g.node(neg).inputs, [out(&g, fused)]);
        assert_eq!(g.region_outputs(root), &[out(&g, fused), out(&g, neg)]);
        g.verify().unwrap();
    }

    #[test]
    fn test_conv2d_sum_fused_when_accumulator_dead() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let conv = conv2d(&mut g);
        let [other, alpha] = inputs(&mut g, 2)[..] else { unreachable!() };
        let add = g
            .append_node(root, OpKind::aten("add"), &[out(&g, conv), other, alpha], 1)
            .unwrap();
        g.register_output(root, out(&g, add)).unwrap();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 1);
        let fused = g.region_nodes(root)[0];
        assert_eq!(g.node(fused).kind, OpKind::ipex("conv2d_sum"));
        assert_eq!(g.node(fused).inputs.len(), 9);
        assert_eq!(g.node(fused).inputs[7], other);
        g.verify().unwrap();
    }

    #[test]
    fn test_conv2d_sum_rejected_when_accumulator_used_later() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let conv = conv2d(&mut g);
        let [other, alpha] = inputs(&mut g, 2)[..] else { unreachable!() };
        let add = g
            .append_node(root, OpKind::aten("add"), &[out(&g, conv), other, alpha], 1)
            .unwrap();
        // conv2d_sum 会原地写 other，而 neg 之后还要读它
        let neg = g.append_node(root, OpKind::aten("neg"), &[other], 1).unwrap();
        g.register_output(root, out(&g, add)).unwrap();
        g.register_output(root, out(&g, neg)).unwrap();
        let before = g.to_string();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(stats.rejected, 1);
        assert_eq!(g.to_string(), before);
    }

    #[test]
    fn test_inplace_write_on_other_input_blocks_move() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        // c 与 a 可能是同一块存储：div 不能越过对 c 的原地写
        let relu = g.append_node(root, OpKind::aten("relu_"), &[c], 1).unwrap();
        let div = g.append_node(root, OpKind::aten("div"), &[out(&g, mm), a], 1).unwrap();
        g.register_output(root, out(&g, div)).unwrap();
        g.register_output(root, out(&g, relu)).unwrap();
        let before = g.to_string();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(stats.rejected, 1);
        assert_eq!(g.to_string(), before);
    }

    #[test]
    fn test_inplace_rejection_keeps_scanning() {
        init();
        let rules = FusionRuleTable::from_rules([
            FusionRule {
                producer: OpKind::aten("conv2d"),
                consumer: OpKind::aten("add"),
                fused: OpKind::ipex("conv2d_sum"),
            },
            FusionRule {
                producer: OpKind::aten("matmul"),
                consumer: OpKind::aten("add"),
                fused: OpKind::ipex("matmul_add"),
            },
            FusionRule {
                producer: OpKind::aten("matmul"),
                consumer: OpKind::aten("div"),
                fused: OpKind::ipex("matmul_div"),
            },
        ])
        .unwrap();
        let schemas = SchemaTable::with_builtins();

        let mut g = Graph::new();
        let root = g.root();
        let [a, b] = inputs(&mut g, 2)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let acc = out(&g, mm);
        let conv = conv2d(&mut g);
        let [alpha, d, e, f] = inputs(&mut g, 4)[..] else { unreachable!() };
        // 第一条路径：conv2d_sum 会原地写 acc，而 neg 之后还要读它
        // 第二条路径：add 不能越过 conv2d 上移
        let add = g
            .append_node(root, OpKind::aten("add"), &[out(&g, conv), acc, alpha], 1)
            .unwrap();
        let neg = g.append_node(root, OpKind::aten("neg"), &[acc], 1).unwrap();
        let mm2 = g.append_node(root, OpKind::aten("matmul"), &[d, e], 1).unwrap();
        let div = g.append_node(root, OpKind::aten("div"), &[out(&g, mm2), f], 1).unwrap();
        for n in [add, neg, div] {
            g.register_output(root, out(&g, n)).unwrap();
        }

        let stats = OpFuser::new(&mut g, &rules, &schemas).run(root).unwrap();
        assert_eq!(stats.fusions, 1);
        // 每轮两条路径都被尝试并拒绝
        assert_eq!(stats.rounds, 2);
        assert_eq!(stats.rejected, 4);
        assert_eq!(
            kinds(&g, root),
            ["aten::matmul", "aten::conv2d", "aten::add", "aten::neg", "ipex::matmul_div"]
        );
        assert_eq!(g.node(add).inputs, [out(&g, conv), acc, alpha]);
        let fused = g.region_nodes(root)[4];
        assert_eq!(g.node(fused).inputs, [d, e, f]);
        g.verify().unwrap();
    }

    #[test]
    fn test_missing_fused_schema_is_fatal() {
        init();
        let mut schemas = SchemaTable::new();
        schemas
            .register_str("aten::matmul(Tensor self, Tensor other) -> Tensor")
            .unwrap();
        schemas
            .register_str("aten::div.Tensor(Tensor self, Tensor other) -> Tensor")
            .unwrap();
        // 只有元数不对的重载
        schemas
            .register_str("ipex::matmul_div(Tensor left, Tensor right) -> Tensor")
            .unwrap();

        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let div = g.append_node(root, OpKind::aten("div"), &[out(&g, mm), c], 1).unwrap();
        g.register_output(root, out(&g, div)).unwrap();
        let before = g.to_string();
        let generation = g.generation();

        let err = OpFuser::new(&mut g, FusionRuleTable::builtin(), &schemas)
            .run(root)
            .unwrap_err();
        assert!(err.is_schema_not_found());
        let msg = err.to_string();
        assert!(msg.contains("candidates were:"));
        assert!(msg.contains("aten::matmul(%"));
        assert_eq!(g.to_string(), before);
        assert_eq!(g.generation(), generation);
    }

    #[test]
    fn test_missing_consumer_schema_is_fatal() {
        init();
        // 没有 aten::add 的签名
        let builtins = SchemaTable::with_builtins();
        let mut schemas = SchemaTable::new();
        for kind in ["aten::conv2d", "ipex::conv2d_sum"] {
            for s in builtins.resolve(&OpKind::new(kind)) {
                schemas.register(s.clone());
            }
        }

        let mut g = Graph::new();
        let root = g.root();
        let conv = conv2d(&mut g);
        let [other, alpha] = inputs(&mut g, 2)[..] else { unreachable!() };
        let add = g
            .append_node(root, OpKind::aten("add"), &[out(&g, conv), other, alpha], 1)
            .unwrap();
        g.register_output(root, out(&g, add)).unwrap();

        let err = OpFuser::new(&mut g, FusionRuleTable::builtin(), &schemas)
            .run(root)
            .unwrap_err();
        assert!(matches!(err, FusionError::InvariantViolation(_)));
        assert_eq!(g.region_node_count(root), 2);
    }

    #[test]
    fn test_multi_output_producer_is_fatal() {
        init();
        let rules = FusionRuleTable::from_rules([FusionRule {
            producer: OpKind::aten("split"),
            consumer: OpKind::aten("relu"),
            fused: OpKind::ipex("split_relu"),
        }])
        .unwrap();
        let schemas = SchemaTable::with_builtins();

        let mut g = Graph::new();
        let root = g.root();
        let [x] = inputs(&mut g, 1)[..] else { unreachable!() };
        let split = g.append_node(root, OpKind::aten("split"), &[x], 2).unwrap();
        let relu = g
            .append_node(root, OpKind::aten("relu"), &[g.node(split).outputs[1]], 1)
            .unwrap();
        g.register_output(root, out(&g, relu)).unwrap();
        let generation = g.generation();

        let err = OpFuser::new(&mut g, &rules, &schemas).run(root).unwrap_err();
        assert!(err.to_string().contains("2 outputs"));
        assert_eq!(g.generation(), generation);
    }

    #[test]
    fn test_nested_regions_fused_after_parent() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let cond = g.add_input(root, TypeHint::Bool, None).unwrap();

        let iff = g.append_node(root, OpKind::prim("If"), &[cond], 1).unwrap();
        let then_b = g.add_block(iff).unwrap();
        let mm = g.append_node(then_b, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let div = g.append_node(then_b, OpKind::aten("div"), &[out(&g, mm), c], 1).unwrap();
        g.register_output(then_b, out(&g, div)).unwrap();
        let else_b = g.add_block(iff).unwrap();
        g.register_output(else_b, a).unwrap();

        let mm2 = g.append_node(root, OpKind::aten("matmul"), &[out(&g, iff), b], 1).unwrap();
        let div2 = g.append_node(root, OpKind::aten("div"), &[out(&g, mm2), c], 1).unwrap();
        g.register_output(root, out(&g, div2)).unwrap();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 2);
        assert_eq!(stats.regions, 3);
        assert_eq!(kinds(&g, root), ["prim::If", "ipex::matmul_div"]);
        assert_eq!(kinds(&g, then_b), ["ipex::matmul_div"]);
        assert!(kinds(&g, else_b).is_empty());
        g.verify().unwrap();
    }

    #[test]
    fn test_cross_region_never_fused() {
        init();
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let cond = g.add_input(root, TypeHint::Bool, None).unwrap();
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let iff = g.append_node(root, OpKind::prim("If"), &[cond], 1).unwrap();
        let then_b = g.add_block(iff).unwrap();
        let div = g.append_node(then_b, OpKind::aten("div"), &[out(&g, mm), c], 1).unwrap();
        g.register_output(then_b, out(&g, div)).unwrap();
        let else_b = g.add_block(iff).unwrap();
        g.register_output(else_b, a).unwrap();
        g.register_output(root, out(&g, iff)).unwrap();
        let before = g.to_string();

        let stats = run(&mut g).unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(g.to_string(), before);
    }

    #[test]
    fn test_try_fuse_without_rule() {
        let mut g = Graph::new();
        let root = g.root();
        let [a, b] = inputs(&mut g, 2)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let neg = g.append_node(root, OpKind::aten("neg"), &[out(&g, mm)], 1).unwrap();
        let schemas = SchemaTable::with_builtins();
        let m = out(&g, mm);
        let mut fuser = OpFuser::new(&mut g, FusionRuleTable::builtin(), &schemas);
        assert_eq!(fuser.try_fuse(root, neg, m).unwrap(), FuseOutcome::NotApplicable);
        assert_eq!(fuser.try_fuse(root, mm, a).unwrap(), FuseOutcome::NotApplicable);
        assert_eq!(fuser.stats(), FusionStats::default());
    }

    #[test]
    fn test_empty_rule_table_fuses_nothing() {
        let mut g = Graph::new();
        let root = g.root();
        let [a, b, c] = inputs(&mut g, 3)[..] else { unreachable!() };
        let mm = g.append_node(root, OpKind::aten("matmul"), &[a, b], 1).unwrap();
        let div = g.append_node(root, OpKind::aten("div"), &[out(&g, mm), c], 1).unwrap();
        g.register_output(root, out(&g, div)).unwrap();
        let before = g.to_string();

        let schemas = SchemaTable::with_builtins();
        let rules = FusionRuleTable::empty();
        assert!(rules.is_empty());
        let stats = OpFuser::new(&mut g, &rules, &schemas).run(root).unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.rounds, 1);
        assert_eq!(g.to_string(), before);
    }

    // =========================================================================
    // 性质测试：随机 matmul -> div 链
    // =========================================================================

    #[derive(Arbitrary, Debug)]
    struct ChainProblem {
        #[strategy(1..=8usize)]
        pairs: usize,
        /// 第 i 位：第 i 对的 matmul 输出被额外使用一次
        extra_use: u8,
        /// 第 i 位：在第 i 对中间插入一个无关节点
        interleave: u8,
    }

    struct Chain {
        graph: Graph,
        expected_fusions: usize,
        external_users: Vec<NodeId>,
    }

    fn build_chain(problem: &ChainProblem) -> Chain {
        let mut g = Graph::new();
        let root = g.root();
        let [mut cur, b] = inputs(&mut g, 2)[..] else { unreachable!() };
        let mut expected_fusions = 0;
        let mut external_users = Vec::new();

        for i in 0..problem.pairs {
            let c = g.add_input(root, TypeHint::Tensor, None).unwrap();
            let mm = g.append_node(root, OpKind::aten("matmul"), &[cur, b], 1).unwrap();
            if problem.interleave & (1 << i) != 0 {
                g.append_node(root, OpKind::aten("neg"), &[b], 1).unwrap();
            }
            let div = g.append_node(root, OpKind::aten("div"), &[out(&g, mm), c], 1).unwrap();
            if problem.extra_use & (1 << i) != 0 {
                let user = g.append_node(root, OpKind::aten("relu"), &[out(&g, mm)], 1).unwrap();
                g.register_output(root, out(&g, user)).unwrap();
                external_users.push(user);
            } else {
                expected_fusions += 1;
            }
            cur = out(&g, div);
        }
        g.register_output(root, cur).unwrap();
        Chain {
            graph: g,
            expected_fusions,
            external_users,
        }
    }

    #[proptest(cases = 64)]
    fn test_chain_fusion_count_and_termination(problem: ChainProblem) {
        let Chain {
            mut graph,
            expected_fusions,
            ..
        } = build_chain(&problem);
        let initial = graph.node_count();

        let stats = run(&mut graph).unwrap();
        assert_eq!(stats.fusions, expected_fusions);
        assert_eq!(graph.node_count(), initial - stats.fusions);
        assert!(stats.fusions < initial);
        assert!(stats.rounds <= stats.fusions + 1);
        graph.verify().unwrap();
    }

    #[proptest(cases = 64)]
    fn test_chain_fusion_idempotent(problem: ChainProblem) {
        let mut graph = build_chain(&problem).graph;
        run(&mut graph).unwrap();
        let once = graph.to_string();

        let stats = run(&mut graph).unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(stats.rounds, 1);
        assert_eq!(graph.to_string(), once);
    }

    #[proptest(cases = 64)]
    fn test_chain_conservative_analysis_fuses_nothing(problem: ChainProblem) {
        let mut graph = build_chain(&problem).graph;
        let before = graph.to_string();
        let schemas = SchemaTable::with_builtins();
        let root = graph.root();

        let stats = OpFuser::with_analysis(
            &mut graph,
            FusionRuleTable::builtin(),
            &schemas,
            ConservativeAnalysis,
        )
        .run(root)
        .unwrap();
        assert_eq!(stats.fusions, 0);
        assert_eq!(graph.to_string(), before);
    }

    #[proptest(cases = 64)]
    fn test_chain_uses_preserved(problem: ChainProblem) {
        let Chain {
            mut graph,
            external_users,
            ..
        } = build_chain(&problem);
        let root = graph.root();
        let outputs_before = graph.region_outputs(root).len();

        run(&mut graph).unwrap();

        // 外部使用者仍然存活，且仍读取 matmul（未融合）的输出
        for user in external_users {
            assert!(graph.node(user).is_alive());
            let input = graph.node(user).inputs[0];
            assert_eq!(graph.node(graph.producer(input)).kind, OpKind::aten("matmul"));
            assert!(graph.uses(input).contains(&Use { user, offset: 0 }));
        }
        // 图输出个数不变，最后一个输出来自 div 或融合节点
        let outputs = graph.region_outputs(root);
        assert_eq!(outputs.len(), outputs_before);
        let last = graph.node(graph.producer(outputs[outputs.len() - 1])).kind.clone();
        assert!(last == OpKind::aten("div") || last == OpKind::ipex("matmul_div"));
        graph.verify().unwrap();
    }
}
