/// 别名分析
///
/// `AliasSnapshot` 是当前图的一次性派生数据：图发生任何结构变更后立即
/// 过期，必须丢弃重建，绝不增量修补。快照记录构建时的图 generation，
/// 读取方据此判断是否过期。
///
/// 所有回答都是保守的：不确定时 `move_after_topologically_valid` 答 false、
/// `may_alias` 答 true、`must_alias` 答 false。错误的保守回答只会导致漏掉
/// 融合，不会导致错误融合。

use std::collections::HashSet;

use crate::graph::{Graph, NodeId, OpKind, RegionId, TypeHint, ValueId};
use crate::schema::SchemaResolver;

/// 别名/顺序查询接口
pub trait AliasOracle {
    /// 快照构建时的图 generation
    fn generation(&self) -> u64;

    /// `node` 能否移动到紧跟 `target` 之后，而不破坏任何数据依赖或
    /// 潜在副作用顺序
    fn move_after_topologically_valid(&self, graph: &Graph, node: NodeId, target: NodeId) -> bool;

    /// 两个值是否可能共享存储
    fn may_alias(&self, a: ValueId, b: ValueId) -> bool;

    /// 两个值是否一定是同一存储
    fn must_alias(&self, a: ValueId, b: ValueId) -> bool;

    /// 程序顺序上 `a` 是否位于 `b` 之后
    fn is_after(&self, graph: &Graph, a: NodeId, b: NodeId) -> bool;

    fn is_stale(&self, graph: &Graph) -> bool {
        self.generation() != graph.generation()
    }
}

/// 别名分析：从当前图构建快照
pub trait AliasAnalysis {
    type Snapshot: AliasOracle;

    fn analyze(&self, graph: &Graph, schemas: SchemaResolver<'_>) -> Self::Snapshot;
}

// =========================================================================
// 默认分析：基于 schema 别名标注
// =========================================================================

/// 基于 schema 别名标注的默认分析
#[derive(Debug, Clone, Copy, Default)]
pub struct AliasDb;

/// 节点的读写效果（包含其嵌套区域中的一切）
#[derive(Debug, Clone, Default)]
struct NodeEffects {
    reads: Vec<ValueId>,
    writes: Vec<ValueId>,
    /// 未知操作：不能跨越它移动任何东西
    barrier: bool,
    /// 节点及其嵌套区域消费的全部值
    consumed: HashSet<ValueId>,
}

pub struct AliasSnapshot {
    generation: u64,
    may: Vec<u32>,
    must: Vec<u32>,
    effects: Vec<NodeEffects>,
    order: Vec<isize>,
}

/// 并查集（路径减半）
struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        UnionFind {
            parent: (0..len as u32).collect(),
        }
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grand = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb) as usize] = ra.min(rb);
        }
    }

    fn flatten(mut self) -> Vec<u32> {
        (0..self.parent.len() as u32).map(|x| self.find(x)).collect()
    }
}

/// 纯的 prim 操作：无副作用，输出只可能引用输入
fn is_pure_prim(kind: &OpKind) -> bool {
    matches!(
        kind.as_str(),
        "prim::Constant" | "prim::ListConstruct" | "prim::TupleConstruct"
    )
}

struct Builder<'g, 'r> {
    graph: &'g Graph,
    schemas: SchemaResolver<'r>,
    may: UnionFind,
    must: UnionFind,
    effects: Vec<NodeEffects>,
    order: Vec<isize>,
    /// 所有区域输入共享的通配别名类代表
    wildcard: Option<ValueId>,
}

/// 来源未知时可能是张量的类型
fn may_hold_tensor(hint: TypeHint) -> bool {
    matches!(hint, TypeHint::Tensor | TypeHint::Unknown)
}

impl Builder<'_, '_> {
    fn visit_region(&mut self, region: RegionId) {
        let graph = self.graph;
        let data = graph.region(region);
        // 调用方可能把同一存储传给多个输入：区域输入彼此可能别名
        for &input in graph.region_inputs(region) {
            if !may_hold_tensor(graph.value(input).type_hint) {
                continue;
            }
            match self.wildcard {
                Some(w) => self.may.union(w, input),
                None => self.wildcard = Some(input),
            }
        }
        self.order[data.param as usize] = -1;
        self.order[data.ret as usize] = data.nodes.len() as isize;
        for (i, &n) in data.nodes.iter().enumerate() {
            self.order[n as usize] = i as isize;
            for &block in &graph.node(n).blocks {
                self.visit_region(block);
            }
            self.visit_node(n);
        }
    }

    fn visit_node(&mut self, n: NodeId) {
        let graph = self.graph;
        let node = graph.node(n);
        let mut effects = NodeEffects {
            reads: node.inputs.clone(),
            consumed: node.inputs.iter().copied().collect(),
            ..Default::default()
        };

        if let Some(schema) = self.schemas.schema_of(node) {
            for (ri, ret) in schema.returns.iter().enumerate() {
                if ret.alias.is_none() {
                    continue;
                }
                for (ai, arg) in schema.arguments.iter().enumerate() {
                    if !arg.alias.shares_set_with(&ret.alias) {
                        continue;
                    }
                    self.may.union(node.outputs[ri], node.inputs[ai]);
                    // 原地操作返回 self
                    if ret.alias.is_write() && arg.alias.is_write() {
                        self.must.union(node.outputs[ri], node.inputs[ai]);
                    }
                }
            }
            effects
                .writes
                .extend(schema.written_arguments().map(|ai| node.inputs[ai]));
        } else if !node.blocks.is_empty() {
            // 控制流：输出可能是任一输入或任一分支返回的值
            for &block in &node.blocks {
                for &out in &node.outputs {
                    for &inp in &node.inputs {
                        self.may.union(out, inp);
                    }
                    for &ret in graph.region_outputs(block) {
                        self.may.union(out, ret);
                    }
                }
                let block_data = graph.region(block);
                effects
                    .consumed
                    .extend(graph.node(block_data.ret).inputs.iter().copied());
                for &inner in &block_data.nodes {
                    let nested = &self.effects[inner as usize];
                    effects.reads.extend(nested.reads.iter().copied());
                    effects.writes.extend(nested.writes.iter().copied());
                    effects.barrier |= nested.barrier;
                    effects.consumed.extend(nested.consumed.iter().copied());
                }
            }
        } else if is_pure_prim(&node.kind) {
            for &out in &node.outputs {
                for &inp in &node.inputs {
                    self.may.union(out, inp);
                }
            }
        } else {
            // 未知操作：可能写任何输入，输出可能引用任何输入
            for &out in &node.outputs {
                for &inp in &node.inputs {
                    self.may.union(out, inp);
                }
            }
            effects.writes = node.inputs.clone();
            effects.barrier = true;
        }

        self.effects[n as usize] = effects;
    }
}

impl AliasAnalysis for AliasDb {
    type Snapshot = AliasSnapshot;

    fn analyze(&self, graph: &Graph, schemas: SchemaResolver<'_>) -> AliasSnapshot {
        let value_count = graph.value_slots();
        let node_count = graph.node_slots();
        let mut builder = Builder {
            graph,
            schemas,
            may: UnionFind::new(value_count),
            must: UnionFind::new(value_count),
            effects: vec![NodeEffects::default(); node_count],
            order: vec![isize::MIN; node_count],
            wildcard: None,
        };
        builder.visit_region(graph.root());

        AliasSnapshot {
            generation: graph.generation(),
            may: builder.may.flatten(),
            must: builder.must.flatten(),
            effects: builder.effects,
            order: builder.order,
        }
    }
}

impl AliasSnapshot {
    fn classes<'a>(&'a self, values: &'a [ValueId]) -> impl Iterator<Item = u32> + 'a {
        values.iter().map(move |&v| self.may[v as usize])
    }

    /// `a` 写入的存储是否与 `b` 读写的存储可能重叠
    fn writes_conflict(&self, a: &NodeEffects, b: &NodeEffects) -> bool {
        let touched: HashSet<u32> = self
            .classes(&b.reads)
            .chain(self.classes(&b.writes))
            .collect();
        self.classes(&a.writes).any(|c| touched.contains(&c))
    }
}

impl AliasOracle for AliasSnapshot {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn move_after_topologically_valid(&self, graph: &Graph, node: NodeId, target: NodeId) -> bool {
        if self.is_stale(graph) {
            debug_assert!(false, "alias snapshot read after mutation");
            return false;
        }
        if node == target {
            return true;
        }
        let region = graph.owning_region(node);
        if graph.owning_region(target) != region {
            return false;
        }
        let (Some(&ni), Some(&ti)) = (
            self.order.get(node as usize),
            self.order.get(target as usize),
        ) else {
            return false;
        };
        // 只支持向前移动到更早的 target 之后
        if ti < 0 || ni <= ti {
            return false;
        }

        let moved = &self.effects[node as usize];
        let between = &graph.region_nodes(region)[(ti + 1) as usize..ni as usize];
        for &m in between {
            let crossed = &self.effects[m as usize];
            if moved.barrier || crossed.barrier {
                return false;
            }
            if graph
                .node(m)
                .outputs
                .iter()
                .any(|out| moved.consumed.contains(out))
            {
                return false;
            }
            if self.writes_conflict(crossed, moved) || self.writes_conflict(moved, crossed) {
                return false;
            }
        }
        true
    }

    fn may_alias(&self, a: ValueId, b: ValueId) -> bool {
        match (self.may.get(a as usize), self.may.get(b as usize)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => true,
        }
    }

    fn must_alias(&self, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return true;
        }
        match (self.must.get(a as usize), self.must.get(b as usize)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => false,
        }
    }

    fn is_after(&self, graph: &Graph, a: NodeId, b: NodeId) -> bool {
        graph.is_after_with(a, b, |n| {
            self.order.get(n as usize).copied().unwrap_or(isize::MIN)
        })
    }
}

// =========================================================================
// 最保守的分析（永远不允许移动）
// =========================================================================

/// 所有查询都回答最保守的结果
#[derive(Debug, Clone, Copy, Default)]
pub struct ConservativeAnalysis;

pub struct ConservativeSnapshot {
    generation: u64,
}

impl AliasAnalysis for ConservativeAnalysis {
    type Snapshot = ConservativeSnapshot;

    fn analyze(&self, graph: &Graph, _schemas: SchemaResolver<'_>) -> ConservativeSnapshot {
        ConservativeSnapshot {
            generation: graph.generation(),
        }
    }
}

impl AliasOracle for ConservativeSnapshot {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn move_after_topologically_valid(&self, _graph: &Graph, _node: NodeId, _target: NodeId) -> bool {
        false
    }

    fn may_alias(&self, _a: ValueId, _b: ValueId) -> bool {
        true
    }

    fn must_alias(&self, _a: ValueId, _b: ValueId) -> bool {
        false
    }

    fn is_after(&self, graph: &Graph, a: NodeId, b: NodeId) -> bool {
        graph.is_after(a, b)
    }
}
