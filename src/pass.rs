/// 融合 pass 驱动
///
/// 围绕核心融合引擎的完整流水线：
/// 1. 转储图，运行前置 pass（去除 profile 节点、去除 dropout 等外部协作者）
/// 2. 图已量化或开启 LLGA 时运行量化 pass
/// 3. 对根区域运行一次 `OpFuser`（嵌套区域由引擎内部递归）
/// 4. 运行后置 pass，再次转储
///
/// 任何阶段的错误原样向上传播，不做重试。

use crate::alias::{AliasAnalysis, AliasDb};
use crate::error::FusionError;
use crate::fuser::{FusionStats, OpFuser};
use crate::graph::{Graph, RegionId};
use crate::rules::FusionRuleTable;
use crate::schema::SchemaRegistry;
use crate::settings::Settings;

/// 图变换 pass（外部协作者）
pub trait GraphPass {
    fn name(&self) -> &str;

    fn run(&self, graph: &mut Graph) -> Result<(), FusionError>;
}

/// 由闭包构成的 pass
pub struct FnPass<F> {
    name: String,
    f: F,
}

impl<F> FnPass<F>
where
    F: Fn(&mut Graph) -> Result<(), FusionError>,
{
    pub fn new(name: &str, f: F) -> Self {
        FnPass {
            name: name.to_string(),
            f,
        }
    }
}

impl<F> GraphPass for FnPass<F>
where
    F: Fn(&mut Graph) -> Result<(), FusionError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &mut Graph) -> Result<(), FusionError> {
        (self.f)(graph)
    }
}

// =========================================================================
// 量化检测
// =========================================================================

const QUANTIZATION_KINDS: [&str; 3] = [
    "aten::quantize_per_tensor",
    "aten::quantize_per_channel",
    "aten::dequantize",
];

/// 区域树中任意位置出现量化/反量化节点即视为量化图
pub fn is_quantized(graph: &Graph) -> bool {
    region_is_quantized(graph, graph.root())
}

fn region_is_quantized(graph: &Graph, region: RegionId) -> bool {
    graph.region_nodes(region).iter().any(|&n| {
        let node = graph.node(n);
        QUANTIZATION_KINDS.contains(&node.kind.as_str())
            || node.blocks.iter().any(|&b| region_is_quantized(graph, b))
    })
}

// =========================================================================
// FusionPass
// =========================================================================

pub struct FusionPass<'a> {
    rules: &'a FusionRuleTable,
    schemas: &'a dyn SchemaRegistry,
    settings: Settings,
    pre_passes: Vec<Box<dyn GraphPass>>,
    quantization_passes: Vec<Box<dyn GraphPass>>,
    post_passes: Vec<Box<dyn GraphPass>>,
}

impl<'a> FusionPass<'a> {
    pub fn new(rules: &'a FusionRuleTable, schemas: &'a dyn SchemaRegistry) -> Self {
        FusionPass {
            rules,
            schemas,
            settings: Settings::default(),
            pre_passes: Vec::new(),
            quantization_passes: Vec::new(),
            post_passes: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn add_pre_pass(&mut self, pass: Box<dyn GraphPass>) -> &mut Self {
        self.pre_passes.push(pass);
        self
    }

    pub fn add_quantization_pass(&mut self, pass: Box<dyn GraphPass>) -> &mut Self {
        self.quantization_passes.push(pass);
        self
    }

    pub fn add_post_pass(&mut self, pass: Box<dyn GraphPass>) -> &mut Self {
        self.post_passes.push(pass);
        self
    }

    /// 使用默认别名分析运行整条流水线
    pub fn run(&self, graph: &mut Graph) -> Result<FusionStats, FusionError> {
        self.run_with_analysis(graph, AliasDb)
    }

    pub fn run_with_analysis<A: AliasAnalysis>(
        &self,
        graph: &mut Graph,
        analysis: A,
    ) -> Result<FusionStats, FusionError> {
        if self.settings.verify_graph {
            graph.verify()?;
        }
        self.dump("Before pre-passes. Beginning of fusion pass", graph);
        run_passes(&self.pre_passes, graph)?;

        if self.settings.llga_enabled || is_quantized(graph) {
            self.dump("After pre-passes. Before quantization passes", graph);
            run_passes(&self.quantization_passes, graph)?;
        }

        self.dump("Before op fusion", graph);
        let root = graph.root();
        let stats = OpFuser::with_analysis(graph, self.rules, self.schemas, analysis).run(root)?;
        log::info!(
            "op fusion: {} fused, {} rejected, {} rounds over {} regions",
            stats.fusions,
            stats.rejected,
            stats.rounds,
            stats.regions
        );

        self.dump("After op fusion. Before post-passes", graph);
        run_passes(&self.post_passes, graph)?;
        self.dump("End of fusion pass", graph);

        if self.settings.verify_graph {
            graph.verify()?;
        }
        Ok(stats)
    }

    fn dump(&self, title: &str, graph: &Graph) {
        let level = self.settings.dump_level();
        if log::log_enabled!(target: "opfuse::dump", level) {
            log::log!(target: "opfuse::dump", level, "{}\n{}", title, graph);
        }
    }
}

fn run_passes(passes: &[Box<dyn GraphPass>], graph: &mut Graph) -> Result<(), FusionError> {
    for pass in passes {
        log::debug!("running pass `{}`", pass.name());
        pass.run(graph)?;
    }
    Ok(())
}
