/// 融合规则表
///
/// (producer kind, consumer kind) -> fused kind 的静态映射。
/// 进程启动时构建，之后只读；按精确键查找，不支持通配符。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::FusionError;
use crate::graph::OpKind;

/// 单条规则（JSON 配置的一项）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionRule {
    pub producer: OpKind,
    pub consumer: OpKind,
    pub fused: OpKind,
}

#[derive(Debug, Clone, Default)]
pub struct FusionRuleTable {
    rules: HashMap<(OpKind, OpKind), OpKind>,
}

impl FusionRuleTable {
    /// 空表（不融合任何东西）
    pub fn empty() -> Self {
        FusionRuleTable {
            rules: HashMap::new(),
        }
    }

    /// 从规则列表构建
    ///
    /// 同一键映射到不同目标时视为配置错误。
    pub fn from_rules(rules: impl IntoIterator<Item = FusionRule>) -> Result<Self, FusionError> {
        let mut table = HashMap::new();
        for rule in rules {
            let key = (rule.producer.clone(), rule.consumer.clone());
            if let Some(existing) = table.get(&key) {
                if existing != &rule.fused {
                    return Err(FusionError::InvalidRuleTable(format!(
                        "({}, {}) maps to both {} and {}",
                        rule.producer, rule.consumer, existing, rule.fused
                    )));
                }
                continue;
            }
            table.insert(key, rule.fused);
        }
        Ok(FusionRuleTable { rules: table })
    }

    /// 从 JSON 列表加载：`[{"producer": ..., "consumer": ..., "fused": ...}]`
    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        let rules: Vec<FusionRule> = serde_json::from_str(json)?;
        Self::from_rules(rules)
    }

    /// 进程级内置规则表（只初始化一次）
    pub fn builtin() -> &'static FusionRuleTable {
        static BUILTIN: OnceLock<FusionRuleTable> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            let mut rules = HashMap::new();
            rules.insert(
                (OpKind::aten("matmul"), OpKind::aten("div")),
                OpKind::ipex("matmul_div"),
            );
            rules.insert(
                (OpKind::aten("conv2d"), OpKind::aten("relu")),
                OpKind::ipex("conv2d_relu"),
            );
            rules.insert(
                (OpKind::aten("conv2d"), OpKind::aten("add")),
                OpKind::ipex("conv2d_sum"),
            );
            FusionRuleTable { rules }
        })
    }

    /// 查找规则：纯函数，O(1)
    #[inline]
    pub fn lookup(&self, producer: &OpKind, consumer: &OpKind) -> Option<&OpKind> {
        // 元组键需要 owned 值；规则表很小，克隆可以接受
        self.rules.get(&(producer.clone(), consumer.clone()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 所有规则，按键排序（用于打印与导出）
    pub fn rules(&self) -> Vec<FusionRule> {
        let mut out: Vec<FusionRule> = self
            .rules
            .iter()
            .map(|((producer, consumer), fused)| FusionRule {
                producer: producer.clone(),
                consumer: consumer.clone(),
                fused: fused.clone(),
            })
            .collect();
        out.sort_by(|a, b| (&a.producer, &a.consumer).cmp(&(&b.producer, &b.consumer)));
        out
    }
}
