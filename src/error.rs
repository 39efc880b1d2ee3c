/// 融合 pass 的错误类型
///
/// 只有致命错误才会出现在这里。候选不安全（UnsafeFusion）不是错误，
/// 由 `FuseOutcome::NotApplicable` 表达。

use crate::graph::OpKind;

#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// 规则表与 schema 注册表不一致：融合目标没有匹配元数的签名
    #[error(
        "schema not found for fusion into `{kind}` \
         ({arguments} arguments, {returns} returns)\n  prev: {prev}\n  node: {node}\n{}",
        format_candidates(.candidates)
    )]
    SchemaNotFound {
        kind: OpKind,
        arguments: usize,
        returns: usize,
        prev: String,
        node: String,
        candidates: Vec<String>,
    },

    /// 图结构损坏或规则跨区域匹配
    #[error("structural invariant violated: {0}")]
    InvariantViolation(String),

    #[error("cannot parse schema `{text}`: {reason}")]
    SchemaParse { text: String, reason: String },

    #[error("invalid fusion rule table: {0}")]
    InvalidRuleTable(String),

    #[error(transparent)]
    Config(#[from] serde_json::Error),
}

impl FusionError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        FusionError::InvariantViolation(msg.into())
    }

    /// 是否为 SchemaNotFound（测试与 Python 绑定用）
    pub fn is_schema_not_found(&self) -> bool {
        matches!(self, FusionError::SchemaNotFound { .. })
    }
}

fn format_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        return "no candidates found".to_string();
    }
    let mut out = String::from("candidates were:");
    for c in candidates {
        out.push_str("\n  ");
        out.push_str(c);
    }
    out
}
