//! Condition rule trees
//!
//! Rules extend the flat equality conditions of a registration with boolean
//! combinators and pattern matching. Keys are looked up in the context data
//! (overlay first) and then in the metadata.

use crate::hooks::context::HookContext;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleNode {
    All(Vec<RuleNode>),
    Any(Vec<RuleNode>),
    Not(Box<RuleNode>),
    Equals { key: String, value: Value },
    Exists { key: String },
    Matches { key: String, pattern: String },
}

/// Size limits applied by [`RuleNode::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLimits {
    /// Maximum nesting of `all`/`any`/`not`
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for RuleLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_nodes: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RuleNode {
    pub fn not(inner: RuleNode) -> Self {
        Self::Not(Box::new(inner))
    }

    pub fn equals(key: impl Into<String>, value: Value) -> Self {
        Self::Equals {
            key: key.into(),
            value,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    pub fn matches(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    /// Check structure and size against `limits`
    pub fn validate(&self, limits: &RuleLimits) -> RuleValidation {
        let mut report = RuleValidation::default();
        let mut nodes = 0;
        let depth = self.check(&mut report, &mut nodes, "$");

        if depth > limits.max_depth {
            report.errors.push(format!(
                "rule nesting depth {} exceeds limit of {}",
                depth, limits.max_depth
            ));
        }
        if nodes > limits.max_nodes {
            report.errors.push(format!(
                "rule has {} nodes, limit is {}",
                nodes, limits.max_nodes
            ));
        }

        report.valid = report.errors.is_empty();
        report
    }

    /// Walk the tree, returning its combinator depth
    fn check(&self, report: &mut RuleValidation, nodes: &mut usize, path: &str) -> usize {
        *nodes += 1;
        match self {
            Self::All(children) | Self::Any(children) => {
                let kind = if matches!(self, Self::All(_)) { "all" } else { "any" };
                match children.len() {
                    0 => report.errors.push(format!("{}: '{}' has no children", path, kind)),
                    1 => report.warnings.push(format!(
                        "{}: '{}' has a single child and can be simplified",
                        path, kind
                    )),
                    _ => {}
                }
                let deepest = children
                    .iter()
                    .enumerate()
                    .map(|(i, child)| child.check(report, nodes, &format!("{}.{}[{}]", path, kind, i)))
                    .max()
                    .unwrap_or(0);
                deepest + 1
            }
            Self::Not(inner) => inner.check(report, nodes, &format!("{}.not", path)) + 1,
            Self::Matches { pattern, .. } => {
                if let Err(e) = Regex::new(pattern) {
                    report.errors.push(format!("{}: invalid pattern '{}': {}", path, pattern, e));
                }
                0
            }
            Self::Equals { key, .. } | Self::Exists { key } => {
                if key.is_empty() {
                    report.errors.push(format!("{}: empty key", path));
                }
                0
            }
        }
    }

    /// Compile patterns once so evaluation never re-parses them
    pub fn compile(&self) -> Result<CompiledRule, regex::Error> {
        Ok(match self {
            Self::All(children) => {
                CompiledRule::All(children.iter().map(RuleNode::compile).collect::<Result<_, _>>()?)
            }
            Self::Any(children) => {
                CompiledRule::Any(children.iter().map(RuleNode::compile).collect::<Result<_, _>>()?)
            }
            Self::Not(inner) => CompiledRule::Not(Box::new(inner.compile()?)),
            Self::Equals { key, value } => CompiledRule::Equals {
                key: key.clone(),
                value: value.clone(),
            },
            Self::Exists { key } => CompiledRule::Exists { key: key.clone() },
            Self::Matches { key, pattern } => CompiledRule::Matches {
                key: key.clone(),
                regex: Regex::new(pattern)?,
            },
        })
    }
}

/// A [`RuleNode`] with its patterns already compiled
#[derive(Debug, Clone)]
pub enum CompiledRule {
    All(Vec<CompiledRule>),
    Any(Vec<CompiledRule>),
    Not(Box<CompiledRule>),
    Equals { key: String, value: Value },
    Exists { key: String },
    Matches { key: String, regex: Regex },
}

impl CompiledRule {
    pub fn evaluate(&self, context: &HookContext) -> bool {
        match self {
            Self::All(children) => children.iter().all(|c| c.evaluate(context)),
            Self::Any(children) => children.iter().any(|c| c.evaluate(context)),
            Self::Not(inner) => !inner.evaluate(context),
            Self::Equals { key, value } => lookup(context, key) == Some(value),
            Self::Exists { key } => lookup(context, key).is_some(),
            Self::Matches { key, regex } => match lookup(context, key) {
                Some(Value::String(s)) => regex.is_match(s),
                Some(other) => regex.is_match(&other.to_string()),
                None => false,
            },
        }
    }

    /// Number of compiled patterns in the tree
    pub fn pattern_count(&self) -> usize {
        match self {
            Self::All(children) | Self::Any(children) => children.iter().map(Self::pattern_count).sum(),
            Self::Not(inner) => inner.pattern_count(),
            Self::Matches { .. } => 1,
            Self::Equals { .. } | Self::Exists { .. } => 0,
        }
    }
}

fn lookup<'a>(context: &'a HookContext, key: &str) -> Option<&'a Value> {
    context.get(key).or_else(|| context.get_metadata(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookType;
    use serde_json::json;

    fn nested_not(n: usize) -> RuleNode {
        let mut node = RuleNode::exists("table");
        for _ in 0..n {
            node = RuleNode::not(node);
        }
        node
    }

    fn eval(rule: &RuleNode, context: &HookContext) -> bool {
        rule.compile().unwrap().evaluate(context)
    }

    #[test]
    fn test_empty_combinator_invalid() {
        let report = RuleNode::All(vec![]).validate(&RuleLimits::default());
        assert!(!report.valid);
        assert!(report.errors[0].contains("no children"));

        let report = RuleNode::Any(vec![]).validate(&RuleLimits::default());
        assert!(!report.valid);
    }

    #[test]
    fn test_single_child_warns() {
        let report = RuleNode::Any(vec![RuleNode::exists("a")]).validate(&RuleLimits::default());
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_nested_not_depth_limit() {
        for n in 1..6 {
            let rule = nested_not(n);
            let ok = RuleLimits { max_depth: n, max_nodes: 64 };
            let tight = RuleLimits { max_depth: n - 1, max_nodes: 64 };
            assert!(rule.validate(&ok).valid, "depth {}", n);
            assert!(!rule.validate(&tight).valid, "depth {}", n);
        }
    }

    #[test]
    fn test_node_limit_and_bad_regex() {
        let rule = RuleNode::All((0..10).map(|i| RuleNode::exists(format!("k{}", i))).collect());
        let report = rule.validate(&RuleLimits { max_depth: 4, max_nodes: 5 });
        assert!(!report.valid);
        assert!(report.errors[0].contains("11 nodes"));

        let report = RuleNode::matches("name", "(unclosed").validate(&RuleLimits::default());
        assert!(!report.valid);
        assert!(RuleNode::matches("name", "(unclosed").compile().is_err());
    }

    #[test]
    fn test_evaluate() {
        let context = HookContext::builder(HookType::OnIssueFound)
            .with_data("severity", json!("critical"))
            .with_data("count", json!(3))
            .with_metadata("source", json!("warehouse.orders"))
            .build();

        let rule = RuleNode::All(vec![
            RuleNode::equals("severity", json!("critical")),
            RuleNode::matches("source", r"^warehouse\."),
            RuleNode::not(RuleNode::exists("suppressed")),
            RuleNode::Any(vec![RuleNode::matches("count", "^[0-9]+$"), RuleNode::exists("nope")]),
        ]);
        assert!(eval(&rule, &context));

        assert!(!eval(&RuleNode::equals("severity", json!("low")), &context));
        assert!(!eval(&RuleNode::matches("missing", ".*"), &context));
    }

    #[test]
    fn test_compiled_rule_reused_across_contexts() {
        let compiled = RuleNode::Any(vec![
            RuleNode::matches("table", "^orders_[0-9]+$"),
            RuleNode::not(RuleNode::matches("source", "^warehouse\\.")),
        ])
        .compile()
        .unwrap();
        assert_eq!(compiled.pattern_count(), 2);

        for (table, expected) in [("orders_1", true), ("orders_x", false), ("orders_42", true)] {
            let context = HookContext::builder(HookType::OnIssueFound)
                .with_data("table", json!(table))
                .with_metadata("source", json!("warehouse.main"))
                .build();
            assert_eq!(compiled.evaluate(&context), expected, "{}", table);
        }
    }

    #[test]
    fn test_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Hook {
            when: RuleNode,
        }

        let hook: Hook = toml::from_str(
            r#"
            [[when.all]]
            equals = { key = "severity", value = "critical" }

            [[when.all]]
            exists = { key = "table" }
            "#,
        )
        .unwrap();
        assert_eq!(
            hook.when,
            RuleNode::All(vec![RuleNode::equals("severity", json!("critical")), RuleNode::exists("table")])
        );
    }
}
