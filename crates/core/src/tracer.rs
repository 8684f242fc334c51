//! Reconstruction of execution trees from recorded spans.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::span::{Span, SpanStatus};

/// The span collections a tree can be built from.
#[derive(Debug, Clone)]
pub enum TraceInput {
    Map(HashMap<String, Span>),
    List(Vec<Span>),
    Tree(ExecutionTree),
}

impl From<Vec<Span>> for TraceInput {
    fn from(spans: Vec<Span>) -> Self {
        Self::List(spans)
    }
}

impl From<HashMap<String, Span>> for TraceInput {
    fn from(spans: HashMap<String, Span>) -> Self {
        Self::Map(spans)
    }
}

impl From<ExecutionTree> for TraceInput {
    fn from(tree: ExecutionTree) -> Self {
        Self::Tree(tree)
    }
}

impl From<&ExecutionTree> for TraceInput {
    fn from(tree: &ExecutionTree) -> Self {
        Self::Tree(tree.clone())
    }
}

impl TraceInput {
    /// Detect the input shape of a JSON document: an array of spans, a single
    /// span, an already-built tree (`roots`), or an object of spans keyed by id.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Array(_) => {
                let spans: Vec<Span> =
                    serde_json::from_value(value).context("invalid span list")?;
                Ok(Self::List(spans))
            }
            Value::Object(ref map) if map.contains_key("roots") => {
                let tree: ExecutionTree =
                    serde_json::from_value(value).context("invalid execution tree")?;
                Ok(Self::Tree(tree))
            }
            Value::Object(ref map) if map.contains_key("pipeline_id") && map.contains_key("id") => {
                let span: Span = serde_json::from_value(value).context("invalid span")?;
                Ok(Self::List(vec![span]))
            }
            Value::Object(_) => {
                let spans: HashMap<String, Span> =
                    serde_json::from_value(value).context("invalid span map")?;
                Ok(Self::Map(spans))
            }
            other => anyhow::bail!("unsupported trace document: expected array or object, got {other}"),
        }
    }

    pub fn into_spans(self) -> Vec<Span> {
        match self {
            Self::Map(map) => map.into_values().collect(),
            Self::List(spans) => spans,
            Self::Tree(tree) => tree.spans().cloned().collect(),
        }
    }
}

/// Load a persisted trace: a JSON document in any [`TraceInput`] shape, or a
/// JSON-lines log with one span per line.
pub fn load_trace_file(path: &Path) -> Result<TraceInput> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read trace file: {}", path.display()))?;

    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => TraceInput::from_json(value)
            .with_context(|| format!("failed to parse trace file: {}", path.display())),
        Err(_) => {
            let spans = raw
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(index, line)| {
                    serde_json::from_str::<Span>(line).with_context(|| {
                        format!("invalid span on line {} of {}", index + 1, path.display())
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(TraceInput::List(spans))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub span: Span,
    #[serde(default)]
    pub children: Vec<TreeNode>,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub step_count: usize,
    #[serde(default)]
    pub max_depth: u32,
}

/// Aggregates are recomputed on every build, so persisted trees may omit them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionTree {
    pub roots: Vec<TreeNode>,
    pub total_duration_ms: u64,
    pub step_count: usize,
    pub max_depth: u32,
}

impl ExecutionTree {
    /// Every span in depth-first pre-order.
    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.nodes().into_iter().map(|(node, _)| &node.span)
    }

    /// Every node with its parent, depth-first pre-order.
    pub fn nodes(&self) -> Vec<(&TreeNode, Option<&TreeNode>)> {
        let mut out = Vec::with_capacity(self.step_count);
        let mut stack: Vec<(&TreeNode, Option<&TreeNode>)> =
            self.roots.iter().rev().map(|root| (root, None)).collect();
        while let Some((node, parent)) = stack.pop() {
            out.push((node, parent));
            stack.extend(node.children.iter().rev().map(|child| (child, Some(node))));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.spans().find_map(|span| span.trace_id.as_deref())
    }

    pub fn root_pipeline(&self) -> Option<&str> {
        self.roots.first().map(|root| root.span.pipeline_id.as_str())
    }
}

/// Build the canonical tree for any supported span collection.
///
/// Spans whose parent is absent become roots. Spans caught in a parent cycle
/// are attached as roots and visited once.
pub fn build_execution_tree(input: impl Into<TraceInput>) -> ExecutionTree {
    let mut spans = input.into().into_spans();
    spans.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));

    let mut seen = HashSet::new();
    spans.retain(|span| {
        let fresh = seen.insert(span.id.clone());
        if !fresh {
            warn!(span_id = %span.id, "Duplicate span id in trace; keeping the earliest");
        }
        fresh
    });

    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut root_indices = Vec::new();
    for (index, span) in spans.iter().enumerate() {
        match span.parent_span_id.as_deref() {
            Some(parent) if seen.contains(parent) && parent != span.id => {
                children.entry(parent).or_default().push(index);
            }
            _ => root_indices.push(index),
        }
    }

    let mut visited = vec![false; spans.len()];
    let mut roots: Vec<TreeNode> = root_indices
        .into_iter()
        .map(|index| build_node(index, &spans, &children, &mut visited))
        .collect();

    for index in 0..spans.len() {
        if !visited[index] {
            warn!(
                span_id = %spans[index].id,
                "Span is part of a parent cycle; attaching it as a root"
            );
            roots.push(build_node(index, &spans, &children, &mut visited));
        }
    }

    ExecutionTree {
        total_duration_ms: roots.iter().map(|r| r.total_duration_ms).sum(),
        step_count: roots.iter().map(|r| r.step_count).sum(),
        max_depth: roots.iter().map(|r| r.max_depth).max().unwrap_or(0),
        roots,
    }
}

fn build_node(
    index: usize,
    spans: &[Span],
    children: &HashMap<&str, Vec<usize>>,
    visited: &mut [bool],
) -> TreeNode {
    visited[index] = true;
    let span = &spans[index];

    let mut child_nodes = Vec::new();
    for &child in children.get(span.id.as_str()).into_iter().flatten() {
        if !visited[child] {
            child_nodes.push(build_node(child, spans, children, visited));
        }
    }

    TreeNode {
        total_duration_ms: span.duration_or_zero()
            + child_nodes.iter().map(|c| c.total_duration_ms).sum::<u64>(),
        step_count: 1 + child_nodes.iter().map(|c| c.step_count).sum::<usize>(),
        max_depth: child_nodes
            .iter()
            .map(|c| c.max_depth)
            .fold(span.depth, u32::max),
        span: span.clone(),
        children: child_nodes,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthMetric {
    pub span_count: usize,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSpan {
    pub span_id: String,
    pub pipeline_id: String,
    pub step_name: Option<String>,
    pub depth: u32,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub pipeline_count: usize,
    pub total_spans: usize,
    pub completed_spans: usize,
    pub failed_spans: Vec<FailedSpan>,
    pub running_spans: usize,
    /// Percentage (0-100) of terminated spans that completed.
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub max_depth: u32,
    pub depth_metrics: BTreeMap<u32, DepthMetric>,
}

impl PerformanceSummary {
    pub fn failed_count(&self) -> usize {
        self.failed_spans.len()
    }
}

pub fn generate_performance_summary(tree: &ExecutionTree) -> PerformanceSummary {
    let mut pipelines = BTreeSet::new();
    let mut completed = 0usize;
    let mut running = 0usize;
    let mut failed = Vec::new();
    let mut by_depth: BTreeMap<u32, (usize, u64, usize)> = BTreeMap::new();

    for span in tree.spans() {
        pipelines.insert(span.pipeline_id.as_str());
        match span.status {
            SpanStatus::Completed => completed += 1,
            SpanStatus::Running => running += 1,
            SpanStatus::Failed => failed.push(FailedSpan {
                span_id: span.id.clone(),
                pipeline_id: span.pipeline_id.clone(),
                step_name: span.step_name.clone(),
                depth: span.depth,
                duration_ms: span.duration_ms,
                error: span.error.clone(),
            }),
        }

        let entry = by_depth.entry(span.depth).or_insert((0, 0, 0));
        entry.0 += 1;
        if let Some(duration) = span.duration_ms {
            entry.1 += duration;
            entry.2 += 1;
        }
    }

    let terminated = completed + failed.len();
    let success_rate = if terminated == 0 {
        100.0
    } else {
        100.0 * completed as f64 / terminated as f64
    };

    let depth_metrics = by_depth
        .into_iter()
        .map(|(depth, (span_count, duration_sum, timed))| {
            let avg_duration_ms = if timed == 0 {
                0.0
            } else {
                duration_sum as f64 / timed as f64
            };
            (
                depth,
                DepthMetric {
                    span_count,
                    avg_duration_ms,
                },
            )
        })
        .collect();

    PerformanceSummary {
        pipeline_count: pipelines.len(),
        total_spans: tree.step_count,
        completed_spans: completed,
        failed_spans: failed,
        running_spans: running,
        success_rate,
        total_duration_ms: tree.total_duration_ms,
        max_depth: tree.max_depth,
        depth_metrics,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::*;

    fn span(id: &str, parent: Option<&str>, pipeline: &str, depth: u32, ms: u64, offset: i64) -> Span {
        Span {
            id: id.to_string(),
            parent_span_id: parent.map(ToString::to_string),
            trace_id: Some("trace-1".to_string()),
            pipeline_id: pipeline.to_string(),
            step_name: None,
            step_type: None,
            status: SpanStatus::Completed,
            duration_ms: Some(ms),
            depth,
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::milliseconds(offset),
            error: None,
            category: None,
        }
    }

    fn sample_spans() -> Vec<Span> {
        let mut failed = span("c", Some("b"), "validator", 2, 50, 2);
        failed.status = SpanStatus::Failed;
        failed.error = Some("timeout".to_string());
        vec![
            span("a", None, "main", 0, 300, 0),
            span("b", Some("a"), "processor", 1, 200, 1),
            failed,
            span("d", Some("a"), "reporter", 1, 100, 3),
        ]
    }

    #[test]
    fn builds_hierarchy_and_aggregates() {
        let tree = build_execution_tree(sample_spans());

        assert_eq!(tree.roots.len(), 1);
        let root = &tree.roots[0];
        assert_eq!(root.span.id, "a");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].span.id, "b");
        assert_eq!(root.children[0].children[0].span.id, "c");
        assert_eq!(root.total_duration_ms, 650);
        assert_eq!(root.step_count, 4);
        assert_eq!(root.max_depth, 2);
        assert_eq!(root.children[1].max_depth, 1);
        assert_eq!(tree.total_duration_ms, 650);
        assert_eq!(tree.step_count, 4);
        assert_eq!(tree.max_depth, 2);
    }

    #[test]
    fn map_list_and_tree_inputs_agree() {
        let list = build_execution_tree(sample_spans());
        let map: HashMap<String, Span> = sample_spans()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let from_map = build_execution_tree(map);
        let from_tree = build_execution_tree(&list);

        assert_eq!(from_map, list);
        assert_eq!(from_tree, list);
    }

    #[test]
    fn rebuilding_is_idempotent() {
        let first = build_execution_tree(sample_spans());
        let second = build_execution_tree(sample_spans());

        assert_eq!(first.total_duration_ms, second.total_duration_ms);
        assert_eq!(first.step_count, second.step_count);
        assert_eq!(first.max_depth, second.max_depth);
    }

    #[test]
    fn orphans_and_parent_cycles_become_roots() {
        let spans = vec![
            span("orphan", Some("missing"), "lost", 1, 10, 0),
            span("x", Some("y"), "cyc_x", 1, 5, 1),
            span("y", Some("x"), "cyc_y", 2, 5, 2),
        ];
        let tree = build_execution_tree(spans);

        assert_eq!(tree.step_count, 3);
        assert_eq!(tree.roots[0].span.id, "orphan");
        assert_eq!(tree.roots.len(), 2);
    }

    #[test]
    fn running_spans_contribute_zero_duration() {
        let mut running = span("b", Some("a"), "child", 1, 0, 1);
        running.status = SpanStatus::Running;
        running.duration_ms = None;
        let tree = build_execution_tree(vec![span("a", None, "main", 0, 40, 0), running]);

        assert_eq!(tree.total_duration_ms, 40);
    }

    #[test]
    fn summary_reports_success_rate_and_depth_metrics() {
        let tree = build_execution_tree(sample_spans());
        let summary = generate_performance_summary(&tree);

        assert_eq!(summary.pipeline_count, 4);
        assert_eq!(summary.total_spans, 4);
        assert_eq!(summary.completed_spans, 3);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.success_rate, 75.0);
        assert_eq!(summary.depth_metrics[&1].span_count, 2);
        assert_eq!(summary.depth_metrics[&1].avg_duration_ms, 150.0);
        assert_eq!(summary.failed_spans[0].error.as_deref(), Some("timeout"));
    }

    #[test]
    fn summary_of_empty_tree_is_fully_successful() {
        let summary = generate_performance_summary(&ExecutionTree::default());
        assert_eq!(summary.success_rate, 100.0);
        assert_eq!(summary.total_spans, 0);
    }

    #[test]
    fn json_shapes_are_detected() {
        let spans = serde_json::to_value(sample_spans()).expect("spans");
        assert!(matches!(
            TraceInput::from_json(spans).expect("list"),
            TraceInput::List(_)
        ));

        let tree = serde_json::to_value(build_execution_tree(sample_spans())).expect("tree");
        assert!(matches!(
            TraceInput::from_json(tree).expect("tree"),
            TraceInput::Tree(_)
        ));

        let map: HashMap<String, Span> = sample_spans()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let map = serde_json::to_value(map).expect("map");
        assert!(matches!(
            TraceInput::from_json(map).expect("map"),
            TraceInput::Map(_)
        ));

        assert!(TraceInput::from_json(json!(42)).is_err());
    }

    #[test]
    fn load_trace_file_accepts_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.jsonl");
        let lines: Vec<String> = sample_spans()
            .iter()
            .map(|s| serde_json::to_string(s).expect("line"))
            .collect();
        fs::write(&path, lines.join("\n")).expect("write trace");

        let tree = build_execution_tree(load_trace_file(&path).expect("load"));
        assert_eq!(tree.step_count, 4);
    }
}
