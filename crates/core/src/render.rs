//! Plain-text debug output for traces: trees, reports and comparison tables.

use std::fmt::Write as _;

use crate::analyzer::{compare_executions_with, Analysis, IssueKind, Severity};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::span::SpanStatus;
use crate::tracer::{ExecutionTree, PerformanceSummary, TreeNode};

const RULE: &str = "============================================================";
const MAX_LISTED_SPANS: usize = 5;

pub fn status_glyph(status: SpanStatus) -> &'static str {
    match status {
        SpanStatus::Completed => "✓",
        SpanStatus::Failed => "✗",
        SpanStatus::Running => "…",
    }
}

pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

/// Render the tree with connectors and one status glyph per span.
///
/// ```text
/// ✓ main (1.2s)
/// ├─ ✓ main::load (40ms)
/// └─ ✗ child (300ms) error: boom
/// ```
pub fn render_tree(tree: &ExecutionTree) -> String {
    let mut out = String::new();
    if tree.is_empty() {
        out.push_str("(empty trace)\n");
        return out;
    }
    for root in &tree.roots {
        push_node(&mut out, root, "", None);
    }
    out
}

fn push_node(out: &mut String, node: &TreeNode, prefix: &str, is_last: Option<bool>) {
    let connector = match is_last {
        None => "",
        Some(true) => "└─ ",
        Some(false) => "├─ ",
    };
    let _ = write!(out, "{prefix}{connector}{}", node_label(node));
    if let Some(error) = node.span.error.as_deref() {
        let _ = write!(out, " error: {error}");
    }
    out.push('\n');

    let child_prefix = match is_last {
        None => prefix.to_string(),
        Some(true) => format!("{prefix}   "),
        Some(false) => format!("{prefix}│  "),
    };
    let count = node.children.len();
    for (index, child) in node.children.iter().enumerate() {
        push_node(out, child, &child_prefix, Some(index + 1 == count));
    }
}

fn node_label(node: &TreeNode) -> String {
    let span = &node.span;
    let name = match span.step_name.as_deref() {
        Some(step) => format!("{}::{step}", span.pipeline_id),
        None => span.pipeline_id.clone(),
    };
    let duration = span
        .duration_ms
        .map(format_duration)
        .unwrap_or_else(|| "running".to_string());
    format!("{} {name} ({duration})", status_glyph(span.status))
}

pub fn render_debug_report(tree: &ExecutionTree, analysis: &Analysis) -> String {
    let mut out = String::new();
    let summary = &analysis.summary;

    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Pipeline Execution Debug Report");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Root pipeline: {}", tree.root_pipeline().unwrap_or("unknown"));
    let _ = writeln!(out, "Trace: {}", tree.trace_id().unwrap_or("unknown"));
    out.push('\n');

    out.push_str("Summary\n");
    let _ = writeln!(out, "  Pipelines: {}", summary.pipeline_count);
    let _ = writeln!(
        out,
        "  Spans: {} (completed {}, failed {}, running {})",
        summary.total_spans,
        summary.completed_spans,
        summary.failed_count(),
        summary.running_spans
    );
    let _ = writeln!(out, "  Success rate: {:.1}%", summary.success_rate);
    let _ = writeln!(out, "  Total duration: {}", format_duration(summary.total_duration_ms));
    let _ = writeln!(out, "  Max depth: {}", summary.max_depth);
    for (depth, metric) in &summary.depth_metrics {
        let _ = writeln!(
            out,
            "    depth {depth}: {} span(s), avg {:.1}ms",
            metric.span_count, metric.avg_duration_ms
        );
    }
    out.push('\n');

    out.push_str("Performance Analysis\n");
    for issue in &analysis.performance_issues {
        let tag = match issue.severity {
            Severity::Info => "OK",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        let _ = writeln!(out, "  [{tag}] {}", issue.description);
        if issue.kind == IssueKind::Healthy {
            continue;
        }
        for span in issue.spans.iter().take(MAX_LISTED_SPANS) {
            let _ = writeln!(
                out,
                "    - {}{} at depth {} ({})",
                span.pipeline_id,
                span.step_name.as_deref().map(|s| format!("::{s}")).unwrap_or_default(),
                span.depth,
                span.duration_ms.map(format_duration).unwrap_or_else(|| "running".to_string())
            );
        }
        if issue.spans.len() > MAX_LISTED_SPANS {
            let _ = writeln!(out, "    ... and {} more", issue.spans.len() - MAX_LISTED_SPANS);
        }
    }
    out.push_str("  Optimizations:\n");
    for suggestion in &analysis.optimizations {
        let _ = writeln!(out, "    - {suggestion}");
    }
    let usage = &analysis.resource_usage;
    let _ = writeln!(out, "  Average span duration: {:.1}ms", usage.avg_span_duration_ms);
    if let Some(slowest) = &usage.slowest_span {
        let _ = writeln!(
            out,
            "  Slowest span: {} ({})",
            slowest.pipeline_id,
            format_duration(slowest.duration_ms.unwrap_or(0))
        );
    }
    out.push('\n');

    out.push_str("Error Analysis\n");
    if analysis.error_patterns.is_empty() {
        out.push_str("  No failures recorded\n");
    }
    for pattern in &analysis.error_patterns {
        let _ = writeln!(
            out,
            "  {}: {} failure(s), most common depth {}, duration min/avg/max {}ms/{:.1}ms/{}ms",
            pattern.category.as_str(),
            pattern.count,
            pattern.most_common_depth,
            pattern.min_duration_ms,
            pattern.avg_duration_ms,
            pattern.max_duration_ms
        );
        let _ = writeln!(out, "    pipelines: {}", pattern.pipelines.join(", "));
    }
    for failed in summary.failed_spans.iter().take(MAX_LISTED_SPANS) {
        let _ = writeln!(
            out,
            "  ✗ {} (depth {}): {}",
            failed.pipeline_id,
            failed.depth,
            failed.error.as_deref().unwrap_or("unknown")
        );
    }
    out.push('\n');

    out.push_str("Recommendations\n");
    for (index, recommendation) in analysis.recommendations.iter().enumerate() {
        let _ = writeln!(out, "  {}. {recommendation}", index + 1);
    }
    out
}

/// One row per labelled trace followed by aggregate statistics and the
/// success-rate trend. Needs at least two traces.
pub fn render_comparison_table(
    traces: &[(String, PerformanceSummary)],
    thresholds: &AnalysisConfig,
) -> Result<String, AnalysisError> {
    let summaries: Vec<PerformanceSummary> =
        traces.iter().map(|(_, summary)| summary.clone()).collect();
    let report = compare_executions_with(&summaries, thresholds.trend_threshold)?;

    let label_width = traces
        .iter()
        .map(|(label, _)| label.chars().count())
        .max()
        .unwrap_or(0)
        .max("Trace".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<label_width$}  {:>6}  {:>6}  {:>8}  {:>10}  {:>5}",
        "Trace", "Spans", "Failed", "Success", "Duration", "Depth"
    );
    let _ = writeln!(out, "{}", "-".repeat(label_width + 47));
    for (label, summary) in traces {
        let _ = writeln!(
            out,
            "{:<label_width$}  {:>6}  {:>6}  {:>7.1}%  {:>10}  {:>5}",
            label,
            summary.total_spans,
            summary.failed_count(),
            summary.success_rate,
            format_duration(summary.total_duration_ms),
            summary.max_depth
        );
    }
    out.push('\n');
    let _ = writeln!(out, "Executions: {}", report.execution_count);
    let _ = writeln!(
        out,
        "Average duration: {:.1}ms (variance {:.1}, range {}-{}ms)",
        report.avg_duration_ms, report.duration_variance, report.min_duration_ms, report.max_duration_ms
    );
    let _ = writeln!(out, "Average success rate: {:.1}%", report.avg_success_rate);
    let _ = writeln!(out, "Success rate trend: {}", report.success_rate_trend);
    Ok(out)
}
