//! Performance, failure and comparison analysis over execution trees.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, ErrorCategory};
use crate::span::{Span, SpanStatus};
use crate::tracer::{generate_performance_summary, ExecutionTree, PerformanceSummary};

const REPEATED_INVOCATION_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SlowExecution,
    HighFailureRate,
    DeepNesting,
    Healthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanBrief {
    pub span_id: String,
    pub pipeline_id: String,
    pub step_name: Option<String>,
    pub depth: u32,
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
}

impl From<&Span> for SpanBrief {
    fn from(span: &Span) -> Self {
        Self {
            span_id: span.id.clone(),
            pipeline_id: span.pipeline_id.clone(),
            step_name: span.step_name.clone(),
            depth: span.depth,
            duration_ms: span.duration_ms,
            status: span.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub spans: Vec<SpanBrief>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub category: ErrorCategory,
    pub count: usize,
    pub most_common_depth: u32,
    pub min_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
    pub pipelines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub total_spans: usize,
    pub pipeline_count: usize,
    pub max_depth: u32,
    pub total_duration_ms: u64,
    pub avg_span_duration_ms: f64,
    pub slowest_span: Option<SpanBrief>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: PerformanceSummary,
    pub performance_issues: Vec<PerformanceIssue>,
    pub optimizations: Vec<String>,
    pub error_patterns: Vec<ErrorPattern>,
    pub resource_usage: ResourceUsage,
    pub recommendations: Vec<String>,
}

impl Analysis {
    pub fn has_issues(&self) -> bool {
        self.performance_issues
            .iter()
            .any(|issue| issue.kind != IssueKind::Healthy)
    }
}

pub fn analyze_execution(tree: &ExecutionTree, thresholds: &AnalysisConfig) -> Analysis {
    let summary = generate_performance_summary(tree);
    let spans: Vec<&Span> = tree.spans().collect();

    let performance_issues = detect_performance_issues(&spans, &summary, thresholds);
    let error_patterns = analyze_error_patterns(&spans);
    let optimizations = suggest_optimizations(&spans, &summary, thresholds);
    let recommendations = build_recommendations(&performance_issues, &error_patterns);
    let resource_usage = resource_usage(&spans, &summary);

    Analysis {
        summary,
        performance_issues,
        optimizations,
        error_patterns,
        resource_usage,
        recommendations,
    }
}

fn detect_performance_issues(
    spans: &[&Span],
    summary: &PerformanceSummary,
    thresholds: &AnalysisConfig,
) -> Vec<PerformanceIssue> {
    let mut issues = Vec::new();

    let slow: Vec<SpanBrief> = spans
        .iter()
        .filter(|span| span.duration_ms.is_some_and(|ms| ms > thresholds.slow_span_ms))
        .map(|span| SpanBrief::from(*span))
        .collect();
    if !slow.is_empty() {
        issues.push(PerformanceIssue {
            kind: IssueKind::SlowExecution,
            severity: Severity::Warning,
            description: format!(
                "{} span(s) took longer than {}ms",
                slow.len(),
                thresholds.slow_span_ms
            ),
            spans: slow,
        });
    }

    if summary.success_rate < thresholds.min_success_rate {
        issues.push(PerformanceIssue {
            kind: IssueKind::HighFailureRate,
            severity: Severity::Error,
            description: format!(
                "Success rate {:.1}% is below {:.1}%",
                summary.success_rate, thresholds.min_success_rate
            ),
            spans: spans
                .iter()
                .filter(|span| span.status == SpanStatus::Failed)
                .map(|span| SpanBrief::from(*span))
                .collect(),
        });
    }

    if summary.max_depth > thresholds.deep_nesting_depth {
        issues.push(PerformanceIssue {
            kind: IssueKind::DeepNesting,
            severity: Severity::Warning,
            description: format!(
                "Nesting reaches depth {} (threshold {})",
                summary.max_depth, thresholds.deep_nesting_depth
            ),
            spans: spans
                .iter()
                .filter(|span| span.depth > thresholds.deep_nesting_depth)
                .map(|span| SpanBrief::from(*span))
                .collect(),
        });
    }

    if issues.is_empty() {
        issues.push(PerformanceIssue {
            kind: IssueKind::Healthy,
            severity: Severity::Info,
            description: "No performance issues detected".to_string(),
            spans: Vec::new(),
        });
    }

    issues
}

fn analyze_error_patterns(spans: &[&Span]) -> Vec<ErrorPattern> {
    let mut groups: BTreeMap<ErrorCategory, Vec<&Span>> = BTreeMap::new();
    for span in spans.iter().filter(|span| span.status == SpanStatus::Failed) {
        let category = span.error_category();
        groups.entry(category).or_default().push(span);
    }

    groups
        .into_iter()
        .map(|(category, failed)| {
            let mut depth_counts: BTreeMap<u32, usize> = BTreeMap::new();
            for span in &failed {
                *depth_counts.entry(span.depth).or_default() += 1;
            }
            // Ties resolve to the shallowest depth.
            let most_common_depth = depth_counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(depth, _)| *depth)
                .unwrap_or(0);

            let durations: Vec<u64> = failed.iter().map(|span| span.duration_or_zero()).collect();
            let mut pipelines: Vec<String> =
                failed.iter().map(|span| span.pipeline_id.clone()).collect();
            pipelines.sort();
            pipelines.dedup();

            ErrorPattern {
                category,
                count: failed.len(),
                most_common_depth,
                min_duration_ms: durations.iter().copied().min().unwrap_or(0),
                avg_duration_ms: durations.iter().sum::<u64>() as f64 / durations.len() as f64,
                max_duration_ms: durations.iter().copied().max().unwrap_or(0),
                pipelines,
            }
        })
        .collect()
}

fn suggest_optimizations(
    spans: &[&Span],
    summary: &PerformanceSummary,
    thresholds: &AnalysisConfig,
) -> Vec<String> {
    let mut suggestions = Vec::new();

    if summary.max_depth > thresholds.parallelize_depth {
        suggestions.push(format!(
            "Nesting depth {} exceeds {}: run independent nested pipelines in parallel",
            summary.max_depth, thresholds.parallelize_depth
        ));
    }

    if summary.pipeline_count > thresholds.cache_pipeline_count {
        suggestions.push(format!(
            "{} distinct pipelines were loaded: cache pipeline definitions between invocations",
            summary.pipeline_count
        ));
    }

    let mut invocations: BTreeMap<&str, usize> = BTreeMap::new();
    for span in spans.iter().filter(|span| span.is_pipeline() && span.depth > 0) {
        *invocations.entry(span.pipeline_id.as_str()).or_default() += 1;
    }
    for (pipeline_id, count) in invocations {
        if count >= REPEATED_INVOCATION_THRESHOLD {
            suggestions.push(format!(
                "Pipeline '{pipeline_id}' was invoked {count} times: memoize its results when inputs repeat"
            ));
        }
    }

    if suggestions.is_empty() {
        suggestions.push("Execution structure looks efficient; no optimizations suggested".to_string());
    }
    suggestions
}

fn build_recommendations(issues: &[PerformanceIssue], patterns: &[ErrorPattern]) -> Vec<String> {
    let mut recommendations = Vec::new();

    for issue in issues {
        let text = match issue.kind {
            IssueKind::SlowExecution => {
                "Profile the slow spans and split long-running nested pipelines into smaller units"
            }
            IssueKind::HighFailureRate => {
                "Investigate the failing spans below before increasing load on this pipeline"
            }
            IssueKind::DeepNesting => {
                "Flatten the pipeline hierarchy to reduce nesting depth"
            }
            IssueKind::Healthy => continue,
        };
        recommendations.push(text.to_string());
    }

    for pattern in patterns {
        let text = match pattern.category {
            ErrorCategory::Timeout => "Raise timeouts or reduce the work done by timed-out pipelines",
            ErrorCategory::CircularDependency => {
                "Break circular pipeline references reported in the error analysis"
            }
            ErrorCategory::ResourceLimit => {
                "Review the limits configuration or reduce per-pipeline resource usage"
            }
            ErrorCategory::NotFound => {
                "Check pipeline references and declared outputs for missing keys or files"
            }
            ErrorCategory::Cancelled => {
                "Check what cancelled the affected pipelines; partial results were discarded"
            }
            ErrorCategory::Unknown => "Inspect the raw error text of failed spans",
        };
        recommendations.push(format!("{text} ({} failure(s))", pattern.count));
    }

    if recommendations.is_empty() {
        recommendations.push("Execution looks healthy; no action needed".to_string());
    }
    recommendations
}

fn resource_usage(spans: &[&Span], summary: &PerformanceSummary) -> ResourceUsage {
    let timed: Vec<u64> = spans.iter().filter_map(|span| span.duration_ms).collect();
    let avg_span_duration_ms = if timed.is_empty() {
        0.0
    } else {
        timed.iter().sum::<u64>() as f64 / timed.len() as f64
    };

    ResourceUsage {
        total_spans: summary.total_spans,
        pipeline_count: summary.pipeline_count,
        max_depth: summary.max_depth,
        total_duration_ms: summary.total_duration_ms,
        avg_span_duration_ms,
        slowest_span: spans
            .iter()
            .filter(|span| span.duration_ms.is_some())
            .max_by_key(|span| span.duration_or_zero())
            .map(|span| SpanBrief::from(*span)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Stable => "stable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub execution_count: usize,
    pub avg_duration_ms: f64,
    /// Population variance of the executions' total durations.
    pub duration_variance: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_success_rate: f64,
    pub success_rate_trend: Trend,
}

pub fn compare_executions(summaries: &[PerformanceSummary]) -> Result<ComparisonReport, AnalysisError> {
    compare_executions_with(summaries, AnalysisConfig::default().trend_threshold)
}

/// Compare two or more executions. The trend compares the mean success rate
/// of the first half of `summaries` with that of the second half.
pub fn compare_executions_with(
    summaries: &[PerformanceSummary],
    trend_threshold: f64,
) -> Result<ComparisonReport, AnalysisError> {
    if summaries.len() < 2 {
        return Err(AnalysisError::InsufficientExecutions {
            actual: summaries.len(),
        });
    }

    let durations: Vec<f64> = summaries.iter().map(|s| s.total_duration_ms as f64).collect();
    let avg_duration_ms = mean(&durations);
    let duration_variance = durations
        .iter()
        .map(|d| (d - avg_duration_ms).powi(2))
        .sum::<f64>()
        / durations.len() as f64;

    let rates: Vec<f64> = summaries.iter().map(|s| s.success_rate).collect();
    let (first, second) = rates.split_at(rates.len() / 2);
    let delta = mean(second) - mean(first);
    let success_rate_trend = if delta > trend_threshold {
        Trend::Improving
    } else if delta < -trend_threshold {
        Trend::Declining
    } else {
        Trend::Stable
    };

    Ok(ComparisonReport {
        execution_count: summaries.len(),
        avg_duration_ms,
        duration_variance,
        min_duration_ms: summaries.iter().map(|s| s.total_duration_ms).min().unwrap_or(0),
        max_duration_ms: summaries.iter().map(|s| s.total_duration_ms).max().unwrap_or(0),
        avg_success_rate: mean(&rates),
        success_rate_trend,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    PipelineIds,
    StepNames,
    Errors,
    All,
}

impl FromStr for SearchField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipeline_ids" | "pipelines" | "pipeline" => Ok(Self::PipelineIds),
            "step_names" | "steps" | "step" => Ok(Self::StepNames),
            "errors" | "error" => Ok(Self::Errors),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown search field '{other}' (expected pipeline_ids, step_names, errors or all)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SearchPattern {
    /// Case-insensitive substring.
    Substring(String),
    Regex(Regex),
}

impl SearchPattern {
    pub fn substring(pattern: &str) -> Self {
        Self::Substring(pattern.to_lowercase())
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Substring(needle) => text.to_lowercase().contains(needle.as_str()),
            Self::Regex(regex) => regex.is_match(text),
        }
    }
}

impl From<&str> for SearchPattern {
    fn from(pattern: &str) -> Self {
        Self::substring(pattern)
    }
}

impl From<Regex> for SearchPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub span_id: String,
    pub field: SearchField,
    pub matched_text: String,
    pub pipeline_id: String,
    pub parent_pipeline: Option<String>,
    pub depth: u32,
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
}

/// Find spans whose selected field matches `pattern`. With
/// [`SearchField::All`] each span is reported once, for the first matching
/// field in the order pipeline id, step name, error.
pub fn search_execution(
    tree: &ExecutionTree,
    pattern: &SearchPattern,
    field: SearchField,
) -> Vec<SearchMatch> {
    let fields: &[SearchField] = match field {
        SearchField::All => &[
            SearchField::PipelineIds,
            SearchField::StepNames,
            SearchField::Errors,
        ],
        SearchField::PipelineIds => &[SearchField::PipelineIds],
        SearchField::StepNames => &[SearchField::StepNames],
        SearchField::Errors => &[SearchField::Errors],
    };

    tree.nodes()
        .into_iter()
        .filter_map(|(node, parent)| {
            let span = &node.span;
            fields.iter().find_map(|&candidate| {
                let text = match candidate {
                    SearchField::PipelineIds => Some(span.pipeline_id.as_str()),
                    SearchField::StepNames => span.step_name.as_deref(),
                    SearchField::Errors => span.error.as_deref(),
                    SearchField::All => None,
                }?;
                pattern.is_match(text).then(|| SearchMatch {
                    span_id: span.id.clone(),
                    field: candidate,
                    matched_text: text.to_string(),
                    pipeline_id: span.pipeline_id.clone(),
                    parent_pipeline: parent.map(|p| p.span.pipeline_id.clone()),
                    depth: span.depth,
                    duration_ms: span.duration_ms,
                    status: span.status,
                })
            })
        })
        .collect()
}
