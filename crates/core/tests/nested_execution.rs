use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pipenest_core::analyzer::analyze_execution;
use pipenest_core::config::{AnalysisConfig, LimitsConfig};
use pipenest_core::render::{render_debug_report, render_tree};
use pipenest_core::span::SpanStatus;
use pipenest_core::tracer::{build_execution_tree, generate_performance_summary, TraceInput};
use pipenest_core::{
    ErrorCategory, ExecutionContext, InvocationSpec, NestedExecutor, NestingError, OutputSpec,
    PipelineRunner,
};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
enum Action {
    Step(&'static str, Value),
    EchoInputs,
    Invoke(InvocationSpec),
    Parallel(Vec<InvocationSpec>),
    Sleep(u64),
    Fail(&'static str),
}

/// Runs a fixed list of actions per pipeline id. Pipelines without a script
/// finish immediately.
#[derive(Debug, Default)]
struct ScriptedRunner {
    scripts: HashMap<String, Vec<Action>>,
}

impl ScriptedRunner {
    fn script(mut self, pipeline: &str, actions: Vec<Action>) -> Self {
        self.scripts.insert(pipeline.to_string(), actions);
        self
    }
}

#[async_trait]
impl PipelineRunner for ScriptedRunner {
    async fn run(&self, executor: &NestedExecutor, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
        let actions = self.scripts.get(&ctx.pipeline_id).cloned().unwrap_or_default();
        for action in actions {
            match action {
                Action::Step(name, value) => executor.record_step(ctx, name, None, value)?,
                Action::EchoInputs => {
                    let inputs = Value::Object(ctx.inputs.clone());
                    executor.record_step(ctx, "inputs", None, inputs)?;
                }
                Action::Invoke(spec) => {
                    let outputs = executor.invoke(self, ctx, &spec).await?;
                    executor.record_step(
                        ctx,
                        spec.display_step_name(),
                        Some("pipeline"),
                        Value::Object(outputs),
                    )?;
                }
                Action::Parallel(specs) => {
                    let results = executor.invoke_parallel(self, ctx, &specs).await;
                    for (spec, result) in specs.iter().zip(results) {
                        executor.record_step(
                            ctx,
                            spec.display_step_name(),
                            Some("pipeline"),
                            Value::Object(result?),
                        )?;
                    }
                }
                Action::Sleep(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                Action::Fail(message) => anyhow::bail!("{message}"),
            }
        }
        Ok(())
    }
}

fn invoke(pipeline: &str) -> Action {
    Action::Invoke(InvocationSpec::new(pipeline))
}

#[tokio::test]
async fn inputs_and_outputs_flow_through_a_nested_call() {
    let runner = ScriptedRunner::default()
        .script(
            "main",
            vec![
                Action::Step("load", json!({ "rows": 3, "name": "orders" })),
                Action::Invoke(
                    InvocationSpec::new("summarize")
                        .with_step_name("summary")
                        .with_input("count", "{{ steps.load.result.rows }}")
                        .with_input("label", "table {{ load.name }}")
                        .with_outputs(vec![
                            OutputSpec::key("inputs"),
                            OutputSpec::path("done.ok", Some("ok")),
                        ]),
                ),
            ],
        )
        .script(
            "summarize",
            vec![Action::EchoInputs, Action::Step("done", json!({ "ok": true }))],
        );
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    executor.run_root(&runner, &mut root).await.expect("run");

    assert_eq!(
        root.results["summary"],
        json!({
            "inputs": { "count": 3, "label": "table orders" },
            "ok": true
        })
    );
}

#[tokio::test]
async fn unresolved_input_is_passed_through_literally() {
    let runner = ScriptedRunner::default()
        .script(
            "main",
            vec![Action::Invoke(
                InvocationSpec::new("child").with_input("x", "{{ steps.missing.result }}"),
            )],
        )
        .script("child", vec![Action::EchoInputs]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    executor.run_root(&runner, &mut root).await.expect("run");

    assert_eq!(
        root.results["child"]["inputs"]["x"],
        json!("{{ steps.missing.result }}")
    );
}

#[tokio::test]
async fn three_level_cycle_is_reported_with_full_chain() {
    let runner = ScriptedRunner::default()
        .script("A", vec![invoke("B")])
        .script("B", vec![invoke("C")])
        .script("C", vec![invoke("A")]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("A");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("cycle");

    assert_eq!(
        failure.error,
        NestingError::CircularDependency {
            chain: vec!["A".into(), "B".into(), "C".into(), "A".into()]
        }
    );
    assert!(failure.report.contains("Cycle: A → B → C → A"));
    assert!(failure.report.contains("Detected in: C (depth: 2)"));
}

#[tokio::test]
async fn depth_never_exceeds_the_configured_limit() {
    let runner = ScriptedRunner::default()
        .script("p0", vec![invoke("p1")])
        .script("p1", vec![invoke("p2")])
        .script("p2", vec![invoke("p3")])
        .script("p3", vec![invoke("p4")])
        .script("p4", vec![Action::Step("leaf", json!(1))]);
    let executor = NestedExecutor::new(LimitsConfig {
        max_depth: 3,
        ..LimitsConfig::default()
    });
    let mut root = ExecutionContext::root("p0");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("depth");

    assert_eq!(failure.error, NestingError::DepthExceeded { current: 4, limit: 3 });
    let spans = executor.recorder().snapshot();
    assert!(spans.iter().all(|span| span.depth <= 3));
    assert!(!spans.iter().any(|span| span.pipeline_id == "p4"));
}

#[tokio::test]
async fn step_budget_stops_the_chain() {
    let runner = ScriptedRunner::default()
        .script(
            "main",
            vec![Action::Step("a", json!(1)), Action::Step("b", json!(2)), invoke("child")],
        )
        .script("child", vec![Action::Step("c", json!(3)), Action::Step("d", json!(4))]);
    let executor = NestedExecutor::new(LimitsConfig {
        max_total_steps: 3,
        ..LimitsConfig::default()
    });
    let mut root = ExecutionContext::root("main");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("budget");

    assert_eq!(failure.error, NestingError::StepBudgetExceeded { total: 4, limit: 3 });
    assert!(failure
        .report
        .starts_with("Step budget exceeded: 4 steps executed, limit is 3"));
}

#[tokio::test(start_paused = true)]
async fn slow_child_times_out_with_a_formatted_report() {
    let runner = ScriptedRunner::default()
        .script(
            "main",
            vec![Action::Invoke(InvocationSpec::new("slow").with_timeout(30))],
        )
        .script("slow", vec![Action::Sleep(45), Action::Step("never", json!(null))]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("timeout");

    match &failure.error {
        NestingError::Timeout {
            pipeline_id,
            limit_seconds,
            elapsed_ms,
        } => {
            assert_eq!(pipeline_id, "slow");
            assert_eq!(*limit_seconds, 30);
            assert!(*elapsed_ms >= 30_000);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(failure.report.contains("Limit: 30s"));
    assert!(failure.report.contains("main"));

    let slow_span = executor
        .recorder()
        .snapshot()
        .into_iter()
        .find(|span| span.pipeline_id == "slow")
        .expect("slow span");
    assert_eq!(slow_span.status, SpanStatus::Failed);
}

#[tokio::test]
async fn parallel_siblings_run_in_independent_contexts() {
    let runner = ScriptedRunner::default()
        .script(
            "main",
            vec![
                Action::Step("seed", json!(7)),
                Action::Parallel(vec![
                    InvocationSpec::new("left").with_input("n", "{{ seed }}"),
                    InvocationSpec::new("right").with_input("n", "{{ seed }}"),
                    InvocationSpec::new("left")
                        .with_step_name("left_again")
                        .with_input("n", 8),
                ]),
            ],
        )
        .script("left", vec![Action::EchoInputs])
        .script("right", vec![Action::EchoInputs]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    executor.run_root(&runner, &mut root).await.expect("run");

    assert_eq!(root.results["left"]["inputs"]["n"], json!(7));
    assert_eq!(root.results["right"]["inputs"]["n"], json!(7));
    assert_eq!(root.results["left_again"]["inputs"]["n"], json!(8));

    let spans = executor.recorder().snapshot();
    let children: Vec<_> = spans
        .iter()
        .filter(|span| span.is_pipeline() && span.depth == 1)
        .collect();
    assert_eq!(children.len(), 3);
    assert!(children
        .iter()
        .all(|span| span.parent_span_id == root.span_id));
}

#[tokio::test]
async fn recorded_spans_feed_tracer_and_analyzer() {
    let runner = ScriptedRunner::default()
        .script("main", vec![Action::Step("load", json!(1)), invoke("child"), invoke("broken")])
        .script("child", vec![Action::Step("work", json!(2))])
        .script("broken", vec![Action::Fail("upstream resource not found")]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("broken child");
    assert!(matches!(failure.error, NestingError::ExecutionFailure { .. }));

    let tree = build_execution_tree(executor.recorder().snapshot());
    assert_eq!(tree.roots.len(), 1);
    assert_eq!(tree.root_pipeline(), Some("main"));
    assert_eq!(tree.trace_id(), root.trace_id.as_deref());

    let summary = generate_performance_summary(&tree);
    assert_eq!(summary.pipeline_count, 3);
    assert_eq!(summary.running_spans, 0);
    assert_eq!(summary.failed_count(), 2);

    let analysis = analyze_execution(&tree, &AnalysisConfig::default());
    assert!(analysis.has_issues());
    let rendered = render_tree(&tree);
    assert!(rendered.contains("child::work"));
    assert!(rendered.contains("✗ broken"));
    let report = render_debug_report(&tree, &analysis);
    assert!(report.contains("not_found"));
}

fn error_categories(executor: &NestedExecutor) -> Vec<ErrorCategory> {
    let tree = build_execution_tree(executor.recorder().snapshot());
    analyze_execution(&tree, &AnalysisConfig::default())
        .error_patterns
        .iter()
        .map(|pattern| pattern.category)
        .collect()
}

#[tokio::test]
async fn missing_output_path_is_grouped_as_not_found() {
    let runner = ScriptedRunner::default()
        .script(
            "main",
            vec![Action::Invoke(
                InvocationSpec::new("child").with_outputs(vec![OutputSpec::path("y.z", None)]),
            )],
        )
        .script("child", vec![Action::Step("x", json!(1))]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("extraction");

    assert_eq!(failure.error.category(), ErrorCategory::NotFound);
    assert_eq!(error_categories(&executor), vec![ErrorCategory::NotFound]);
}

#[tokio::test]
async fn pipeline_name_does_not_decide_the_error_category() {
    let runner = ScriptedRunner::default()
        .script("main", vec![invoke("memory_report")])
        .script("memory_report", vec![Action::Fail("boom")]);
    let executor = NestedExecutor::new(LimitsConfig::default());
    let mut root = ExecutionContext::root("main");

    let failure = executor.run_root(&runner, &mut root).await.expect_err("boom");

    assert_eq!(failure.error.category(), ErrorCategory::Unknown);
    assert_eq!(error_categories(&executor), vec![ErrorCategory::Unknown]);

    let persisted = serde_json::to_value(executor.recorder().snapshot()).expect("serialize");
    let tree = build_execution_tree(TraceInput::from_json(persisted).expect("reload"));
    let analysis = analyze_execution(&tree, &AnalysisConfig::default());
    assert_eq!(analysis.error_patterns.len(), 1);
    assert_eq!(analysis.error_patterns[0].category, ErrorCategory::Unknown);
    assert_eq!(analysis.error_patterns[0].count, 2);
}
