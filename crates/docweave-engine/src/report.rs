//! Report generation
//!
//! Converts validation and run results into stable diagnostics and wraps
//! them in a [`Report`].

use docweave_core::{Diagnostic, DiagnosticCode, Report, Severity};
use docweave_dag::{ModelGraph, ValidationError, ValidationResult, WarningKind};

use crate::executor::RunResult;

/// Diagnostics for every validation error and warning
pub fn validation_diagnostics(result: &ValidationResult) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for error in &result.errors {
        match error {
            ValidationError::Cycle { path } => diagnostics.push(
                Diagnostic::new(DiagnosticCode::GraphCycle, Severity::Error, error.to_string())
                    .with_impact(path.clone()),
            ),
        }
    }

    for warning in &result.warnings {
        match warning.kind {
            WarningKind::Orphan => diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::GraphOrphanRoots,
                    Severity::Warn,
                    format!(
                        "Graph has disconnected groups of models; roots: {}",
                        warning.models.join(", ")
                    ),
                )
                .with_impact(warning.models.clone()),
            ),
        }
    }

    diagnostics
}

/// Diagnostics for failed and skipped models
///
/// A failure's impact is every model downstream of it.
pub fn run_diagnostics(result: &RunResult, graph: &ModelGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for failure in &result.models_failed {
        diagnostics.push(
            Diagnostic::new(
                DiagnosticCode::ModelFailed,
                Severity::Error,
                format!("Model '{}' failed: {}", failure.name, failure.error),
            )
            .with_model(failure.name.clone())
            .with_impact(graph.downstream_names(&failure.name)),
        );
    }

    for skipped in &result.models_skipped {
        diagnostics.push(
            Diagnostic::new(
                DiagnosticCode::ModelSkipped,
                Severity::Warn,
                format!("Model '{skipped}' was skipped because an upstream model failed"),
            )
            .with_model(skipped.clone()),
        );
    }

    diagnostics
}

/// Build a report for `project` from a validation and an optional run
pub fn build_report(
    project: &str,
    graph: &ModelGraph,
    validation: &ValidationResult,
    run: Option<&RunResult>,
) -> Report {
    let mut report = Report::from_diagnostics(project, validation_diagnostics(validation));

    if let Some(run) = run {
        for diagnostic in run_diagnostics(run, graph) {
            report.add_diagnostic(diagnostic);
        }
        report.summary.models_run = run.models_run.len();
        report.summary.models_failed = run.models_failed.len();
        report.summary.models_skipped = run.models_skipped.len();
        if let Ok(metadata) = serde_json::to_value(run) {
            report = report.with_metadata(metadata);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ModelFailure;
    use docweave_core::{Model, Source};
    use docweave_dag::{validate, GraphBuilder};
    use pretty_assertions::assert_eq;

    #[test]
    fn failed_model_reports_downstream_impact() {
        let base = Model::builder("base", Source::collection("raw")).build_shared().unwrap();
        let mid = Model::builder("mid", base).build_shared().unwrap();
        let top = Model::builder("top", mid).build_shared().unwrap();
        let graph = GraphBuilder::new().declare(top).build().unwrap();

        let run = RunResult {
            success: false,
            models_failed: vec![ModelFailure {
                name: "base".to_string(),
                error: "boom".to_string(),
            }],
            models_skipped: vec!["mid".to_string(), "top".to_string()],
            ..RunResult::default()
        };

        let report = build_report("shop", &graph, &validate(&graph), Some(&run));

        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.summary.warnings, 2);
        assert_eq!(report.summary.models_failed, 1);
        assert_eq!(report.summary.models_skipped, 2);
        assert_eq!(report.diagnostics[0].code, DiagnosticCode::ModelFailed);
        assert_eq!(report.diagnostics[0].impact, vec!["mid", "top"]);
        assert!(report.has_errors());
        assert!(report.metadata.is_some());
    }

    #[test]
    fn orphan_warning_becomes_diagnostic() {
        let a = Model::builder("a", Source::collection("x")).build_shared().unwrap();
        let b = Model::builder("b", Source::collection("y")).build_shared().unwrap();
        let graph = GraphBuilder::new().declare(a).declare(b).build().unwrap();

        let diagnostics = validation_diagnostics(&validate(&graph));

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticCode::GraphOrphanRoots);
        assert_eq!(diagnostics[0].severity, Severity::Warn);
        assert_eq!(diagnostics[0].impact, vec!["a", "b"]);
    }

    #[test]
    fn cycle_becomes_error() {
        let a = Model::builder("a", Source::collection("x")).build_shared().unwrap();
        let b = Model::builder("b", a).build_shared().unwrap();
        let mut graph = GraphBuilder::new().declare(b).build().unwrap();
        let (a_id, b_id) = (graph.id_of("a").unwrap(), graph.id_of("b").unwrap());
        graph.add_edge(a_id, b_id);

        let diagnostics = validation_diagnostics(&validate(&graph));
        assert_eq!(diagnostics[0].code, DiagnosticCode::GraphCycle);
        assert_eq!(diagnostics[0].severity, Severity::Error);
    }
}
