//! Dependency discovery
//!
//! A model depends on its declared upstream plus every source embedded in
//! its pipeline. A source referenced inside a nested sub-pipeline counts
//! exactly like one referenced directly.

use docweave_core::{Model, Pipeline, Source, SourceReferences};

/// All sources `model` directly depends on
///
/// The upstream comes first, then embedded references in pipeline order,
/// a pipeline's own references before those of its nested pipelines. Each
/// source appears once. Distinct sources sharing a name are all returned so
/// the graph builder can reject them.
pub fn discover_dependencies(model: &Model) -> Vec<Source> {
    let mut found = vec![model.source().clone()];

    // Explicit stack keeps deeply nested pipelines off the call stack
    let mut stack: Vec<&Pipeline> = vec![model.pipeline()];
    while let Some(pipeline) = stack.pop() {
        let references = pipeline.source_references();

        // Push nested pipelines in reverse so they are walked in order
        for reference in references.iter().rev() {
            if let Some(nested) = reference.nested {
                stack.push(nested);
            }
        }

        for reference in references {
            if !found.iter().any(|known| known.same_as(reference.source)) {
                found.push(reference.source.clone());
            }
        }
    }

    tracing::debug!(
        model = model.name(),
        dependencies = ?found.iter().map(Source::name).collect::<Vec<_>>(),
        "discovered dependencies"
    );

    found
}
