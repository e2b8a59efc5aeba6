//! Stage dependency graph
//!
//! Resolves the execution order of a pipeline's stages from their `needs`.
//! Validation happens at construction: a graph value always describes a DAG
//! whose every edge points at a defined stage.

use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_core::error::DefinitionError;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Read-only view over the `needs` relation of one pipeline definition
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    needs: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds and validates the graph
    ///
    /// # Errors
    /// - `EmptyPipeline` / `EmptyStage` for definitions with nothing to run
    /// - `InvalidStageName` for blank names and the `.` / `..` path components
    /// - `DuplicateStage` if two stages share a name
    /// - `UnknownDependency` naming the first undefined stage found in `needs`
    /// - `Cycle` with the offending path if the relation is not acyclic
    pub fn build(definition: &PipelineDefinition) -> Result<Self, DefinitionError> {
        if definition.stages.is_empty() {
            return Err(DefinitionError::EmptyPipeline(definition.name.clone()));
        }

        let mut index = HashMap::with_capacity(definition.stages.len());
        for (i, stage) in definition.stages.iter().enumerate() {
            let name = stage.name.trim();
            if name.is_empty() || name == "." || name == ".." {
                return Err(DefinitionError::InvalidStageName(stage.name.clone()));
            }
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateStage(stage.name.clone()));
            }
            if stage.steps.is_empty() {
                return Err(DefinitionError::EmptyStage(stage.name.clone()));
            }
        }

        let mut needs = Vec::with_capacity(definition.stages.len());
        let mut dependents = vec![Vec::new(); definition.stages.len()];
        for (i, stage) in definition.stages.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut edges = Vec::with_capacity(stage.needs.len());
            for dep in &stage.needs {
                let &j = index
                    .get(dep)
                    .ok_or_else(|| DefinitionError::UnknownDependency {
                        stage: stage.name.clone(),
                        missing: dep.clone(),
                    })?;
                if seen.insert(j) {
                    edges.push(j);
                    dependents[j].push(i);
                }
            }
            needs.push(edges);
        }

        let names: Vec<String> = definition.stages.iter().map(|s| s.name.clone()).collect();

        let mut marks = vec![Mark::Unvisited; names.len()];
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(names.len());
        for start in 0..names.len() {
            if marks[start] == Mark::Unvisited {
                visit(start, &needs, &names, &mut marks, &mut stack, &mut order)?;
            }
        }

        Ok(Self {
            names,
            index,
            needs,
            dependents,
            order,
        })
    }

    /// Stage names such that every stage follows all of its `needs`
    ///
    /// Independent stages keep their definition order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Direct dependencies of `stage`
    pub fn dependencies(&self, stage: &str) -> Vec<&str> {
        self.index
            .get(stage)
            .map(|&i| self.needs[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Stages that directly need `stage`
    pub fn dependents(&self, stage: &str) -> Vec<&str> {
        self.index
            .get(stage)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&j| self.names[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every stage that directly or transitively needs `stage`, in topological order
    pub fn transitive_dependents(&self, stage: &str) -> Vec<&str> {
        let Some(&root) = self.index.get(stage) else {
            return Vec::new();
        };

        let mut reached = vec![false; self.names.len()];
        let mut pending = vec![root];
        while let Some(i) = pending.pop() {
            for &j in &self.dependents[i] {
                if !reached[j] {
                    reached[j] = true;
                    pending.push(j);
                }
            }
        }

        self.order
            .iter()
            .filter(|&&i| reached[i])
            .map(|&i| self.names[i].as_str())
            .collect()
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.index.contains_key(stage)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Depth-first post-order visit; a dependency found `InProgress` is a back-edge
fn visit(
    node: usize,
    needs: &[Vec<usize>],
    names: &[String],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), DefinitionError> {
    marks[node] = Mark::InProgress;
    stack.push(node);

    for &dep in &needs[node] {
        match marks[dep] {
            Mark::Done => {}
            Mark::Unvisited => visit(dep, needs, names, marks, stack, order)?,
            Mark::InProgress => {
                let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                let mut path: Vec<String> =
                    stack[start..].iter().map(|&n| names[n].clone()).collect();
                path.push(names[dep].clone());
                return Err(DefinitionError::Cycle { path });
            }
        }
    }

    stack.pop();
    marks[node] = Mark::Done;
    order.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sluice_core::domain::pipeline::{StageDefinition, StepAction, StepDefinition};

    fn stage(name: &str, needs: &[&str]) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            steps: vec![StepDefinition {
                name: "noop".to_string(),
                action: StepAction::Run("true".to_string()),
                env: Default::default(),
                timeout_seconds: None,
            }],
            retries: None,
        }
    }

    fn pipeline(stages: Vec<StageDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            name: "demo".to_string(),
            description: None,
            stages,
        }
    }

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|s| *s == name).unwrap()
    }

    #[test]
    fn test_linear_pipeline_order() {
        let graph = DependencyGraph::build(&pipeline(vec![
            stage("deploy", &["build-and-push"]),
            stage("build-and-push", &["test"]),
            stage("test", &[]),
        ]))
        .unwrap();

        assert_eq!(
            graph.topological_order(),
            vec!["test", "build-and-push", "deploy"]
        );
    }

    #[test]
    fn test_independent_stages_keep_definition_order() {
        let graph = DependencyGraph::build(&pipeline(vec![
            stage("lint", &[]),
            stage("test", &[]),
            stage("build", &["lint", "test"]),
        ]))
        .unwrap();

        assert_eq!(graph.topological_order(), vec!["lint", "test", "build"]);
        assert_eq!(graph.dependencies("build"), vec!["lint", "test"]);
        assert_eq!(graph.dependents("lint"), vec!["build"]);
    }

    #[test]
    fn test_two_stage_cycle_is_rejected() {
        let err = DependencyGraph::build(&pipeline(vec![stage("a", &["b"]), stage("b", &["a"])]))
            .unwrap_err();

        assert_eq!(
            err,
            DefinitionError::Cycle {
                path: vec!["a".to_string(), "b".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DependencyGraph::build(&pipeline(vec![stage("a", &["a"])])).unwrap_err();
        assert!(matches!(err, DefinitionError::Cycle { .. }));
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let err = DependencyGraph::build(&pipeline(vec![
            stage("root", &[]),
            stage("x", &["root", "z"]),
            stage("y", &["x"]),
            stage("z", &["y"]),
        ]))
        .unwrap_err();

        match err {
            DefinitionError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert!(!path.contains(&"root".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_is_named() {
        let err = DependencyGraph::build(&pipeline(vec![stage("deploy", &["build"])])).unwrap_err();

        assert_eq!(
            err,
            DefinitionError::UnknownDependency {
                stage: "deploy".to_string(),
                missing: "build".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_and_empty_definitions_are_rejected() {
        let err = DependencyGraph::build(&pipeline(vec![stage("a", &[]), stage("a", &[])]))
            .unwrap_err();
        assert_eq!(err, DefinitionError::DuplicateStage("a".to_string()));

        let err = DependencyGraph::build(&pipeline(vec![])).unwrap_err();
        assert!(matches!(err, DefinitionError::EmptyPipeline(_)));

        let mut empty = stage("a", &[]);
        empty.steps.clear();
        let err = DependencyGraph::build(&pipeline(vec![empty])).unwrap_err();
        assert_eq!(err, DefinitionError::EmptyStage("a".to_string()));
    }

    #[test]
    fn test_path_like_stage_names_are_rejected() {
        for name in ["", "  ", ".", ".."] {
            let err = DependencyGraph::build(&pipeline(vec![stage("test", &[]), stage(name, &[])]))
                .unwrap_err();
            assert_eq!(err, DefinitionError::InvalidStageName(name.to_string()));
        }

        // Dots inside a name are fine
        DependencyGraph::build(&pipeline(vec![stage("v1.2", &[]), stage(".hidden", &[])]))
            .unwrap();
    }

    #[test]
    fn test_repeated_needs_entries_are_collapsed() {
        let graph =
            DependencyGraph::build(&pipeline(vec![stage("a", &[]), stage("b", &["a", "a"])]))
                .unwrap();
        assert_eq!(graph.dependencies("b"), vec!["a"]);
        assert_eq!(graph.dependents("a"), vec!["b"]);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::build(&pipeline(vec![
            stage("test", &[]),
            stage("docs", &[]),
            stage("build-and-push", &["test"]),
            stage("deploy", &["build-and-push"]),
            stage("publish-docs", &["docs"]),
        ]))
        .unwrap();

        assert_eq!(
            graph.transitive_dependents("test"),
            vec!["build-and-push", "deploy"]
        );
        assert_eq!(graph.transitive_dependents("deploy"), Vec::<&str>::new());
        assert_eq!(graph.transitive_dependents("missing"), Vec::<&str>::new());
    }

    /// Random DAGs: stage `i` may only need stages with a smaller index,
    /// then the definition order is shuffled.
    fn arb_dag() -> impl Strategy<Value = PipelineDefinition> {
        (1usize..12)
            .prop_flat_map(|n| {
                let edges = proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n);
                let perm = Just((0..n).collect::<Vec<usize>>()).prop_shuffle();
                (Just(n), edges, perm)
            })
            .prop_map(|(n, edges, perm)| {
                let stages = perm
                    .into_iter()
                    .map(|i| {
                        let needs: Vec<String> = (0..i)
                            .filter(|&j| edges[i][j])
                            .map(|j| format!("s{}", j))
                            .collect();
                        let needs: Vec<&str> = needs.iter().map(String::as_str).collect();
                        stage(&format!("s{}", i), &needs)
                    })
                    .collect::<Vec<_>>();
                debug_assert_eq!(stages.len(), n);
                pipeline(stages)
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn proptest_order_places_stages_after_their_needs(def in arb_dag()) {
            let graph = DependencyGraph::build(&def).unwrap();
            let order = graph.topological_order();

            prop_assert_eq!(order.len(), def.stages.len());
            for s in &def.stages {
                for dep in &s.needs {
                    prop_assert!(position(&order, dep) < position(&order, &s.name));
                }
            }
        }
    }
}
