//! Dependency graph analysis for issue scheduling.
//!
//! The analyzer turns an issue list plus blocking edges into a prioritized
//! execution plan. It is pure: the controller feeds it the graph and
//! consults the analysis; no I/O happens here.
//!
//! ## Components
//!
//! 1. **Graph construction** - validates node/edge references and rejects
//!    duplicates
//! 2. **Topological analysis** - Kahn ordering, cycle detection with a
//!    named witness, level grouping
//! 3. **Prioritisation** - critical path, per-node scores, ready-queue
//!    ordering

mod analyzer;

pub use analyzer::{
    AnalyzerConfig, GraphAnalysis, GraphStats, IssueGraph, NodeScore, QUICK_WIN_BONUS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyEdge, Issue, IssueStatus, Priority};

    fn issue(id: &str, priority: Priority, effort: u32) -> Issue {
        Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            priority,
            effort,
            status: IssueStatus::Ready,
            component_id: None,
            feature_id: None,
            requirement_id: None,
            related_files: vec![],
            acceptance_criteria: vec![],
        }
    }

    fn edge(from: &str, to: &str) -> DependencyEdge {
        DependencyEdge {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn diamond_graph_analyzes_in_three_levels() {
        let graph = IssueGraph::build(
            vec![
                issue("ISS-001", Priority::P1, 4),
                issue("ISS-002", Priority::P1, 8),
                issue("ISS-003", Priority::P1, 2),
                issue("ISS-004", Priority::P1, 4),
            ],
            &[
                edge("ISS-001", "ISS-002"),
                edge("ISS-001", "ISS-003"),
                edge("ISS-002", "ISS-004"),
                edge("ISS-003", "ISS-004"),
            ],
        )
        .unwrap();

        let analysis = graph.analyze(&AnalyzerConfig::default()).unwrap();
        assert_eq!(analysis.levels.len(), 3);
        assert_eq!(analysis.levels[0], vec!["ISS-001"]);
        assert_eq!(analysis.levels[2], vec!["ISS-004"]);
    }

    #[test]
    fn cycle_is_rejected_with_witness() {
        let result = IssueGraph::build(
            vec![
                issue("A", Priority::P1, 1),
                issue("B", Priority::P1, 1),
                issue("C", Priority::P1, 1),
            ],
            &[edge("A", "B"), edge("B", "C"), edge("C", "A")],
        )
        .unwrap()
        .analyze(&AnalyzerConfig::default());

        match result {
            Err(crate::errors::AnalyzerError::CircularDependency { cycle }) => {
                assert_eq!(cycle, vec!["A", "B", "C", "A"]);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }
}
