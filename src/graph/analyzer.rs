//! Issue graph construction and prioritised analysis.

use crate::errors::AnalyzerError;
use crate::model::{DependencyEdge, Issue, IssueStatus, Priority};
use std::collections::{HashMap, HashSet};

/// Bonus applied to nodes on the critical path.
const CRITICAL_PATH_BONUS: u32 = 50;
/// Bonus applied to small tasks that unblock quickly.
pub const QUICK_WIN_BONUS: u32 = 15;
/// Score contribution per direct dependent.
const DEPENDENT_WEIGHT: u32 = 10;

/// Tuning knobs for the analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Effort (hours) at or below which a task counts as a quick win.
    pub quick_win_threshold: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            quick_win_threshold: 4,
        }
    }
}

type NodeIndex = usize;

/// A validated issue dependency graph.
#[derive(Debug)]
pub struct IssueGraph {
    nodes: Vec<Issue>,
    index: HashMap<String, NodeIndex>,
    /// `forward[i]` lists nodes blocked by `i`.
    forward: Vec<Vec<NodeIndex>>,
    /// `reverse[i]` lists nodes that block `i`.
    reverse: Vec<Vec<NodeIndex>>,
}

impl IssueGraph {
    /// Build a graph, validating that edges reference known nodes and ids
    /// are unique. Cycles are detected at analysis time so the witness can
    /// be reported alongside the rest of the diagnosis.
    pub fn build(nodes: Vec<Issue>, edges: &[DependencyEdge]) -> Result<Self, AnalyzerError> {
        let mut index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(AnalyzerError::DuplicateNode {
                    id: node.id.clone(),
                });
            }
        }

        let mut forward: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        let mut reverse: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        for edge in edges {
            let from = *index.get(&edge.from).ok_or_else(|| AnalyzerError::UnknownNode {
                id: edge.from.clone(),
            })?;
            let to = *index.get(&edge.to).ok_or_else(|| AnalyzerError::UnknownNode {
                id: edge.to.clone(),
            })?;
            forward[from].push(to);
            reverse[to].push(from);
        }

        Ok(Self {
            nodes,
            index,
            forward,
            reverse,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Ids of nodes directly blocked by `id`.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.forward[i]
                    .iter()
                    .map(|&j| self.nodes[j].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of nodes directly blocking `id`.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.reverse[i]
                    .iter()
                    .map(|&j| self.nodes[j].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Everything `id` transitively depends on, depth-first, deduplicated.
    pub fn transitive_dependencies(&self, id: &str) -> Vec<String> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeIndex> = self.reverse[start].clone();
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                out.push(self.nodes[i].id.clone());
                stack.extend(self.reverse[i].iter().copied());
            }
        }
        out.sort();
        out
    }

    /// Whether every dependency of `id` is in the completed set.
    pub fn is_ready(&self, id: &str, completed: &HashSet<String>) -> bool {
        self.dependencies(id)
            .iter()
            .all(|dep| completed.contains(*dep))
    }

    /// Run the full analysis: topological order, cycle check, critical
    /// path, level grouping, and per-node scores.
    pub fn analyze(&self, config: &AnalyzerConfig) -> Result<GraphAnalysis, AnalyzerError> {
        let order = self.topo_order()?;

        // Depth = longest chain of predecessors; used for level grouping
        // and score tie-breaking.
        let mut depth: Vec<usize> = vec![0; self.nodes.len()];
        for &i in &order {
            depth[i] = self.reverse[i]
                .iter()
                .map(|&p| depth[p] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        for &i in &order {
            let d = depth[i];
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(self.nodes[i].id.clone());
        }
        for level in &mut levels {
            level.sort();
        }

        // Critical path: longest effort-weighted path, computed in one
        // pass over the topological order.
        let mut dist: Vec<u32> = vec![0; self.nodes.len()];
        let mut back: Vec<Option<NodeIndex>> = vec![None; self.nodes.len()];
        for &i in &order {
            let (best_dist, best_pred) = self.reverse[i]
                .iter()
                .map(|&p| (dist[p], Some(p)))
                .max_by_key(|(d, _)| *d)
                .unwrap_or((0, None));
            dist[i] = best_dist + self.nodes[i].effort;
            back[i] = best_pred;
        }

        let critical_path = match (0..self.nodes.len()).max_by_key(|&i| dist[i]) {
            Some(mut tail) => {
                let mut path = vec![self.nodes[tail].id.clone()];
                while let Some(prev) = back[tail] {
                    path.push(self.nodes[prev].id.clone());
                    tail = prev;
                }
                path.reverse();
                path
            }
            None => Vec::new(),
        };
        let critical_duration = dist.iter().copied().max().unwrap_or(0);
        let on_critical: HashSet<&str> = critical_path.iter().map(String::as_str).collect();
        let bottleneck = critical_path
            .iter()
            .max_by_key(|id| self.get(id).map_or(0, |n| n.effort))
            .cloned();

        let scores = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let mut score = node.priority.weight();
                score += self.forward[i].len() as u32 * DEPENDENT_WEIGHT;
                if on_critical.contains(node.id.as_str()) {
                    score += CRITICAL_PATH_BONUS;
                }
                if node.effort <= config.quick_win_threshold {
                    score += QUICK_WIN_BONUS;
                }
                (
                    node.id.clone(),
                    NodeScore {
                        score,
                        depth: depth[i],
                    },
                )
            })
            .collect();

        Ok(GraphAnalysis {
            order: order.iter().map(|&i| self.nodes[i].id.clone()).collect(),
            levels,
            critical_path,
            critical_duration,
            bottleneck,
            scores,
        })
    }

    /// Summary counts over the graph's current node statuses.
    pub fn statistics(&self) -> GraphStats {
        let mut stats = GraphStats {
            total: self.nodes.len(),
            ..Default::default()
        };
        for node in &self.nodes {
            stats.total_effort += node.effort;
            match node.status {
                IssueStatus::Ready => stats.ready += 1,
                IssueStatus::InProgress => stats.in_progress += 1,
                IssueStatus::Completed => stats.completed += 1,
                IssueStatus::Blocked => stats.blocked += 1,
            }
            if node.status != IssueStatus::Completed {
                stats.remaining_effort += node.effort;
            }
            if node.priority == Priority::P0 {
                stats.p0 += 1;
            }
        }
        stats
    }

    /// Kahn's algorithm. Ties are popped smallest-id-first so the order is
    /// deterministic. A remainder after exhaustion means a cycle; the
    /// witness is extracted from the remaining subgraph.
    fn topo_order(&self) -> Result<Vec<NodeIndex>, AnalyzerError> {
        let mut in_degree: Vec<usize> = self.reverse.iter().map(Vec::len).collect();
        let mut ready: Vec<NodeIndex> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while !ready.is_empty() {
            ready.sort_by(|&a, &b| self.nodes[b].id.cmp(&self.nodes[a].id));
            let i = ready.pop().expect("non-empty");
            order.push(i);
            for &j in &self.forward[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(j);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let remaining: Vec<NodeIndex> = (0..self.nodes.len())
                .filter(|&i| in_degree[i] > 0)
                .collect();
            return Err(AnalyzerError::CircularDependency {
                cycle: self.find_cycle(&remaining),
            });
        }
        Ok(order)
    }

    /// Walk forward through the cyclic remainder until a node repeats,
    /// then rotate the loop to start at its smallest id and close it.
    fn find_cycle(&self, remaining: &[NodeIndex]) -> Vec<String> {
        let in_remainder: HashSet<NodeIndex> = remaining.iter().copied().collect();
        let Some(&start) = remaining.first() else {
            return Vec::new();
        };

        let mut path: Vec<NodeIndex> = Vec::new();
        let mut seen_at: HashMap<NodeIndex, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&pos) = seen_at.get(&current) {
                let mut cycle = path[pos..].to_vec();
                let min_pos = cycle
                    .iter()
                    .enumerate()
                    .min_by_key(|&(_, &i)| &self.nodes[i].id)
                    .map(|(p, _)| p)
                    .unwrap_or(0);
                cycle.rotate_left(min_pos);
                let mut ids: Vec<String> =
                    cycle.iter().map(|&i| self.nodes[i].id.clone()).collect();
                ids.push(ids[0].clone());
                return ids;
            }
            seen_at.insert(current, path.len());
            path.push(current);
            // Stay inside the remainder; every node in it has such an edge.
            current = match self.forward[current]
                .iter()
                .copied()
                .find(|n| in_remainder.contains(n))
            {
                Some(next) => next,
                None => return path.iter().map(|&i| self.nodes[i].id.clone()).collect(),
            };
        }
    }
}

/// Per-node priority score plus the depth used for tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeScore {
    pub score: u32,
    pub depth: usize,
}

/// The full analysis result consulted by the controller.
#[derive(Debug, Clone)]
pub struct GraphAnalysis {
    /// Deterministic topological order.
    pub order: Vec<String>,
    /// Parallel groups: nodes at the same topological level.
    pub levels: Vec<Vec<String>>,
    /// Longest effort-weighted path through the DAG.
    pub critical_path: Vec<String>,
    /// Total effort along the critical path.
    pub critical_duration: u32,
    /// Highest-effort node on the critical path.
    pub bottleneck: Option<String>,
    pub scores: HashMap<String, NodeScore>,
}

impl GraphAnalysis {
    /// Compare two nodes for dispatch: higher score first, then lower
    /// depth, then lower id. This is a total order.
    pub fn dispatch_cmp(&self, a: &str, b: &str) -> std::cmp::Ordering {
        let sa = self.scores.get(a).copied().unwrap_or(NodeScore { score: 0, depth: 0 });
        let sb = self.scores.get(b).copied().unwrap_or(NodeScore { score: 0, depth: 0 });
        sb.score
            .cmp(&sa.score)
            .then(sa.depth.cmp(&sb.depth))
            .then(a.cmp(b))
    }

    /// Highest-scored node whose dependencies are all completed and which
    /// is neither completed nor already dispatched.
    pub fn next_executable<'a>(
        &'a self,
        graph: &IssueGraph,
        completed: &HashSet<String>,
        in_flight: &HashSet<String>,
    ) -> Option<&'a str> {
        self.order
            .iter()
            .map(String::as_str)
            .filter(|id| !completed.contains(*id) && !in_flight.contains(*id))
            .filter(|id| graph.get(id).is_some_and(|n| n.status != IssueStatus::Blocked))
            .filter(|id| graph.is_ready(id, completed))
            .min_by(|a, b| self.dispatch_cmp(a, b))
    }
}

/// Aggregate counts consulted by the controller's monitoring output.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GraphStats {
    pub total: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub p0: usize,
    pub total_effort: u32,
    pub remaining_effort: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn linear_graph() -> IssueGraph {
        IssueGraph::build(
            vec![
                issue("ISS-001", Priority::P1, 2),
                issue("ISS-002", Priority::P1, 6),
                issue("ISS-003", Priority::P1, 3),
            ],
            &[edge("ISS-001", "ISS-002"), edge("ISS-002", "ISS-003")],
        )
        .unwrap()
    }

    #[test]
    fn topo_order_honours_every_edge() {
        let graph = linear_graph();
        let analysis = graph.analyze(&AnalyzerConfig::default()).unwrap();
        assert_eq!(analysis.order, vec!["ISS-001", "ISS-002", "ISS-003"]);
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let result = IssueGraph::build(
            vec![issue("A", Priority::P1, 1), issue("A", Priority::P1, 1)],
            &[],
        );
        assert!(matches!(result, Err(AnalyzerError::DuplicateNode { .. })));
    }

    #[test]
    fn unknown_edge_reference_is_rejected() {
        let result = IssueGraph::build(
            vec![issue("A", Priority::P1, 1)],
            &[edge("A", "missing")],
        );
        match result {
            Err(AnalyzerError::UnknownNode { id }) => assert_eq!(id, "missing"),
            other => panic!("expected UnknownNode, got {other:?}"),
        }
    }

    #[test]
    fn self_cycle_is_detected() {
        let result = IssueGraph::build(vec![issue("A", Priority::P1, 1)], &[edge("A", "A")])
            .unwrap()
            .analyze(&AnalyzerConfig::default());
        match result {
            Err(AnalyzerError::CircularDependency { cycle }) => {
                assert_eq!(cycle, vec!["A", "A"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn critical_path_is_the_longest_effort_chain() {
        // Two chains from ISS-001: 2+6+3=11 via ISS-002, 2+1=3 via ISS-004.
        let graph = IssueGraph::build(
            vec![
                issue("ISS-001", Priority::P1, 2),
                issue("ISS-002", Priority::P1, 6),
                issue("ISS-003", Priority::P1, 3),
                issue("ISS-004", Priority::P1, 1),
            ],
            &[
                edge("ISS-001", "ISS-002"),
                edge("ISS-002", "ISS-003"),
                edge("ISS-001", "ISS-004"),
            ],
        )
        .unwrap();

        let analysis = graph.analyze(&AnalyzerConfig::default()).unwrap();
        assert_eq!(
            analysis.critical_path,
            vec!["ISS-001", "ISS-002", "ISS-003"]
        );
        assert_eq!(analysis.critical_duration, 11);
        assert_eq!(analysis.bottleneck.as_deref(), Some("ISS-002"));
    }

    #[test]
    fn scores_combine_priority_dependents_and_bonuses() {
        let graph = linear_graph();
        let analysis = graph.analyze(&AnalyzerConfig::default()).unwrap();

        // ISS-001: P1=75, 1 dependent=10, on critical path=50, effort 2 ≤ 4
        // quick win=15.
        assert_eq!(analysis.scores["ISS-001"].score, 75 + 10 + 50 + 15);
        // ISS-002: P1=75, 1 dependent=10, critical=50, effort 6 no bonus.
        assert_eq!(analysis.scores["ISS-002"].score, 75 + 10 + 50);
        // ISS-003: P1=75, no dependents, critical=50, effort 3 quick win.
        assert_eq!(analysis.scores["ISS-003"].score, 75 + 50 + 15);
    }

    #[test]
    fn dispatch_order_is_total() {
        let graph = IssueGraph::build(
            vec![
                issue("ISS-001", Priority::P2, 4),
                issue("ISS-002", Priority::P2, 4),
            ],
            &[],
        )
        .unwrap();
        let analysis = graph.analyze(&AnalyzerConfig::default()).unwrap();

        // Equal score and depth: lower id wins deterministically.
        assert_eq!(
            analysis.dispatch_cmp("ISS-001", "ISS-002"),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            analysis.dispatch_cmp("ISS-002", "ISS-001"),
            std::cmp::Ordering::Greater
        );
        assert_eq!(
            analysis.dispatch_cmp("ISS-001", "ISS-001"),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn next_executable_respects_dependencies_and_flight() {
        let graph = linear_graph();
        let analysis = graph.analyze(&AnalyzerConfig::default()).unwrap();

        let mut completed = HashSet::new();
        let mut in_flight = HashSet::new();

        assert_eq!(
            analysis.next_executable(&graph, &completed, &in_flight),
            Some("ISS-001")
        );

        in_flight.insert("ISS-001".to_string());
        assert_eq!(analysis.next_executable(&graph, &completed, &in_flight), None);

        in_flight.clear();
        completed.insert("ISS-001".to_string());
        assert_eq!(
            analysis.next_executable(&graph, &completed, &in_flight),
            Some("ISS-002")
        );
    }

    #[test]
    fn transitive_dependencies_cover_the_chain() {
        let graph = linear_graph();
        assert_eq!(
            graph.transitive_dependencies("ISS-003"),
            vec!["ISS-001", "ISS-002"]
        );
        assert!(graph.transitive_dependencies("ISS-001").is_empty());
    }

    #[test]
    fn statistics_count_by_status() {
        let mut nodes = vec![
            issue("A", Priority::P0, 2),
            issue("B", Priority::P1, 3),
            issue("C", Priority::P2, 5),
        ];
        nodes[1].status = IssueStatus::Completed;
        let graph = IssueGraph::build(nodes, &[]).unwrap();

        let stats = graph.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.p0, 1);
        assert_eq!(stats.total_effort, 10);
        assert_eq!(stats.remaining_effort, 7);
    }
}
