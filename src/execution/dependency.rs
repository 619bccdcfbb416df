//! Step dependency analysis
//!
//! Turns a linear plan into a DAG by applying conflict rules between step
//! pairs, then layers the DAG into execution levels: everything within a
//! level may run concurrently. A detected cycle degrades to strictly
//! sequential layering for the remaining nodes rather than failing.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::intent::{Intent, Step};

/// Minimum estimated speedup before parallel dispatch is worth it
const MIN_SPEEDUP: f64 = 1.3;

/// Dependency structure of an intent's steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Step indices 0..n-1
    pub nodes: Vec<usize>,
    /// `edges[i]` = set of earlier steps that step `i` must wait on
    pub edges: HashMap<usize, HashSet<usize>>,
    /// Topological layers; each inner vec can run in parallel
    pub levels: Vec<Vec<usize>>,
    /// Whether layering fell back to sequential because of a cycle
    pub had_cycle: bool,
}

/// Computes dependency graphs and execution levels
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, intent: &Intent) -> DependencyGraph {
        let steps = &intent.steps;
        let n = steps.len();

        if n == 0 {
            return DependencyGraph {
                nodes: vec![],
                edges: HashMap::new(),
                levels: vec![],
                had_cycle: false,
            };
        }

        let mut edges: HashMap<usize, HashSet<usize>> = (0..n).map(|i| (i, HashSet::new())).collect();
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();

        for i in 0..n {
            for j in 0..i {
                if depends_on(&steps[i], &steps[j]) {
                    edges.get_mut(&i).expect("node present").insert(j);
                    graph.add_edge(indices[j], indices[i], ());
                }
            }
        }

        let had_cycle = is_cyclic_directed(&graph);
        let levels = compute_levels(n, &edges);

        debug!(
            steps = n,
            levels = levels.len(),
            had_cycle,
            "dependency analysis complete"
        );

        DependencyGraph {
            nodes: (0..n).collect(),
            edges,
            levels,
            had_cycle,
        }
    }

    /// Speedup factor assuming unbounded parallelism within a level
    pub fn estimate_speedup(&self, intent: &Intent) -> f64 {
        if intent.steps.len() < 2 {
            return 1.0;
        }
        let graph = self.analyze(intent);
        if graph.levels.is_empty() {
            return 1.0;
        }
        intent.steps.len() as f64 / graph.levels.len() as f64
    }

    /// Parallel dispatch is worthwhile only when some level has width >= 2
    /// and the estimated speedup clears the threshold.
    pub fn is_parallelizable(&self, intent: &Intent) -> bool {
        if intent.steps.len() < 2 {
            return false;
        }
        let graph = self.analyze(intent);
        let has_wide_level = graph.levels.iter().any(|level| level.len() >= 2);
        has_wide_level && self.estimate_speedup(intent) >= MIN_SPEEDUP
    }

    /// Human-readable execution plan for dry runs
    pub fn visualize(&self, intent: &Intent) -> String {
        let graph = self.analyze(intent);
        let mut lines = vec![
            "Execution plan:".to_string(),
            format!("  Total steps: {}", intent.steps.len()),
            format!("  Execution levels: {}", graph.levels.len()),
            format!("  Estimated speedup: {:.1}x", self.estimate_speedup(intent)),
        ];

        for (idx, level) in graph.levels.iter().enumerate() {
            let label = if level.len() == 1 {
                "sequential".to_string()
            } else {
                format!("parallel - {} steps", level.len())
            };
            lines.push(format!("  Level {} ({}):", idx + 1, label));
            for &step_idx in level {
                let step = &intent.steps[step_idx];
                lines.push(format!("    [{}] {}.{}", step_idx, step.tool, step.action));
            }
        }

        lines.join("\n")
    }
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Does `later` depend on `earlier`?
fn depends_on(later: &Step, earlier: &Step) -> bool {
    // Same tool touching the same resource orders unconditionally.
    if later.tool == earlier.tool && shares_resource(later, earlier) {
        return true;
    }

    // Read-after-write on files.
    if reads_written_file(later, earlier) {
        return true;
    }

    // Package managers and git repos have implicit global ordering.
    if later.tool == "PackageOps" && earlier.tool == "PackageOps" {
        return true;
    }
    if later.tool == "GitOps" && earlier.tool == "GitOps" {
        return true;
    }

    // Services serialize per service name.
    if later.tool == "ServiceOps" && earlier.tool == "ServiceOps" {
        if let (Some(a), Some(b)) = (later.arg_str("service"), earlier.arg_str("service")) {
            if a == b {
                return true;
            }
        }
    }

    false
}

fn shares_resource(a: &Step, b: &Step) -> bool {
    if a.tool == "FileOps" {
        // Every path argument counts: a move's destination conflicts with
        // the directory an earlier step created, even though the move's
        // primary argument is its source.
        for pa in step_paths(a) {
            for pb in step_paths(b) {
                if pa == pb || is_path_prefix(pa, pb) || is_path_prefix(pb, pa) {
                    return true;
                }
            }
        }
        return false;
    }

    if a.tool == "PackageOps" {
        return match (a.arg_str("package"), b.arg_str("package")) {
            (Some(pa), Some(pb)) => pa == pb,
            _ => false,
        };
    }

    if a.tool == "NetworkOps" {
        return match (a.arg_str("url"), b.arg_str("url")) {
            (Some(ua), Some(ub)) => ua == ub,
            _ => false,
        };
    }

    false
}

fn step_paths(step: &Step) -> impl Iterator<Item = &str> {
    ["path", "source", "dest"]
        .into_iter()
        .filter_map(|key| step.arg_str(key))
}

/// Component-aware prefix: `/a/b` is a prefix of `/a/b/c` but not of
/// `/a/bc`.
fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path.starts_with(prefix)
        && path[prefix.len()..].starts_with('/')
}

/// `later` reads a file that `earlier` writes.
fn reads_written_file(later: &Step, earlier: &Step) -> bool {
    if !matches!(
        earlier.action.as_str(),
        "create_file" | "write_file" | "copy_file" | "move_file" | "create_dir"
    ) {
        return false;
    }

    let written = earlier.arg_str("dest").or_else(|| earlier.arg_str("path"));
    let read = later.arg_str("path").or_else(|| later.arg_str("source"));

    matches!((written, read), (Some(w), Some(r)) if w == r)
}

/// Kahn layering: level(i) = 1 + max(level of dependencies). Remaining
/// nodes after a stall (cycle) are emitted one per level.
fn compute_levels(n: usize, edges: &HashMap<usize, HashSet<usize>>) -> Vec<Vec<usize>> {
    let mut in_degree: HashMap<usize, usize> =
        (0..n).map(|i| (i, edges[&i].len())).collect();
    let mut processed: HashSet<usize> = HashSet::new();
    let mut levels = Vec::new();

    while processed.len() < n {
        let current: Vec<usize> = (0..n)
            .filter(|i| !processed.contains(i) && in_degree[i] == 0)
            .collect();

        if current.is_empty() {
            // Cycle: sequential fallback over the remaining nodes.
            for i in (0..n).filter(|i| !processed.contains(i)).collect::<Vec<_>>() {
                levels.push(vec![i]);
                processed.insert(i);
            }
            break;
        }

        for &node in &current {
            processed.insert(node);
        }
        for i in 0..n {
            if processed.contains(&i) {
                continue;
            }
            let satisfied = edges[&i].iter().filter(|dep| current.contains(dep)).count();
            if satisfied > 0 {
                *in_degree.get_mut(&i).expect("node present") -= satisfied;
            }
        }

        levels.push(current);
    }

    levels
}
