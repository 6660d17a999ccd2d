//! Dependency parsing, deterministic cycle breaking, and topological sort.
//!
//! Failure modes: none. Every input is tolerated — unknown targets and
//! self-references are dropped silently rather than rejected, so construction
//! is an infallible function rather than one returning `Result`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

static DEPENDENCY_REF_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)(?:depends on|blocked by|after|requires)\s+#(\d+)")
        .expect("static regex is valid")
});

/// A tracked work item as seen by the controller.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub comments: Vec<String>,
}

impl Item {
    pub fn new(id: u64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            labels: Vec::new(),
            comments: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

/// Scan a body string for case-insensitive `depends on|blocked by|after|requires #<digits>`
/// phrases, returning a deduplicated, first-occurrence-ordered list of referenced ids.
/// Non-matching occurrences of `#N` are ignored.
pub fn parse_dependency_references(body: &str) -> Vec<u64> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for cap in DEPENDENCY_REF_RE.captures_iter(body) {
        if let Ok(id) = cap[1].parse::<u64>()
            && seen.insert(id)
        {
            refs.push(id);
        }
    }
    refs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// A DAG over a batch of items: parent/child adjacency, the deterministic
/// topological order, and the edges that were broken to make that order
/// possible.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    parents: HashMap<u64, Vec<u64>>,
    children: HashMap<u64, Vec<u64>>,
    sorted_order: Vec<u64>,
    broken_edges: Vec<(u64, u64)>,
}

impl DependencyGraph {
    /// Build a graph over `items`. Only item ids become nodes; references to
    /// ids outside the batch, and self-references, are dropped silently.
    pub fn build(items: &[Item]) -> Self {
        let batch_ids: HashSet<u64> = items.iter().map(|i| i.id).collect();
        let mut parents: HashMap<u64, Vec<u64>> = HashMap::new();
        let mut children: HashMap<u64, Vec<u64>> = HashMap::new();
        for &id in &batch_ids {
            parents.entry(id).or_default();
            children.entry(id).or_default();
        }

        let mut add_edge = |parents: &mut HashMap<u64, Vec<u64>>,
                             children: &mut HashMap<u64, Vec<u64>>,
                             parent: u64,
                             child: u64| {
            if parent == child {
                return;
            }
            let kids = children.entry(parent).or_default();
            if !kids.contains(&child) {
                kids.push(child);
            }
            let pars = parents.entry(child).or_default();
            if !pars.contains(&parent) {
                pars.push(parent);
            }
        };

        for item in items {
            let mut refs: Vec<u64> = parse_dependency_references(&item.body)
                .into_iter()
                .filter(|r| *r != item.id && batch_ids.contains(r))
                .collect();
            refs.sort_unstable();
            refs.dedup();
            if refs.is_empty() {
                continue;
            }
            // Chain A->B->C->...; only the last reference becomes a direct
            // parent of the item itself.
            for window in refs.windows(2) {
                add_edge(&mut parents, &mut children, window[0], window[1]);
            }
            let last = *refs.last().expect("non-empty checked above");
            add_edge(&mut parents, &mut children, last, item.id);
        }

        let mut nodes: Vec<u64> = batch_ids.into_iter().collect();
        nodes.sort_unstable();

        let broken_edges = break_cycles(&nodes, &mut parents, &mut children);
        let sorted_order = topological_sort(&nodes, &children);

        Self {
            parents,
            children,
            sorted_order,
            broken_edges,
        }
    }

    pub fn parents_of(&self, id: u64) -> &[u64] {
        self.parents.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn children_of(&self, id: u64) -> &[u64] {
        self.children.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn sorted_issue_ids(&self) -> &[u64] {
        &self.sorted_order
    }

    pub fn broken_edges(&self) -> &[(u64, u64)] {
        &self.broken_edges
    }

    pub fn has_dependencies(&self, id: u64) -> bool {
        !self.parents_of(id).is_empty()
    }
}

/// Single DFS, three-color marking, deterministic node/child ordering.
/// Any edge into an in-path (gray) node is a back edge; back edges are
/// collected during the DFS and removed from both adjacency maps afterward.
fn break_cycles(
    nodes: &[u64],
    parents: &mut HashMap<u64, Vec<u64>>,
    children: &mut HashMap<u64, Vec<u64>>,
) -> Vec<(u64, u64)> {
    let mut color: HashMap<u64, Color> = nodes.iter().map(|&n| (n, Color::White)).collect();
    let mut broken = Vec::new();

    for &n in nodes {
        if color[&n] == Color::White {
            dfs_visit(n, children, &mut color, &mut broken);
        }
    }

    for &(p, c) in &broken {
        if let Some(kids) = children.get_mut(&p) {
            kids.retain(|&x| x != c);
        }
        if let Some(pars) = parents.get_mut(&c) {
            pars.retain(|&x| x != p);
        }
    }

    broken
}

fn dfs_visit(
    node: u64,
    children: &HashMap<u64, Vec<u64>>,
    color: &mut HashMap<u64, Color>,
    broken: &mut Vec<(u64, u64)>,
) {
    color.insert(node, Color::Gray);
    let mut kids: Vec<u64> = children.get(&node).cloned().unwrap_or_default();
    kids.sort_unstable();
    for kid in kids {
        match color.get(&kid).copied().unwrap_or(Color::White) {
            Color::White => dfs_visit(kid, children, color, broken),
            Color::Gray => broken.push((node, kid)),
            Color::Black => {}
        }
    }
    color.insert(node, Color::Black);
}

/// Kahn's algorithm: zero-in-degree nodes seeded ascending; a `BTreeSet` acts
/// as the sorted-insertion queue so newly-zero children land in ascending
/// position automatically.
fn topological_sort(nodes: &[u64], children: &HashMap<u64, Vec<u64>>) -> Vec<u64> {
    let mut in_degree: HashMap<u64, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    for kids in children.values() {
        for &k in kids {
            *in_degree.entry(k).or_insert(0) += 1;
        }
    }

    let mut queue: BTreeSet<u64> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(&next) = queue.iter().next() {
        queue.remove(&next);
        order.push(next);
        let mut kids: Vec<u64> = children.get(&next).cloned().unwrap_or_default();
        kids.sort_unstable();
        for kid in kids {
            if let Some(deg) = in_degree.get_mut(&kid) {
                *deg -= 1;
                if *deg == 0 {
                    queue.insert(kid);
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_references_recognizes_all_keyword_forms() {
        assert_eq!(parse_dependency_references("Depends on #101"), vec![101]);
        assert_eq!(parse_dependency_references("blocked by #7"), vec![7]);
        assert_eq!(parse_dependency_references("run AFTER #3"), vec![3]);
        assert_eq!(parse_dependency_references("requires #42"), vec![42]);
    }

    #[test]
    fn parse_references_ignores_bare_hash_numbers() {
        assert_eq!(parse_dependency_references("see #101 for context"), Vec::<u64>::new());
    }

    #[test]
    fn parse_references_dedups_preserving_first_occurrence_order() {
        let body = "depends on #5, also depends on #3, and requires #5 again";
        assert_eq!(parse_dependency_references(body), vec![5, 3]);
    }

    fn item_ref(id: u64, body: &str) -> Item {
        Item::new(id, format!("Item {id}"), body)
    }

    /// S1: simple linear dependency.
    #[test]
    fn scenario_s1_simple_chain() {
        let items = vec![item_ref(101, ""), item_ref(102, "Depends on #101")];
        let graph = DependencyGraph::build(&items);
        assert_eq!(graph.sorted_issue_ids(), &[101, 102]);
        assert_eq!(graph.parents_of(102), &[101]);
        assert!(graph.broken_edges().is_empty());
    }

    /// S2: a 3-cycle must have exactly one edge broken and all nodes present once.
    #[test]
    fn scenario_s2_cycle_is_broken_deterministically() {
        let items = vec![
            item_ref(101, "depends on #102"),
            item_ref(102, "depends on #103"),
            item_ref(103, "depends on #101"),
        ];
        let graph = DependencyGraph::build(&items);
        assert_eq!(graph.broken_edges().len(), 1);
        let mut sorted = graph.sorted_issue_ids().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![101, 102, 103]);
        assert_eq!(graph.sorted_issue_ids().len(), 3);
    }

    /// S3: multi-parent chaining — only the numerically-last parent is direct.
    #[test]
    fn scenario_s3_multi_parent_chaining() {
        let items = vec![
            item_ref(101, ""),
            item_ref(102, ""),
            item_ref(104, "depends on #101 and depends on #102"),
        ];
        let graph = DependencyGraph::build(&items);
        assert_eq!(graph.parents_of(102), &[101]);
        assert_eq!(graph.parents_of(104), &[102]);
        assert_eq!(graph.sorted_issue_ids(), &[101, 102, 104]);
    }

    #[test]
    fn invariant_self_references_are_dropped() {
        let items = vec![item_ref(101, "depends on #101")];
        let graph = DependencyGraph::build(&items);
        assert!(graph.parents_of(101).is_empty());
        assert!(graph.children_of(101).is_empty());
    }

    #[test]
    fn invariant_out_of_batch_references_never_become_nodes() {
        let items = vec![item_ref(101, "depends on #999")];
        let graph = DependencyGraph::build(&items);
        assert!(graph.parents_of(101).is_empty());
        assert_eq!(graph.sorted_issue_ids(), &[101]);
    }

    #[test]
    fn invariant_every_edge_respects_topological_order() {
        let items = vec![
            item_ref(1, ""),
            item_ref(2, "depends on #1"),
            item_ref(3, "depends on #2"),
            item_ref(4, "depends on #1"),
        ];
        let graph = DependencyGraph::build(&items);
        let order = graph.sorted_issue_ids();
        let pos = |id: u64| order.iter().position(|&x| x == id).unwrap();
        for &id in order {
            for &child in graph.children_of(id) {
                assert!(pos(id) < pos(child), "{id} should precede {child}");
            }
        }
    }

    #[test]
    fn has_dependencies_reflects_parent_presence() {
        let items = vec![item_ref(1, ""), item_ref(2, "depends on #1")];
        let graph = DependencyGraph::build(&items);
        assert!(!graph.has_dependencies(1));
        assert!(graph.has_dependencies(2));
    }

    #[test]
    fn unknown_id_lookups_return_empty_slices() {
        let graph = DependencyGraph::build(&[]);
        assert!(graph.parents_of(999).is_empty());
        assert!(graph.children_of(999).is_empty());
    }
}
