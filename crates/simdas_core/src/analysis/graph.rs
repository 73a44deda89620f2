//! Graph algorithms over the variable dependency structure of a residual system.

use std::collections::{BTreeMap, BTreeSet};

/// Directed graph with an edge `i → j` when the equation of variable `i` depends on `y[j]`.
/// Self-dependencies are not edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new(nodes: usize) -> Self {
        Self {
            edges: vec![BTreeSet::new(); nodes],
        }
    }

    /// Builds the graph from a column pattern: `pattern[j][i]` is true when row `i` reacts
    /// to coordinate `j`.
    pub fn from_pattern(pattern: &[Vec<bool>]) -> Self {
        let mut graph = Self::new(pattern.len());
        for (j, column) in pattern.iter().enumerate() {
            for (i, &depends) in column.iter().enumerate() {
                if depends {
                    graph.add_edge(i, j);
                }
            }
        }
        graph
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        if from != to {
            self.edges[from].insert(to);
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn dependencies(&self, node: usize) -> &BTreeSet<usize> {
        &self.edges[node]
    }

    pub fn to_map(&self) -> BTreeMap<usize, BTreeSet<usize>> {
        self.edges.iter().cloned().enumerate().collect()
    }

    /// Every cycle closed by a back edge of a depth-first traversal, as a node path whose last
    /// element repeats the first.
    pub fn cycles(&self) -> Vec<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnPath,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
            cycles: &mut Vec<Vec<usize>>,
        ) {
            marks[node] = Mark::OnPath;
            path.push(node);
            for &next in &graph.edges[node] {
                match marks[next] {
                    Mark::OnPath => {
                        if let Some(start) = path.iter().position(|&n| n == next) {
                            let mut cycle = path[start..].to_vec();
                            cycle.push(next);
                            cycles.push(cycle);
                        }
                    }
                    Mark::New => visit(graph, next, marks, path, cycles),
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
        }

        let mut marks = vec![Mark::New; self.len()];
        let mut path = Vec::new();
        let mut cycles = Vec::new();
        for node in 0..self.len() {
            if marks[node] == Mark::New {
                visit(self, node, &mut marks, &mut path, &mut cycles);
            }
        }
        cycles
    }

    /// Tarjan's algorithm. Components come out in reverse topological order of the
    /// condensation; members are sorted.
    pub fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        struct Tarjan<'g> {
            graph: &'g DependencyGraph,
            counter: usize,
            index: Vec<Option<usize>>,
            low: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            components: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn connect(&mut self, v: usize) {
                self.index[v] = Some(self.counter);
                self.low[v] = self.counter;
                self.counter += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                let graph = self.graph;
                for &w in &graph.edges[v] {
                    match self.index[w] {
                        None => {
                            self.connect(w);
                            self.low[v] = self.low[v].min(self.low[w]);
                        }
                        Some(index) if self.on_stack[w] => {
                            self.low[v] = self.low[v].min(index);
                        }
                        Some(_) => {}
                    }
                }

                if Some(self.low[v]) == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.components.push(component);
                }
            }
        }

        let n = self.len();
        let mut tarjan = Tarjan {
            graph: self,
            counter: 0,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.connect(v);
            }
        }
        tarjan.components
    }
}

/// Kuhn's augmenting-path matching of rows to columns. Returns the row matched to each column.
pub fn maximum_matching(candidates: &[Vec<usize>], columns: usize) -> Vec<Option<usize>> {
    fn augment(
        row: usize,
        candidates: &[Vec<usize>],
        seen: &mut [bool],
        owner: &mut [Option<usize>],
    ) -> bool {
        for &column in &candidates[row] {
            if seen[column] {
                continue;
            }
            seen[column] = true;
            let free = match owner[column] {
                None => true,
                Some(other) => augment(other, candidates, seen, owner),
            };
            if free {
                owner[column] = Some(row);
                return true;
            }
        }
        false
    }

    let mut owner = vec![None; columns];
    for row in 0..candidates.len() {
        let mut seen = vec![false; columns];
        augment(row, candidates, &mut seen, &mut owner);
    }
    owner
}

/// Structural index of a residual system.
///
/// `state_rows[j]` and `derivative_rows[j]` list the rows that depend on `y[j]` and `y'[j]`.
/// Rows without any derivative dependence are constraints. Each round matches constraints to
/// the algebraic variables they depend on; unmatched constraints are differentiated by
/// replacing every differential variable they reference with the state dependencies of the
/// rows defining its derivative. The index starts at 1 and grows by one per round, capped at
/// `max_index`.
pub fn structural_index(
    state_rows: &[Vec<usize>],
    derivative_rows: &[Vec<usize>],
    algebraic: &[bool],
    max_index: usize,
) -> usize {
    let n = algebraic.len();
    let mut row_dependencies = vec![BTreeSet::new(); n];
    let mut has_derivative = vec![false; n];
    for (j, rows) in state_rows.iter().enumerate() {
        for &row in rows {
            row_dependencies[row].insert(j);
        }
    }
    for rows in derivative_rows {
        for &row in rows {
            has_derivative[row] = true;
        }
    }

    let mut constraints: Vec<BTreeSet<usize>> = (0..n)
        .filter(|&row| !has_derivative[row])
        .map(|row| row_dependencies[row].clone())
        .collect();
    let mut index = 1;
    if constraints.is_empty() {
        return index;
    }

    loop {
        let candidates: Vec<Vec<usize>> = constraints
            .iter()
            .map(|deps| deps.iter().copied().filter(|&j| algebraic[j]).collect())
            .collect();
        let owner = maximum_matching(&candidates, n);
        let mut matched = vec![false; constraints.len()];
        for row in owner.into_iter().flatten() {
            matched[row] = true;
        }
        if matched.iter().all(|&m| m) || index >= max_index {
            return index;
        }

        for (deps, _) in constraints
            .iter_mut()
            .zip(&matched)
            .filter(|(_, &done)| !done)
        {
            let mut differentiated = BTreeSet::new();
            for &j in deps.iter() {
                if algebraic[j] {
                    differentiated.insert(j);
                } else {
                    for &row in &derivative_rows[j] {
                        differentiated.extend(row_dependencies[row].iter().copied());
                    }
                }
            }
            *deps = differentiated;
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(usize, usize)], nodes: usize) -> DependencyGraph {
        let mut graph = DependencyGraph::new(nodes);
        for &(from, to) in edges {
            graph.add_edge(from, to);
        }
        graph
    }

    #[test]
    fn builds_from_column_pattern() {
        let pattern = vec![vec![true, true], vec![false, true]];
        let graph = DependencyGraph::from_pattern(&pattern);
        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1).iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(graph.to_map().len(), 2);
    }

    #[test]
    fn finds_cycles_along_the_current_path() {
        let graph = graph(&[(0, 1), (1, 2), (2, 0), (2, 3)], 4);
        assert_eq!(graph.cycles(), vec![vec![0, 1, 2, 0]]);

        let acyclic = graph_acyclic();
        assert!(acyclic.cycles().is_empty());
    }

    fn graph_acyclic() -> DependencyGraph {
        graph(&[(0, 1), (1, 2), (0, 2)], 3)
    }

    #[test]
    fn tarjan_groups_coupled_variables() {
        let graph = graph(&[(0, 1), (1, 0), (1, 2), (3, 3)], 4);
        let mut components = graph.strongly_connected_components();
        components.sort();
        assert_eq!(components, vec![vec![0, 1], vec![2], vec![3]]);
        assert_eq!(graph_acyclic().strongly_connected_components().len(), 3);
    }

    #[test]
    fn matching_uses_augmenting_paths() {
        // row 0 can take column 0 or 1, row 1 only column 0
        let owner = maximum_matching(&[vec![0, 1], vec![0]], 2);
        assert_eq!(owner, vec![Some(1), Some(0)]);
    }

    #[test]
    fn index_of_ode_is_one() {
        // x' = y, y' = -x
        let state_rows = vec![vec![1], vec![0]];
        let derivative_rows = vec![vec![0], vec![1]];
        assert_eq!(structural_index(&state_rows, &derivative_rows, &[false, false], 4), 1);
    }

    #[test]
    fn index_one_constraint() {
        // x' = -x + z, 0 = z - x^2
        let state_rows = vec![vec![0, 1], vec![0, 1]];
        let derivative_rows = vec![vec![0], vec![]];
        assert_eq!(structural_index(&state_rows, &derivative_rows, &[false, true], 4), 1);
    }

    #[test]
    fn index_two_constraint() {
        // y0' = y1, 0 = y0 - 1
        let state_rows = vec![vec![1], vec![0]];
        let derivative_rows = vec![vec![0], vec![]];
        assert_eq!(structural_index(&state_rows, &derivative_rows, &[false, true], 4), 2);
    }

    #[test]
    fn pendulum_is_index_three() {
        // x, y, vx, vy, lambda
        // x' = vx, y' = vy, vx' = -lambda x, vy' = -lambda y - g, 0 = x^2 + y^2 - L^2
        let state_rows = vec![
            vec![2, 4],    // x
            vec![3, 4],    // y
            vec![0],       // vx
            vec![1],       // vy
            vec![2, 3],    // lambda
        ];
        let derivative_rows = vec![vec![0], vec![1], vec![2], vec![3], vec![]];
        let algebraic = [false, false, false, false, true];
        assert_eq!(structural_index(&state_rows, &derivative_rows, &algebraic, 4), 3);
        assert_eq!(structural_index(&state_rows, &derivative_rows, &algebraic, 2), 2);
    }
}
