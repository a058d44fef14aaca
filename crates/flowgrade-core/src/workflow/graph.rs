//! Workflow graph: step definitions, dependency edges, validation and ordering.
//!
//! Steps are stored in insertion order and mirrored as nodes of a `petgraph`
//! `DiGraph` whose edges run from a dependency to its dependent. The graph
//! holds no run state; once validated it is read-only and may back any
//! number of runs.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use flowgrade_types::workflow::{OutputDeclaration, StepDefinition};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use super::expression::Expression;

// ---------------------------------------------------------------------------
// GraphValidationError
// ---------------------------------------------------------------------------

/// Structural problems in a workflow graph. Fatal at build time, never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphValidationError {
    #[error("step '{step}' depends on undefined step '{missing_dep}'")]
    MissingDependency { step: String, missing_dep: String },

    #[error("cycle detected: {}", .cycle_path.join(" -> "))]
    CycleDetected { cycle_path: Vec<String> },

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("duplicate output name '{0}'")]
    DuplicateOutput(String),

    #[error("invalid expression in '{owner}' ({expression}): {message}")]
    InvalidExpression {
        owner: String,
        expression: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Steps plus their derived adjacency (step -> dependents).
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflow_id: String,
    version: String,
    steps: Vec<StepDefinition>,
    index: HashMap<String, NodeIndex>,
    dag: DiGraph<usize, ()>,
    outputs: Vec<OutputDeclaration>,
    required_inputs: BTreeSet<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl WorkflowGraph {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version: "0.0.0".to_string(),
            steps: Vec::new(),
            index: HashMap::new(),
            dag: DiGraph::new(),
            outputs: Vec::new(),
            required_inputs: BTreeSet::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a step. Rejects a name that is already defined.
    ///
    /// Dependencies may be added in any order; edges to steps that do not
    /// exist yet are wired when those steps arrive.
    pub fn add(mut self, step: StepDefinition) -> Result<Self, GraphValidationError> {
        if self.index.contains_key(&step.name) {
            return Err(GraphValidationError::DuplicateStep(step.name));
        }

        let node = self.dag.add_node(self.steps.len());

        for dep in &step.depends_on {
            if *dep == step.name {
                self.dag.add_edge(node, node, ());
            } else if let Some(&from) = self.index.get(dep) {
                self.dag.add_edge(from, node, ());
            }
        }

        // Earlier steps that were waiting on this one
        for existing in &self.steps {
            if existing.depends_on.contains(&step.name) {
                let to = self.index[&existing.name];
                self.dag.add_edge(node, to, ());
            }
        }

        self.index.insert(step.name.clone(), node);
        self.steps.push(step);
        Ok(self)
    }

    /// Declare a named workflow output.
    pub fn declare_output(
        mut self,
        output: OutputDeclaration,
    ) -> Result<Self, GraphValidationError> {
        if self.outputs.iter().any(|o| o.name == output.name) {
            return Err(GraphValidationError::DuplicateOutput(output.name));
        }
        self.outputs.push(output);
        Ok(self)
    }

    /// Declare an input every dataset sample must provide.
    pub fn require_input(mut self, name: impl Into<String>) -> Self {
        self.required_inputs.insert(name.into());
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|n| &self.steps[self.dag[*n]])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn outputs(&self) -> &[OutputDeclaration] {
        &self.outputs
    }

    pub fn required_inputs(&self) -> &BTreeSet<String> {
        &self.required_inputs
    }

    /// Steps that list `name` in `depends_on`, in insertion order.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&node) = self.index.get(name) else {
            return Vec::new();
        };
        self.sorted_neighbors(node)
            .into_iter()
            .map(|n| self.steps[self.dag[n]].name.as_str())
            .collect()
    }

    fn sorted_neighbors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .dag
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.sort_unstable();
        next.dedup();
        next
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check that every dependency resolves, the graph is acyclic, and every
    /// condition, input mapping and output source parses.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        for step in &self.steps {
            for dep in &step.depends_on {
                if !self.index.contains_key(dep) {
                    return Err(GraphValidationError::MissingDependency {
                        step: step.name.clone(),
                        missing_dep: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle_path) = self.find_cycle() {
            return Err(GraphValidationError::CycleDetected { cycle_path });
        }

        for step in &self.steps {
            let exprs = step
                .when
                .iter()
                .chain(step.unless.iter())
                .chain(step.input_mapping.values());
            for expr in exprs {
                check_expression(&step.name, expr)?;
            }
        }
        for output in &self.outputs {
            check_expression(&format!("output {}", output.name), &output.source)?;
        }

        Ok(())
    }

    /// Three-color DFS. Reaching a GRAY node closes a cycle; the returned
    /// path starts and ends at that node.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colors = vec![Color::White; self.steps.len()];
        let mut path: Vec<NodeIndex> = Vec::new();

        for start in self.dag.node_indices() {
            if colors[start.index()] == Color::White {
                if let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path) {
                    return Some(
                        cycle
                            .into_iter()
                            .map(|n| self.steps[self.dag[n]].name.clone())
                            .collect(),
                    );
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: NodeIndex,
        colors: &mut [Color],
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        colors[node.index()] = Color::Gray;
        path.push(node);

        for next in self.sorted_neighbors(node) {
            match colors[next.index()] {
                Color::Gray => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(next, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node.index()] = Color::Black;
        None
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Topological order via Kahn's algorithm.
    ///
    /// Zero-in-degree steps are taken in insertion order. If steps remain
    /// once no node is removable, the graph contains a cycle.
    pub fn get_execution_order(&self) -> Result<Vec<&str>, GraphValidationError> {
        let mut in_degree: Vec<usize> = self
            .dag
            .node_indices()
            .map(|n| {
                let mut preds: Vec<NodeIndex> = self
                    .dag
                    .neighbors_directed(n, Direction::Incoming)
                    .collect();
                preds.sort_unstable();
                preds.dedup();
                preds.len()
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .dag
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(node) = queue.pop_front() {
            order.push(self.steps[self.dag[node]].name.as_str());
            for next in self.sorted_neighbors(node) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < self.steps.len() {
            let cycle_path = self.find_cycle().unwrap_or_else(|| {
                self.steps
                    .iter()
                    .filter(|s| !order.contains(&s.name.as_str()))
                    .map(|s| s.name.clone())
                    .collect()
            });
            return Err(GraphValidationError::CycleDetected { cycle_path });
        }

        Ok(order)
    }

    /// Steps whose entire `depends_on` set is in `completed`, excluding
    /// completed and already-scheduled steps.
    pub fn get_ready_steps(
        &self,
        completed: &HashSet<String>,
        scheduled: &HashSet<String>,
    ) -> Vec<&StepDefinition> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.name) && !scheduled.contains(&s.name))
            .filter(|s| s.depends_on.iter().all(|d| completed.contains(d)))
            .collect()
    }
}

fn check_expression(owner: &str, expr: &str) -> Result<(), GraphValidationError> {
    Expression::parse(expr)
        .map(|_| ())
        .map_err(|e| GraphValidationError::InvalidExpression {
            owner: owner.to_string(),
            expression: expr.to_string(),
            message: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
