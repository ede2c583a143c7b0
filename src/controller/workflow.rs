//! Dependent resource workflows
//!
//! A [`Workflow`] is the immutable DAG of [`DependentNode`]s registered for
//! one parent kind. It is validated once, when built: duplicate names,
//! references to unknown nodes and `depends_on` cycles are configuration
//! errors that stop the operator from starting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use kube::api::ApiResource;

use super::dependent::DependentResource;
use crate::error::{Error, Result};

/// What happens to a node's managed object when the node is skipped
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Garbage collect the object
    #[default]
    Delete,
    /// Leave the object in place
    Retain,
}

/// A named node in the workflow graph
pub struct DependentNode<P> {
    name: String,
    resource: Arc<dyn DependentResource<P>>,
    depends_on: Vec<String>,
    deletion_policy: DeletionPolicy,
    optional: bool,
    condition: Option<String>,
}

impl<P> Clone for DependentNode<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            resource: Arc::clone(&self.resource),
            depends_on: self.depends_on.clone(),
            deletion_policy: self.deletion_policy,
            optional: self.optional,
            condition: self.condition.clone(),
        }
    }
}

impl<P> DependentNode<P> {
    pub fn new(name: impl Into<String>, resource: impl DependentResource<P> + 'static) -> Self {
        Self {
            name: name.into(),
            resource: Arc::new(resource),
            depends_on: Vec::new(),
            deletion_policy: DeletionPolicy::default(),
            optional: false,
            condition: None,
        }
    }

    /// Evaluate this node only after `nodes` have completed
    pub fn depends_on<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(nodes.into_iter().map(Into::into));
        self
    }

    pub fn deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Mark the node's precondition as a supported way to switch it off;
    /// skipping it then does not make the parent unready
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Status condition type this node reports into
    pub fn condition(mut self, condition_type: impl Into<String>) -> Self {
        self.condition = Some(condition_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &dyn DependentResource<P> {
        self.resource.as_ref()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub fn policy(&self) -> DeletionPolicy {
        self.deletion_policy
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn condition_type(&self) -> Option<&str> {
        self.condition.as_deref()
    }
}

/// Validated, immutable dependency graph for one parent kind
pub struct Workflow<P> {
    name: String,
    /// Nodes in a deterministic topological order
    nodes: Vec<DependentNode<P>>,
    index: HashMap<String, usize>,
    /// `deps[i]`: indices node `i` depends on
    deps: Vec<Vec<usize>>,
    /// `successors[i]`: indices that depend on node `i`
    successors: Vec<Vec<usize>>,
}

impl<P> Workflow<P> {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder<P> {
        WorkflowBuilder {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in topological order
    pub fn nodes(&self) -> &[DependentNode<P>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&DependentNode<P>> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn deps_of(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    pub(crate) fn successors_of(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    /// Distinct kinds managed by this workflow, for watch registration
    pub fn managed_kinds(&self) -> Vec<ApiResource> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .map(|n| n.resource().api_resource())
            .filter(|ar| seen.insert((ar.api_version.clone(), ar.kind.clone())))
            .collect()
    }

    /// Condition types, each listed at its first node in evaluation order
    pub fn condition_types(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .filter_map(|n| n.condition_type())
            .filter(|c| seen.insert(c.to_string()))
            .map(str::to_string)
            .collect()
    }
}

/// Collects nodes and validates them into a [`Workflow`]
pub struct WorkflowBuilder<P> {
    name: String,
    nodes: Vec<DependentNode<P>>,
}

impl<P> WorkflowBuilder<P> {
    pub fn add(mut self, node: DependentNode<P>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Validate names, references and acyclicity, and fix the evaluation order
    pub fn build(self) -> Result<Workflow<P>> {
        let WorkflowBuilder { name, nodes } = self;

        let mut index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(Error::DuplicateNode {
                    workflow: name,
                    node: node.name.clone(),
                });
            }
        }

        let mut deps = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(Error::UnknownDependency {
                        workflow: name,
                        node: node.name.clone(),
                        missing: dep.clone(),
                    });
                };
                if !deps[i].contains(&d) {
                    deps[i].push(d);
                }
            }
        }

        let order = match topological_order(&deps) {
            Some(order) => order,
            None => {
                let cycle = find_cycle(&deps)
                    .into_iter()
                    .map(|i| nodes[i].name.clone())
                    .collect();
                return Err(Error::CyclicDependency {
                    workflow: name,
                    cycle,
                });
            }
        };

        // Re-index everything in topological order.
        let mut new_pos = vec![0; nodes.len()];
        for (pos, &old) in order.iter().enumerate() {
            new_pos[old] = pos;
        }
        let mut slots: Vec<Option<DependentNode<P>>> = nodes.into_iter().map(Some).collect();
        let mut sorted = Vec::with_capacity(slots.len());
        let mut sorted_deps = Vec::with_capacity(slots.len());
        for &old in &order {
            if let Some(node) = slots[old].take() {
                sorted.push(node);
            }
            sorted_deps.push(deps[old].iter().map(|&d| new_pos[d]).collect::<Vec<_>>());
        }

        let mut successors = vec![Vec::new(); sorted.len()];
        for (i, ds) in sorted_deps.iter().enumerate() {
            for &d in ds {
                successors[d].push(i);
            }
        }
        let index = sorted
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        Ok(Workflow {
            name,
            nodes: sorted,
            index,
            deps: sorted_deps,
            successors,
        })
    }
}

/// Kahn's algorithm, stable with respect to registration order
fn topological_order(deps: &[Vec<usize>]) -> Option<Vec<usize>> {
    let n = deps.len();
    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut successors = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            successors[d].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &s in &successors[i] {
            indegree[s] -= 1;
            if indegree[s] == 0 {
                ready.push_back(s);
            }
        }
    }
    (order.len() == n).then_some(order)
}

/// Depth-first search for one cycle; returns it closed (`a, b, a`)
fn find_cycle(deps: &[Vec<usize>]) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(i: usize, deps: &[Vec<usize>], marks: &mut [Mark], stack: &mut Vec<usize>) -> bool {
        marks[i] = Mark::Active;
        stack.push(i);
        for &d in &deps[i] {
            match marks[d] {
                Mark::Active => {
                    stack.push(d);
                    return true;
                }
                Mark::New => {
                    if visit(d, deps, marks, stack) {
                        return true;
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[i] = Mark::Done;
        false
    }

    let mut marks = vec![Mark::New; deps.len()];
    for start in 0..deps.len() {
        let mut stack = Vec::new();
        if marks[start] == Mark::New && visit(start, deps, &mut marks, &mut stack) {
            // Drop the path that led into the cycle.
            let last = stack.last().copied().unwrap_or(start);
            let begin = stack.iter().position(|&i| i == last).unwrap_or(0);
            return stack[begin..].to_vec();
        }
    }
    Vec::new()
}
