//! An in-process [`QueryEngine`] that interprets clause compositions against
//! a node/edge table behind a [`tokio::sync::RwLock`]. Each call holds the
//! lock for the whole composition, so a composed query is atomic with respect
//! to other calls on the same engine.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::query::{
    Clause, GraphQuery, NodeRef, OnCreateSet, Pattern, Properties, QueryEngine, ReturnSpec, Row,
};

#[derive(Debug, Clone)]
struct NodeRec {
    label: String,
    props: Properties,
}

#[derive(Debug, Clone)]
struct EdgeRec {
    rel_type: String,
    from: u64,
    to: u64,
    props: Properties,
}

#[derive(Debug, Default)]
struct GraphData {
    nodes: BTreeMap<u64, NodeRec>,
    edges: BTreeMap<u64, EdgeRec>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Binding {
    Node(u64),
    Edge(u64),
}

/// Alias environment for one candidate row. `None` marks an alias left
/// unbound by an optional match.
type Env = BTreeMap<String, Option<Binding>>;

impl GraphData {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn create_node(&mut self, label: &str, props: Properties) -> u64 {
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            NodeRec {
                label: label.to_string(),
                props,
            },
        );
        id
    }

    fn create_edge(&mut self, rel_type: &str, from: u64, to: u64, props: Properties) -> u64 {
        let id = self.alloc_id();
        self.edges.insert(
            id,
            EdgeRec {
                rel_type: rel_type.to_string(),
                from,
                to,
                props,
            },
        );
        id
    }

    fn node_matches(&self, id: u64, label: &str, constraints: &Properties) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|node| node.label == label && props_satisfy(&node.props, constraints))
    }

    fn nodes_with(&self, label: &str, constraints: &Properties) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.label == label && props_satisfy(&node.props, constraints))
            .map(|(id, _)| *id)
            .collect()
    }

    fn delete_node(&mut self, id: u64) {
        self.nodes.remove(&id);
        self.edges
            .retain(|_, edge| edge.from != id && edge.to != id);
    }
}

fn props_satisfy(props: &Properties, constraints: &Properties) -> bool {
    constraints
        .iter()
        .all(|(key, expected)| props.get(key) == Some(expected))
}

fn unbound_alias(alias: &str) -> StoreError {
    StoreError::unavailable(
        "Graph engine rejected the query",
        anyhow!("clause references alias `{alias}` that no earlier clause bound"),
    )
}

/// Node ids the given endpoint can take under the environment. A `Bound`
/// endpoint whose alias was left unbound by an optional match yields no
/// candidates.
fn endpoint_candidates(data: &GraphData, env: &Env, node: &NodeRef) -> Result<Vec<u64>> {
    match node {
        NodeRef::Bound(alias) => match env.get(alias) {
            Some(Some(Binding::Node(id))) => Ok(vec![*id]),
            Some(Some(Binding::Edge(_))) => Err(unbound_alias(alias)),
            Some(None) => Ok(Vec::new()),
            None => Err(unbound_alias(alias)),
        },
        NodeRef::Labeled {
            label, constraints, ..
        } => Ok(data.nodes_with(label, constraints)),
    }
}

fn end_accepts(data: &GraphData, env: &Env, end: &NodeRef, candidate: u64) -> bool {
    match end {
        NodeRef::Bound(alias) => {
            matches!(env.get(alias), Some(Some(Binding::Node(id))) if *id == candidate)
        }
        NodeRef::Labeled {
            label, constraints, ..
        } => data.node_matches(candidate, label, constraints),
    }
}

fn pattern_aliases(pattern: &Pattern) -> Vec<&str> {
    let mut aliases = Vec::new();
    if let NodeRef::Labeled { alias, .. } = &pattern.start {
        aliases.push(alias.as_str());
    }
    if let Some((rel, end)) = &pattern.edge {
        aliases.push(rel.alias.as_str());
        if let NodeRef::Labeled { alias, .. } = end {
            aliases.push(alias.as_str());
        }
    }
    aliases
}

/// Every instantiation of `pattern` under `env`, as extended environments.
fn instantiate(data: &GraphData, env: &Env, pattern: &Pattern) -> Result<Vec<Env>> {
    let mut found = Vec::new();
    match &pattern.edge {
        None => {
            for node_id in endpoint_candidates(data, env, &pattern.start)? {
                let mut extended = env.clone();
                if let NodeRef::Labeled { alias, .. } = &pattern.start {
                    extended.insert(alias.clone(), Some(Binding::Node(node_id)));
                }
                found.push(extended);
            }
        }
        Some((rel, end)) => {
            for start_id in endpoint_candidates(data, env, &pattern.start)? {
                for (edge_id, edge) in &data.edges {
                    if edge.rel_type != rel.rel_type || edge.from != start_id {
                        continue;
                    }
                    if !end_accepts(data, env, end, edge.to) {
                        continue;
                    }
                    let mut extended = env.clone();
                    if let NodeRef::Labeled { alias, .. } = &pattern.start {
                        extended.insert(alias.clone(), Some(Binding::Node(start_id)));
                    }
                    extended.insert(rel.alias.clone(), Some(Binding::Edge(*edge_id)));
                    if let NodeRef::Labeled { alias, .. } = end {
                        extended.insert(alias.clone(), Some(Binding::Node(edge.to)));
                    }
                    found.push(extended);
                }
            }
        }
    }
    Ok(found)
}

fn expand(
    data: &GraphData,
    envs: Vec<Env>,
    pattern: &Pattern,
    optional: bool,
) -> Result<Vec<Env>> {
    let mut next = Vec::new();
    for env in envs {
        let instantiations = instantiate(data, &env, pattern)?;
        if instantiations.is_empty() {
            if optional {
                let mut kept = env;
                for alias in pattern_aliases(pattern) {
                    kept.insert(alias.to_string(), None);
                }
                next.push(kept);
            }
            // A plain match drops the row.
        } else {
            next.extend(instantiations);
        }
    }
    Ok(next)
}

fn merge_one(
    data: &mut GraphData,
    env: &mut Env,
    pattern: &Pattern,
    on_create: &[OnCreateSet],
) -> Result<()> {
    if let Some(existing) = instantiate(data, env, pattern)?.into_iter().next() {
        *env = existing;
        return Ok(());
    }

    let Some((rel, end)) = &pattern.edge else {
        return Err(StoreError::unavailable(
            "Graph engine rejected the query",
            anyhow!("merge requires a relationship pattern"),
        ));
    };
    let start_id = endpoint_candidates(data, env, &pattern.start)?
        .into_iter()
        .next()
        .ok_or_else(|| unbound_alias(pattern.start.alias()))?;
    let end_id = match end {
        NodeRef::Bound(alias) => match env.get(alias) {
            Some(Some(Binding::Node(id))) => *id,
            _ => return Err(unbound_alias(alias)),
        },
        NodeRef::Labeled {
            alias,
            label,
            constraints,
        } => {
            let id = data.create_node(label, constraints.clone());
            env.insert(alias.clone(), Some(Binding::Node(id)));
            id
        }
    };
    let edge_id = data.create_edge(&rel.rel_type, start_id, end_id, Properties::new());
    env.insert(rel.alias.clone(), Some(Binding::Edge(edge_id)));

    for assignment in on_create {
        match env.get(&assignment.alias) {
            Some(Some(Binding::Node(id))) => {
                if let Some(node) = data.nodes.get_mut(id) {
                    node.props.extend(assignment.props.clone());
                }
            }
            Some(Some(Binding::Edge(id))) => {
                if let Some(edge) = data.edges.get_mut(id) {
                    edge.props.extend(assignment.props.clone());
                }
            }
            _ => return Err(unbound_alias(&assignment.alias)),
        }
    }
    Ok(())
}

fn delete_bindings(data: &mut GraphData, envs: &[Env], aliases: &[String]) {
    let mut edges = HashSet::new();
    let mut nodes = HashSet::new();
    for env in envs {
        for alias in aliases {
            match env.get(alias) {
                Some(Some(Binding::Edge(id))) => {
                    edges.insert(*id);
                }
                Some(Some(Binding::Node(id))) => {
                    nodes.insert(*id);
                }
                // Unmatched optional aliases are skipped.
                _ => {}
            }
        }
    }
    for id in edges {
        data.edges.remove(&id);
    }
    for id in nodes {
        data.delete_node(id);
    }
}

/// Groups environments by the root binding: one output row per distinct root
/// node, collections deduplicated by node identity, first-seen order kept.
fn project(data: &GraphData, envs: &[Env], spec: &ReturnSpec) -> Vec<Row> {
    let mut order: Vec<u64> = Vec::new();
    let mut rows: HashMap<u64, Row> = HashMap::new();
    let mut seen: HashMap<(u64, &str), HashSet<u64>> = HashMap::new();

    for env in envs {
        let Some(Some(Binding::Node(root_id))) = env.get(&spec.root) else {
            continue;
        };
        let Some(root) = data.nodes.get(root_id) else {
            continue;
        };
        let row = rows.entry(*root_id).or_insert_with(|| {
            order.push(*root_id);
            Row {
                root: root.props.clone(),
                collections: spec
                    .collect
                    .iter()
                    .map(|alias| (alias.clone(), Vec::new()))
                    .collect(),
            }
        });
        for alias in &spec.collect {
            let Some(Some(Binding::Node(member_id))) = env.get(alias) else {
                continue;
            };
            let distinct = seen.entry((*root_id, alias.as_str())).or_default();
            if !distinct.insert(*member_id) {
                continue;
            }
            if let (Some(member), Some(collection)) =
                (data.nodes.get(member_id), row.collections.get_mut(alias))
            {
                collection.push(member.props.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|root_id| rows.remove(&root_id))
        .collect()
}

fn apply(data: &mut GraphData, query: &GraphQuery) -> Result<Vec<Row>> {
    let mut envs: Vec<Env> = vec![Env::new()];
    let mut output = Vec::new();

    for clause in &query.clauses {
        match clause {
            Clause::Match(pattern) => {
                envs = expand(data, envs, pattern, false)?;
            }
            Clause::OptionalMatch(pattern) => {
                envs = expand(data, envs, pattern, true)?;
            }
            Clause::Create {
                alias,
                label,
                props,
            } => {
                for env in &mut envs {
                    let id = data.create_node(label, props.clone());
                    env.insert(alias.clone(), Some(Binding::Node(id)));
                }
            }
            Clause::Merge { pattern, on_create } => {
                for env in &mut envs {
                    merge_one(data, env, pattern, on_create)?;
                }
            }
            Clause::Set { alias, props } => {
                for env in &envs {
                    match env.get(alias) {
                        Some(Some(Binding::Node(id))) => {
                            if let Some(node) = data.nodes.get_mut(id) {
                                node.props = props.clone();
                            }
                        }
                        Some(None) => {}
                        _ => return Err(unbound_alias(alias)),
                    }
                }
            }
            Clause::Delete { aliases } => {
                delete_bindings(data, &envs, aliases);
            }
            Clause::Return(spec) => {
                output = project(data, &envs, spec);
            }
        }
    }

    trace!(rows = output.len(), "interpreted query");
    Ok(output)
}

/// In-memory graph engine. Cloneable handles share storage through the
/// surrounding `Arc` held by the stores.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    data: RwLock<GraphData>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes carrying the given label. Inspection surface for
    /// callers asserting on graph shape.
    pub async fn node_count(&self, label: &str) -> usize {
        self.data
            .read()
            .await
            .nodes
            .values()
            .filter(|node| node.label == label)
            .count()
    }

    /// Number of edges of the given relationship type.
    pub async fn edge_count(&self, rel_type: &str) -> usize {
        self.data
            .read()
            .await
            .edges
            .values()
            .filter(|edge| edge.rel_type == rel_type)
            .count()
    }
}

#[async_trait]
impl QueryEngine for MemoryGraph {
    async fn run(&self, query: &GraphQuery) -> Result<()> {
        let mut data = self.data.write().await;
        apply(&mut data, query)?;
        Ok(())
    }

    async fn fetch(&self, query: &GraphQuery) -> Result<Vec<Row>> {
        let mut data = self.data.write().await;
        apply(&mut data, query)
    }
}
