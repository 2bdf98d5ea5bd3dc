//! The narrow pattern-matching query contract between the stores and a graph
//! engine. Stores compose [`GraphQuery`] values out of typed clauses; an
//! engine interprets them. No textual query language appears on this side of
//! the boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Property bag attached to a node or edge. Ordered for deterministic
/// composition and comparison.
pub type Properties = BTreeMap<String, Value>;

/// One endpoint of a pattern: either an alias bound by an earlier clause, or
/// a labeled node with equality constraints on its properties.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRef {
    Bound(String),
    Labeled {
        alias: String,
        label: String,
        constraints: Properties,
    },
}

impl NodeRef {
    pub fn bound(alias: impl Into<String>) -> Self {
        Self::Bound(alias.into())
    }

    pub fn labeled(alias: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Labeled {
            alias: alias.into(),
            label: label.into(),
            constraints: Properties::new(),
        }
    }

    pub fn constrained(
        alias: impl Into<String>,
        label: impl Into<String>,
        constraints: Properties,
    ) -> Self {
        Self::Labeled {
            alias: alias.into(),
            label: label.into(),
            constraints,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            Self::Bound(alias) => alias,
            Self::Labeled { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelPattern {
    pub alias: String,
    pub rel_type: String,
}

impl RelPattern {
    pub fn new(alias: impl Into<String>, rel_type: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            rel_type: rel_type.into(),
        }
    }
}

/// A single node, or a directed `start-[rel]->end` hop.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub start: NodeRef,
    pub edge: Option<(RelPattern, NodeRef)>,
}

impl Pattern {
    pub fn node(node: NodeRef) -> Self {
        Self {
            start: node,
            edge: None,
        }
    }

    pub fn related(start: NodeRef, rel: RelPattern, end: NodeRef) -> Self {
        Self {
            start,
            edge: Some((rel, end)),
        }
    }
}

/// Per-alias property assignments applied only when a merge creates.
#[derive(Debug, Clone, PartialEq)]
pub struct OnCreateSet {
    pub alias: String,
    pub props: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Bind every instantiation of the pattern; a row with no instantiation
    /// is dropped.
    Match(Pattern),
    /// Like `Match`, but a row with no instantiation survives with the
    /// pattern's aliases unbound.
    OptionalMatch(Pattern),
    /// Create one node carrying the given properties.
    Create {
        alias: String,
        label: String,
        props: Properties,
    },
    /// Create the pattern if no instantiation exists, applying `on_create`
    /// assignments only on creation. Idempotent per constraint key.
    Merge {
        pattern: Pattern,
        on_create: Vec<OnCreateSet>,
    },
    /// Overwrite a bound node's properties wholesale.
    Set { alias: String, props: Properties },
    /// Delete the bound nodes/edges; unbound aliases are skipped.
    Delete { aliases: Vec<String> },
    /// Project the root node plus collected related nodes, grouped per root.
    Return(ReturnSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnSpec {
    pub root: String,
    /// Node aliases whose matches are collected (distinct, per root row).
    pub collect: Vec<String>,
}

/// An ordered clause composition executed as a single request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphQuery {
    pub clauses: Vec<Clause>,
}

impl GraphQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_pattern(mut self, pattern: Pattern) -> Self {
        self.clauses.push(Clause::Match(pattern));
        self
    }

    pub fn optional_match(mut self, pattern: Pattern) -> Self {
        self.clauses.push(Clause::OptionalMatch(pattern));
        self
    }

    pub fn create(mut self, alias: impl Into<String>, label: impl Into<String>, props: Properties) -> Self {
        self.clauses.push(Clause::Create {
            alias: alias.into(),
            label: label.into(),
            props,
        });
        self
    }

    pub fn merge(mut self, pattern: Pattern, on_create: Vec<OnCreateSet>) -> Self {
        self.clauses.push(Clause::Merge { pattern, on_create });
        self
    }

    pub fn set(mut self, alias: impl Into<String>, props: Properties) -> Self {
        self.clauses.push(Clause::Set {
            alias: alias.into(),
            props,
        });
        self
    }

    pub fn delete(mut self, aliases: Vec<String>) -> Self {
        self.clauses.push(Clause::Delete { aliases });
        self
    }

    pub fn returning(mut self, spec: ReturnSpec) -> Self {
        self.clauses.push(Clause::Return(spec));
        self
    }
}

/// One result row: the root node's properties plus the collected relationship
/// collections, already grouped per root (never a Cartesian product).
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub root: Properties,
    pub collections: BTreeMap<String, Vec<Properties>>,
}

impl Row {
    pub fn collection(&self, alias: &str) -> &[Properties] {
        self.collections
            .get(alias)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Execution surface of the underlying graph engine. Transactionality of a
/// composed query is the engine's contract, not enforced here.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Execute without reading results (fire-and-forget consistency).
    async fn run(&self, query: &GraphQuery) -> Result<()>;

    /// Execute and return the grouped result rows.
    async fn fetch(&self, query: &GraphQuery) -> Result<Vec<Row>>;
}
