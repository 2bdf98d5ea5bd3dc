//! Bolt-backed [`QueryEngine`] for a real Neo4j deployment. Renders a clause
//! composition into one parameterized Cypher statement; absent values render
//! as literal `null` so a wholesale `SET` clears the property on the node.

use anyhow::anyhow;
use neo4rs::{BoltType, Graph};
use serde_json::Value;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::query::{
    Clause, GraphQuery, NodeRef, Pattern, Properties, QueryEngine, ReturnSpec, Row,
};

fn quote(identifier: &str) -> String {
    format!("`{identifier}`")
}

fn bolt_value(value: &Value) -> Option<BoltType> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some((*flag).into()),
        Value::Number(number) => number
            .as_i64()
            .map(BoltType::from)
            .or_else(|| number.as_f64().map(BoltType::from)),
        Value::String(text) => Some(text.clone().into()),
        // Composite property values do not occur in identity mappings.
        other => Some(other.to_string().into()),
    }
}

#[derive(Default)]
struct Renderer {
    lines: Vec<String>,
    params: Vec<(String, BoltType)>,
    wrote: bool,
}

impl Renderer {
    // Cypher forbids MATCH/OPTIONAL MATCH directly after an updating clause;
    // a WITH re-scopes the row first.
    fn segue(&mut self) {
        if self.wrote {
            self.lines.push("WITH *".to_string());
            self.wrote = false;
        }
    }

    fn value(&mut self, value: &Value) -> String {
        match bolt_value(value) {
            Some(bolt) => {
                let name = format!("p{}", self.params.len());
                let placeholder = format!("${name}");
                self.params.push((name, bolt));
                placeholder
            }
            None => "null".to_string(),
        }
    }

    fn props(&mut self, props: &Properties) -> String {
        let pairs: Vec<String> = props
            .iter()
            .map(|(key, value)| format!("{}: {}", quote(key), self.value(value)))
            .collect();
        format!("{{{}}}", pairs.join(", "))
    }

    fn node(&mut self, node: &NodeRef) -> String {
        match node {
            NodeRef::Bound(alias) => format!("({alias})"),
            NodeRef::Labeled {
                alias,
                label,
                constraints,
            } => {
                if constraints.is_empty() {
                    format!("({alias}:{})", quote(label))
                } else {
                    let props = self.props(constraints);
                    format!("({alias}:{} {props})", quote(label))
                }
            }
        }
    }

    fn pattern(&mut self, pattern: &Pattern) -> String {
        let start = self.node(&pattern.start);
        match &pattern.edge {
            None => start,
            Some((rel, end)) => {
                let end = self.node(end);
                format!("{start}-[{}:{}]->{end}", rel.alias, quote(&rel.rel_type))
            }
        }
    }

    fn projection(&mut self, spec: &ReturnSpec) {
        let mut columns = vec![format!("{}{{.*}} AS root", spec.root)];
        for alias in &spec.collect {
            columns.push(format!(
                "collect(DISTINCT CASE WHEN {alias} IS NULL THEN null ELSE {alias}{{.*}} END) \
                 AS {alias}"
            ));
        }
        self.lines.push(format!("RETURN {}", columns.join(", ")));
    }

    fn clause(&mut self, clause: &Clause) {
        match clause {
            Clause::Match(pattern) => {
                self.segue();
                let rendered = self.pattern(pattern);
                self.lines.push(format!("MATCH {rendered}"));
            }
            Clause::OptionalMatch(pattern) => {
                self.segue();
                let rendered = self.pattern(pattern);
                self.lines.push(format!("OPTIONAL MATCH {rendered}"));
            }
            Clause::Create {
                alias,
                label,
                props,
            } => {
                let props = self.props(props);
                self.lines
                    .push(format!("CREATE ({alias}:{} {props})", quote(label)));
                self.wrote = true;
            }
            Clause::Merge { pattern, on_create } => {
                let rendered = self.pattern(pattern);
                self.lines.push(format!("MERGE {rendered}"));
                for assignment in on_create {
                    let props = self.props(&assignment.props);
                    self.lines
                        .push(format!("ON CREATE SET {} = {props}", assignment.alias));
                }
                self.wrote = true;
            }
            Clause::Set { alias, props } => {
                let props = self.props(props);
                self.lines.push(format!("SET {alias} = {props}"));
                self.wrote = true;
            }
            Clause::Delete { aliases } => {
                self.lines
                    .push(format!("DETACH DELETE {}", aliases.join(", ")));
                self.wrote = true;
            }
            Clause::Return(spec) => self.projection(spec),
        }
    }
}

/// Renders one composed query into Cypher text plus its parameter table.
fn render(query: &GraphQuery) -> (String, Vec<(String, BoltType)>) {
    let mut renderer = Renderer::default();
    for clause in &query.clauses {
        renderer.clause(clause);
    }
    (renderer.lines.join("\n"), renderer.params)
}

fn return_spec(query: &GraphQuery) -> Option<&ReturnSpec> {
    query.clauses.iter().find_map(|clause| match clause {
        Clause::Return(spec) => Some(spec),
        _ => None,
    })
}

fn as_props(value: Value, what: &'static str) -> Result<Properties> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(StoreError::unavailable(
            "Graph returned a malformed row",
            anyhow!("expected a map for {what}, got {other}"),
        )),
    }
}

fn decode_row(value: Value, spec: &ReturnSpec) -> Result<Row> {
    let Value::Object(mut columns) = value else {
        return Err(StoreError::unavailable(
            "Graph returned a malformed row",
            anyhow!("expected a record map, got {value}"),
        ));
    };
    let root = columns
        .remove("root")
        .ok_or_else(|| {
            StoreError::unavailable(
                "Graph returned a malformed row",
                anyhow!("record is missing the root column"),
            )
        })
        .and_then(|value| as_props(value, "root column"))?;

    let mut row = Row {
        root,
        collections: Default::default(),
    };
    for alias in &spec.collect {
        let mut members = Vec::new();
        if let Some(Value::Array(values)) = columns.remove(alias) {
            for value in values {
                if value.is_null() {
                    continue;
                }
                members.push(as_props(value, "collected node")?);
            }
        }
        row.collections.insert(alias.clone(), members);
    }
    Ok(row)
}

fn build(query: &GraphQuery) -> neo4rs::Query {
    let (cypher, params) = render(query);
    trace!(%cypher, params = params.len(), "rendered cypher");
    let mut built = neo4rs::query(&cypher);
    for (name, value) in params {
        built = built.param(&name, value);
    }
    built
}

/// [`QueryEngine`] backed by a Bolt connection pool.
pub struct Neo4jGraph {
    graph: Graph,
}

impl Neo4jGraph {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password).await?;
        Ok(Self { graph })
    }

    /// Wraps an already configured connection pool.
    pub fn from_graph(graph: Graph) -> Self {
        Self { graph }
    }
}

#[async_trait::async_trait]
impl QueryEngine for Neo4jGraph {
    async fn run(&self, query: &GraphQuery) -> Result<()> {
        self.graph.run(build(query)).await?;
        Ok(())
    }

    async fn fetch(&self, query: &GraphQuery) -> Result<Vec<Row>> {
        let Some(spec) = return_spec(query) else {
            self.graph.run(build(query)).await?;
            return Ok(Vec::new());
        };

        let mut stream = self.graph.execute(build(query)).await?;
        let mut rows = Vec::new();
        while let Some(record) = stream.next().await? {
            let value: Value = record.to().map_err(|err| {
                StoreError::unavailable(
                    "Graph returned a malformed row",
                    anyhow!("failed to decode record: {err}"),
                )
            })?;
            rows.push(decode_row(value, spec)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::mapping;
    use crate::models::{Claim, User};
    use crate::schema::GraphSchema;

    use super::*;

    #[test]
    fn create_renders_parameterized_props_with_literal_nulls() {
        let schema = GraphSchema::default();
        let user = User::new("alice");
        let (cypher, params) = render(&mapping::create_user(&schema, &user));

        assert!(cypher.starts_with("CREATE (u:`IdentityUser` {"));
        assert!(cypher.contains("`id`: $p"));
        // A fresh user has no password hash; the property renders as null so
        // the key still lands on the node.
        assert!(cypher.contains("`password_hash`: null"));
        assert!(!params.is_empty());
    }

    #[test]
    fn update_renders_removals_before_merges() {
        let schema = GraphSchema::default();
        let mut user = User::new("alice");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        user.add_claim(Claim::new("scope", "write").expect("valid claim"));
        user.remove_claim("scope", "write");

        let (cypher, _) = render(&mapping::update_user(&schema, &user));
        let wholesale_set = cypher.find("SET u = {").expect("scalar overwrite");
        let segue = cypher.find("WITH *").expect("re-scope before the read");
        let removal = cypher
            .find("OPTIONAL MATCH (u)-[cr1:`HAS_CLAIM`]->(c1:`IdentityClaim`")
            .expect("removal fragment");
        let merge = cypher
            .find("MERGE (u)-[cr0:`HAS_CLAIM`]->(c0:`IdentityClaim`")
            .expect("merge fragment");
        assert!(wholesale_set < segue && segue < removal && removal < merge);
        assert!(cypher.contains("WITH *\nOPTIONAL MATCH"));
        assert!(cypher.contains("DETACH DELETE c1, cr1"));
        assert!(cypher.contains("ON CREATE SET c0 = {"));
    }

    #[test]
    fn membership_match_after_a_write_is_re_scoped() {
        let schema = GraphSchema::default();
        let mut user = User::new("alice");
        user.add_role("Admin").expect("valid role");

        let (cypher, _) = render(&mapping::update_user(&schema, &user));
        assert!(cypher.contains("WITH *\nMATCH (r0:`IdentityRole`"));
        assert!(cypher.contains("MERGE (u)-[ur0:`IN_ROLE`]->(r0)"));
    }

    #[test]
    fn reads_before_any_write_render_without_a_segue() {
        let schema = GraphSchema::default();
        let query =
            mapping::with_user_relations(mapping::match_user_by_id(&schema, "user_1"), &schema);
        let (cypher, _) = render(&query);
        assert!(!cypher.contains("WITH *"));
    }

    #[test]
    fn find_renders_grouped_projection() {
        let schema = GraphSchema::default();
        let query =
            mapping::with_user_relations(mapping::match_user_by_id(&schema, "user_1"), &schema);
        let (cypher, _) = render(&query);

        assert!(cypher.contains("RETURN u{.*} AS root"));
        assert!(cypher.contains("collect(DISTINCT CASE WHEN claim IS NULL"));
        assert!(cypher.contains("AS login"));
        assert!(cypher.contains("AS role"));
    }

    #[test]
    fn decode_row_skips_null_collection_members() {
        let spec = ReturnSpec {
            root: "u".to_string(),
            collect: vec!["claim".to_string()],
        };
        let record = json!({
            "root": {"id": "user_1"},
            "claim": [null, {"type": "scope", "value": "read"}],
        });

        let row = decode_row(record, &spec).expect("row should decode");
        assert_eq!(row.root.get("id"), Some(&json!("user_1")));
        assert_eq!(row.collection("claim").len(), 1);
    }

    #[test]
    fn decode_row_requires_the_root_column() {
        let spec = ReturnSpec {
            root: "u".to_string(),
            collect: vec![],
        };
        let err = decode_row(json!({"claim": []}), &spec).expect_err("missing root");
        assert_eq!(err.code, "engine_unavailable");
    }
}
