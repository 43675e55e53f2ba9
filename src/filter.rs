//! # Filter Predicates
//!
//! A [`Filter`] is a small predicate tree evaluated against the JSON document of
//! a committed event (`key`, `type`, `revision`, `category`, `correlationId`,
//! `committedAt`, `data`). Field access is positional: a leaf applies to the
//! field path formed by the [`Filter::Fields`] maps above it.
//!
//! ```text
//! Fields { "data": Fields { "value": Or[ Compare(<=, 3), Compare(=, 9) ] } }
//!
//!   → ((json_type(doc, :n0) IN ('integer', 'real') AND json_extract(doc, :n0) <= :v0)
//!       OR (json_type(doc, :n1) IN ('integer', 'real') AND json_extract(doc, :n1) = :v1))
//!     :n0 = :n1 = $."data"."value",  :v0 = 3,  :v1 = 9
//! ```
//!
//! [`compile`] produces the store-native form: an SQLite expression plus name
//! and value bindings. Field names only ever travel as bound JSON paths, never
//! as SQL text. [`Filter::matches`] evaluates the same tree in memory with the
//! same semantics:
//!
//! - a comparison on a missing field, or between different types, is false
//!   (so `<>` does not match a missing field);
//! - `Prefix` matches string fields only;
//! - `Exists` matches any present field, JSON `null` included;
//! - comparisons only hold against numbers, strings and booleans; a `null`,
//!   array or object operand never matches;
//! - a field whose name contains `"` cannot be addressed and is treated as
//!   missing;
//! - a tree with no leaves matches everything and compiles to no filter.

use std::collections::BTreeMap;

use serde_json::Value;

// =============================================================================
// Predicate Tree
// =============================================================================

/// Relational operator of a comparison leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Ne => "<>",
        }
    }
}

/// A predicate over an event document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything.
    True,
    /// The field is present.
    Exists,
    /// The field is a string starting with the value.
    Prefix(Value),
    /// The field compares to the value.
    Compare(Comparator, Value),
    /// Every subtree matches the same field.
    And(Vec<Filter>),
    /// At least one subtree matches the same field.
    Or(Vec<Filter>),
    /// Subtrees applied to named child fields, all of which must match.
    Fields(BTreeMap<String, Filter>),
}

impl Filter {
    pub fn exists() -> Self {
        Filter::Exists
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Filter::Prefix(Value::String(value.into()))
    }

    pub fn eq(value: impl Into<Value>) -> Self {
        Filter::Compare(Comparator::Eq, value.into())
    }

    pub fn ne(value: impl Into<Value>) -> Self {
        Filter::Compare(Comparator::Ne, value.into())
    }

    pub fn gt(value: impl Into<Value>) -> Self {
        Filter::Compare(Comparator::Gt, value.into())
    }

    pub fn gte(value: impl Into<Value>) -> Self {
        Filter::Compare(Comparator::Ge, value.into())
    }

    pub fn lt(value: impl Into<Value>) -> Self {
        Filter::Compare(Comparator::Lt, value.into())
    }

    pub fn lte(value: impl Into<Value>) -> Self {
        Filter::Compare(Comparator::Le, value.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Applies `filter` to the child field `name`.
    pub fn field(name: impl Into<String>, filter: Filter) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(name.into(), filter);
        Filter::Fields(fields)
    }

    /// Applies `filter` to a nested field, outermost name first.
    ///
    /// `Filter::path(["data", "value"], Filter::lte(3))` reads `data.value`.
    pub fn path<I, S>(names: I, filter: Filter) -> Self
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: DoubleEndedIterator,
        S: Into<String>,
    {
        names
            .into_iter()
            .rev()
            .fold(filter, |inner, name| Filter::field(name, inner))
    }

    /// Evaluates the predicate against an event document.
    pub fn matches(&self, document: &Value) -> bool {
        evaluate(self, Some(document))
    }
}

fn evaluate(filter: &Filter, value: Option<&Value>) -> bool {
    match filter {
        Filter::True => true,
        Filter::Exists => value.is_some(),
        Filter::Prefix(prefix) => match (value, prefix) {
            (Some(Value::String(actual)), Value::String(prefix)) => actual.starts_with(prefix),
            _ => false,
        },
        Filter::Compare(op, expected) => value.is_some_and(|actual| compare(actual, *op, expected)),
        Filter::And(filters) => filters.iter().all(|f| evaluate(f, value)),
        Filter::Or(filters) => filters.is_empty() || filters.iter().any(|f| evaluate(f, value)),
        Filter::Fields(fields) => fields.iter().all(|(name, f)| {
            let child = value
                .filter(|_| addressable(name))
                .and_then(|v| v.get(name));
            evaluate(f, child)
        }),
    }
}

/// Whether `name` can be spelled as a quoted SQLite JSON path label.
fn addressable(name: &str) -> bool {
    !name.contains('"')
}

fn compare(actual: &Value, op: Comparator, expected: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => match a.partial_cmp(&b) {
                    Some(o) => o,
                    None => return false,
                },
                _ => return false,
            },
        },
        (Value::String(a), Value::String(b)) => a.as_str().cmp(b.as_str()),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => return false,
    };

    match op {
        Comparator::Eq => ordering == Ordering::Equal,
        Comparator::Ne => ordering != Ordering::Equal,
        Comparator::Gt => ordering == Ordering::Greater,
        Comparator::Ge => ordering != Ordering::Less,
        Comparator::Lt => ordering == Ordering::Less,
        Comparator::Le => ordering != Ordering::Greater,
    }
}

// =============================================================================
// Compilation
// =============================================================================

/// Column holding the JSON document of an event row.
pub const DOCUMENT_COLUMN: &str = "doc";

/// A clause that holds for no row.
const NEVER: &str = "0";

/// A filter in the store's native syntax.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    /// SQLite boolean expression over the document column.
    pub expression: String,
    /// Name placeholder (`:n0`) to quoted JSON path (`$."data"."value"`).
    pub names: BTreeMap<String, String>,
    /// Value placeholder (`:v0`) to scalar value.
    pub values: BTreeMap<String, Value>,
}

/// Compiles a predicate tree. Returns `None` when it matches everything.
pub fn compile(filter: &Filter) -> Option<CompiledFilter> {
    let mut compiler = Compiler::default();
    let expression = compiler.walk(filter, Some(&[]))?;
    Some(CompiledFilter {
        expression,
        names: compiler.names,
        values: compiler.values,
    })
}

#[derive(Default)]
struct Compiler {
    counter: usize,
    names: BTreeMap<String, String>,
    values: BTreeMap<String, Value>,
}

impl Compiler {
    /// `None` means "always true" for this subtree. A `None` path is one that
    /// cannot be addressed; every leaf below it is false.
    fn walk(&mut self, filter: &Filter, path: Option<&[&str]>) -> Option<String> {
        match (filter, path) {
            (Filter::True, _) => None,
            (Filter::Exists | Filter::Prefix(_) | Filter::Compare(..), None) => {
                Some(NEVER.to_string())
            }
            (Filter::Exists, Some(path)) => {
                let n = self.name(path);
                Some(format!("json_type({DOCUMENT_COLUMN}, {n}) IS NOT NULL"))
            }
            (Filter::Prefix(prefix @ Value::String(_)), Some(path)) => {
                let (n, v) = self.leaf(path, prefix);
                Some(format!(
                    "(json_type({DOCUMENT_COLUMN}, {n}) = 'text' AND substr(json_extract({DOCUMENT_COLUMN}, {n}), 1, length({v})) = {v})"
                ))
            }
            (Filter::Prefix(_), Some(_)) => Some(NEVER.to_string()),
            (Filter::Compare(op, expected), Some(path)) => {
                let Some(types) = json_types(expected) else {
                    return Some(NEVER.to_string());
                };
                let (n, v) = self.leaf(path, expected);
                Some(format!(
                    "(json_type({DOCUMENT_COLUMN}, {n}) IN ({types}) AND json_extract({DOCUMENT_COLUMN}, {n}) {} {v})",
                    op.as_str()
                ))
            }
            (Filter::And(filters), _) => {
                let clauses: Vec<String> = filters
                    .iter()
                    .filter_map(|f| self.walk(f, path))
                    .collect();
                join(clauses, "AND")
            }
            (Filter::Or(filters), _) => {
                let mut clauses = Vec::with_capacity(filters.len());
                for f in filters {
                    // A branch that always holds makes the whole disjunction hold.
                    clauses.push(self.walk(f, path)?);
                }
                join(clauses, "OR")
            }
            (Filter::Fields(fields), _) => {
                let mut clauses = Vec::with_capacity(fields.len());
                for (name, f) in fields {
                    let child: Option<Vec<&str>> = path
                        .filter(|_| addressable(name))
                        .map(|path| {
                            let mut child = path.to_vec();
                            child.push(name.as_str());
                            child
                        });
                    if let Some(clause) = self.walk(f, child.as_deref()) {
                        clauses.push(clause);
                    }
                }
                join(clauses, "AND")
            }
        }
    }

    fn name(&mut self, path: &[&str]) -> String {
        let n = format!(":n{}", self.counter);
        self.counter += 1;
        self.names.insert(n.clone(), json_path(path));
        n
    }

    fn leaf(&mut self, path: &[&str], value: &Value) -> (String, String) {
        let index = self.counter;
        self.counter += 1;
        let n = format!(":n{index}");
        let v = format!(":v{index}");
        self.names.insert(n.clone(), json_path(path));
        self.values.insert(v.clone(), value.clone());
        (n, v)
    }
}

fn join(clauses: Vec<String>, op: &str) -> Option<String> {
    match clauses.len() {
        0 => None,
        1 => clauses.into_iter().next(),
        _ => Some(format!("({})", clauses.join(&format!(" {op} ")))),
    }
}

/// `["data", "value"]` → `$."data"."value"`.
fn json_path(path: &[&str]) -> String {
    let mut out = String::from("$");
    for part in path {
        out.push_str(".\"");
        out.push_str(part);
        out.push('"');
    }
    out
}

/// `json_type` results that can compare with `value`. `None` for operands
/// that never compare.
fn json_types(value: &Value) -> Option<&'static str> {
    match value {
        Value::Number(_) => Some("'integer', 'real'"),
        Value::String(_) => Some("'text'"),
        Value::Bool(_) => Some("'true', 'false'"),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
