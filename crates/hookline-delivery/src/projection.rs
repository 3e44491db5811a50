//! Payload projection by selection query.
//!
//! A webhook may declare a selection query shaped like a GraphQL
//! subscription, e.g. `subscription { orderCreated { id total } }`. The
//! query is parsed once into a tree of [`SelectionNode`]s and the payload is
//! reduced to the requested fields before it is signed and sent.
//!
//! Projection is a hint, not a security boundary: a query that does not
//! parse, or that holds no operation, leaves the payload untouched.
//!
//! Rules, applied recursively:
//!
//! - a requested field absent from the source is not emitted
//! - a requested field holding `null` is emitted as `null`
//! - a field with a sub-selection is projected into objects and mapped over
//!   arrays; any other value is copied verbatim
//! - `alias: field` emits the value under the alias
//! - inline fragments (`... on Type { .. }`) are flattened into the
//!   enclosing selection; arguments, variables and directives are ignored
//!
//! If the root selection is a single field with its own sub-selection, that
//! field is treated as the subscription wrapper and its sub-selection is
//! applied to the payload directly.

use serde_json::{Map, Value};
use thiserror::Error;

/// Selection query syntax error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// Unexpected token.
    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    Unexpected {
        /// Description of what was found
        found: String,
        /// What the parser was looking for
        expected: &'static str,
        /// Byte offset in the query
        offset: usize,
    },

    /// Query ended early.
    #[error("unexpected end of query, expected {expected}")]
    UnexpectedEnd {
        /// What the parser was looking for
        expected: &'static str,
    },

    /// String literal was never closed.
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString {
        /// Byte offset of the opening quote
        offset: usize,
    },
}

/// One entry of a selection set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionNode {
    /// `alias: name { ... }`
    Field {
        /// Output key override.
        alias: Option<String>,
        /// Source key.
        name: String,
        /// Nested selection, if any.
        selection: Option<Vec<SelectionNode>>,
    },
    /// `... on Type { ... }`, flattened during projection.
    InlineFragment {
        /// Fragment selection.
        selection: Vec<SelectionNode>,
    },
}

impl SelectionNode {
    /// Shorthand for a leaf field.
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field { alias: None, name: name.into(), selection: None }
    }

    /// Shorthand for a field with a sub-selection.
    pub fn object(name: impl Into<String>, selection: Vec<SelectionNode>) -> Self {
        Self::Field { alias: None, name: name.into(), selection: Some(selection) }
    }
}

/// Operation keyword of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// `query` or an anonymous `{ ... }` document.
    Query,
    /// `mutation`
    Mutation,
    /// `subscription`
    Subscription,
}

/// An operation definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation keyword.
    pub kind: OperationKind,
    /// Operation name, if given.
    pub name: Option<String>,
    /// Root selection set.
    pub selection: Vec<SelectionNode>,
}

/// Parsed selection query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionDocument {
    /// Operation definitions in source order. Fragment definitions are
    /// parsed but not kept.
    pub operations: Vec<Operation>,
}

impl SelectionDocument {
    /// Parses a selection query.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError` if the query is not a well-formed document.
    pub fn parse(query: &str) -> Result<Self, ProjectionError> {
        Parser::new(query)?.document()
    }

    /// Selection applied to payloads: the root selection of the first
    /// operation, unwrapped if it is a single field with a sub-selection.
    pub fn payload_selection(&self) -> Option<Vec<SelectionNode>> {
        let operation = self.operations.first()?;
        let root = flatten(&operation.selection);

        match root.as_slice() {
            [SelectionNode::Field { selection: Some(inner), .. }] => Some(inner.clone()),
            _ => Some(root),
        }
    }
}

/// Projects `payload` through `query`. Fails open on unparsable queries.
pub fn project(query: &str, payload: &Value) -> Value {
    let document = match SelectionDocument::parse(query) {
        Ok(document) => document,
        Err(e) => {
            tracing::debug!(error = %e, "selection query did not parse, sending full payload");
            return payload.clone();
        },
    };

    match document.payload_selection() {
        Some(selection) => apply_selection(&selection, payload),
        None => payload.clone(),
    }
}

/// Applies a parsed selection to a value.
pub fn apply_selection(selection: &[SelectionNode], value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(project_object(selection, map)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| apply_selection(selection, item)).collect())
        },
        other => other.clone(),
    }
}

fn project_object(selection: &[SelectionNode], source: &Map<String, Value>) -> Map<String, Value> {
    let mut projected = Map::new();

    for node in selection {
        match node {
            SelectionNode::Field { alias, name, selection } => {
                let Some(value) = source.get(name) else {
                    continue;
                };
                let value = match (selection, value) {
                    (Some(inner), Value::Object(_) | Value::Array(_)) => {
                        apply_selection(inner, value)
                    },
                    _ => value.clone(),
                };
                merge(&mut projected, alias.as_ref().unwrap_or(name), value);
            },
            SelectionNode::InlineFragment { selection } => {
                for (key, value) in project_object(selection, source) {
                    merge(&mut projected, &key, value);
                }
            },
        }
    }

    projected
}

/// Inserts `value`, merging objects when the key was already selected.
fn merge(target: &mut Map<String, Value>, key: &str, value: Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (inner_key, inner_value) in incoming {
                merge(existing, &inner_key, inner_value);
            }
        },
        (_, value) => {
            target.insert(key.to_string(), value);
        },
    }
}

fn flatten(selection: &[SelectionNode]) -> Vec<SelectionNode> {
    let mut flat = Vec::with_capacity(selection.len());
    for node in selection {
        match node {
            SelectionNode::InlineFragment { selection } => flat.extend(flatten(selection)),
            field => flat.push(field.clone()),
        }
    }
    flat
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Punct(char),
    Spread,
    Name(&'a str),
    Literal,
}

impl Token<'_> {
    fn describe(&self) -> String {
        match self {
            Token::Punct(c) => format!("'{c}'"),
            Token::Spread => "'...'".to_string(),
            Token::Name(name) => format!("name '{name}'"),
            Token::Literal => "literal".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token<'_>, usize)>, ProjectionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' | b',' => pos += 1,
            b'#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            },
            b'.' if bytes[pos..].starts_with(b"...") => {
                tokens.push((Token::Spread, pos));
                pos += 3;
            },
            b'{' | b'}' | b'(' | b')' | b'[' | b']' | b':' | b'@' | b'$' | b'!' | b'=' | b'|'
            | b'&' => {
                tokens.push((Token::Punct(char::from(c)), pos));
                pos += 1;
            },
            b'"' => {
                let start = pos;
                pos = skip_string(bytes, pos).ok_or(ProjectionError::UnterminatedString {
                    offset: start,
                })?;
                tokens.push((Token::Literal, start));
            },
            b'-' | b'0'..=b'9' => {
                let start = pos;
                pos += 1;
                while pos < bytes.len()
                    && matches!(bytes[pos], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
                {
                    pos += 1;
                }
                tokens.push((Token::Literal, start));
            },
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                let start = pos;
                while pos < bytes.len() && matches!(bytes[pos], b'_' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
                {
                    pos += 1;
                }
                tokens.push((Token::Name(&source[start..pos]), start));
            },
            _ => {
                let found = source[pos..].chars().next().map_or_else(String::new, |ch| format!("'{ch}'"));
                return Err(ProjectionError::Unexpected { found, expected: "a token", offset: pos });
            },
        }
    }

    Ok(tokens)
}

/// Returns the offset just past the string literal starting at `start`.
fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    if bytes[start..].starts_with(b"\"\"\"") {
        let mut pos = start + 3;
        while pos + 3 <= bytes.len() {
            if bytes[pos..].starts_with(b"\\\"\"\"") {
                pos += 4;
            } else if bytes[pos..].starts_with(b"\"\"\"") {
                return Some(pos + 3);
            } else {
                pos += 1;
            }
        }
        return None;
    }

    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'"' => return Some(pos + 1),
            b'\n' => return None,
            _ => pos += 1,
        }
    }
    None
}

struct Parser<'a> {
    tokens: Vec<(Token<'a>, usize)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, ProjectionError> {
        Ok(Self { tokens: tokenize(source)?, pos: 0 })
    }

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).map(|(token, _)| *token)
    }

    fn peek_at(&self, ahead: usize) -> Option<Token<'a>> {
        self.tokens.get(self.pos + ahead).map(|(token, _)| *token)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token<'a>, ProjectionError> {
        let token = self.peek().ok_or(ProjectionError::UnexpectedEnd { expected })?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, expected: &'static str) -> ProjectionError {
        match self.tokens.get(self.pos) {
            Some((token, offset)) => {
                ProjectionError::Unexpected { found: token.describe(), expected, offset: *offset }
            },
            None => ProjectionError::UnexpectedEnd { expected },
        }
    }

    fn expect_punct(&mut self, punct: char, expected: &'static str) -> Result<(), ProjectionError> {
        if self.peek() == Some(Token::Punct(punct)) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn name(&mut self, expected: &'static str) -> Result<&'a str, ProjectionError> {
        match self.peek() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                Ok(name)
            },
            _ => Err(self.unexpected(expected)),
        }
    }

    fn document(&mut self) -> Result<SelectionDocument, ProjectionError> {
        let mut document = SelectionDocument::default();

        while let Some(token) = self.peek() {
            match token {
                Token::Punct('{') => document.operations.push(Operation {
                    kind: OperationKind::Query,
                    name: None,
                    selection: self.selection_set()?,
                }),
                Token::Name("query" | "mutation" | "subscription") => {
                    document.operations.push(self.operation()?);
                },
                Token::Name("fragment") => self.fragment_definition()?,
                _ => return Err(self.unexpected("an operation or fragment definition")),
            }
        }

        Ok(document)
    }

    fn operation(&mut self) -> Result<Operation, ProjectionError> {
        let kind = match self.name("an operation type")? {
            "mutation" => OperationKind::Mutation,
            "subscription" => OperationKind::Subscription,
            _ => OperationKind::Query,
        };

        let name = match self.peek() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                Some(name.to_string())
            },
            _ => None,
        };

        if self.peek() == Some(Token::Punct('(')) {
            self.skip_group('(', ')')?;
        }
        self.directives()?;

        Ok(Operation { kind, name, selection: self.selection_set()? })
    }

    fn fragment_definition(&mut self) -> Result<(), ProjectionError> {
        self.name("'fragment'")?;
        self.name("a fragment name")?;
        if self.name("'on'")? != "on" {
            return Err(ProjectionError::Unexpected {
                found: "type condition".to_string(),
                expected: "'on'",
                offset: self.tokens.get(self.pos - 1).map_or(0, |(_, offset)| *offset),
            });
        }
        self.name("a type name")?;
        self.directives()?;
        self.selection_set()?;
        Ok(())
    }

    fn selection_set(&mut self) -> Result<Vec<SelectionNode>, ProjectionError> {
        self.expect_punct('{', "'{'")?;

        let mut selection = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Punct('}')) => {
                    self.pos += 1;
                    break;
                },
                Some(Token::Spread) => {
                    if let Some(node) = self.fragment()? {
                        selection.push(node);
                    }
                },
                Some(Token::Name(_)) => selection.push(self.field()?),
                _ => return Err(self.unexpected("a field or '}'")),
            }
        }

        if selection.is_empty() {
            return Err(self.tokens.get(self.pos - 1).map_or(
                ProjectionError::UnexpectedEnd { expected: "a field" },
                |(_, offset)| ProjectionError::Unexpected {
                    found: "'}'".to_string(),
                    expected: "a field",
                    offset: *offset,
                },
            ));
        }

        Ok(selection)
    }

    fn field(&mut self) -> Result<SelectionNode, ProjectionError> {
        let first = self.name("a field name")?;
        let (alias, name) = if self.peek() == Some(Token::Punct(':')) {
            self.pos += 1;
            (Some(first.to_string()), self.name("a field name after alias")?)
        } else {
            (None, first)
        };

        if self.peek() == Some(Token::Punct('(')) {
            self.skip_group('(', ')')?;
        }
        self.directives()?;

        let selection = if self.peek() == Some(Token::Punct('{')) {
            Some(self.selection_set()?)
        } else {
            None
        };

        Ok(SelectionNode::Field { alias, name: name.to_string(), selection })
    }

    /// Parses `... on Type { }`, `... { }` or a named spread. Named spreads
    /// yield `None`.
    fn fragment(&mut self) -> Result<Option<SelectionNode>, ProjectionError> {
        self.next("'...'")?;

        match (self.peek(), self.peek_at(1)) {
            (Some(Token::Name("on")), Some(Token::Name(_))) => {
                self.pos += 2;
            },
            (Some(Token::Name(_)), _) => {
                self.pos += 1;
                self.directives()?;
                return Ok(None);
            },
            _ => {},
        }

        self.directives()?;
        Ok(Some(SelectionNode::InlineFragment { selection: self.selection_set()? }))
    }

    fn directives(&mut self) -> Result<(), ProjectionError> {
        while self.peek() == Some(Token::Punct('@')) {
            self.pos += 1;
            self.name("a directive name")?;
            if self.peek() == Some(Token::Punct('(')) {
                self.skip_group('(', ')')?;
            }
        }
        Ok(())
    }

    /// Skips a balanced group such as an argument list.
    fn skip_group(&mut self, open: char, close: char) -> Result<(), ProjectionError> {
        self.expect_punct(open, "an opening bracket")?;
        let mut depth = 1usize;
        while depth > 0 {
            match self.next("a closing bracket")? {
                Token::Punct(c) if c == open => depth += 1,
                Token::Punct(c) if c == close => depth -= 1,
                _ => {},
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unwraps_single_wrapper_field() {
        let payload = json!({"id": "1", "name": "Widget", "secret": "x"});
        assert_eq!(
            project("subscription { event { id name } }", &payload),
            json!({"id": "1", "name": "Widget"})
        );
    }

    #[test]
    fn multi_field_root_is_projected_directly() {
        let payload = json!({"id": "1", "name": "Widget", "extra": "x"});
        assert_eq!(
            project("subscription { id name }", &payload),
            json!({"id": "1", "name": "Widget"})
        );
    }

    #[test]
    fn single_leaf_root_is_not_unwrapped() {
        let payload = json!({"id": "1", "name": "Widget"});
        assert_eq!(project("{ id }", &payload), json!({"id": "1"}));
    }

    #[test]
    fn nulls_are_kept_and_absent_fields_dropped() {
        let payload = json!({"id": "1", "note": null});
        assert_eq!(
            project("subscription { id note missing }", &payload),
            json!({"id": "1", "note": null})
        );
    }

    #[test]
    fn nested_objects_and_arrays_are_projected() {
        let payload = json!({
            "id": "o-1",
            "customer": {"name": "Ada", "email": "ada@example.com"},
            "items": [
                {"sku": "A", "qty": 1, "cost": 3},
                {"sku": "B", "qty": 2, "cost": 4}
            ],
            "tags": ["new", "priority"]
        });

        let projected = project(
            "subscription OrderCreated { orderCreated { id customer { name } items { sku qty } tags } }",
            &payload,
        );

        assert_eq!(
            projected,
            json!({
                "id": "o-1",
                "customer": {"name": "Ada"},
                "items": [{"sku": "A", "qty": 1}, {"sku": "B", "qty": 2}],
                "tags": ["new", "priority"]
            })
        );
    }

    #[test]
    fn scalar_with_subselection_is_copied() {
        let payload = json!({"id": "1", "customer": "c-9"});
        assert_eq!(
            project("{ id customer { name } }", &payload),
            json!({"id": "1", "customer": "c-9"})
        );
    }

    #[test]
    fn non_object_payloads_pass_through() {
        assert_eq!(project("{ id name }", &json!(null)), json!(null));
        assert_eq!(project("{ id name }", &json!(42)), json!(42));
        assert_eq!(project("{ id name }", &json!("text")), json!("text"));
    }

    #[test]
    fn root_array_is_projected_element_wise() {
        let payload = json!([{"id": 1, "x": 0}, {"id": 2, "x": 0}, 7]);
        assert_eq!(project("{ id x2: x }", &payload), json!([{"id": 1, "x2": 0}, {"id": 2, "x2": 0}, 7]));
    }

    #[test]
    fn malformed_query_fails_open() {
        let payload = json!({"id": "1", "secret": "x"});
        assert_eq!(project("subscription { id ", &payload), payload);
        assert_eq!(project("not a query", &payload), payload);
        assert_eq!(project("{ }", &payload), payload);
        assert_eq!(project("{ id \"open }", &payload), payload);
    }

    #[test]
    fn document_without_operation_fails_open() {
        let payload = json!({"id": "1", "secret": "x"});
        assert_eq!(project("", &payload), payload);
        assert_eq!(project("# just a comment", &payload), payload);
        assert_eq!(project("fragment F on Order { id }", &payload), payload);
    }

    #[test]
    fn aliases_arguments_and_directives() {
        let payload = json!({"id": "1", "total": 10, "currency": "EUR"});
        let query = r#"
            subscription Watch($shop: ID!) {
                orderCreated(shop: $shop, filter: { status: ["open", "paid"] }) @live {
                    orderId: id
                    total @include(if: true)
                }
            }
        "#;
        assert_eq!(project(query, &payload), json!({"orderId": "1", "total": 10}));
    }

    #[test]
    fn inline_fragments_are_flattened() {
        let payload = json!({
            "id": "1",
            "customer": {"name": "Ada", "email": "a@x", "phone": "1"},
            "secret": true
        });
        let query = "{ id ... on Order { customer { name } } ... { customer { email } } }";
        assert_eq!(
            project(query, &payload),
            json!({"id": "1", "customer": {"name": "Ada", "email": "a@x"}})
        );
    }

    #[test]
    fn wrapper_inside_inline_fragment_is_unwrapped() {
        let payload = json!({"id": "1", "secret": "x"});
        assert_eq!(project("subscription { ... on Subscription { e { id } } }", &payload), json!({"id": "1"}));
    }

    #[test]
    fn named_spreads_are_ignored() {
        let payload = json!({"id": "1", "name": "n"});
        assert_eq!(
            project("{ id ...Rest } fragment Rest on Order { name }", &payload),
            json!({"id": "1"})
        );
    }

    #[test]
    fn first_operation_wins() {
        let payload = json!({"a": 1, "b": 2});
        assert_eq!(project("query A { a } query B { b }", &payload), json!({"a": 1}));
    }

    #[test]
    fn parse_builds_selection_tree() {
        let document = SelectionDocument::parse("subscription S { e { id o: owner { name } } }").unwrap();
        let operation = &document.operations[0];

        assert_eq!(operation.kind, OperationKind::Subscription);
        assert_eq!(operation.name.as_deref(), Some("S"));
        assert_eq!(
            document.payload_selection().unwrap(),
            vec![
                SelectionNode::field("id"),
                SelectionNode::Field {
                    alias: Some("o".to_string()),
                    name: "owner".to_string(),
                    selection: Some(vec![SelectionNode::field("name")]),
                },
            ]
        );
    }

    #[test]
    fn parse_errors_report_offsets() {
        let err = SelectionDocument::parse("{ id ) }").unwrap_err();
        assert_eq!(
            err,
            ProjectionError::Unexpected { found: "')'".to_string(), expected: "a field or '}'", offset: 5 }
        );
        assert!(matches!(
            SelectionDocument::parse("{ id").unwrap_err(),
            ProjectionError::UnexpectedEnd { .. }
        ));
    }
}
