//! `results` mapping detection
//!
//! Generated scripts hand their output back through a module-level `results`
//! binding. Statically we can only prove the binding is a mapping when it is
//! assigned a dict literal, a `dict(...)` call or a dict comprehension. Any
//! other right-hand side leaves the check `false`, which is advisory: the
//! runtime check in the executor is the authoritative one.

use crate::syntax::parse_python;
use tree_sitter::Node;

/// Binding name generated code must assign
pub const RESULTS_BINDING: &str = "results";

/// Bodies that may never execute; assignments inside them are not counted
const OPAQUE_SCOPES: &[&str] = &[
    "function_definition",
    "class_definition",
    "decorated_definition",
    "lambda",
];

/// Whether the source assigns a provable mapping to `results`
///
/// Returns `false` for empty source, comment-only source and source with
/// syntax errors. Never panics.
#[must_use]
pub fn validate_result_structure(code: &str) -> bool {
    let parsed = parse_python(code);
    let Some(tree) = parsed.tree() else {
        return false;
    };
    has_results_mapping(tree.root_node(), code)
}

/// Search a parsed module for a qualifying `results` assignment
pub(crate) fn has_results_mapping(module: Node<'_>, source: &str) -> bool {
    let mut stack = vec![module];
    while let Some(node) = stack.pop() {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            let kind = child.kind();
            if OPAQUE_SCOPES.contains(&kind) {
                continue;
            }
            if kind == "expression_statement" {
                let mut inner = child.walk();
                let found = child
                    .named_children(&mut inner)
                    .filter(|n| n.kind() == "assignment")
                    .any(|n| assignment_binds_mapping(n, source));
                if found {
                    return true;
                }
            } else if is_statement_container(kind) {
                stack.push(child);
            }
        }
    }
    false
}

/// Compound statements and their blocks/clauses
fn is_statement_container(kind: &str) -> bool {
    kind == "block" || kind.ends_with("_statement") || kind.ends_with("_clause")
}

/// Check `results = <mapping>`, including chained `a = results = {}`
fn assignment_binds_mapping(assignment: Node<'_>, source: &str) -> bool {
    let mut binds_results = false;
    let mut current = assignment;
    loop {
        if let Some(left) = current.child_by_field_name("left") {
            if left.kind() == "identifier" && text(left, source) == RESULTS_BINDING {
                binds_results = true;
            }
        }
        match current.child_by_field_name("right") {
            Some(right) if right.kind() == "assignment" => current = right,
            Some(right) => return binds_results && is_mapping_expression(right, source),
            // Bare annotation `results: dict` binds nothing
            None => return false,
        }
    }
}

fn is_mapping_expression(expr: Node<'_>, source: &str) -> bool {
    match expr.kind() {
        "dictionary" | "dictionary_comprehension" => true,
        "call" => expr
            .child_by_field_name("function")
            .is_some_and(|f| f.kind() == "identifier" && text(f, source) == "dict"),
        "parenthesized_expression" => {
            let mut cursor = expr.walk();
            let inner = expr.named_children(&mut cursor).find(|n| n.kind() != "comment");
            inner.is_some_and(|n| is_mapping_expression(n, source))
        }
        _ => false,
    }
}

fn text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    source.get(node.byte_range()).unwrap_or_default()
}
