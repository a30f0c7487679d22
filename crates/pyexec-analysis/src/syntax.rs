//! Python syntax checking
//!
//! Wraps the tree-sitter Python grammar. tree-sitter recovers from errors
//! instead of failing, so validity is decided by the presence of `ERROR`
//! or `MISSING` nodes in the recovered tree.
//!
//! The grammar also accepts constructs CPython 3 refuses to compile: the
//! Python 2 `print` and `exec` statements, and `return` or `yield` outside
//! a function. Those are reported as issues on an otherwise clean tree.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser, Tree};

/// A single syntax problem located in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxIssue {
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
    /// Human-readable description
    pub message: String,
}

impl std::fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Outcome of parsing a candidate script
#[derive(Debug)]
pub struct ParsedSource {
    tree: Option<Tree>,
    issues: Vec<SyntaxIssue>,
}

impl ParsedSource {
    /// Whether the source parsed without any error or missing node
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.tree.is_some() && self.issues.is_empty()
    }

    /// Syntax issues found
    #[inline]
    #[must_use]
    pub fn issues(&self) -> &[SyntaxIssue] {
        &self.issues
    }

    /// Syntax tree, present only for valid source
    #[inline]
    #[must_use]
    pub fn tree(&self) -> Option<&Tree> {
        if self.issues.is_empty() {
            self.tree.as_ref()
        } else {
            None
        }
    }

    /// Consume into the issue list
    #[inline]
    #[must_use]
    pub fn into_issues(self) -> Vec<SyntaxIssue> {
        self.issues
    }
}

/// Build a parser with the Python grammar loaded
pub(crate) fn python_parser() -> Result<Parser, AnalysisError> {
    let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| AnalysisError::GrammarUnavailable(e.to_string()))?;
    Ok(parser)
}

/// Parse Python source
///
/// Never fails: grammar or parser problems are reported as a single issue at
/// 1:1 so callers can treat them like any other invalid source.
#[must_use]
pub fn parse_python(source: &str) -> ParsedSource {
    let mut parser = match python_parser() {
        Ok(parser) => parser,
        Err(e) => {
            return ParsedSource {
                tree: None,
                issues: vec![SyntaxIssue {
                    line: 1,
                    column: 1,
                    message: e.to_string(),
                }],
            }
        }
    };

    let Some(tree) = parser.parse(source, None) else {
        return ParsedSource {
            tree: None,
            issues: vec![SyntaxIssue {
                line: 1,
                column: 1,
                message: "parser produced no syntax tree".to_string(),
            }],
        };
    };

    let mut issues = collect_issues(tree.root_node(), source);
    if issues.is_empty() && tree.root_node().has_error() {
        issues.push(SyntaxIssue {
            line: 1,
            column: 1,
            message: "invalid syntax".to_string(),
        });
    }
    if issues.is_empty() {
        issues = collect_python3_issues(tree.root_node(), source);
    }

    ParsedSource {
        tree: Some(tree),
        issues,
    }
}

/// Walk the tree collecting `ERROR` and `MISSING` nodes
///
/// Children of an `ERROR` node are not visited; one issue per broken region.
fn collect_issues(root: Node<'_>, source: &str) -> Vec<SyntaxIssue> {
    let mut issues = Vec::new();
    if !root.has_error() {
        return issues;
    }

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            issues.push(located(node, format!("missing '{}'", node.kind())));
            continue;
        }
        if node.is_error() {
            let snippet = node
                .utf8_text(source.as_bytes())
                .unwrap_or_default()
                .lines()
                .next()
                .unwrap_or_default()
                .trim();
            let message = if snippet.is_empty() {
                "invalid syntax".to_string()
            } else {
                format!("invalid syntax near '{}'", truncate(snippet, 40))
            };
            issues.push(located(node, message));
            continue;
        }
        if node.has_error() {
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
            // Reverse so issues come out in source order
            stack.extend(children.into_iter().rev());
        }
    }

    issues
}

/// Walk a clean tree for statements CPython 3 rejects at compile time
fn collect_python3_issues(root: Node<'_>, source: &str) -> Vec<SyntaxIssue> {
    let mut issues = Vec::new();
    // (node, inside a function or lambda body)
    let mut stack = vec![(root, false)];
    while let Some((node, in_function)) = stack.pop() {
        match node.kind() {
            kind @ ("print_statement" | "exec_statement") => {
                let keyword = if kind == "print_statement" { "print" } else { "exec" };
                let text = node.utf8_text(source.as_bytes()).unwrap_or_default();
                // `print (x)` is still a call in Python 3
                let rest = text.strip_prefix(keyword).unwrap_or(text).trim_start();
                if !rest.starts_with('(') {
                    issues.push(located(node, format!("Python 2 '{keyword}' statement")));
                    continue;
                }
            }
            "return_statement" if !in_function => {
                issues.push(located(node, "'return' outside function".to_string()));
            }
            "yield" if node.is_named() && !in_function => {
                issues.push(located(node, "'yield' outside function".to_string()));
            }
            _ => {}
        }
        let in_function = in_function || matches!(node.kind(), "function_definition" | "lambda");
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev().map(|child| (child, in_function)));
    }
    issues
}

fn located(node: Node<'_>, message: String) -> SyntaxIssue {
    let point = node.start_position();
    SyntaxIssue {
        line: point.row + 1,
        column: point.column + 1,
        message,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
