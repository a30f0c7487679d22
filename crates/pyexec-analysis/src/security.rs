//! Security scan over raw source text
//!
//! Matching is regex based and syntax independent, so it also runs on code
//! that failed to parse. It is deliberately conservative: a denylisted call
//! inside a comment or string literal is still reported.

use crate::error::AnalysisError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Overall security risk of a candidate script
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Nothing denylisted matched
    #[default]
    Low,
    /// Potentially unsafe but common in analysis code
    Medium,
    /// Process, network or interpreter escape
    High,
}

impl RiskLevel {
    /// Lowercase name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One denylist match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIssue {
    /// Rule identifier (e.g. `os_system`, `import:socket`)
    pub rule: String,
    /// Severity of this match
    pub severity: RiskLevel,
    /// 1-based line of the match
    pub line: usize,
    /// Description of the risk
    pub description: String,
}

/// Result of a security scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScan {
    /// Maximum severity among all issues
    pub risk_level: RiskLevel,
    /// Every match, in source order
    pub issues: Vec<SecurityIssue>,
    /// Denylisted modules imported, in order of first appearance
    pub prohibited_imports: Vec<String>,
}

struct CallRule {
    id: &'static str,
    pattern: Regex,
    severity: RiskLevel,
    description: &'static str,
}

/// Denylisted call patterns: (id, regex, severity, description)
///
/// `regex` has no look-behind, so "not preceded by an attribute dot" is
/// spelled `(?:^|[^\w.])`.
const CALL_RULES: &[(&str, &str, RiskLevel, &str)] = &[
    (
        "os_system",
        r"\bos\s*\.\s*(?:system|popen|exec[lv]p?e?|spawn[lv]?p?e?|fork|kill)\s*\(",
        RiskLevel::High,
        "spawns or signals operating-system processes",
    ),
    (
        "subprocess_call",
        r"\bsubprocess\s*\.\s*\w+\s*\(",
        RiskLevel::High,
        "spawns operating-system processes",
    ),
    (
        "eval",
        r"(?:^|[^\w.])eval\s*\(",
        RiskLevel::High,
        "evaluates arbitrary expressions",
    ),
    (
        "exec",
        r"(?:^|[^\w.])exec\s*\(",
        RiskLevel::High,
        "executes arbitrary code",
    ),
    (
        "dynamic_import",
        r"\b__import__\s*\(",
        RiskLevel::High,
        "imports modules dynamically",
    ),
    (
        "raw_socket",
        r"\bsocket\s*\.\s*socket\s*\(",
        RiskLevel::High,
        "opens raw network sockets",
    ),
    (
        "recursive_delete",
        r"\bshutil\s*\.\s*rmtree\s*\(",
        RiskLevel::High,
        "recursively deletes directories",
    ),
    (
        "compile",
        r"(?:^|[^\w.])compile\s*\(",
        RiskLevel::Medium,
        "compiles code objects at runtime",
    ),
    (
        "file_delete",
        r"\bos\s*\.\s*(?:remove|unlink|rmdir|removedirs)\s*\(",
        RiskLevel::Medium,
        "deletes files",
    ),
    (
        "pickle_load",
        r"\bpickle\s*\.\s*loads?\s*\(",
        RiskLevel::Medium,
        "deserializes untrusted pickle data",
    ),
    (
        "builtins_access",
        r"\b__builtins__\b",
        RiskLevel::High,
        "reaches into interpreter builtins",
    ),
    (
        "builtins_call",
        r"\bbuiltins\s*\.\s*(?:eval|exec|compile|__import__|open)\b",
        RiskLevel::High,
        "calls interpreter builtins through the builtins module",
    ),
];

/// Denylisted modules by top-level package name
const MODULE_DENYLIST: &[(&str, RiskLevel)] = &[
    ("subprocess", RiskLevel::High),
    ("socket", RiskLevel::High),
    ("ctypes", RiskLevel::High),
    ("pty", RiskLevel::High),
    ("builtins", RiskLevel::High),
    ("multiprocessing", RiskLevel::Medium),
    ("requests", RiskLevel::Medium),
    ("urllib", RiskLevel::Medium),
    ("urllib3", RiskLevel::Medium),
    ("httpx", RiskLevel::Medium),
    ("http", RiskLevel::Medium),
    ("ftplib", RiskLevel::Medium),
    ("telnetlib", RiskLevel::Medium),
    ("paramiko", RiskLevel::Medium),
];

/// Modules whose members are checked when imported by name or aliased
const GUARDED_MODULES: &[&str] = &["os", "posix", "nt", "builtins", "subprocess", "pty"];

/// Whether `module.member` spawns processes or evaluates code
fn is_dangerous_member(module: &str, member: &str) -> bool {
    if member == "*" {
        return GUARDED_MODULES.contains(&module);
    }
    match module {
        "os" | "posix" | "nt" => {
            matches!(member, "system" | "popen" | "fork" | "forkpty" | "kill" | "killpg")
                || member.starts_with("exec")
                || member.starts_with("spawn")
                || member.starts_with("posix_spawn")
        }
        "builtins" => matches!(member, "eval" | "exec" | "compile" | "__import__"),
        "subprocess" | "pty" => true,
        _ => false,
    }
}

/// Local names bound to dangerous functions or guarded modules
#[derive(Debug, Default)]
struct Bindings {
    /// `(local name, module.member)` from `from module import member [as name]`
    functions: Vec<(String, String)>,
    /// `(alias, module)` from `import module as alias`
    modules: Vec<(String, String)>,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// End offsets of `name` used as a whole identifier, not as an attribute
fn bare_occurrences<'a>(line: &'a str, name: &'a str) -> impl Iterator<Item = usize> + 'a {
    line.match_indices(name).filter_map(move |(idx, _)| {
        let end = idx + name.len();
        let before = line[..idx].chars().next_back();
        let after = line[end..].chars().next();
        let bare = !before.is_some_and(|c| is_ident_char(c) || c == '.');
        let whole = !after.is_some_and(is_ident_char);
        (bare && whole).then_some(end)
    })
}

/// Whether `line` calls `name(...)` directly
fn calls_name(line: &str, name: &str) -> bool {
    bare_occurrences(line, name).any(|end| line[end..].trim_start().starts_with('('))
}

/// Member of `alias` called on `line`, if it is dangerous for `module`
fn called_member(line: &str, alias: &str, module: &str) -> Option<String> {
    bare_occurrences(line, alias).find_map(|end| {
        let rest = line[end..].trim_start().strip_prefix('.')?.trim_start();
        let member: String = rest.chars().take_while(|c| is_ident_char(*c)).collect();
        let called = rest[member.len()..].trim_start().starts_with('(');
        (called && is_dangerous_member(module, &member)).then_some(member)
    })
}

/// Compiled denylist scanner
pub struct SecurityScanner {
    calls: Vec<CallRule>,
    import_stmt: Regex,
    from_stmt: Regex,
}

impl std::fmt::Debug for SecurityScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityScanner")
            .field("rules", &self.calls.len())
            .finish_non_exhaustive()
    }
}

impl SecurityScanner {
    /// Compile the built-in denylist
    ///
    /// # Errors
    /// Returns `AnalysisError::InvalidSecurityRule` if a rule fails to compile.
    pub fn new() -> Result<Self, AnalysisError> {
        let calls = CALL_RULES
            .iter()
            .map(|&(id, pattern, severity, description)| {
                Regex::new(pattern)
                    .map(|pattern| CallRule {
                        id,
                        pattern,
                        severity,
                        description,
                    })
                    .map_err(|source| AnalysisError::InvalidSecurityRule { rule: id, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let import_stmt = Regex::new(r"^\s*import\s+(.+)$")
            .map_err(|source| AnalysisError::InvalidSecurityRule { rule: "import", source })?;
        let from_stmt = Regex::new(r"^\s*from\s+([\w.]+)\s+import\b\s*(.*)$")
            .map_err(|source| AnalysisError::InvalidSecurityRule { rule: "from", source })?;

        Ok(Self {
            calls,
            import_stmt,
            from_stmt,
        })
    }

    /// Scan source text
    #[must_use]
    pub fn scan(&self, code: &str) -> SecurityScan {
        let mut scan = SecurityScan::default();
        let bindings = self.collect_bindings(code);

        for (idx, line) in code.lines().enumerate() {
            let line_no = idx + 1;

            for module in self.imported_modules(line) {
                let root = module.split('.').next().unwrap_or(module.as_str());
                let Some(&(_, severity)) =
                    MODULE_DENYLIST.iter().find(|(name, _)| *name == root)
                else {
                    continue;
                };
                if !scan.prohibited_imports.contains(&module) {
                    scan.prohibited_imports.push(module.clone());
                }
                scan.issues.push(SecurityIssue {
                    rule: format!("import:{root}"),
                    severity,
                    line: line_no,
                    description: format!("imports denylisted module '{module}'"),
                });
            }

            if let Some((module, names)) = self.from_import(line) {
                for (member, _) in names.iter().filter(|(m, _)| is_dangerous_member(&module, m)) {
                    scan.issues.push(SecurityIssue {
                        rule: "from_import".to_string(),
                        severity: RiskLevel::High,
                        line: line_no,
                        description: format!("imports '{module}.{member}' by name"),
                    });
                }
            }

            for rule in &self.calls {
                if rule.pattern.is_match(line) {
                    scan.issues.push(SecurityIssue {
                        rule: rule.id.to_string(),
                        severity: rule.severity,
                        line: line_no,
                        description: rule.description.to_string(),
                    });
                }
            }

            for (name, target) in &bindings.functions {
                if calls_name(line, name) {
                    scan.issues.push(SecurityIssue {
                        rule: "aliased_call".to_string(),
                        severity: RiskLevel::High,
                        line: line_no,
                        description: format!("calls '{target}' through the name '{name}'"),
                    });
                }
            }
            for (alias, module) in &bindings.modules {
                if let Some(member) = called_member(line, alias, module) {
                    scan.issues.push(SecurityIssue {
                        rule: "aliased_call".to_string(),
                        severity: RiskLevel::High,
                        line: line_no,
                        description: format!("calls '{module}.{member}' through the alias '{alias}'"),
                    });
                }
            }
        }

        scan.risk_level = scan
            .issues
            .iter()
            .map(|issue| issue.severity)
            .max()
            .unwrap_or_default();
        scan
    }

    /// Names bound anywhere in `code` to dangerous functions or guarded modules
    fn collect_bindings(&self, code: &str) -> Bindings {
        let mut bindings = Bindings::default();
        for line in code.lines() {
            if let Some((module, names)) = self.from_import(line) {
                bindings.functions.extend(
                    names
                        .into_iter()
                        .filter(|(member, _)| member != "*" && is_dangerous_member(&module, member))
                        .map(|(member, bound)| (bound, format!("{module}.{member}"))),
                );
            }
            bindings.modules.extend(
                self.module_aliases(line)
                    .into_iter()
                    .filter(|(module, alias)| alias != module && GUARDED_MODULES.contains(&module.as_str()))
                    .map(|(module, alias)| (alias, module)),
            );
        }
        bindings
    }

    /// Module and `(member, bound name)` pairs of a `from module import ...` line
    fn from_import(&self, line: &str) -> Option<(String, Vec<(String, String)>)> {
        let caps = self.from_stmt.captures(line)?;
        let names = caps[2].split(['#', ';']).next().unwrap_or_default();
        let pairs = names
            .split(',')
            .filter_map(|part| {
                let part = part.trim().trim_matches(['(', ')']);
                let mut words = part.split_whitespace();
                let member = words.next()?.to_string();
                let bound = match (words.next(), words.next()) {
                    (Some("as"), Some(alias)) => alias.to_string(),
                    _ => member.clone(),
                };
                Some((member, bound))
            })
            .collect();
        Some((caps[1].to_string(), pairs))
    }

    /// `(module, alias)` pairs of an `import a as b, c` line
    fn module_aliases(&self, line: &str) -> Vec<(String, String)> {
        let Some(caps) = self.import_stmt.captures(line) else {
            return Vec::new();
        };
        let names = caps[1].split(['#', ';']).next().unwrap_or_default();
        names
            .split(',')
            .filter_map(|part| {
                let mut words = part.split_whitespace();
                let module = words.next()?.to_string();
                let alias = match (words.next(), words.next()) {
                    (Some("as"), Some(alias)) => alias.to_string(),
                    _ => module.clone(),
                };
                Some((module, alias))
            })
            .collect()
    }

    /// Module names imported on a single line
    fn imported_modules(&self, line: &str) -> Vec<String> {
        if let Some(caps) = self.from_stmt.captures(line) {
            return vec![caps[1].to_string()];
        }
        self.module_aliases(line)
            .into_iter()
            .map(|(module, _)| module)
            .collect()
    }
}
