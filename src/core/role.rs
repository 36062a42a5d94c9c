//! Worker roles and their ownership contracts.

use serde::{Deserialize, Serialize};

/// Logical role a worker plays in a run.
///
/// Each built-in role carries a default ownership contract: the resource
/// globs a worker in that role may mutate when a task does not narrow it.
/// Unknown role names round-trip through [`Role::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    TechnicalImpl,
    QaVerifier,
    Researcher,
    SecurityAuditor,
    DocsMaintainer,
    Refactorer,
    Custom(String),
}

impl Role {
    /// All built-in roles, in the order they are usually layered.
    pub const BUILTIN: [Role; 6] = [
        Role::Researcher,
        Role::TechnicalImpl,
        Role::Refactorer,
        Role::QaVerifier,
        Role::SecurityAuditor,
        Role::DocsMaintainer,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Role::TechnicalImpl => "technical-impl",
            Role::QaVerifier => "qa-verifier",
            Role::Researcher => "researcher",
            Role::SecurityAuditor => "security-auditor",
            Role::DocsMaintainer => "docs-maintainer",
            Role::Refactorer => "refactorer",
            Role::Custom(name) => name,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Role::TechnicalImpl => "Implements features and fixes in the source tree",
            Role::QaVerifier => "Writes and runs tests, verifies behaviour",
            Role::Researcher => "Reads code and documentation, reports findings",
            Role::SecurityAuditor => "Audits for vulnerabilities and writes security reports",
            Role::DocsMaintainer => "Keeps user and API documentation current",
            Role::Refactorer => "Improves structure and quality without changing behaviour",
            Role::Custom(_) => "Custom role",
        }
    }

    /// Default resource globs a worker in this role may mutate.
    ///
    /// Read-only roles claim nothing.
    pub fn default_ownership(&self) -> &'static [&'static str] {
        match self {
            Role::TechnicalImpl | Role::Refactorer => &["src/**"],
            Role::QaVerifier => &["tests/**"],
            Role::SecurityAuditor => &["reports/security/**"],
            Role::DocsMaintainer => &["docs/**", "*.md"],
            Role::Researcher | Role::Custom(_) => &[],
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.default_ownership().is_empty()
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "technical-impl" => Role::TechnicalImpl,
            "qa-verifier" => Role::QaVerifier,
            "researcher" => Role::Researcher,
            "security-auditor" => Role::SecurityAuditor,
            "docs-maintainer" => Role::DocsMaintainer,
            "refactorer" => Role::Refactorer,
            _ => Role::Custom(s),
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::from(s.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
