//! Built-in workflow templates.
//!
//! A template expands a goal into a layered plan whose concurrent tasks
//! own disjoint parts of the tree.

use crate::core::{Role, TaskId};
use crate::workflow::plan::{Plan, PlanTask};
use regex::Regex;
use std::sync::LazyLock;

static SECURITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bsecurity\b").unwrap());
static AUDIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\baudit").unwrap());
static DOCUMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bdocument").unwrap());
static QUALITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(quality|improve|refactor)").unwrap());
static DEVELOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(develop|implement|build)").unwrap());

struct Step {
    id: &'static str,
    role: &'static str,
    layer: u32,
    depends_on: &'static [&'static str],
    ownership: &'static [&'static str],
    /// `{goal}` is replaced with the run's goal.
    prompt: &'static str,
}

/// A named decomposition of a goal into tasks.
pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    steps: &'static [Step],
}

impl Template {
    /// Build a plan for `goal`.
    pub fn expand(&self, goal: &str) -> Plan {
        let mut plan = Plan::new(goal);
        for step in self.steps {
            let mut task = PlanTask::new(step.id, Role::from(step.role));
            task.layer = step.layer;
            task.depends_on = step.depends_on.iter().map(|d| TaskId::from(*d)).collect();
            task.ownership = step.ownership.iter().map(|p| p.to_string()).collect();
            task.prompt = Some(step.prompt.replace("{goal}", goal));
            plan.tasks.push(task);
        }
        plan
    }

    /// Roles the template uses, in step order without repeats.
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = Vec::new();
        for step in self.steps {
            let role = Role::from(step.role);
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        roles
    }
}

static TEMPLATES: &[Template] = &[
    Template {
        name: "full-development-cycle",
        description: "Analyze, implement with tests, refactor, then document",
        steps: &[
            Step {
                id: "analyze",
                role: "researcher",
                layer: 0,
                depends_on: &[],
                ownership: &[],
                prompt: "Analyze the codebase and outline the changes needed to: {goal}",
            },
            Step {
                id: "implement",
                role: "technical-impl",
                layer: 1,
                depends_on: &["analyze"],
                ownership: &[],
                prompt: "Implement: {goal}",
            },
            Step {
                id: "tests",
                role: "qa-verifier",
                layer: 1,
                depends_on: &["analyze"],
                ownership: &[],
                prompt: "Write tests that pin down the behavior of: {goal}",
            },
            Step {
                id: "refactor",
                role: "refactorer",
                layer: 2,
                depends_on: &["implement", "tests"],
                ownership: &[],
                prompt: "Refactor the new code for clarity without changing behavior",
            },
            Step {
                id: "docs",
                role: "docs-maintainer",
                layer: 3,
                depends_on: &["refactor"],
                ownership: &[],
                prompt: "Update the documentation for: {goal}",
            },
        ],
    },
    Template {
        name: "security-audit",
        description: "Audit, reproduce findings as tests, then document them",
        steps: &[
            Step {
                id: "audit",
                role: "security-auditor",
                layer: 0,
                depends_on: &[],
                ownership: &[],
                prompt: "Audit for vulnerabilities: {goal}",
            },
            Step {
                id: "threat-research",
                role: "researcher",
                layer: 0,
                depends_on: &[],
                ownership: &[],
                prompt: "Research known attack patterns relevant to: {goal}",
            },
            Step {
                id: "regression-tests",
                role: "qa-verifier",
                layer: 1,
                depends_on: &["audit"],
                ownership: &["tests/security/**"],
                prompt: "Write regression tests for each audit finding",
            },
            Step {
                id: "report",
                role: "docs-maintainer",
                layer: 2,
                depends_on: &["audit", "threat-research"],
                ownership: &["docs/security/**"],
                prompt: "Document the audit findings and remediations",
            },
        ],
    },
    Template {
        name: "documentation",
        description: "Survey changes, write documentation, verify its examples",
        steps: &[
            Step {
                id: "survey",
                role: "researcher",
                layer: 0,
                depends_on: &[],
                ownership: &[],
                prompt: "Survey recent changes and existing docs related to: {goal}",
            },
            Step {
                id: "write",
                role: "docs-maintainer",
                layer: 1,
                depends_on: &["survey"],
                ownership: &[],
                prompt: "Write or update documentation for: {goal}",
            },
            Step {
                id: "verify-examples",
                role: "qa-verifier",
                layer: 2,
                depends_on: &["write"],
                ownership: &["tests/docs/**"],
                prompt: "Turn the documented examples into tests",
            },
        ],
    },
    Template {
        name: "quality-improvement",
        description: "Find problem areas, refactor them, verify behavior",
        steps: &[
            Step {
                id: "analyze",
                role: "researcher",
                layer: 0,
                depends_on: &[],
                ownership: &[],
                prompt: "Find the code most in need of improvement for: {goal}",
            },
            Step {
                id: "refactor",
                role: "refactorer",
                layer: 1,
                depends_on: &["analyze"],
                ownership: &[],
                prompt: "Refactor the identified code: {goal}",
            },
            Step {
                id: "verify",
                role: "qa-verifier",
                layer: 1,
                depends_on: &["analyze"],
                ownership: &[],
                prompt: "Add tests that lock in current behavior before and after the refactor",
            },
        ],
    },
];

/// All built-in templates.
pub fn list() -> &'static [Template] {
    TEMPLATES
}

pub fn get(name: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.name == name)
}

/// Pick a template from keywords in the goal.
pub fn detect(goal: &str) -> Option<&'static Template> {
    let name = if SECURITY_RE.is_match(goal) && AUDIT_RE.is_match(goal) {
        "security-audit"
    } else if DOCUMENT_RE.is_match(goal) {
        "documentation"
    } else if QUALITY_RE.is_match(goal) {
        "quality-improvement"
    } else if DEVELOP_RE.is_match(goal) {
        "full-development-cycle"
    } else {
        return None;
    };
    get(name)
}
