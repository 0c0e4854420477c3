//! Step graph validation.
//!
//! Rule based: each rule checks one structural property and may offer a
//! mechanical repair. Repairs are pure `Workflow -> Workflow` functions;
//! the validator never edits a step in place.
//!
//! ```ignore
//! use agentpilot_compiler::validator::Validator;
//!
//! let report = Validator::new().with_catalog(&registry).validate(&workflow, true);
//! if !report.valid {
//!     for issue in &report.issues {
//!         eprintln!("{}", issue);
//!     }
//! }
//! ```
//!
//! # Adding a rule
//!
//! 1. Create a file in `validator/rules/`
//! 2. Implement `ValidationRule`
//! 3. Add it to `Validator::new()`

pub mod rules;
mod scope;

use serde::{Deserialize, Serialize};

use agentpilot_tools::CapabilityCatalog;

use crate::workflow::{renumber, Workflow};

pub(crate) use scope::{walk_scoped, Scope};

/// Severity levels for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The workflow cannot run as written.
    Error,
    /// Suspicious but executable.
    Warning,
}

/// One finding of a validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub rule_id: String,
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    /// Valid choices the author could have meant (ids, variables, params).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,

    #[serde(default)]
    pub auto_fixable: bool,

    /// Set when the issue was repaired by auto-fix.
    #[serde(default)]
    pub fixed: bool,
}

impl ValidationIssue {
    pub fn error(rule_id: &str, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            severity: Severity::Error,
            step_id: step_id.map(str::to_string),
            message: message.into(),
            suggestion: None,
            alternatives: Vec::new(),
            auto_fixable: false,
            fixed: false,
        }
    }

    pub fn warning(rule_id: &str, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule_id, step_id, message)
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<String>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn fixable(mut self) -> Self {
        self.auto_fixable = true;
        self
    }

    /// Errors that still block execution.
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error && !self.fixed
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}", severity)?;
        if let Some(step) = &self.step_id {
            write!(f, " at {}", step)?;
        }
        write!(f, ": {} [{}]", self.message, self.rule_id)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        if !self.alternatives.is_empty() {
            write!(f, " valid: {}", self.alternatives.join(", "))?;
        }
        if self.fixed {
            write!(f, " [fixed]")?;
        }
        Ok(())
    }
}

/// Shared inputs available to every rule.
pub struct RuleContext<'a> {
    pub catalog: Option<&'a dyn CapabilityCatalog>,
}

/// Trait that all validation rules implement.
pub trait ValidationRule: Send + Sync {
    /// Unique identifier (e.g., "dag-integrity").
    fn id(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn validate(&self, workflow: &Workflow, ctx: &RuleContext<'_>) -> Vec<ValidationIssue>;

    /// Mechanical repair for the auto-fixable issues this rule reports.
    ///
    /// Returns `None` when there is nothing to repair.
    fn fix(&self, _workflow: &Workflow, _ctx: &RuleContext<'_>) -> Option<Workflow> {
        None
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,

    /// Repaired workflow, present only when a repair was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_workflow: Option<Workflow>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }
}

/// Runs every rule over a workflow.
pub struct Validator<'a> {
    rules: Vec<Box<dyn ValidationRule>>,
    catalog: Option<&'a dyn CapabilityCatalog>,
}

impl<'a> Validator<'a> {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(rules::ActionTransformSeparationRule),
                Box::new(rules::TransformInputRule),
                Box::new(rules::ReferenceResolutionRule),
                Box::new(rules::MissingDependencyRule),
                Box::new(rules::DagIntegrityRule),
                Box::new(rules::CapabilityParamsRule),
            ],
            catalog: None,
        }
    }

    /// Enable capability parameter checks against a catalog.
    pub fn with_catalog(mut self, catalog: &'a dyn CapabilityCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Validate, optionally applying every available mechanical repair.
    ///
    /// Repairs run rule by rule in registration order; the result is then
    /// renumbered and validated again from scratch.
    pub fn validate(&self, workflow: &Workflow, auto_fix: bool) -> ValidationReport {
        let ctx = RuleContext {
            catalog: self.catalog,
        };

        let mut current = workflow.clone();
        let mut fixed_issues = Vec::new();
        let mut changed = false;

        if auto_fix {
            for rule in &self.rules {
                let issues = rule.validate(&current, &ctx);
                if !issues.iter().any(|i| i.auto_fixable) {
                    continue;
                }
                if let Some(next) = rule.fix(&current, &ctx) {
                    tracing::debug!(rule = rule.id(), "Applied workflow auto-fix");
                    fixed_issues.extend(issues.into_iter().filter(|i| i.auto_fixable).map(
                        |mut i| {
                            i.fixed = true;
                            i
                        },
                    ));
                    current = next;
                    changed = true;
                }
            }
        }

        if changed {
            current = renumber(&current);
        }

        let mut issues = fixed_issues;
        for rule in &self.rules {
            issues.extend(rule.validate(&current, &ctx));
        }

        let valid = !issues.iter().any(|i| i.is_blocking());
        ValidationReport {
            valid,
            issues,
            fixed_workflow: changed.then_some(current),
        }
    }
}

impl Default for Validator<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate without a capability catalog.
pub fn validate(workflow: &Workflow, auto_fix: bool) -> ValidationReport {
    Validator::new().validate(workflow, auto_fix)
}

#[cfg(test)]
mod tests;
