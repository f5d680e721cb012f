//! Post-hoc session verifier.
//!
//! Pure over a `(session, steps, entities, taxonomy)` view: it never mutates
//! anything and never fails for a known session. Whether a failing report
//! blocks downstream use is the caller's decision.

use casegraph_store::{
    CaseId, Category, ExtractionSession, ExtractionStep, PublishedEntity, SessionId,
    SessionStatus, StepType, TaxonomySnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    /// Expected category with zero committed entities
    Missing,
    /// Committed entities that were never published
    DraftEntities,
    /// Entity points at a class absent from the taxonomy
    DanglingReference,
    /// Class used by this case does not record the case as a discoverer
    MissingProvenance,
    UnregisteredOntology,
    ModelMismatch,
    SessionNotCompleted,
    StepSequence,
    EntityCountMismatch,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::Missing => "MISSING",
            IssueCode::DraftEntities => "DRAFT_ENTITIES",
            IssueCode::DanglingReference => "DANGLING_REFERENCE",
            IssueCode::MissingProvenance => "MISSING_PROVENANCE",
            IssueCode::UnregisteredOntology => "UNREGISTERED_ONTOLOGY",
            IssueCode::ModelMismatch => "MODEL_MISMATCH",
            IssueCode::SessionNotCompleted => "SESSION_NOT_COMPLETED",
            IssueCode::StepSequence => "STEP_SEQUENCE",
            IssueCode::EntityCountMismatch => "ENTITY_COUNT_MISMATCH",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    pub category: Option<Category>,
    pub message: String,
}

impl VerificationIssue {
    fn critical(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            code,
            category: None,
            message: message.into(),
        }
    }

    fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub session_id: SessionId,
    pub case_id: CaseId,
    pub passed: bool,
    pub issues: Vec<VerificationIssue>,
    /// Committed entities per expected category (zeros included)
    pub category_counts: BTreeMap<Category, u32>,
}

impl VerificationReport {
    pub fn issues_with(&self, code: IssueCode) -> impl Iterator<Item = &VerificationIssue> {
        self.issues.iter().filter(move |i| i.code == code)
    }

    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "session {} (case {}): {}",
            self.session_id,
            self.case_id,
            if self.passed { "PASS" } else { "FAIL" }
        )?;
        for (category, count) in &self.category_counts {
            writeln!(f, "  {:<12} {}", category.as_str(), count)?;
        }
        if self.issues.is_empty() {
            return writeln!(f, "  no issues");
        }
        for issue in &self.issues {
            match issue.category {
                Some(category) => writeln!(
                    f,
                    "  [{}] {} ({}): {}",
                    issue.severity, issue.code, category, issue.message
                )?,
                None => writeln!(f, "  [{}] {}: {}", issue.severity, issue.code, issue.message)?,
            }
        }
        Ok(())
    }
}

/// What a session is expected to look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierPolicy {
    pub expected_categories: Vec<Category>,
    pub mandatory_categories: Vec<Category>,
    /// Identity every model call must carry. `None` skips the check.
    pub expected_model: Option<String>,
    /// Name the case ontology must be registered under
    pub ontology_name: String,
}

/// Check one session against `policy` and the current taxonomy.
pub fn verify(
    session: &ExtractionSession,
    steps: &[ExtractionStep],
    entities: &[PublishedEntity],
    taxonomy: &TaxonomySnapshot,
    policy: &VerifierPolicy,
) -> VerificationReport {
    let mut issues = Vec::new();

    if session.status != SessionStatus::Completed {
        issues.push(VerificationIssue::critical(
            IssueCode::SessionNotCompleted,
            match &session.failure_reason {
                Some(reason) => format!("session is {}: {reason}", session.status),
                None => format!("session is {}", session.status),
            },
        ));
    }

    // (1) coverage
    let mut category_counts: BTreeMap<Category, u32> = policy
        .expected_categories
        .iter()
        .map(|c| (*c, 0))
        .collect();
    for entity in entities {
        *category_counts.entry(entity.category).or_default() += 1;
    }
    for category in &policy.expected_categories {
        if category_counts.get(category).copied().unwrap_or(0) == 0 {
            let severity = if policy.mandatory_categories.contains(category) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            issues.push(VerificationIssue {
                severity,
                code: IssueCode::Missing,
                category: Some(*category),
                message: format!("no committed entities for category '{}'", category.plural()),
            });
        }
    }

    // (2) drafts and log consistency
    issues.extend(step_sequence(steps));
    if let Some(issue) = draft_entities(entities) {
        issues.push(issue);
    }
    if session.status == SessionStatus::Completed {
        if let Some(issue) = entity_count(steps, entities) {
            issues.push(issue);
        }
    }
    if session.status.is_closed() && session.aggregates.total_steps as usize != steps.len() {
        issues.push(VerificationIssue::critical(
            IssueCode::StepSequence,
            format!(
                "aggregates report {} steps but the log holds {}",
                session.aggregates.total_steps,
                steps.len()
            ),
        ));
    }

    // (3) taxonomy cross-references
    let mut seen_classes = BTreeSet::new();
    for entity in entities {
        if !seen_classes.insert(entity.class_id.as_str()) {
            continue;
        }
        match taxonomy.class(&entity.class_id) {
            None => issues.push(
                VerificationIssue::critical(
                    IssueCode::DanglingReference,
                    format!("entity '{}' references unknown class {}", entity.label, entity.class_id),
                )
                .with_category(entity.category),
            ),
            Some(class) if !class.references_case(&session.case_id) => issues.push(
                VerificationIssue::critical(
                    IssueCode::MissingProvenance,
                    format!(
                        "class {} does not record case {} as a discoverer",
                        class.id, session.case_id
                    ),
                )
                .with_category(entity.category),
            ),
            Some(_) => {}
        }
    }

    // (4) ontology registration
    match taxonomy.case_ontologies.get(&session.case_id) {
        Some(name) if *name == policy.ontology_name => {}
        Some(name) => issues.push(VerificationIssue::critical(
            IssueCode::UnregisteredOntology,
            format!(
                "case ontology registered as '{name}', expected '{}'",
                policy.ontology_name
            ),
        )),
        None => issues.push(VerificationIssue::critical(
            IssueCode::UnregisteredOntology,
            format!("no ontology registered for case {}", session.case_id),
        )),
    }

    // (5) model uniformity
    if let Some(expected) = &policy.expected_model {
        for step in steps {
            if step.step_type != StepType::ModelCall || step.is_algorithmic() {
                continue;
            }
            if step.model_identity.as_deref() != Some(expected.as_str()) {
                let mut issue = VerificationIssue::critical(
                    IssueCode::ModelMismatch,
                    format!(
                        "step {} used model '{}', expected '{expected}'",
                        step.step_number,
                        step.model_identity.as_deref().unwrap_or("<none>")
                    ),
                );
                issue.category = step.category;
                issues.push(issue);
            }
        }
    }

    let passed = !issues.iter().any(|i| i.severity == Severity::Critical);
    VerificationReport {
        session_id: session.id,
        case_id: session.case_id.clone(),
        passed,
        issues,
        category_counts,
    }
}

/// Checks that hold for any session about to complete: contiguous steps,
/// no unpublished entities, committed = recorded − discarded.
pub fn ledger_consistency(
    steps: &[ExtractionStep],
    entities: &[PublishedEntity],
) -> Vec<VerificationIssue> {
    let mut issues = step_sequence(steps);
    issues.extend(draft_entities(entities));
    issues.extend(entity_count(steps, entities));
    issues
}

fn step_sequence(steps: &[ExtractionStep]) -> Vec<VerificationIssue> {
    steps
        .iter()
        .enumerate()
        .filter(|(idx, step)| step.step_number as usize != idx + 1)
        .map(|(idx, step)| {
            VerificationIssue::critical(
                IssueCode::StepSequence,
                format!(
                    "step at position {} is numbered {}",
                    idx + 1,
                    step.step_number
                ),
            )
        })
        .collect()
}

fn draft_entities(entities: &[PublishedEntity]) -> Option<VerificationIssue> {
    let drafts = entities.iter().filter(|e| !e.published).count();
    (drafts > 0).then(|| {
        VerificationIssue::critical(
            IssueCode::DraftEntities,
            format!(
                "{drafts} of {} committed entities were never published",
                entities.len()
            ),
        )
    })
}

fn entity_count(steps: &[ExtractionStep], entities: &[PublishedEntity]) -> Option<VerificationIssue> {
    let recorded: u32 = steps.iter().map(|s| s.entity_count).sum();
    let discarded: u32 = steps.iter().map(|s| s.discarded_duplicates).sum();
    let expected = recorded.saturating_sub(discarded) as usize;
    (entities.len() != expected).then(|| {
        VerificationIssue::critical(
            IssueCode::EntityCountMismatch,
            format!(
                "{} committed entities, expected {expected} ({recorded} recorded - {discarded} discarded)",
                entities.len()
            ),
        )
    })
}
