//! Core task types for patchgate.
//!
//! Foundation types used throughout the harness: task identifiers, the
//! domain tag, ref kinds, grader variants, and the immutable
//! [`TaskDescriptor`] built at catalog load time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A validated task identifier.
///
/// Task ids must be lowercase alphanumeric with hyphens or underscores,
/// 1–64 characters. Examples: `fix-profile-404`, `smart_contract_erc20`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// The maximum length of a task id.
    pub const MAX_LEN: usize = 64;

    /// Create a new `TaskId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty, too long, or contains invalid characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the task id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The default ref stem: the id with hyphens turned into underscores.
    #[must_use]
    pub fn default_ref_stem(&self) -> String {
        self.0.replace('-', "_")
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: String| ValidationError {
            kind: ValueKind::TaskId,
            value: s.to_owned(),
            reason,
        };
        if s.is_empty() {
            return Err(fail("task id must not be empty".to_owned()));
        }
        if s.len() > Self::MAX_LEN {
            return Err(fail(format!(
                "task id must be at most {} characters, got {}",
                Self::MAX_LEN,
                s.len()
            )));
        }
        if s.starts_with(['-', '_']) {
            return Err(fail(
                "task id must start with a letter or digit".to_owned(),
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(fail(
                "task id must contain only lowercase letters (a-z), digits (0-9), hyphens (-) and underscores (_)"
                    .to_owned(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// The code domain a task's repository tree belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    /// An interpreted web application with a framework test runner.
    WebApp,
    /// Smart contracts tested with a contract toolchain.
    SmartContract,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebApp => write!(f, "web-app"),
            Self::SmartContract => write!(f, "smart-contract"),
        }
    }
}

// ---------------------------------------------------------------------------
// RefKind
// ---------------------------------------------------------------------------

/// Which of a task's three canonical refs to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefKind {
    /// Repository state containing the unfixed defect.
    #[serde(alias = "baseline")]
    Buggy,
    /// Repository state containing the correct fix.
    #[serde(alias = "golden")]
    ReferenceFix,
    /// Repository state carrying the hidden acceptance tests.
    #[serde(alias = "test")]
    HiddenTest,
}

impl RefKind {
    /// All kinds, in canonical order.
    pub const ALL: [Self; 3] = [Self::Buggy, Self::ReferenceFix, Self::HiddenTest];

    /// Suffix appended to a task's ref stem (`{stem}_{suffix}`).
    #[must_use]
    pub const fn ref_suffix(self) -> &'static str {
        match self {
            Self::Buggy => "baseline",
            Self::ReferenceFix => "golden",
            Self::HiddenTest => "test",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buggy => write!(f, "buggy"),
            Self::ReferenceFix => write!(f, "reference-fix"),
            Self::HiddenTest => write!(f, "hidden-test"),
        }
    }
}

impl FromStr for RefKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buggy" | "baseline" => Ok(Self::Buggy),
            "reference-fix" | "golden" => Ok(Self::ReferenceFix),
            "hidden-test" | "test" => Ok(Self::HiddenTest),
            _ => Err(ValidationError {
                kind: ValueKind::RefKind,
                value: s.to_owned(),
                reason: "expected one of: buggy, reference-fix, hidden-test (or baseline, golden, test)"
                    .to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// GraderVariant
// ---------------------------------------------------------------------------

/// Selects the test-runner adapter used to grade a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraderVariant {
    /// Django's `manage.py test` runner (verbosity 2 output).
    Django,
    /// Foundry's `forge test` runner.
    Forge,
    /// Any command; only its exit status is graded.
    ExitStatus,
}

impl GraderVariant {
    /// The variant used when a task does not name one.
    #[must_use]
    pub const fn default_for(domain: Domain) -> Self {
        match domain {
            Domain::WebApp => Self::Django,
            Domain::SmartContract => Self::Forge,
        }
    }
}

impl fmt::Display for GraderVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Django => write!(f, "django"),
            Self::Forge => write!(f, "forge"),
            Self::ExitStatus => write!(f, "exit-status"),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDescriptor
// ---------------------------------------------------------------------------

/// The three ref names of a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskRefs {
    /// Ref holding the unfixed defect.
    pub buggy: String,
    /// Ref holding the reference fix.
    pub reference_fix: String,
    /// Ref holding the hidden acceptance tests.
    pub hidden_test: String,
}

impl TaskRefs {
    /// Refs following the `{stem}_baseline` / `{stem}_golden` / `{stem}_test`
    /// convention.
    #[must_use]
    pub fn from_stem(stem: &str) -> Self {
        Self {
            buggy: format!("{stem}_{}", RefKind::Buggy.ref_suffix()),
            reference_fix: format!("{stem}_{}", RefKind::ReferenceFix.ref_suffix()),
            hidden_test: format!("{stem}_{}", RefKind::HiddenTest.ref_suffix()),
        }
    }

    /// The ref name for `kind`.
    #[must_use]
    pub fn get(&self, kind: RefKind) -> &str {
        match kind {
            RefKind::Buggy => &self.buggy,
            RefKind::ReferenceFix => &self.reference_fix,
            RefKind::HiddenTest => &self.hidden_test,
        }
    }
}

/// Immutable description of one benchmark scenario.
///
/// Built by the catalog from static configuration and never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskDescriptor {
    /// Unique task id.
    pub id: TaskId,
    /// Code domain of the task's tree.
    pub domain: Domain,
    /// Repository locator (URL or local path) understood by `git clone`.
    pub repo: String,
    /// Canonical ref names.
    pub refs: TaskRefs,
    /// Grader adapter selector.
    pub grader: GraderVariant,
    /// Hidden test files, relative to the tree root.
    pub test_files: Vec<String>,
    /// Task-specific test command overriding the grader's template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// Directory name the working tree is materialized under.
    pub checkout_dir: String,
    /// Environment files upserted into every materialized tree
    /// (`path -> {KEY -> VALUE}`).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env_files: BTreeMap<String, BTreeMap<String, String>>,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TaskDescriptor {
    /// The ref name this task uses for `kind`.
    #[must_use]
    pub fn ref_name(&self, kind: RefKind) -> &str {
        self.refs.get(kind)
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// What kind of value failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// A task id.
    TaskId,
    /// A ref kind name.
    RefKind,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskId => write!(f, "task id"),
            Self::RefKind => write!(f, "ref kind"),
        }
    }
}

/// A value failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// What kind of value was being validated.
    pub kind: ValueKind,
    /// The invalid value.
    pub value: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- TaskId --

    #[test]
    fn task_id_accepts_hyphens_and_underscores() {
        assert!(TaskId::new("fix-profile-404").is_ok());
        assert!(TaskId::new("smart_contract_erc20").is_ok());
        assert!(TaskId::new("a").is_ok());
    }

    #[test]
    fn task_id_rejects_bad_values() {
        assert!(TaskId::new("").is_err());
        assert!(TaskId::new("Fix").is_err());
        assert!(TaskId::new("fix 404").is_err());
        assert!(TaskId::new("-fix").is_err());
        assert!(TaskId::new("_fix").is_err());
        assert!(TaskId::new(&"a".repeat(65)).is_err());
        assert!(TaskId::new(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn task_id_error_names_the_value() {
        let err = TaskId::new("Bad").unwrap_err();
        assert_eq!(err.kind, ValueKind::TaskId);
        assert!(err.to_string().contains("\"Bad\""));
    }

    #[test]
    fn task_id_serde_validates() {
        let ok: TaskId = serde_json::from_str("\"fix-result-crud\"").unwrap();
        assert_eq!(ok.as_str(), "fix-result-crud");
        assert!(serde_json::from_str::<TaskId>("\"NOPE\"").is_err());
    }

    #[test]
    fn default_ref_stem_uses_underscores() {
        let id = TaskId::new("fix-profile-404").unwrap();
        assert_eq!(id.default_ref_stem(), "fix_profile_404");
    }

    // -- RefKind --

    #[test]
    fn ref_kind_parses_canonical_and_legacy_names() {
        assert_eq!("buggy".parse::<RefKind>().unwrap(), RefKind::Buggy);
        assert_eq!("baseline".parse::<RefKind>().unwrap(), RefKind::Buggy);
        assert_eq!("golden".parse::<RefKind>().unwrap(), RefKind::ReferenceFix);
        assert_eq!("hidden-test".parse::<RefKind>().unwrap(), RefKind::HiddenTest);
        assert!("tests".parse::<RefKind>().is_err());
    }

    #[test]
    fn ref_kind_display_roundtrips() {
        for kind in RefKind::ALL {
            assert_eq!(kind.to_string().parse::<RefKind>().unwrap(), kind);
        }
    }

    // -- TaskRefs --

    #[test]
    fn refs_from_stem_follow_convention() {
        let refs = TaskRefs::from_stem("fix_result_crud");
        assert_eq!(refs.get(RefKind::Buggy), "fix_result_crud_baseline");
        assert_eq!(refs.get(RefKind::ReferenceFix), "fix_result_crud_golden");
        assert_eq!(refs.get(RefKind::HiddenTest), "fix_result_crud_test");
    }

    // -- GraderVariant --

    #[test]
    fn grader_defaults_follow_domain() {
        assert_eq!(GraderVariant::default_for(Domain::WebApp), GraderVariant::Django);
        assert_eq!(
            GraderVariant::default_for(Domain::SmartContract),
            GraderVariant::Forge
        );
    }

    #[test]
    fn grader_variant_serde_is_kebab_case() {
        let v: GraderVariant = serde_json::from_str("\"exit-status\"").unwrap();
        assert_eq!(v, GraderVariant::ExitStatus);
        assert_eq!(serde_json::to_string(&Domain::SmartContract).unwrap(), "\"smart-contract\"");
    }
}
