//! Test case descriptors.
//!
//! A [`TestCase`] is built once when a group defines its suite and never
//! mutated. How it is executed is decided by its [`CaseKind`], so group
//! runners dispatch on the kind instead of probing optional fields.

use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::runner::HarnessContext;
use crate::tool::Verb;
use crate::verify::CaseOutcome;

/// What a case acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    None,
    Container(String),
}

impl Subject {
    #[must_use]
    pub fn container(id: impl Into<String>) -> Self {
        Subject::Container(id.into())
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Subject::None => None,
            Subject::Container(id) => Some(id),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::None => f.write_str("No container"),
            Subject::Container(id) => f.write_str(id),
        }
    }
}

/// Expected-output matcher.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Substring.
    Literal(String),
    /// Every substring must be present.
    AllOf(Vec<String>),
    Pattern(Regex),
}

impl Matcher {
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Matcher::Literal(text.into())
    }

    #[must_use]
    pub fn all_of<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Matcher::AllOf(parts.into_iter().map(Into::into).collect())
    }

    /// Compile `pattern`; an invalid pattern is a programming error in the
    /// suite definition and is reported as such.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Matcher::Pattern)
    }

    #[must_use]
    pub fn is_match(&self, observed: &str) -> bool {
        match self {
            Matcher::Literal(text) => observed.contains(text.as_str()),
            Matcher::AllOf(parts) => parts.iter().all(|p| observed.contains(p.as_str())),
            Matcher::Pattern(re) => re.is_match(observed),
        }
    }

    #[must_use]
    pub fn is_match_ignore_case(&self, observed: &str) -> bool {
        let lowered = observed.to_lowercase();
        match self {
            Matcher::Literal(text) => lowered.contains(&text.to_lowercase()),
            Matcher::AllOf(parts) => parts.iter().all(|p| lowered.contains(&p.to_lowercase())),
            Matcher::Pattern(re) => RegexBuilder::new(re.as_str())
                .case_insensitive(true)
                .build()
                .is_ok_and(|re| re.is_match(observed)),
        }
    }

    /// Whole-value comparison after trimming surrounding whitespace.
    #[must_use]
    pub fn matches_exactly(&self, observed: &str) -> bool {
        let observed = observed.trim();
        match self {
            Matcher::Literal(text) => observed == text.trim(),
            Matcher::AllOf(parts) => parts.iter().all(|p| observed == p.trim()),
            Matcher::Pattern(re) => re
                .find(observed)
                .is_some_and(|m| m.start() == 0 && m.end() == observed.len()),
        }
    }

    /// The expected text as written, for failure messages.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Matcher::Literal(text) => text.clone(),
            Matcher::AllOf(parts) => parts.join(", "),
            Matcher::Pattern(re) => re.as_str().to_string(),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Matcher::Literal(text) => format!("{text:?}"),
            Matcher::AllOf(parts) => format!("all of {parts:?}"),
            Matcher::Pattern(re) => format!("/{}/", re.as_str()),
        }
    }
}

/// A named procedure run for [`CaseKind::NamedProcedure`] cases.
pub type Procedure = fn(&HarnessContext<'_>, &TestCase) -> CaseOutcome;

#[derive(Debug, Clone)]
pub enum CaseKind {
    /// Observed output must match.
    SimpleMatch,
    /// Observed output must not match.
    NegatedMatch,
    /// The procedure produces the outcome itself.
    NamedProcedure(Procedure),
    /// Issue `verb` against the subject and match its stdout.
    ScriptedCommand { verb: Verb, negate: bool },
}

#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub subject: Subject,
    pub expected: Matcher,
    pub description: String,
    pub kind: CaseKind,
}

impl TestCase {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subject: Subject,
        expected: Matcher,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            subject,
            expected,
            description: description.into(),
            kind: CaseKind::SimpleMatch,
        }
    }

    #[must_use]
    pub fn negated(mut self) -> Self {
        self.kind = match self.kind {
            CaseKind::ScriptedCommand { verb, .. } => CaseKind::ScriptedCommand { verb, negate: true },
            _ => CaseKind::NegatedMatch,
        };
        self
    }

    #[must_use]
    pub fn scripted(mut self, verb: Verb) -> Self {
        let negate = matches!(self.kind, CaseKind::NegatedMatch);
        self.kind = CaseKind::ScriptedCommand { verb, negate };
        self
    }

    #[must_use]
    pub fn procedure(mut self, procedure: Procedure) -> Self {
        self.kind = CaseKind::NamedProcedure(procedure);
        self
    }

    #[must_use]
    pub fn container_id(&self) -> &str {
        self.subject.id().unwrap_or_default()
    }

    #[must_use]
    pub fn is_negated(&self) -> bool {
        matches!(
            self.kind,
            CaseKind::NegatedMatch | CaseKind::ScriptedCommand { negate: true, .. }
        )
    }

    /// Apply the matcher, inverted for negated cases.
    #[must_use]
    pub fn check(&self, observed: &str) -> bool {
        self.expected.is_match(observed) != self.is_negated()
    }
}
