//! Diagnostics collected while planning and applying.
//!
//! Node-local problems (a provider call that failed, a value that could not
//! be validated) are recorded as diagnostics instead of aborting the run, so
//! that independent parts of the graph can still make progress.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The address of the object the diagnostic is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}
impl Diagnostic {
    pub fn error(summary: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            summary: summary.into(),
            detail: None,
            address: None,
        }
    }
    pub fn warning(summary: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(summary)
        }
    }
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
    pub fn with_address(mut self, address: impl Display) -> Self {
        self.address = Some(address.to_string());
        self
    }
    /// Wrap an error, keeping its full context chain as the detail.
    pub fn from_error(summary: impl Into<String>, error: &anyhow::Error) -> Self {
        Diagnostic::error(summary).with_detail(format!("{:#}", error))
    }
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}
impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: ", level)?;
        if let Some(address) = &self.address {
            write!(f, "{}: ", address)?;
        }
        write!(f, "{}", self.summary)?;
        if let Some(detail) = &self.detail {
            write!(f, "\n  {}", detail.replace('\n', "\n  "))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);
impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics(Vec::new())
    }
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }
    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.is_error())
    }
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    /// Set the address on every diagnostic that does not have one yet.
    pub fn with_address(mut self, address: impl Display) -> Self {
        let address = address.to_string();
        for d in self.0.iter_mut() {
            if d.address.is_none() {
                d.address = Some(address.clone());
            }
        }
        self
    }
}
/// One diagnostic per line. As an error, a set of diagnostics stands for the
/// node-local failure they describe.
impl Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}
impl std::error::Error for Diagnostics {}

impl From<Diagnostic> for Diagnostics {
    fn from(d: Diagnostic) -> Self {
        Diagnostics(vec![d])
    }
}
impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        Diagnostics(iter.into_iter().collect())
    }
}
impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_are_not_errors() {
        let mut d = Diagnostics::new();
        d.push(Diagnostic::warning("deprecated attribute"));
        assert!(!d.has_errors());
        d.push(Diagnostic::error("boom").with_address("t_x.a"));
        assert!(d.has_errors());
        assert_eq!(d.errors().count(), 1);
    }

    #[test]
    fn display_includes_address_and_detail() {
        let e = anyhow::anyhow!("inner").context("outer");
        let d = Diagnostic::from_error("create failed", &e).with_address("t_x.a");
        assert_eq!(
            d.to_string(),
            "error: t_x.a: create failed\n  outer: inner"
        );
    }

    #[test]
    fn with_address_keeps_existing() {
        let d: Diagnostics = vec![
            Diagnostic::error("a").with_address("x"),
            Diagnostic::error("b"),
        ]
        .into_iter()
        .collect();
        let d = d.with_address("y");
        let addrs: Vec<_> = d.iter().map(|d| d.address.clone().unwrap()).collect();
        assert_eq!(addrs, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn diagnostics_travel_as_errors() {
        let d: Diagnostics = Diagnostic::error("quota exceeded").into();
        let err: anyhow::Error = d.clone().into();
        assert_eq!(err.downcast_ref::<Diagnostics>(), Some(&d));
        assert_eq!(err.to_string(), "error: quota exceeded");
    }
}
