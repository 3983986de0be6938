//! Template versioning types

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::compatibility::ChangeReport;
use crate::schema::TemplateDefinition;

/// Parse a version string, accepting a leading 'v'
pub fn parse_version(version_str: &str) -> Result<Version, semver::Error> {
    let version_str = version_str.strip_prefix('v').unwrap_or(version_str);
    Version::parse(version_str)
}

/// One published version of a template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersion {
    pub template_id: String,
    /// Semantic version (e.g., "1.2.3")
    pub version: Version,
    /// False once deprecated
    pub is_active: bool,
    /// Derived from the template's latest pointer at read time
    pub is_latest: bool,
    pub definition: TemplateDefinition,
    /// Differences from the previous latest version
    pub changeset: Option<ChangeReport>,
    pub previous_version: Option<Version>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for TemplateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.template_id, self.version)
    }
}

impl PartialEq for TemplateVersion {
    fn eq(&self, other: &Self) -> bool {
        self.template_id == other.template_id && self.version == other.version
    }
}

impl Eq for TemplateVersion {}

impl PartialOrd for TemplateVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TemplateVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.template_id
            .cmp(&other.template_id)
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// Which semver component a publish increments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bump {
    Major,
    Minor,
    Patch,
}

impl Bump {
    /// Smallest bump that honestly describes a change report
    pub fn for_changes(report: &ChangeReport) -> Self {
        if report.has_breaking_changes {
            Bump::Major
        } else if !report.fields_added.is_empty() {
            Bump::Minor
        } else {
            Bump::Patch
        }
    }

    pub fn apply(&self, version: &Version) -> Version {
        match self {
            Bump::Major => Version::new(version.major + 1, 0, 0),
            Bump::Minor => Version::new(version.major, version.minor + 1, 0),
            Bump::Patch => Version::new(version.major, version.minor, version.patch + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!(parse_version("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert!(parse_version("one").is_err());
    }

    #[test]
    fn test_version_bumps() {
        let v = Version::new(1, 2, 3);
        assert_eq!(Bump::Major.apply(&v).to_string(), "2.0.0");
        assert_eq!(Bump::Minor.apply(&v).to_string(), "1.3.0");
        assert_eq!(Bump::Patch.apply(&v).to_string(), "1.2.4");
    }

    #[test]
    fn test_bump_for_changes() {
        let mut report = ChangeReport::empty("t", Version::new(1, 0, 0), Version::new(1, 0, 1));
        assert_eq!(Bump::for_changes(&report), Bump::Patch);

        report.fields_added.push("f3".to_string());
        assert_eq!(Bump::for_changes(&report), Bump::Minor);

        report.has_breaking_changes = true;
        assert_eq!(Bump::for_changes(&report), Bump::Major);
    }
}
