//! Selection of remote release files.
//!
//! A [`RequirementFilter`] built from PEP 508 strings narrows which versions
//! of which projects count as "remote"; a [`ReleaseFilter`] adds the
//! package-type and pre-release switches on top.

use crate::error::{PythonError, Result};
use crate::index::normalize_package_name;
use crate::types::{PackageType, ReleaseFile};
use pep440_rs::{Version, VersionSpecifiers};
use pep508_rs::{Requirement, VersionOrUrl};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Version predicate per project, parsed from PEP 508 requirement strings.
///
/// Several requirements naming the same project are alternatives: a version
/// passes if any of them accepts it. Extras and environment markers are
/// ignored.
///
/// # Examples
///
/// ```
/// use pyrepo_python::filter::RequirementFilter;
/// use pep440_rs::Version;
/// use std::str::FromStr;
///
/// let filter = RequirementFilter::parse(&["Django>=4.2,<5".to_string()]).unwrap();
///
/// assert!(filter.allows("django", &Version::from_str("4.2.7").unwrap()));
/// assert!(!filter.allows("django", &Version::from_str("5.0").unwrap()));
/// // Projects the filter does not mention are not restricted
/// assert!(filter.allows("flask", &Version::from_str("0.1").unwrap()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequirementFilter {
    /// Normalized name -> alternatives (`None` = any version)
    projects: BTreeMap<String, Vec<Option<VersionSpecifiers>>>,
}

impl RequirementFilter {
    /// Parses requirement strings.
    ///
    /// # Errors
    ///
    /// Returns [`PythonError::InvalidRequirement`] for strings that are not
    /// valid PEP 508 or that name a direct URL.
    pub fn parse(requirements: &[String]) -> Result<Self> {
        let mut projects: BTreeMap<String, Vec<Option<VersionSpecifiers>>> = BTreeMap::new();

        for line in requirements {
            let requirement: Requirement = Requirement::from_str(line)
                .map_err(|e| PythonError::invalid_requirement(line, e.to_string()))?;

            let specifiers = match requirement.version_or_url {
                Some(VersionOrUrl::VersionSpecifier(specs)) if !specs.is_empty() => Some(specs),
                Some(VersionOrUrl::VersionSpecifier(_)) | None => None,
                Some(VersionOrUrl::Url(_)) => {
                    return Err(PythonError::invalid_requirement(
                        line,
                        "direct URL requirements cannot be synced from an index",
                    ));
                }
            };

            projects
                .entry(normalize_package_name(&requirement.name.to_string()))
                .or_default()
                .push(specifiers);
        }

        Ok(Self { projects })
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Normalized names of the projects the filter mentions.
    pub fn project_names(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    /// Whether the filter restricts versions of `project` at all.
    pub fn restricts(&self, project: &str) -> bool {
        self.projects
            .get(project)
            .is_some_and(|alts| alts.iter().all(Option::is_some))
    }

    /// Whether `version` of `project` (normalized) passes the filter.
    pub fn allows(&self, project: &str, version: &Version) -> bool {
        match self.projects.get(project) {
            None => true,
            Some(alternatives) => alternatives.iter().any(|specs| match specs {
                None => true,
                Some(specs) => specs.contains(version),
            }),
        }
    }
}

/// Decides which listed files a sync should consider.
///
/// # Examples
///
/// ```
/// use pyrepo_python::filter::{ReleaseFilter, RequirementFilter};
/// use pyrepo_python::types::PackageType;
///
/// let filter = ReleaseFilter::new(RequirementFilter::default(), false, vec![PackageType::Sdist]);
/// assert!(!filter.includes_prereleases());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    requirements: RequirementFilter,
    prereleases: bool,
    package_types: BTreeSet<PackageType>,
}

impl ReleaseFilter {
    /// `package_types` empty means every supported type.
    pub fn new(
        requirements: RequirementFilter,
        prereleases: bool,
        package_types: impl IntoIterator<Item = PackageType>,
    ) -> Self {
        Self {
            requirements,
            prereleases,
            package_types: package_types.into_iter().collect(),
        }
    }

    pub fn requirements(&self) -> &RequirementFilter {
        &self.requirements
    }

    pub fn includes_prereleases(&self) -> bool {
        self.prereleases
    }

    /// Whether `file`, listed for `project` (normalized), should be synced.
    ///
    /// Files of an unsupported type are always rejected. Files whose version
    /// cannot be parsed from the filename pass only when no version
    /// constraint applies to them.
    pub fn accepts(&self, project: &str, file: &ReleaseFile) -> bool {
        let Some(packagetype) = file.packagetype else {
            return false;
        };
        if !self.package_types.is_empty() && !self.package_types.contains(&packagetype) {
            return false;
        }

        let version = file
            .version
            .as_deref()
            .and_then(|v| Version::from_str(v).ok());

        match version {
            Some(version) => {
                (self.prereleases || !version.any_prerelease())
                    && self.requirements.allows(project, &version)
            }
            None => {
                tracing::debug!("{}: cannot determine version of {}", project, file.filename);
                !self.requirements.restricts(project)
            }
        }
    }
}
