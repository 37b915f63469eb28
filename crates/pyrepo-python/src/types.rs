use pyrepo_core::{Content, ContentAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Distribution format of a package artifact.
///
/// The serialized names are the `packagetype` strings used by PyPI.
///
/// # Examples
///
/// ```
/// use pyrepo_python::types::PackageType;
///
/// assert_eq!(PackageType::from_filename("foo-1.0-py3-none-any.whl"), Some(PackageType::BdistWheel));
/// assert_eq!(PackageType::from_filename("foo-1.0.tar.gz"), Some(PackageType::Sdist));
/// assert_eq!(PackageType::from_filename("foo-1.0.exe"), None);
/// assert_eq!(PackageType::Sdist.as_str(), "sdist");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PackageType {
    #[serde(rename = "sdist")]
    Sdist,
    #[serde(rename = "bdist_wheel")]
    BdistWheel,
    #[serde(rename = "bdist_egg")]
    BdistEgg,
}

/// Source distribution archive suffixes, longest first.
pub(crate) const SDIST_SUFFIXES: &[&str] = &[".tar.gz", ".tar.bz2", ".tgz", ".zip"];

impl PackageType {
    /// Detects the package type from an artifact filename.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".whl") {
            Some(Self::BdistWheel)
        } else if lower.ends_with(".egg") {
            Some(Self::BdistEgg)
        } else if SDIST_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            Some(Self::Sdist)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sdist => "sdist",
            Self::BdistWheel => "bdist_wheel",
            Self::BdistEgg => "bdist_egg",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trove classifier tag, e.g. `Programming Language :: Python :: 3`.
///
/// Classifiers are owned by exactly one [`PythonPackageContent`] and go
/// away with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Classifier(String);

impl Classifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Core metadata of a distribution (PEP 345 / PEP 426 / PEP 566).
///
/// Produced by the metadata parser from `PKG-INFO`, `METADATA` or
/// `setup.cfg`. Multi-use fields whose order carries meaning are kept as
/// sequences; the dependency fields and keywords are sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMetadata {
    pub metadata_version: String,
    pub name: String,
    /// PEP 440 version string as written in the metadata
    pub version: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub description_content_type: Option<String>,
    pub keywords: BTreeSet<String>,
    pub home_page: Option<String>,
    pub download_url: Option<String>,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub maintainer: Option<String>,
    pub maintainer_email: Option<String>,
    pub license: Option<String>,
    pub requires_python: Option<String>,
    pub platforms: Vec<String>,
    pub supported_platforms: Vec<String>,
    /// `Project-URL` entries, e.g. `Source, https://github.com/psf/requests`
    pub project_urls: Vec<String>,
    /// Unique, in first-seen order
    pub classifiers: Vec<Classifier>,
    pub requires_dist: BTreeSet<String>,
    pub provides_dist: BTreeSet<String>,
    pub obsoletes_dist: BTreeSet<String>,
    pub requires_external: BTreeSet<String>,
    /// Unrecognized headers, keyed by the header name as written
    pub extra_fields: BTreeMap<String, Vec<String>>,
}

impl PackageMetadata {
    /// Appends a classifier unless an identical one is already present.
    pub fn add_classifier(&mut self, name: impl Into<String>) {
        let classifier = Classifier::new(name);
        if !self.classifiers.contains(&classifier) {
            self.classifiers.push(classifier);
        }
    }

    /// Splits `Project-URL` entries into `(label, url)` pairs.
    ///
    /// Entries without a comma are returned with an empty label.
    pub fn project_url_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.project_urls.iter().map(|entry| match entry.split_once(',') {
            Some((label, url)) => (label.trim(), url.trim()),
            None => ("", entry.trim()),
        })
    }
}

/// A Python distribution artifact stored in the catalog.
///
/// Immutable once created and uniquely identified by `filename`. A corrected
/// record is a new unit, never an update of this one.
///
/// # Examples
///
/// ```
/// use pyrepo_core::{Content, ContentAddress};
/// use pyrepo_python::types::{PackageMetadata, PackageType, PythonPackageContent};
///
/// let metadata = PackageMetadata {
///     metadata_version: "2.1".into(),
///     name: "Foo-Bar".into(),
///     version: "1.0".into(),
///     ..Default::default()
/// };
/// let content = PythonPackageContent::new(
///     "Foo_Bar-1.0.tar.gz",
///     PackageType::Sdist,
///     ContentAddress::of(b"sdist bytes"),
///     metadata,
/// );
///
/// assert_eq!(content.natural_key(), "Foo_Bar-1.0.tar.gz");
/// assert_eq!(content.normalized_name(), "foo-bar");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonPackageContent {
    filename: String,
    packagetype: PackageType,
    artifact: ContentAddress,
    metadata: PackageMetadata,
}

impl PythonPackageContent {
    pub fn new(
        filename: impl Into<String>,
        packagetype: PackageType,
        artifact: ContentAddress,
        metadata: PackageMetadata,
    ) -> Self {
        Self {
            filename: filename.into(),
            packagetype,
            artifact,
            metadata,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn packagetype(&self) -> PackageType {
        self.packagetype
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    /// PEP 503 normalized project name.
    pub fn normalized_name(&self) -> String {
        crate::index::normalize_package_name(&self.metadata.name)
    }

    /// Lowercase hex SHA-256 of the artifact bytes.
    pub fn sha256(&self) -> &str {
        self.artifact.sha256()
    }

    pub fn metadata(&self) -> &PackageMetadata {
        &self.metadata
    }

    pub fn classifiers(&self) -> &[Classifier] {
        &self.metadata.classifiers
    }
}

impl Content for PythonPackageContent {
    const TYPE: &'static str = "python";

    fn natural_key(&self) -> &str {
        &self.filename
    }

    fn artifact(&self) -> &ContentAddress {
        &self.artifact
    }
}

/// One downloadable file listed by a remote index for a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFile {
    pub filename: String,
    /// Absolute download URL with the fragment stripped
    pub url: String,
    /// SHA-256 digest advertised by the index, lowercase hex
    pub sha256: Option<String>,
    pub requires_python: Option<String>,
    /// `Some(reason)` when the file is yanked (the reason may be empty)
    pub yanked: Option<String>,
    pub packagetype: Option<PackageType>,
    /// Version parsed from the filename, when it can be determined
    pub version: Option<String>,
}

impl ReleaseFile {
    pub fn is_yanked(&self) -> bool {
        self.yanked.is_some()
    }
}
