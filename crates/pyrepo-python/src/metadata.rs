//! Core metadata parsing.
//!
//! Two sources are understood:
//!
//! - RFC 822 style `PKG-INFO` / `METADATA` documents (PEP 241, 314, 345,
//!   566, 643). Header names match case-insensitively, continuation lines
//!   are folded, multi-use headers accumulate, and a message body becomes
//!   the description when no `Description` header is present.
//! - The `[metadata]` and `[options]` sections of a setuptools `setup.cfg`,
//!   used for source distributions that ship no `PKG-INFO`.
//!
//! Unknown headers are kept verbatim in [`PackageMetadata::extra_fields`] and
//! unknown `Metadata-Version` values are accepted as-is.

use crate::error::{PythonError, Result};
use crate::types::PackageMetadata;
use std::collections::BTreeMap;

/// `Metadata-Version` recorded for metadata derived from `setup.cfg`.
pub const SETUP_CFG_METADATA_VERSION: &str = "2.1";

/// Legacy prefix setuptools puts before each continuation line of a
/// multi-line `Description` header.
const LEGACY_DESCRIPTION_PREFIX: &str = "        |";

/// Parses an RFC 822 style metadata document.
///
/// `filename` names the artifact in error messages only.
///
/// # Errors
///
/// Returns [`PythonError::MalformedArtifact`] when `Metadata-Version`,
/// `Name` or `Version` is missing or empty.
///
/// # Examples
///
/// ```
/// use pyrepo_python::metadata::parse_metadata;
///
/// let text = "Metadata-Version: 2.1\n\
///             Name: requests\n\
///             Version: 2.31.0\n\
///             Requires-Dist: idna<4,>=2.5\n\
///             Requires-Dist: urllib3<3,>=1.21.1\n\
///             \n\
///             Requests is an HTTP library.\n";
///
/// let metadata = parse_metadata("requests-2.31.0-py3-none-any.whl", text).unwrap();
/// assert_eq!(metadata.name, "requests");
/// assert_eq!(metadata.requires_dist.len(), 2);
/// assert_eq!(metadata.description.as_deref(), Some("Requests is an HTTP library."));
/// ```
pub fn parse_metadata(filename: &str, text: &str) -> Result<PackageMetadata> {
    let (headers, body) = split_headers(text);
    let mut metadata = PackageMetadata::default();

    for (key, value) in headers {
        apply_header(&mut metadata, key, value);
    }

    if metadata.description.is_none() {
        let body = body.trim_matches(|c| c == '\n' || c == '\r');
        if !body.trim().is_empty() {
            metadata.description = Some(body.to_string());
        }
    }

    require_core_fields(filename, &metadata)?;
    Ok(metadata)
}

/// Splits a document into folded `(name, value)` headers and the body.
fn split_headers(text: &str) -> (Vec<(&str, String)>, String) {
    let mut headers: Vec<(&str, String)> = Vec::new();
    let mut lines = text.lines();

    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }

        if line.starts_with([' ', '\t']) {
            if let Some((key, value)) = headers.last_mut() {
                fold_continuation(*key, value, line);
            } else {
                tracing::debug!("continuation line before any header ignored");
            }
            continue;
        }

        match line.split_once(':') {
            Some((key, value)) => headers.push((key.trim(), value.trim().to_string())),
            None => tracing::debug!("ignoring metadata line without a colon: {:?}", line),
        }
    }

    let body = lines.collect::<Vec<_>>().join("\n");
    (headers, body)
}

fn fold_continuation(key: &str, value: &mut String, line: &str) {
    if key.eq_ignore_ascii_case("description") {
        let stripped = line
            .strip_prefix(LEGACY_DESCRIPTION_PREFIX)
            .unwrap_or_else(|| strip_indent(line, LEGACY_DESCRIPTION_PREFIX.len() - 1));
        value.push('\n');
        value.push_str(stripped);
    } else {
        let stripped = line.trim();
        if !stripped.is_empty() {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(stripped);
        }
    }
}

/// Removes at most `max` leading whitespace characters.
fn strip_indent(line: &str, max: usize) -> &str {
    let indent = line
        .bytes()
        .take(max)
        .take_while(|b| *b == b' ' || *b == b'\t')
        .count();
    &line[indent..]
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn apply_header(metadata: &mut PackageMetadata, key: &str, value: String) {
    match key.to_ascii_lowercase().as_str() {
        "metadata-version" => metadata.metadata_version = value,
        "name" => metadata.name = value,
        "version" => metadata.version = value,
        "summary" => metadata.summary = non_empty(value),
        "description" => metadata.description = non_empty(value),
        "description-content-type" => metadata.description_content_type = non_empty(value),
        "keywords" => metadata.keywords.extend(split_keywords(&value)),
        "home-page" => metadata.home_page = non_empty(value),
        "download-url" => metadata.download_url = non_empty(value),
        "author" => metadata.author = non_empty(value),
        "author-email" => metadata.author_email = non_empty(value),
        "maintainer" => metadata.maintainer = non_empty(value),
        "maintainer-email" => metadata.maintainer_email = non_empty(value),
        "license" => metadata.license = non_empty(value),
        "requires-python" => metadata.requires_python = non_empty(value),
        "platform" => metadata.platforms.push(value),
        "supported-platform" => metadata.supported_platforms.push(value),
        "project-url" => metadata.project_urls.push(value),
        "classifier" => metadata.add_classifier(value),
        "requires-dist" => {
            metadata.requires_dist.insert(value);
        }
        "provides-dist" => {
            metadata.provides_dist.insert(value);
        }
        "obsoletes-dist" => {
            metadata.obsoletes_dist.insert(value);
        }
        "requires-external" => {
            metadata.requires_external.insert(value);
        }
        _ => metadata
            .extra_fields
            .entry(key.to_string())
            .or_default()
            .push(value),
    }
}

/// Splits a `Keywords` value on commas, or on whitespace when it has none.
///
/// # Examples
///
/// ```
/// use pyrepo_python::metadata::split_keywords;
///
/// assert_eq!(split_keywords("http, client ,"), vec!["http", "client"]);
/// assert_eq!(split_keywords("http client"), vec!["http", "client"]);
/// ```
pub fn split_keywords(value: &str) -> Vec<String> {
    let parts: Vec<&str> = if value.contains(',') {
        value.split(',').collect()
    } else {
        value.split_whitespace().collect()
    };
    parts
        .into_iter()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

fn require_core_fields(filename: &str, metadata: &PackageMetadata) -> Result<()> {
    let missing = [
        ("Metadata-Version", &metadata.metadata_version),
        ("Name", &metadata.name),
        ("Version", &metadata.version),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(field, _)| field)
    .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PythonError::malformed(
            filename,
            format!("missing required metadata: {}", missing.join(", ")),
        ))
    }
}

type IniSections = BTreeMap<String, BTreeMap<String, String>>;

/// Parses an INI document as written by setuptools.
///
/// Section and key names are lowercased; indented lines continue the
/// previous value and are joined with newlines.
fn parse_ini(text: &str) -> IniSections {
    let mut sections: IniSections = BTreeMap::new();
    let mut section: Option<String> = None;
    let mut key: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            if let (Some(s), Some(k)) = (&section, &key)
                && !trimmed.is_empty()
                && let Some(value) = sections.get_mut(s).and_then(|m| m.get_mut(k))
            {
                if !value.is_empty() {
                    value.push('\n');
                }
                value.push_str(trimmed);
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let name = name.trim().to_ascii_lowercase();
            sections.entry(name.clone()).or_default();
            section = Some(name);
            key = None;
            continue;
        }

        let Some(current) = &section else {
            continue;
        };
        let split = trimmed
            .find(['=', ':'])
            .map(|i| (&trimmed[..i], &trimmed[i + 1..]));
        if let Some((k, v)) = split {
            let k = k.trim().to_ascii_lowercase().replace('-', "_");
            sections
                .entry(current.clone())
                .or_default()
                .insert(k.clone(), v.trim().to_string());
            key = Some(k);
        }
    }

    sections
}

/// Values of a list-valued option: one per line, or comma separated on a
/// single line.
fn ini_list(value: &str) -> Vec<String> {
    let items: Vec<&str> = if value.contains('\n') {
        value.lines().collect()
    } else {
        value.split(',').collect()
    };
    items
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Whether a setup.cfg value is a directive setuptools resolves at build
/// time (`attr:` / `file:`), which cannot be evaluated here.
fn is_directive(value: &str) -> bool {
    let value = value.trim_start();
    value.starts_with("attr:") || value.starts_with("file:")
}

/// Builds metadata from a `setup.cfg` document.
///
/// The result always carries `Metadata-Version` [`SETUP_CFG_METADATA_VERSION`].
/// `fallback_version` (usually parsed from the sdist filename) is used when
/// the version is missing or is an `attr:` / `file:` directive.
///
/// # Errors
///
/// Returns [`PythonError::MalformedArtifact`] when there is no `[metadata]`
/// section or the name or version cannot be determined.
///
/// # Examples
///
/// ```
/// use pyrepo_python::metadata::parse_setup_cfg;
///
/// let cfg = "[metadata]\n\
///            name = Foo-Bar\n\
///            version = attr: foo_bar.__version__\n\
///            classifiers =\n    License :: OSI Approved :: MIT License\n\
///            \n\
///            [options]\n\
///            install_requires =\n    requests>=2\n";
///
/// let metadata = parse_setup_cfg("Foo-Bar-1.0.tar.gz", cfg, Some("1.0")).unwrap();
/// assert_eq!(metadata.metadata_version, "2.1");
/// assert_eq!(metadata.version, "1.0");
/// assert!(metadata.requires_dist.contains("requests>=2"));
/// ```
pub fn parse_setup_cfg(
    filename: &str,
    text: &str,
    fallback_version: Option<&str>,
) -> Result<PackageMetadata> {
    let mut sections = parse_ini(text);
    let Some(mut section) = sections.remove("metadata") else {
        return Err(PythonError::malformed(filename, "setup.cfg has no [metadata] section"));
    };
    let options = sections.remove("options").unwrap_or_default();

    let mut take = |key: &str| {
        section
            .remove(key)
            .filter(|v| !v.is_empty() && !is_directive(v))
    };

    let mut metadata = PackageMetadata {
        metadata_version: SETUP_CFG_METADATA_VERSION.to_string(),
        name: take("name").unwrap_or_default(),
        version: take("version")
            .or_else(|| fallback_version.map(String::from))
            .unwrap_or_default(),
        summary: take("description"),
        description: take("long_description"),
        description_content_type: take("long_description_content_type"),
        home_page: take("url").or_else(|| take("home_page")),
        download_url: take("download_url"),
        author: take("author"),
        author_email: take("author_email"),
        maintainer: take("maintainer"),
        maintainer_email: take("maintainer_email"),
        license: take("license"),
        ..Default::default()
    };

    if let Some(keywords) = take("keywords") {
        metadata.keywords = keywords
            .lines()
            .flat_map(split_keywords)
            .collect();
    }
    if let Some(platforms) = take("platforms") {
        metadata.platforms = ini_list(&platforms);
    }
    if let Some(classifiers) = take("classifiers") {
        for classifier in ini_list(&classifiers) {
            metadata.add_classifier(classifier);
        }
    }
    if let Some(urls) = take("project_urls") {
        metadata.project_urls = ini_list(&urls)
            .into_iter()
            .filter_map(|line| {
                line.split_once('=')
                    .map(|(label, url)| format!("{}, {}", label.trim(), url.trim()))
            })
            .collect();
    }

    for (key, value) in section {
        metadata.extra_fields.entry(key).or_default().push(value);
    }

    if let Some(python) = options.get("python_requires") {
        metadata.requires_python = non_empty(python.clone());
    }
    if let Some(requires) = options.get("install_requires") {
        metadata.requires_dist = ini_list(requires).into_iter().collect();
    }

    require_core_fields(filename, &metadata)?;
    Ok(metadata)
}
