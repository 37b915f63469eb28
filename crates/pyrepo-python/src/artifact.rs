//! Reading metadata out of distribution archives.
//!
//! | Package type | Archive | Metadata file |
//! |---|---|---|
//! | wheel (`.whl`) | zip | `*.dist-info/METADATA`, else `PKG-INFO` |
//! | egg (`.egg`) | zip | `EGG-INFO/PKG-INFO` |
//! | sdist (`.tar.gz`, `.tgz`, `.tar.bz2`, `.zip`) | tar or zip | top-level `PKG-INFO`, else `setup.cfg` |

use crate::error::{PythonError, Result};
use crate::metadata::{parse_metadata, parse_setup_cfg};
use crate::types::{PackageMetadata, PackageType, SDIST_SUFFIXES};
use std::io::{Cursor, Read};
use std::path::{Component, Path};

/// Upper bound on the size of a metadata file read from an archive.
const MAX_METADATA_SIZE: u64 = 16 * 1024 * 1024;

/// Extracts and parses the metadata of a distribution artifact.
///
/// The artifact kind is detected from `filename`.
///
/// # Errors
///
/// Returns [`PythonError::MalformedArtifact`] when the filename has an
/// unsupported extension, the archive cannot be read, no metadata file is
/// present, or the metadata lacks a name, version or metadata version.
///
/// # Examples
///
/// ```no_run
/// use pyrepo_python::artifact::read_artifact;
///
/// let bytes = std::fs::read("requests-2.31.0-py3-none-any.whl").unwrap();
/// let metadata = read_artifact("requests-2.31.0-py3-none-any.whl", &bytes).unwrap();
/// assert_eq!(metadata.name, "requests");
/// ```
pub fn read_artifact(filename: &str, bytes: &[u8]) -> Result<PackageMetadata> {
    let packagetype = PackageType::from_filename(filename)
        .ok_or_else(|| PythonError::malformed(filename, "unsupported artifact type"))?;

    match packagetype {
        PackageType::BdistWheel => read_wheel(filename, bytes),
        PackageType::BdistEgg => read_egg(filename, bytes),
        PackageType::Sdist => read_sdist(filename, bytes),
    }
}

fn read_wheel(filename: &str, bytes: &[u8]) -> Result<PackageMetadata> {
    let mut archive = open_zip(filename, bytes)?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let entry = names
        .iter()
        .find(|n| is_dist_info_file(n, "METADATA"))
        .or_else(|| names.iter().find(|n| is_dist_info_file(n, "PKG-INFO")))
        .or_else(|| names.iter().find(|n| n.as_str() == "PKG-INFO"))
        .ok_or_else(|| PythonError::malformed(filename, "no .dist-info/METADATA in wheel"))?;

    let text = read_zip_entry(filename, &mut archive, entry)?;
    parse_metadata(filename, &text)
}

/// Matches `<something>.dist-info/<file>` at the archive root.
fn is_dist_info_file(name: &str, file: &str) -> bool {
    name.split_once('/').is_some_and(|(dir, rest)| {
        dir.ends_with(".dist-info") && rest == file
    })
}

fn read_egg(filename: &str, bytes: &[u8]) -> Result<PackageMetadata> {
    let mut archive = open_zip(filename, bytes)?;
    let text = read_zip_entry(filename, &mut archive, "EGG-INFO/PKG-INFO")?;
    parse_metadata(filename, &text)
}

fn read_sdist(filename: &str, bytes: &[u8]) -> Result<PackageMetadata> {
    let lower = filename.to_ascii_lowercase();
    let found = if lower.ends_with(".zip") {
        scan_zip_sdist(filename, bytes)?
    } else if lower.ends_with(".tar.bz2") {
        scan_tar_sdist(filename, bzip2::read::BzDecoder::new(Cursor::new(bytes)))?
    } else {
        scan_tar_sdist(filename, flate2::read::GzDecoder::new(Cursor::new(bytes)))?
    };

    match found {
        SdistMetadata {
            pkg_info: Some(text),
            ..
        } => parse_metadata(filename, &text),
        SdistMetadata {
            setup_cfg: Some(text),
            ..
        } => {
            let fallback = version_from_filename(filename);
            parse_setup_cfg(filename, &text, fallback.as_deref())
        }
        _ => Err(PythonError::malformed(
            filename,
            "no PKG-INFO or setup.cfg in source distribution",
        )),
    }
}

/// Metadata candidates found while scanning a source archive.
#[derive(Default)]
struct SdistMetadata {
    pkg_info: Option<String>,
    setup_cfg: Option<String>,
}

impl SdistMetadata {
    /// Records `path` if it is a top-level `PKG-INFO` or `setup.cfg`
    /// (either at the root or one directory deep).
    fn wants(&self, path: &Path) -> Option<SdistFile> {
        let parts: Vec<_> = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        if parts.len() > 2 {
            return None;
        }
        let name = parts.last()?.as_os_str().to_str()?;
        match name {
            "PKG-INFO" if self.pkg_info.is_none() => Some(SdistFile::PkgInfo),
            "setup.cfg" if self.setup_cfg.is_none() => Some(SdistFile::SetupCfg),
            _ => None,
        }
    }

    fn record(&mut self, file: SdistFile, text: String) {
        match file {
            SdistFile::PkgInfo => self.pkg_info = Some(text),
            SdistFile::SetupCfg => self.setup_cfg = Some(text),
        }
    }
}

#[derive(Clone, Copy)]
enum SdistFile {
    PkgInfo,
    SetupCfg,
}

fn scan_tar_sdist(filename: &str, reader: impl Read) -> Result<SdistMetadata> {
    let mut archive = tar::Archive::new(reader);
    let mut found = SdistMetadata::default();

    let entries = archive
        .entries()
        .map_err(|e| PythonError::malformed(filename, format!("unreadable archive: {}", e)))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| PythonError::malformed(filename, format!("corrupt archive: {}", e)))?;
        let wanted = match entry.path() {
            Ok(path) => found.wants(&path),
            Err(_) => None,
        };
        if let Some(file) = wanted {
            let text = read_limited(filename, entry)?;
            found.record(file, text);
        }
        if found.pkg_info.is_some() {
            break;
        }
    }

    Ok(found)
}

fn scan_zip_sdist(filename: &str, bytes: &[u8]) -> Result<SdistMetadata> {
    let mut archive = open_zip(filename, bytes)?;
    let mut found = SdistMetadata::default();

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    for name in names {
        if let Some(file) = found.wants(Path::new(&name)) {
            let text = read_zip_entry(filename, &mut archive, &name)?;
            found.record(file, text);
        }
    }

    Ok(found)
}

fn open_zip<'a>(filename: &str, bytes: &'a [u8]) -> Result<zip::ZipArchive<Cursor<&'a [u8]>>> {
    zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PythonError::malformed(filename, format!("unreadable zip archive: {}", e)))
}

fn read_zip_entry(
    filename: &str,
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    entry: &str,
) -> Result<String> {
    let file = archive
        .by_name(entry)
        .map_err(|e| PythonError::malformed(filename, format!("{}: {}", entry, e)))?;
    read_limited(filename, file)
}

/// Reads a metadata file, decoding it as UTF-8 with replacement.
fn read_limited(filename: &str, reader: impl Read) -> Result<String> {
    let mut data = Vec::new();
    reader
        .take(MAX_METADATA_SIZE)
        .read_to_end(&mut data)
        .map_err(|e| PythonError::malformed(filename, format!("failed to read metadata: {}", e)))?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Extracts the version from a distribution filename.
///
/// Wheels carry it as the second dash-separated field; eggs likewise;
/// sdists as everything after the last dash of the stem.
///
/// # Examples
///
/// ```
/// use pyrepo_python::artifact::version_from_filename;
///
/// assert_eq!(version_from_filename("requests-2.31.0-py3-none-any.whl").as_deref(), Some("2.31.0"));
/// assert_eq!(version_from_filename("foo_bar-1.0b1.tar.gz").as_deref(), Some("1.0b1"));
/// assert_eq!(version_from_filename("setuptools-0.6c11-py2.7.egg").as_deref(), Some("0.6c11"));
/// assert_eq!(version_from_filename("README.txt"), None);
/// ```
pub fn version_from_filename(filename: &str) -> Option<String> {
    let lower = filename.to_ascii_lowercase();
    let version = match PackageType::from_filename(filename)? {
        PackageType::BdistWheel | PackageType::BdistEgg => {
            let stem = &filename[..filename.rfind('.')?];
            stem.split('-').nth(1)?
        }
        PackageType::Sdist => {
            let suffix = SDIST_SUFFIXES.iter().find(|s| lower.ends_with(*s))?;
            let stem = &filename[..filename.len() - suffix.len()];
            stem.rsplit_once('-')?.1
        }
    };
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}
