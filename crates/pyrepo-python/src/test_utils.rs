//! Builders for in-memory distribution archives used by unit tests.

use std::io::Write;

/// Zip archive with the given `(path, contents)` entries.
pub(crate) fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (path, contents) in files {
        writer.start_file(*path, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Wheel containing `<name>-<version>.dist-info/METADATA`.
pub(crate) fn wheel_bytes(name: &str, version: &str, metadata: &str) -> Vec<u8> {
    let dist_info = format!("{}-{}.dist-info", name, version);
    zip_bytes(&[
        (format!("{}/__init__.py", name).as_str(), ""),
        (format!("{}/METADATA", dist_info).as_str(), metadata),
        (format!("{}/WHEEL", dist_info).as_str(), "Wheel-Version: 1.0\n"),
    ])
}

fn tar_into<W: Write>(writer: W, files: &[(&str, &str)]) -> W {
    let mut builder = tar::Builder::new(writer);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

/// Gzip-compressed tarball with the given entries.
pub(crate) fn sdist_tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    tar_into(encoder, files).finish().unwrap()
}

/// Bzip2-compressed tarball with the given entries.
pub(crate) fn sdist_tar_bz2(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    tar_into(encoder, files).finish().unwrap()
}

/// Minimal sdist for `name`/`version` with a `PKG-INFO`.
pub(crate) fn sdist_for(name: &str, version: &str) -> Vec<u8> {
    let pkg_info = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\nSummary: {} package\n",
        name, version, name
    );
    let path = format!("{}-{}/PKG-INFO", name, version);
    sdist_tar_gz(&[(path.as_str(), pkg_info.as_str())])
}
