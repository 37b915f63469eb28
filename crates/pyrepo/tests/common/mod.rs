//! Shared fixtures for host integration tests.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// Gzipped sdist with a `PKG-INFO` for `name`/`version`.
pub(crate) fn sdist(name: &str, version: &str) -> Vec<u8> {
    let pkg_info = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\nSummary: {} test package\nRequires-Python: >=3.8\n",
        name, version, name
    );
    let path = format!("{}-{}/PKG-INFO", name, version);

    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(pkg_info.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, pkg_info.as_bytes())
        .unwrap();
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

pub(crate) fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serves `project` from a PEP 503 page listing `files` under `/packages/`.
pub(crate) async fn serve_project(
    server: &mut mockito::ServerGuard,
    project: &str,
    files: &[(String, Vec<u8>)],
) {
    let mut page = String::from("<!DOCTYPE html><html><body>\n");
    for (filename, bytes) in files {
        page.push_str(&format!(
            "<a href=\"../../packages/{f}#sha256={d}\">{f}</a>\n",
            f = filename,
            d = sha256(bytes)
        ));
        server
            .mock("GET", format!("/packages/{}", filename).as_str())
            .with_body(bytes)
            .create_async()
            .await;
    }
    page.push_str("</body></html>\n");

    server
        .mock("GET", format!("/simple/{}/", project).as_str())
        .with_header("content-type", "text/html")
        .with_body(page)
        .create_async()
        .await;
}

/// Writes a host configuration file into `dir` and returns its path.
pub(crate) fn write_config(dir: &Path, config: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("pyrepo.json");
    std::fs::write(&path, serde_json::to_vec_pretty(config).unwrap()).unwrap();
    path
}
