//! End-to-end runs of the host library against a mock package index.

mod common;

use common::{sdist, serve_project, write_config};
use pyrepo::Host;
use pyrepo::config::HostConfig;
use pyrepo_core::{PublishState, SyncState};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn open(path: &std::path::Path) -> Host {
    let config = HostConfig::load(path).await.unwrap();
    Host::open(config).await.unwrap()
}

#[tokio::test]
async fn test_sync_then_publish() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let www = dir.path().join("www");

    serve_project(
        &mut server,
        "foo-bar",
        &[
            ("Foo_Bar-1.0.tar.gz".to_string(), sdist("Foo_Bar", "1.0")),
            ("Foo_Bar-2.0.tar.gz".to_string(), sdist("Foo_Bar", "2.0")),
        ],
    )
    .await;

    let path = write_config(
        dir.path(),
        &json!({
            "repositories": {
                "mirror": {
                    "sync": {
                        "remote_url": format!("{}/simple/", server.url()),
                        "projects": ["Foo.Bar"],
                        "max_retries": 1
                    },
                    "publish": { "base_path": www, "output_layout": "json" }
                }
            }
        }),
    );
    let host = open(&path).await;

    let report = host
        .run_sync("mirror", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.state, SyncState::Done);
    assert_eq!((report.added, report.removed, report.failed_count()), (2, 0, 0));
    assert_eq!(report.snapshot_version, Some(1));

    let report = host.run_publish("mirror").await.unwrap();
    assert_eq!(report.state, PublishState::Done);
    assert_eq!(report.projects, 1);

    let page = std::fs::read_to_string(www.join("simple/foo-bar/index.html")).unwrap();
    let first = page.find("Foo_Bar-1.0.tar.gz").unwrap();
    let second = page.find("Foo_Bar-2.0.tar.gz").unwrap();
    assert!(first < second);
    assert!(page.contains("data-requires-python=\"&gt;=3.8\""));
    assert!(www.join("packages/Foo_Bar-2.0.tar.gz").exists());

    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(www.join("pypi/foo-bar/json")).unwrap()).unwrap();
    assert_eq!(metadata["info"]["version"], "2.0");

    // Artifacts land in the content-addressed store under the config dir
    assert!(dir.path().join("artifacts").is_dir());
}

#[tokio::test]
async fn test_catalog_persists_between_hosts() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    serve_project(
        &mut server,
        "foo",
        &[("foo-1.0.tar.gz".to_string(), sdist("foo", "1.0"))],
    )
    .await;

    let path = write_config(
        dir.path(),
        &json!({
            "repositories": {
                "mirror": {
                    "sync": {
                        "remote_url": format!("{}/simple/", server.url()),
                        "projects": ["foo"]
                    }
                }
            }
        }),
    );

    let first = open(&path).await;
    let report = first
        .run_sync("mirror", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.added, 1);
    drop(first);

    assert!(dir.path().join("catalog.json").exists());

    let second = open(&path).await;
    let history = second.snapshots("mirror").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content_count, 1);

    // Unchanged remote: nothing to do, no new snapshot
    let report = second
        .run_sync("mirror", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((report.added, report.removed), (0, 0));
    assert_eq!(report.snapshot_version, Some(1));
    assert_eq!(second.snapshots("mirror").unwrap().len(), 1);
}

#[tokio::test]
async fn test_keep_snapshots_prunes_history() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    serve_project(
        &mut server,
        "foo",
        &[("foo-1.0.tar.gz".to_string(), sdist("foo", "1.0"))],
    )
    .await;
    serve_project(
        &mut server,
        "bar",
        &[("bar-1.0.tar.gz".to_string(), sdist("bar", "1.0"))],
    )
    .await;

    let remote = format!("{}/simple/", server.url());
    let config = |projects: &[&str]| {
        json!({
            "keep_snapshots": 1,
            "repositories": {
                "mirror": { "sync": { "remote_url": remote, "projects": projects } }
            }
        })
    };

    let path = write_config(dir.path(), &config(&["foo"]));
    let host = open(&path).await;
    host.run_sync("mirror", CancellationToken::new()).await.unwrap();
    drop(host);

    let path = write_config(dir.path(), &config(&["foo", "bar"]));
    let host = open(&path).await;
    let report = host.run_sync("mirror", CancellationToken::new()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.snapshot_version, Some(2));

    let history = host.snapshots("mirror").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 2);
    assert_eq!(history[0].content_count, 2);
}

#[tokio::test]
async fn test_failed_project_is_reported() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();

    serve_project(
        &mut server,
        "foo",
        &[("foo-1.0.tar.gz".to_string(), sdist("foo", "1.0"))],
    )
    .await;
    server
        .mock("GET", "/simple/missing/")
        .with_status(404)
        .create_async()
        .await;

    let path = write_config(
        dir.path(),
        &json!({
            "repositories": {
                "mirror": {
                    "sync": {
                        "remote_url": format!("{}/simple/", server.url()),
                        "projects": ["foo", "missing"]
                    }
                }
            }
        }),
    );
    let host = open(&path).await;

    let report = host
        .run_sync("mirror", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.state, SyncState::Done);
    assert_eq!(report.added, 1);
    assert_eq!(report.failed_projects.len(), 1);
    assert!(report.failed_projects[0].reason.contains("not found"));
}
