//! Deployment sink publishing and content addressing.

use std::fs;
use std::path::Path;

use mailroom::deploy::{DeploymentSink, DirectorySink, artifact_digest};
use mailroom::model::{ErrorKind, PairKey};
use tempfile::TempDir;

fn write_site(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

#[tokio::test]
async fn publish_copies_the_artifact_and_names_it_by_content() {
    let dir = TempDir::new().unwrap();
    let artifact = dir.path().join("dist");
    write_site(&artifact, &[("index.html", "<h1>hi</h1>"), ("css/site.css", "h1{}")]);

    let sink = DirectorySink::new(dir.path().join("public"), "https://sites.test/");
    let reference = sink
        .publish(&PairKey::new("site-1", "alice"), &artifact)
        .await
        .unwrap();

    assert_eq!(reference.url, "https://sites.test/site-1/");
    assert_eq!(reference.digest, artifact_digest(&artifact).unwrap());
    assert_eq!(
        reference.to_wire(),
        format!("https://sites.test/site-1/?rev={}", &reference.digest[..12])
    );
    let published = dir.path().join("public/site-1");
    assert_eq!(fs::read_to_string(published.join("index.html")).unwrap(), "<h1>hi</h1>");
    assert_eq!(fs::read_to_string(published.join("css/site.css")).unwrap(), "h1{}");
}

#[tokio::test]
async fn republishing_identical_content_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let artifact = dir.path().join("dist");
    write_site(&artifact, &[("index.html", "v1")]);
    let sink = DirectorySink::new(dir.path().join("public"), "https://sites.test");
    let pair = PairKey::new("site-1", "alice");

    let first = sink.publish(&pair, &artifact).await.unwrap();
    // A file dropped into the published tree survives only if nothing is rewritten.
    let marker = dir.path().join("public/site-1/untouched");
    fs::write(&marker, "").unwrap();

    let second = sink.publish(&pair, &artifact).await.unwrap();
    assert_eq!(first, second);
    assert!(marker.exists());
}

#[tokio::test]
async fn changed_content_replaces_the_published_tree() {
    let dir = TempDir::new().unwrap();
    let artifact = dir.path().join("dist");
    write_site(&artifact, &[("index.html", "v1"), ("old.html", "gone soon")]);
    let sink = DirectorySink::new(dir.path().join("public"), "https://sites.test");
    let pair = PairKey::new("site-1", "alice");

    let first = sink.publish(&pair, &artifact).await.unwrap();
    fs::remove_file(artifact.join("old.html")).unwrap();
    fs::write(artifact.join("index.html"), "v2").unwrap();
    let second = sink.publish(&pair, &artifact).await.unwrap();

    assert_ne!(first.digest, second.digest);
    let published = dir.path().join("public/site-1");
    assert_eq!(fs::read_to_string(published.join("index.html")).unwrap(), "v2");
    assert!(!published.join("old.html").exists());

    let leftovers: Vec<_> = fs::read_dir(dir.path().join("public"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["site-1".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn users_of_one_project_publish_without_colliding() {
    let dir = TempDir::new().unwrap();
    let sink = DirectorySink::new(dir.path().join("public"), "https://sites.test");

    let mut tasks = Vec::new();
    for n in 0..8 {
        let artifact = dir.path().join(format!("dist-{n}"));
        let page = format!("build {n}");
        write_site(&artifact, &[("index.html", page.as_str())]);
        let sink = sink.clone();
        let pair = PairKey::new("site-1", format!("user-{}", n % 2));
        tasks.push(tokio::spawn(async move { sink.publish(&pair, &artifact).await }));
    }

    let mut digests = Vec::new();
    for task in tasks {
        digests.push(task.await.unwrap().unwrap().digest);
    }

    // Whichever publish ran last left a complete tree behind.
    let content = fs::read_to_string(dir.path().join("public/site-1/index.html")).unwrap();
    let n: usize = content.trim_start_matches("build ").parse().unwrap();
    let winner = artifact_digest(&dir.path().join(format!("dist-{n}"))).unwrap();
    assert!(digests.contains(&winner));

    let leftovers: Vec<_> = fs::read_dir(dir.path().join("public"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["site-1".to_string()]);
}

#[tokio::test]
async fn unsafe_project_id_is_a_deploy_failure() {
    let dir = TempDir::new().unwrap();
    let artifact = dir.path().join("dist");
    write_site(&artifact, &[("index.html", "v1")]);
    let sink = DirectorySink::new(dir.path().join("public"), "https://sites.test");

    for project in ["../escape", "a/b", ""] {
        let err = sink
            .publish(&PairKey::new(project, "alice"), &artifact)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeployFailure, "{project:?}");
    }
}

#[tokio::test]
async fn missing_artifact_is_a_deploy_failure() {
    let dir = TempDir::new().unwrap();
    let sink = DirectorySink::new(dir.path().join("public"), "https://sites.test");
    let err = sink
        .publish(&PairKey::new("site-1", "alice"), &dir.path().join("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeployFailure);
}

#[test]
fn digest_depends_on_paths_and_contents_only() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_site(a.path(), &[("x/1.txt", "one"), ("2.txt", "two")]);
    write_site(b.path(), &[("2.txt", "two"), ("x/1.txt", "one")]);
    assert_eq!(
        artifact_digest(a.path()).unwrap(),
        artifact_digest(b.path()).unwrap()
    );

    fs::rename(b.path().join("2.txt"), b.path().join("3.txt")).unwrap();
    assert_ne!(
        artifact_digest(a.path()).unwrap(),
        artifact_digest(b.path()).unwrap()
    );
}
