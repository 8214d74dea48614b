//! Hook-backed editor and builder, driven through real shell scripts.

use std::path::Path;

use chrono::Utc;
use mailroom::engine::hooks::scratch_dir;
use mailroom::engine::{Editor, PipelineConfig, SiteBuilder};
use mailroom::model::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PIPELINE: &str = r#"
[pipeline]
edit = { command = "hooks/edit.sh" }
build = { command = "hooks/build.sh", output_dir = "dist" }
"#;

#[test]
fn pipeline_config_parses() {
    let config = PipelineConfig::parse(PIPELINE).unwrap();
    assert_eq!(config.edit.command, Path::new("hooks/edit.sh"));
    assert_eq!(config.build.output_dir, Path::new("dist"));

    assert!(PipelineConfig::parse("[pipeline]\nedit = { command = \"x\" }\n").is_err());
}

#[test]
fn missing_pipeline_file_is_a_config_error() {
    let err = PipelineConfig::load(Path::new("/nonexistent/pipeline.toml")).unwrap_err();
    assert!(err.to_string().contains("pipeline config"), "{err}");
}

#[cfg(unix)]
fn script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\nset -e\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn context() -> (ClaimContext, WorkRequest) {
    let pair = PairKey::new("site-1", "alice");
    let ctx = ClaimContext {
        pair: pair.clone(),
        worker_id: WorkerId::new("w1"),
        claim_token: ClaimToken::new(),
        input_queue: pair.input_queue(),
        output_queue: pair.output_queue(),
    };
    let request = WorkRequest {
        correlation_id: CorrelationId::new(),
        thread_id: ThreadId::new(),
        project_id: pair.project_id.clone(),
        user_id: pair.user_id.clone(),
        instruction: "make the banner blue".to_string(),
        source_ref: "/srv/site-1.git".to_string(),
        received_at: Utc::now(),
    };
    (ctx, request)
}

#[cfg(unix)]
#[tokio::test]
async fn hooks_see_the_request_and_report_back() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();

    let edit = script(
        dir.path(),
        "edit.sh",
        r#"printf '%s' "$MAILROOM_INSTRUCTION" > index.html
printf '{"summary":"Banner is %s","changed_files":["index.html"]}' "$MAILROOM_BRANCH" > "$MAILROOM_SCRATCH_DIR/edit-out.json""#,
    );
    let build = script(dir.path(), "build.sh", "mkdir -p dist && cp index.html dist/");
    let toml = format!(
        "[pipeline]\nedit = {{ command = {:?} }}\nbuild = {{ command = {:?}, output_dir = \"dist\" }}\n",
        edit.display().to_string(),
        build.display().to_string()
    );
    let config = PipelineConfig::parse(&toml).unwrap();
    let (ctx, request) = context();
    let cancel = CancellationToken::new();

    let outcome = config
        .editor()
        .edit(&ctx, &workspace, &request, &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.summary, format!("Banner is {}", request.branch_name()));
    assert_eq!(outcome.changed_files, vec!["index.html".to_string()]);
    assert_eq!(
        std::fs::read_to_string(workspace.join("index.html")).unwrap(),
        "make the banner blue"
    );
    assert!(!scratch_dir(&workspace).starts_with(&workspace));

    let artifact = config
        .builder()
        .build(&ctx, &workspace, &request, &cancel)
        .await
        .unwrap();
    assert_eq!(artifact, workspace.join("dist"));
    assert!(artifact.join("index.html").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn failing_hooks_map_to_their_step() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();

    let silent = script(dir.path(), "silent.sh", "true");
    let broken = script(dir.path(), "broken.sh", "exit 3");
    let toml = format!(
        "[pipeline]\nedit = {{ command = {:?} }}\nbuild = {{ command = {:?}, output_dir = \"dist\" }}\n",
        silent.display().to_string(),
        broken.display().to_string()
    );
    let config = PipelineConfig::parse(&toml).unwrap();
    let (ctx, request) = context();
    let cancel = CancellationToken::new();

    // Exit 0 without edit-out.json is still an edit failure.
    let err = config
        .editor()
        .edit(&ctx, &workspace, &request, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EditFailure);

    let err = config
        .builder()
        .build(&ctx, &workspace, &request, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildFailure);
    assert!(err.to_string().contains("status 3"), "{err}");
}

#[cfg(unix)]
#[tokio::test]
async fn cancelled_build_is_killed() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();

    let edit = script(dir.path(), "edit.sh", "true");
    let slow = script(dir.path(), "slow.sh", "sleep 30");
    let toml = format!(
        "[pipeline]\nedit = {{ command = {:?} }}\nbuild = {{ command = {:?}, output_dir = \"dist\" }}\n",
        edit.display().to_string(),
        slow.display().to_string()
    );
    let config = PipelineConfig::parse(&toml).unwrap();
    let (ctx, request) = context();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let err = config
        .builder()
        .build(&ctx, &workspace, &request, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, mailroom::error::Error::Cancelled), "{err:?}");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}
