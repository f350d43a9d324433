//! End-to-end tests: manifests on disk, trust verification, sandboxed TCL
//! handlers and hot reload

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tcl_plugin_host::hooks::{ExecuteOptions, HookManager, HookType};
use tcl_plugin_host::plugin::{PluginError, PluginLifecycle, PluginLoader, PluginState};
use tcl_plugin_host::reload::{ChangeKind, FileWatcher, HotReloadManager, ReloadStrategy, WatcherConfig};
use tcl_plugin_host::security::{
    PolicyRegistry, SignatureAlgorithm, SigningKey, TrustError, TrustLevel, TrustStore, TrustedSigner,
};
use tempfile::TempDir;

/// Test fixture for integration tests
struct TestFixture {
    loader: Arc<PluginLoader>,
    trust: Arc<TrustStore>,
    _temp_dir: TempDir,
    root: PathBuf,
}

impl TestFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let trust = Arc::new(TrustStore::new());
        let loader = PluginLoader::new(HookManager::new(), trust.clone(), Arc::new(PolicyRegistry::new()));

        Self {
            loader: Arc::new(loader),
            trust,
            _temp_dir: temp_dir,
            root,
        }
    }

    fn hooks(&self) -> &HookManager {
        self.loader.hooks()
    }

    /// Write a plugin with one handler `handle` bound to `hook_type`
    fn write_plugin(&self, id: &str, policy: &str, priority: i32, hook_type: &str, source: &str) -> PathBuf {
        let dir = self.root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.tcl"), source).unwrap();
        let manifest = format!(
            r#"id = "{id}"
name = "{id}"
version = "1.0.0"
source = "main.tcl"
signature = "main.tcl.sig"
policy = {policy}

[[hooks]]
hook_type = "{hook_type}"
handler = "handle"
priority = {priority}
"#
        );
        let path = dir.join("plugin.toml");
        std::fs::write(&path, manifest).unwrap();
        path
    }

    fn add_signer(&self, level: TrustLevel) -> (String, SigningKey) {
        let key = SigningKey::generate(SignatureAlgorithm::Ed25519);
        let signer = TrustedSigner::new("Release team", Some("Acme".to_string()), &key.verification_key(), level);
        (self.trust.add_signer(signer).unwrap(), key)
    }

    fn sign(&self, id: &str, signer_id: &str, key: &SigningKey) {
        let dir = self.root.join(id);
        let source = std::fs::read(dir.join("main.tcl")).unwrap();
        let signature = self.trust.sign_plugin(id, &source, signer_id, key).unwrap();
        signature.save(&dir.join("main.tcl.sig")).unwrap();
    }
}

fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn appender(tag: &str) -> String {
    format!(
        "proc handle {{data}} {{\n    return [list modify [list order \"[dict get $data order] {}\"]]\n}}\n",
        tag
    )
}

#[tokio::test]
async fn test_signed_plugin_loads_and_dispatches() {
    let fixture = TestFixture::new();
    let source = r#"
proc handle {data plugin_id} {
    set rows [dict get $data null_rows]
    if {$rows > 10} {
        return [list modify [list severity high flagged_by $plugin_id]]
    }
    return ok
}
"#;
    let path = fixture.write_plugin("null-audit", "\"enterprise\"", 50, "on_issue_found", source);
    let (signer_id, key) = fixture.add_signer(TrustLevel::Trusted);
    fixture.sign("null-audit", &signer_id, &key);

    fixture.loader.load(&path).await.unwrap();
    assert_eq!(fixture.loader.state("null-audit"), Some(PluginState::Loaded));
    assert!(fixture.trust.signature("null-audit").unwrap().is_valid);
    assert_eq!(fixture.trust.get_signer(&signer_id).unwrap().plugins_signed, 1);

    let (context, results) = fixture
        .hooks()
        .dispatch_async(HookType::OnIssueFound, data(&[("null_rows", json!(42))]), Map::new())
        .await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(results[0].plugin_id.as_deref(), Some("null-audit"));
    assert_eq!(context.get("severity"), Some(&json!("high")));
    assert_eq!(context.get("flagged_by"), Some(&json!("null-audit")));

    let (context, _) = fixture
        .hooks()
        .dispatch_async(HookType::OnIssueFound, data(&[("null_rows", json!(3))]), Map::new())
        .await;
    assert!(context.get("severity").is_none());
}

#[tokio::test]
async fn test_tampered_plugin_rejected() {
    let fixture = TestFixture::new();
    let path = fixture.write_plugin("audit", "\"enterprise\"", 50, "on_issue_found", &appender("a"));
    let (signer_id, key) = fixture.add_signer(TrustLevel::Trusted);
    fixture.sign("audit", &signer_id, &key);

    std::fs::write(
        fixture.root.join("audit/main.tcl"),
        "proc handle {data} { return [list modify [list owned 1]] }",
    )
    .unwrap();

    let err = fixture.loader.load(&path).await.unwrap_err();
    assert!(matches!(
        err,
        PluginError::Trust(TrustError::SignatureInvalid { .. })
    ));
    assert!(matches!(fixture.loader.state("audit"), Some(PluginState::Failed(_))));
    assert!(fixture.hooks().is_empty());
    assert!(!fixture.trust.signature("audit").unwrap().is_valid);
}

#[tokio::test]
async fn test_revoked_signer_and_insufficient_trust() {
    let fixture = TestFixture::new();
    let path = fixture.write_plugin("audit", "\"enterprise\"", 50, "on_issue_found", &appender("a"));

    let (verified_id, verified_key) = fixture.add_signer(TrustLevel::Verified);
    fixture.sign("audit", &verified_id, &verified_key);
    let err = fixture.loader.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::Trust(TrustError::InsufficientTrust { .. })));

    let (trusted_id, trusted_key) = fixture.add_signer(TrustLevel::Trusted);
    fixture.sign("audit", &trusted_id, &trusted_key);
    fixture.trust.revoke_signer(&trusted_id, "key leaked").unwrap();
    let err = fixture.loader.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::Trust(TrustError::SignerRevoked { .. })));
    assert!(fixture.hooks().is_empty());
}

#[tokio::test]
async fn test_expired_signer_rejected() {
    let fixture = TestFixture::new();
    let path = fixture.write_plugin("audit", "\"enterprise\"", 50, "on_issue_found", &appender("a"));
    let (signer_id, key) = fixture.add_signer(TrustLevel::Trusted);
    fixture.sign("audit", &signer_id, &key);

    fixture
        .trust
        .set_expiry(&signer_id, Some(Utc::now() - chrono::Duration::hours(1)))
        .unwrap();
    let err = fixture.loader.load(&path).await.unwrap_err();
    assert!(matches!(err, PluginError::Trust(TrustError::SignerExpired(_))));
    assert!(fixture.hooks().is_empty());

    fixture.trust.set_expiry(&signer_id, None).unwrap();
    fixture.loader.load(&path).await.unwrap();
    assert_eq!(fixture.loader.state("audit"), Some(PluginState::Loaded));
}

#[tokio::test]
async fn test_priorities_run_in_order() {
    let fixture = TestFixture::new();
    for (tag, priority) in [("p90", 90), ("p10", 10), ("p50", 50)] {
        let path = unsigned(&fixture, tag, "\"development\"", priority, "before_validation", &appender(tag));
        fixture.loader.load(&path).await.unwrap();
    }

    let (context, results) = fixture
        .hooks()
        .dispatch_async(HookType::BeforeValidation, data(&[("order", json!(""))]), Map::new())
        .await;

    let handlers: Vec<&str> = results.iter().filter_map(|r| r.plugin_id.as_deref()).collect();
    assert_eq!(handlers, vec!["p10", "p50", "p90"]);
    assert_eq!(context.get("order").and_then(Value::as_str).map(str::trim), Some("p10 p50 p90"));
}

fn unsigned(fixture: &TestFixture, id: &str, policy: &str, priority: i32, hook_type: &str, source: &str) -> PathBuf {
    let path = fixture.write_plugin(id, policy, priority, hook_type, source);
    let manifest = std::fs::read_to_string(&path).unwrap().replace("signature = \"main.tcl.sig\"\n", "");
    std::fs::write(&path, manifest).unwrap();
    path
}

#[tokio::test]
async fn test_stop_on_error_end_to_end() {
    let fixture = TestFixture::new();
    let failing = unsigned(&fixture, "a", "\"development\"", 0, "on_error", "proc handle {} { error boom }");
    let marking = unsigned(
        &fixture,
        "b",
        "\"development\"",
        100,
        "on_error",
        "proc handle {} { return [list modify [list reached 1]] }",
    );
    fixture.loader.load(&failing).await.unwrap();
    fixture.loader.load(&marking).await.unwrap();

    let (context, results) = fixture
        .hooks()
        .execute_async(
            HookType::OnError,
            Map::new(),
            Map::new(),
            ExecuteOptions::default().stop_on_error(true),
        )
        .await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("boom"));
    assert!(context.get("reached").is_none());

    let (context, results) = fixture
        .hooks()
        .execute_async(HookType::OnError, Map::new(), Map::new(), ExecuteOptions::default())
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(context.get("reached"), Some(&json!(1)));
}

#[tokio::test]
async fn test_handler_timeout_from_policy() {
    let fixture = TestFixture::new();
    let policy = r#"{ name = "tight", isolation = "process", timeout_ms = 100 }"#;
    let path = unsigned(&fixture, "slow", policy, 50, "after_profile", "proc handle {} { after 2000; return ok }");
    fixture.loader.load(&path).await.unwrap();

    let started = Instant::now();
    let (_, results) = fixture
        .hooks()
        .dispatch_async(HookType::AfterProfile, Map::new(), Map::new())
        .await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("timeout"));
}

#[test]
fn test_watcher_reports_create_and_delete_once() {
    let dir = TempDir::new().unwrap();
    let watcher = FileWatcher::new(WatcherConfig::default());
    watcher.watch(dir.path());

    let file = dir.path().join("handler.tcl");
    std::fs::write(&file, "proc handle {} {}").unwrap();
    let events = watcher.poll_once();
    assert_eq!(events.len(), 1);
    assert_eq!((events[0].path.as_path(), events[0].kind), (file.as_path(), ChangeKind::Created));
    assert!(watcher.poll_once().is_empty());

    std::fs::remove_file(&file).unwrap();
    let events = watcher.poll_once();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Deleted);
    assert!(watcher.poll_once().is_empty());
}

#[tokio::test]
async fn test_hot_reload_applies_new_source() {
    let fixture = TestFixture::new();
    let path = unsigned(&fixture, "live", "\"development\"", 50, "on_report_generate", &appender("v1"));
    fixture.loader.load(&path).await.unwrap();

    let watcher = Arc::new(FileWatcher::new(WatcherConfig::default()));
    let lifecycle: Arc<dyn PluginLifecycle> = fixture.loader.clone();
    let reloader = HotReloadManager::new(lifecycle, watcher.clone());
    reloader.register("live", vec![plugin_dir(&path)], ReloadStrategy::Automatic);

    std::fs::write(fixture.root.join("live/main.tcl"), appender("v2-longer")).unwrap();
    let events = watcher.poll_once();
    assert_eq!(events.len(), 1);
    assert_eq!(reloader.handle_event(&events[0]).await, vec!["live".to_string()]);
    assert_eq!(reloader.status("live").unwrap().reload_count, 1);

    let (context, _) = fixture
        .hooks()
        .dispatch_async(HookType::OnReportGenerate, data(&[("order", json!(""))]), Map::new())
        .await;
    assert_eq!(context.get("order").and_then(Value::as_str).map(str::trim), Some("v2-longer"));
    assert_eq!(fixture.hooks().len(), 1);
}

fn plugin_dir(manifest: &Path) -> PathBuf {
    manifest.parent().unwrap().to_path_buf()
}
