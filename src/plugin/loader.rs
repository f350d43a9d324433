//! Plugin loader
//!
//! Loading runs, in order: policy resolution, trust verification, manifest
//! validation against the source, static analysis, and finally one hook
//! registration per `[[hooks]]` entry. Any failure leaves no registrations
//! behind and records the plugin as failed.

use crate::hooks::{
    ExecuteOptions, HookManager, HookType, RegistrationOptions, TclScriptHandler,
};
use crate::plugin::{PluginError, PluginLifecycle, PluginManifest, PluginResult, PluginState};
use crate::sandbox::{CodeAnalyzer, SandboxExecutor};
use crate::security::{
    PluginSignature, PolicyRegistry, PolicySelection, SecurityPolicy, TrustDecision, TrustStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Summary of a known plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub policy: Option<String>,
    pub signer_id: Option<String>,
    pub hooks: usize,
    pub manifest_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

struct LoadedPlugin {
    manifest: PluginManifest,
    manifest_path: PathBuf,
    state: PluginState,
    policy: Option<SecurityPolicy>,
    decision: Option<TrustDecision>,
    /// Registrations enabled by the manifest; toggled by enable/disable
    active: Vec<String>,
    registrations: Vec<String>,
    loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    fn failed(manifest: PluginManifest, manifest_path: PathBuf, reason: String) -> Self {
        Self {
            manifest,
            manifest_path,
            state: PluginState::Failed(reason),
            policy: None,
            decision: None,
            active: Vec::new(),
            registrations: Vec::new(),
            loaded_at: Utc::now(),
        }
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            state: self.state.clone(),
            policy: self.policy.as_ref().map(|p| p.name.clone()),
            signer_id: self.decision.as_ref().and_then(|d| d.signer_id.clone()),
            hooks: self.registrations.len(),
            manifest_path: self.manifest_path.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Loads plugins from manifests and keeps their hook registrations in sync
pub struct PluginLoader {
    hooks: HookManager,
    trust: Arc<TrustStore>,
    policies: Arc<PolicyRegistry>,
    analyzer: CodeAnalyzer,
    default_policy: PolicySelection,
    max_output_size: Option<usize>,
    recursion_limit: Option<usize>,
    plugins: DashMap<String, LoadedPlugin>,
}

impl PluginLoader {
    pub fn new(hooks: HookManager, trust: Arc<TrustStore>, policies: Arc<PolicyRegistry>) -> Self {
        Self {
            hooks,
            trust,
            policies,
            analyzer: CodeAnalyzer::new(),
            default_policy: PolicySelection::default(),
            max_output_size: None,
            recursion_limit: None,
            plugins: DashMap::new(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: CodeAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Policy for manifests that do not name one
    pub fn with_default_policy(mut self, name: impl Into<String>) -> Self {
        self.default_policy = PolicySelection::Named(name.into());
        self
    }

    /// Override the output ceiling and recursion limit of every plugin sandbox
    pub fn with_sandbox_tuning(mut self, max_output_size: usize, recursion_limit: usize) -> Self {
        self.max_output_size = Some(max_output_size);
        self.recursion_limit = Some(recursion_limit);
        self
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Load every `plugin.toml` found one level below `dir`
    ///
    /// Failures are logged and recorded; the ids of loaded plugins are returned.
    pub async fn load_dir(&self, dir: &Path) -> PluginResult<Vec<String>> {
        let mut loaded = Vec::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("plugin.toml"))
            .filter(|path| path.is_file())
            .collect();
        entries.sort();

        for manifest_path in entries {
            match self.load(&manifest_path).await {
                Ok(id) => loaded.push(id),
                Err(e) => warn!(path = %manifest_path.display(), "Skipping plugin: {}", e),
            }
        }
        Ok(loaded)
    }

    fn prepare(&self, manifest: &PluginManifest) -> PluginResult<LoadedPlugin> {
        let plugin_id = manifest.id.as_str();
        let selection = manifest.policy.as_ref().unwrap_or(&self.default_policy);
        let policy = self.policies.resolve(selection).ok_or_else(|| match selection {
            PolicySelection::Named(name) => PluginError::UnknownPolicy(name.clone()),
            PolicySelection::Custom(policy) => PluginError::UnknownPolicy(policy.name.clone()),
        })?;

        let source = std::fs::read_to_string(manifest.source_path())?;
        let signature = match manifest.signature_path() {
            Some(path) => Some(PluginSignature::load(&path)?),
            None => None,
        };

        let decision = self
            .trust
            .verify_plugin(plugin_id, source.as_bytes(), signature.as_ref(), &policy)?;

        manifest.validate(&source)?;

        let report = self.analyzer.analyze(&source);
        if !report.is_clean() {
            return Err(PluginError::Analysis {
                plugin_id: plugin_id.to_string(),
                issues: report.issues,
            });
        }
        for warning in &report.warnings {
            debug!(plugin_id = %plugin_id, "Analysis warning: {}", warning);
        }

        let mut sandbox = policy.sandbox_config();
        if let Some(max_output_size) = self.max_output_size {
            sandbox.max_output_size = max_output_size;
        }
        if let Some(recursion_limit) = self.recursion_limit {
            sandbox.limits.recursion_limit = recursion_limit;
        }
        let executor = SandboxExecutor::new(sandbox).with_analyzer(self.analyzer.clone());
        let source: Arc<str> = Arc::from(source);

        let mut registrations = Vec::new();
        let mut active = Vec::new();
        for hook in &manifest.hooks {
            let registered = TclScriptHandler::new(hook.handler.clone(), source.clone(), executor.clone())
                .map_err(PluginError::from)
                .and_then(|handler| {
                    let handler = handler.with_plugin_id(plugin_id);
                    let mut options = RegistrationOptions::for_plugin(plugin_id)
                        .with_name(format!("{}::{}", plugin_id, hook.handler))
                        .with_priority(hook.priority);
                    for (key, value) in &hook.conditions {
                        options = options.with_condition(key.clone(), value.clone());
                    }
                    for (key, value) in &hook.metadata {
                        options = options.with_metadata(key.clone(), value.clone());
                    }
                    if let Some(rule) = &hook.when {
                        options = options.with_rule(rule.clone());
                    }
                    if !hook.enabled {
                        options = options.disabled();
                    }
                    Ok(self.hooks.register(hook.hook_type, handler, options)?)
                });

            match registered {
                Ok(id) => {
                    if hook.enabled {
                        active.push(id.clone());
                    }
                    registrations.push(id);
                }
                Err(e) => {
                    self.hooks.unregister_plugin(plugin_id);
                    return Err(e);
                }
            }
        }

        Ok(LoadedPlugin {
            manifest: manifest.clone(),
            manifest_path: PathBuf::new(),
            state: PluginState::Loaded,
            policy: Some(policy),
            decision: Some(decision),
            active,
            registrations,
            loaded_at: Utc::now(),
        })
    }

    async fn announce(&self, hook_type: HookType, plugin_id: &str, data: Map<String, Value>) {
        let options = ExecuteOptions::default().triggered_by(plugin_id);
        let (_, results) = self.hooks.execute_async(hook_type, data, Map::new(), options).await;
        for failure in results.iter().filter(|r| !r.success) {
            warn!(
                hook_type = %hook_type,
                plugin_id = %plugin_id,
                handler = %failure.handler_name,
                "Lifecycle handler failed: {}",
                failure.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    fn describe(plugin: &PluginInfo) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("plugin_id".to_string(), json!(plugin.id));
        data.insert("name".to_string(), json!(plugin.name));
        data.insert("version".to_string(), json!(plugin.version));
        data.insert("signed".to_string(), json!(plugin.signer_id.is_some()));
        data
    }

    fn transition(&self, plugin_id: &str, enable: bool) -> PluginResult<Option<PluginInfo>> {
        let mut plugin = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        let target = if enable { PluginState::Loaded } else { PluginState::Disabled };
        match &plugin.state {
            PluginState::Failed(_) => {
                return Err(PluginError::InvalidState {
                    plugin_id: plugin_id.to_string(),
                    state: plugin.state.clone(),
                })
            }
            state if *state == target => return Ok(None),
            _ => {}
        }

        for registration_id in &plugin.active {
            self.hooks.set_enabled(registration_id, enable)?;
        }
        plugin.state = target;
        Ok(Some(plugin.info()))
    }
}

#[async_trait]
impl PluginLifecycle for PluginLoader {
    async fn load(&self, manifest_path: &Path) -> PluginResult<String> {
        let manifest = PluginManifest::from_file(manifest_path)?;
        let plugin_id = manifest.id.clone();

        if let Some(existing) = self.plugins.get(&plugin_id) {
            if !matches!(existing.state, PluginState::Failed(_)) {
                return Err(PluginError::AlreadyLoaded(plugin_id));
            }
        }

        match self.prepare(&manifest) {
            Ok(mut plugin) => {
                plugin.manifest_path = manifest_path.to_path_buf();
                let info = plugin.info();
                self.plugins.insert(plugin_id.clone(), plugin);
                info!(
                    plugin_id = %plugin_id,
                    version = %info.version,
                    hooks = info.hooks,
                    signed = info.signer_id.is_some(),
                    "Plugin loaded"
                );
                self.announce(HookType::OnPluginLoad, &plugin_id, Self::describe(&info)).await;
                Ok(plugin_id)
            }
            Err(e) => {
                error!(plugin_id = %plugin_id, "Plugin failed to load: {}", e);
                let failed = LoadedPlugin::failed(manifest, manifest_path.to_path_buf(), e.to_string());
                self.plugins.insert(plugin_id, failed);
                Err(e)
            }
        }
    }

    async fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        let info = self
            .plugins
            .get(plugin_id)
            .map(|p| p.info())
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        if info.state == PluginState::Loaded {
            self.announce(HookType::OnPluginUnload, plugin_id, Self::describe(&info)).await;
        }

        let removed = self.hooks.unregister_plugin(plugin_id);
        self.plugins.remove(plugin_id);
        info!(plugin_id = %plugin_id, registrations = removed, "Plugin unloaded");
        Ok(())
    }

    async fn enable(&self, plugin_id: &str) -> PluginResult<()> {
        if let Some(info) = self.transition(plugin_id, true)? {
            info!(plugin_id = %plugin_id, "Plugin enabled");
            self.announce(HookType::OnPluginEnable, plugin_id, Self::describe(&info)).await;
        }
        Ok(())
    }

    async fn disable(&self, plugin_id: &str) -> PluginResult<()> {
        if let Some(info) = self.transition(plugin_id, false)? {
            info!(plugin_id = %plugin_id, "Plugin disabled");
            self.announce(HookType::OnPluginDisable, plugin_id, Self::describe(&info)).await;
        }
        Ok(())
    }

    async fn reload(&self, plugin_id: &str) -> PluginResult<()> {
        let manifest_path = self
            .plugins
            .get(plugin_id)
            .map(|p| p.manifest_path.clone())
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        self.unload(plugin_id).await?;
        let reloaded = self.load(&manifest_path).await?;
        if reloaded != plugin_id {
            warn!(plugin_id = %plugin_id, new_id = %reloaded, "Plugin id changed on reload");
        }
        Ok(())
    }

    fn state(&self, plugin_id: &str) -> Option<PluginState> {
        self.plugins.get(plugin_id).map(|p| p.state.clone())
    }

    fn list(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self.plugins.iter().map(|p| p.info()).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FnHandler, HookContext, HookError};
    use crate::security::{SignatureAlgorithm, SigningKey, TrustLevel, TrustedSigner};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const SOURCE: &str = r#"
proc on_issue {data} {
    if {[dict get $data severity] == "high"} {
        return [list modify [list escalated 1]]
    }
    return ok
}
"#;

    fn write_plugin(dir: &Path, id: &str, policy: &str, signed: bool, source: &str) -> PathBuf {
        let plugin_dir = dir.join(id);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("main.tcl"), source).unwrap();
        let signature = if signed { "signature = \"main.tcl.sig\"\n" } else { "" };
        let manifest = format!(
            "id = \"{id}\"\nname = \"{id}\"\nversion = \"0.1.0\"\nsource = \"main.tcl\"\n{signature}policy = \"{policy}\"\n\n[[hooks]]\nhook_type = \"on_issue_found\"\nhandler = \"on_issue\"\n"
        );
        let path = plugin_dir.join("plugin.toml");
        std::fs::write(&path, manifest).unwrap();
        path
    }

    fn loader() -> PluginLoader {
        PluginLoader::new(HookManager::new(), Arc::new(TrustStore::new()), Arc::new(PolicyRegistry::new()))
    }

    fn issue(severity: &str) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("severity".to_string(), json!(severity));
        data
    }

    #[tokio::test]
    async fn test_load_unsigned_under_development() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "audit", "development", false, SOURCE);
        let loader = loader();

        let id = loader.load(&path).await.unwrap();
        assert_eq!(id, "audit");
        assert_eq!(loader.state("audit"), Some(PluginState::Loaded));
        assert_eq!(loader.hooks().list(Some(HookType::OnIssueFound)).len(), 1);

        let (context, results) = loader.hooks().dispatch(HookType::OnIssueFound, issue("high"), Map::new());
        assert!(results[0].success);
        assert_eq!(context.get("escalated"), Some(&json!(1)));

        assert!(matches!(loader.load(&path).await, Err(PluginError::AlreadyLoaded(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failing_lifecycle_handler_does_not_block_load() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "audit", "development", false, SOURCE);
        let loader = loader();
        loader
            .hooks()
            .register(
                HookType::OnPluginLoad,
                FnHandler::new("load-auditor", |_ctx: &mut HookContext| {
                    Err(HookError::Custom("auditor offline".to_string()))
                }),
                RegistrationOptions::default().with_name("load-auditor"),
            )
            .unwrap();

        loader.load(&path).await.unwrap();
        assert_eq!(loader.state("audit"), Some(PluginState::Loaded));
        assert!(logs_contain("Lifecycle handler failed"));
        assert!(logs_contain("auditor offline"));
    }

    #[tokio::test]
    async fn test_unsigned_rejected_under_enterprise() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "audit", "enterprise", false, SOURCE);
        let loader = loader();

        let err = loader.load(&path).await.unwrap_err();
        assert!(matches!(err, PluginError::Trust(_)));
        assert!(matches!(loader.state("audit"), Some(PluginState::Failed(_))));
        assert!(loader.hooks().is_empty());
    }

    #[tokio::test]
    async fn test_signed_plugin_loads() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "audit", "enterprise", true, SOURCE);
        let loader = loader();

        let key = SigningKey::generate(SignatureAlgorithm::Ed25519);
        let signer = TrustedSigner::new("Release", Some("Acme".to_string()), &key.verification_key(), TrustLevel::Trusted);
        let signer_id = loader.trust_store().add_signer(signer).unwrap();
        let signature = loader
            .trust_store()
            .sign_plugin("audit", SOURCE.as_bytes(), &signer_id, &key)
            .unwrap();
        signature.save(&dir.path().join("audit/main.tcl.sig")).unwrap();

        loader.load(&path).await.unwrap();
        let info = &loader.list()[0];
        assert_eq!(info.signer_id.as_deref(), Some(signer_id.as_str()));
        assert_eq!(info.policy.as_deref(), Some("enterprise"));
    }

    #[tokio::test]
    async fn test_analysis_failure_leaves_no_registrations() {
        let dir = TempDir::new().unwrap();
        let source = "proc on_issue {data} { exec rm -rf / }";
        let path = write_plugin(dir.path(), "evil", "development", false, source);
        let loader = loader();

        let err = loader.load(&path).await.unwrap_err();
        assert!(matches!(err, PluginError::Analysis { .. }));
        assert!(err.to_string().contains("exec"));
        assert!(loader.hooks().is_empty());
    }

    #[tokio::test]
    async fn test_enable_disable_unload() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "audit", "development", false, SOURCE);
        let loader = loader();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for hook_type in [HookType::OnPluginLoad, HookType::OnPluginDisable, HookType::OnPluginEnable, HookType::OnPluginUnload] {
            let seen = seen.clone();
            loader
                .hooks()
                .register(
                    hook_type,
                    FnHandler::new("observer", move |ctx: &mut HookContext| {
                        seen.lock().unwrap().push(ctx.hook_type());
                        Ok(None)
                    }),
                    RegistrationOptions::default(),
                )
                .unwrap();
        }

        loader.load(&path).await.unwrap();
        loader.disable("audit").await.unwrap();
        assert_eq!(loader.state("audit"), Some(PluginState::Disabled));
        let (context, results) = loader.hooks().dispatch(HookType::OnIssueFound, issue("high"), Map::new());
        assert!(results.is_empty());
        assert!(context.get("escalated").is_none());

        // no-op when already disabled
        loader.disable("audit").await.unwrap();
        loader.enable("audit").await.unwrap();
        let (_, results) = loader.hooks().dispatch(HookType::OnIssueFound, issue("high"), Map::new());
        assert_eq!(results.len(), 1);

        loader.unload("audit").await.unwrap();
        assert_eq!(loader.state("audit"), None);
        assert_eq!(loader.hooks().list(Some(HookType::OnIssueFound)).len(), 0);
        assert!(matches!(loader.unload("audit").await, Err(PluginError::NotFound(_))));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                HookType::OnPluginLoad,
                HookType::OnPluginDisable,
                HookType::OnPluginEnable,
                HookType::OnPluginUnload
            ]
        );
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let path = write_plugin(dir.path(), "audit", "development", false, SOURCE);
        let loader = loader();
        loader.load(&path).await.unwrap();

        std::fs::write(
            dir.path().join("audit/main.tcl"),
            "proc on_issue {} { return [list modify [list reloaded 1]] }",
        )
        .unwrap();
        loader.reload("audit").await.unwrap();

        let (context, _) = loader.hooks().dispatch(HookType::OnIssueFound, issue("low"), Map::new());
        assert_eq!(context.get("reloaded"), Some(&json!(1)));
        assert_eq!(loader.hooks().len(), 1);
    }

    #[tokio::test]
    async fn test_load_dir() {
        let dir = TempDir::new().unwrap();
        write_plugin(dir.path(), "a", "development", false, SOURCE);
        write_plugin(dir.path(), "b", "enterprise", false, SOURCE);
        let loader = loader();

        let loaded = loader.load_dir(dir.path()).await.unwrap();
        assert_eq!(loaded, vec!["a".to_string()]);
        assert_eq!(loader.list().len(), 2);
    }
}
