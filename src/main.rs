use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcl_plugin_host::config::HostConfig;
use tcl_plugin_host::hooks::context::into_map;
use tcl_plugin_host::hooks::{HookPriority, LoggingHandler, LoggingObserver, MetricsHandler, RegistrationOptions};
use tcl_plugin_host::platform_dirs;
use tcl_plugin_host::plugin::{PluginLifecycle, PluginManifest};
use tcl_plugin_host::reload::{FileWatcher, HotReloadManager};
use tcl_plugin_host::sandbox::{CodeAnalyzer, SandboxExecutor};
use tcl_plugin_host::security::{
    PluginSignature, PolicySelection, SignatureAlgorithm, SigningKey, TrustLevel, TrustStore, TrustedSigner,
    VerificationKey,
};
use tcl_plugin_host::{logging, HookManager, HookType, PluginLoader};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "tcl-plugin-host")]
#[command(about = "Host for sandboxed, signed TCL hook plugins")]
#[command(version)]
struct Cli {
    /// Host configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Statically analyze a TCL file
    Analyze { file: PathBuf },

    /// Run a TCL file in the sandbox
    Run {
        file: PathBuf,

        /// Proc to call after the file is evaluated
        #[arg(long)]
        entry: Option<String>,

        /// Entry argument, `name=value` (value parsed as JSON when possible)
        #[arg(long = "arg", value_parser = parse_pair)]
        args: Vec<(String, Value)>,

        /// Global variable, `name=value`
        #[arg(long = "bind", value_parser = parse_pair)]
        bindings: Vec<(String, Value)>,

        /// Use the sandbox settings of a named policy
        #[arg(long)]
        policy: Option<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Generate a signing key
    Keygen {
        /// ed25519 or blake3
        #[arg(long, default_value = "ed25519")]
        algorithm: String,

        /// Where to write the private key
        #[arg(long)]
        out: PathBuf,
    },

    /// Manage trusted signers
    Signer {
        #[command(subcommand)]
        command: SignerCommand,
    },

    /// Sign a plugin's source and write its detached signature
    Sign {
        manifest: PathBuf,

        #[arg(long)]
        signer: String,

        #[arg(long)]
        key_file: PathBuf,
    },

    /// Check a plugin against its policy and the trust store
    Verify { manifest: PathBuf },

    /// Load plugins and dispatch one hook
    Dispatch {
        hook_type: String,

        /// JSON object
        #[arg(long, default_value = "{}")]
        data: String,

        /// JSON object
        #[arg(long, default_value = "{}")]
        metadata: String,
    },

    /// Load plugins and reload them as their files change
    Watch,
}

#[derive(Subcommand)]
enum SignerCommand {
    /// Trust a signing key; blake3 shared secrets are kept in the trust store file
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        organization: Option<String>,

        /// Derive the public key from a private key file
        #[arg(long, conflicts_with = "public_key")]
        key_file: Option<PathBuf>,

        /// Hex public key
        ///
        /// For blake3 this is the shared secret itself; it is stored in plain
        /// text in the trust store file, which must be protected like a key file.
        #[arg(long)]
        public_key: Option<String>,

        #[arg(long, default_value = "ed25519")]
        algorithm: String,

        #[arg(long, default_value = "verified")]
        level: String,

        #[arg(long)]
        expires_days: Option<i64>,
    },

    Revoke {
        signer_id: String,

        #[arg(long)]
        reason: String,
    },

    List,
}

fn parse_pair(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_key_file(path: &Path) -> Result<SigningKey> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading key file {}", path.display()))?;
    let (algorithm, key) = text
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("key file {} is not in 'algorithm:hex' form", path.display()))?;
    Ok(SigningKey::from_hex(algorithm.parse()?, key)?)
}

struct Host {
    config: HostConfig,
    hooks: HookManager,
    trust: Arc<TrustStore>,
    trust_path: PathBuf,
    loader: Arc<PluginLoader>,
}

impl Host {
    fn new(config: HostConfig) -> Result<Self> {
        let hooks = HookManager::new().with_max_history(config.system.max_history);
        hooks.set_system_enabled(config.system.hooks_enabled);
        hooks
            .lifecycle()
            .register_observer(Arc::new(LoggingObserver::new(Level::DEBUG)))
            .map_err(anyhow::Error::msg)?;

        let trust_path = config.trust_store_path()?;
        let trust = Arc::new(TrustStore::load_or_default(&trust_path)?);
        let loader = PluginLoader::new(hooks.clone(), trust.clone(), Arc::new(config.policy_registry()))
            .with_default_policy(config.system.default_policy.clone())
            .with_sandbox_tuning(config.sandbox.max_output_size, config.sandbox.recursion_limit);

        Ok(Self {
            config,
            hooks,
            trust,
            trust_path,
            loader: Arc::new(loader),
        })
    }

    async fn load_plugins(&self) -> Result<Vec<String>> {
        let dir = self.config.plugins_dir()?;
        if !dir.is_dir() {
            info!(path = %dir.display(), "No plugins directory");
            return Ok(Vec::new());
        }
        Ok(self.loader.load_dir(&dir).await?)
    }

    fn save_trust(&self) -> Result<()> {
        if let Some(parent) = self.trust_path.parent() {
            platform_dirs::ensure_dir(parent)?;
        }
        self.trust.save(&self.trust_path)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => platform_dirs::config_path()?,
    };
    let config = HostConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let _guard = logging::init(&config.logging)?;

    match cli.command {
        Commands::Analyze { file } => {
            let code = std::fs::read_to_string(&file)?;
            let report = CodeAnalyzer::new().analyze(&code);
            print_json(&report)?;
            if !report.is_clean() {
                bail!("{} issue(s) found", report.issues.len());
            }
        }

        Commands::Run {
            file,
            entry,
            args,
            bindings,
            policy,
            timeout_ms,
        } => {
            let code = std::fs::read_to_string(&file)?;
            let mut sandbox = match policy {
                Some(name) => config
                    .policy_registry()
                    .get(&name)
                    .ok_or_else(|| anyhow!("unknown policy '{}'", name))?
                    .sandbox_config(),
                None => config.sandbox.sandbox_config(),
            };
            if let Some(timeout_ms) = timeout_ms {
                sandbox.limits.timeout_ms = timeout_ms;
            }

            let bindings: Map<String, Value> = bindings.into_iter().collect();
            let args: Map<String, Value> = args.into_iter().collect();
            let result = SandboxExecutor::new(sandbox).execute(&code, &bindings, entry.as_deref(), &args);
            print_json(&result)?;
            if !result.success {
                bail!(result.error.unwrap_or_default());
            }
        }

        Commands::Keygen { algorithm, out } => {
            let algorithm: SignatureAlgorithm = algorithm.parse()?;
            let key = SigningKey::generate(algorithm);
            if let Some(parent) = out.parent() {
                platform_dirs::ensure_dir(parent)?;
            }
            std::fs::write(&out, format!("{}:{}\n", algorithm, key.to_hex()))?;
            let public = key.verification_key();
            println!("algorithm:   {}", algorithm);
            println!("public key:  {}", public.to_hex());
            println!("fingerprint: {}", public.fingerprint());
        }

        Commands::Signer { command } => {
            let host = Host::new(config)?;
            match command {
                SignerCommand::Add {
                    name,
                    organization,
                    key_file,
                    public_key,
                    algorithm,
                    level,
                    expires_days,
                } => {
                    let key = match (key_file, public_key) {
                        (Some(path), _) => read_key_file(&path)?.verification_key(),
                        (None, Some(hex_key)) => VerificationKey::from_hex(algorithm.parse()?, &hex_key)?,
                        (None, None) => bail!("either --key-file or --public-key is required"),
                    };
                    let level: TrustLevel = level.parse().map_err(anyhow::Error::msg)?;
                    let mut signer = TrustedSigner::new(name, organization, &key, level);
                    if let Some(days) = expires_days {
                        signer = signer.with_expiry(chrono::Utc::now() + chrono::Duration::days(days));
                    }
                    let signer_id = host.trust.add_signer(signer)?;
                    host.save_trust()?;
                    println!("{}", signer_id);
                }
                SignerCommand::Revoke { signer_id, reason } => {
                    host.trust.revoke_signer(&signer_id, &reason)?;
                    host.save_trust()?;
                }
                SignerCommand::List => {
                    let signers: Vec<TrustedSigner> =
                        host.trust.list_signers().iter().map(TrustedSigner::redacted).collect();
                    print_json(&signers)?
                }
            }
        }

        Commands::Sign {
            manifest,
            signer,
            key_file,
        } => {
            let host = Host::new(config)?;
            let manifest = PluginManifest::from_file(&manifest)?;
            let source = std::fs::read(manifest.source_path())?;
            let key = read_key_file(&key_file)?;

            let signature = host.trust.sign_plugin(&manifest.id, &source, &signer, &key)?;
            let sig_path = manifest
                .signature_path()
                .unwrap_or_else(|| PathBuf::from(format!("{}.sig", manifest.source_path().display())));
            signature.save(&sig_path)?;
            host.save_trust()?;
            println!("{}", sig_path.display());
        }

        Commands::Verify { manifest } => {
            let host = Host::new(config)?;
            let manifest = PluginManifest::from_file(&manifest)?;
            let source = std::fs::read_to_string(manifest.source_path())?;
            let selection = manifest
                .policy
                .clone()
                .unwrap_or_else(|| PolicySelection::Named(host.config.system.default_policy.clone()));
            let policy = host
                .config
                .policy_registry()
                .resolve(&selection)
                .ok_or_else(|| anyhow!("unknown policy {:?}", selection))?;

            let signature = match manifest.signature_path() {
                Some(path) if path.exists() => Some(PluginSignature::load(&path)?),
                _ => None,
            };
            let decision = host
                .trust
                .verify_plugin(&manifest.id, source.as_bytes(), signature.as_ref(), &policy)?;
            manifest.validate(&source)?;
            let (valid, issues) = CodeAnalyzer::new().validate(&source);
            if !valid {
                bail!("static analysis failed: {}", issues.join("; "));
            }
            host.save_trust()?;
            print_json(&decision)?;
        }

        Commands::Dispatch {
            hook_type,
            data,
            metadata,
        } => {
            let hook_type: HookType = hook_type.parse().map_err(anyhow::Error::msg)?;
            let data = into_map(serde_json::from_str(&data).context("--data must be JSON")?);
            let metadata = into_map(serde_json::from_str(&metadata).context("--metadata must be JSON")?);

            let host = Host::new(config)?;
            let metrics = MetricsHandler::new("metrics");
            host.hooks.register(
                hook_type,
                LoggingHandler::new("dispatch-log", Level::INFO),
                RegistrationOptions::default().with_priority(HookPriority::HIGHEST),
            )?;
            host.hooks.register(
                hook_type,
                metrics.clone(),
                RegistrationOptions::default().with_priority(HookPriority::LOWEST),
            )?;
            host.load_plugins().await?;

            let (context, results) = host.hooks.dispatch_async(hook_type, data, metadata).await;
            print_json(&serde_json::json!({
                "hook_type": hook_type,
                "cancelled": context.is_cancelled(),
                "data": context.merged_data(),
                "results": results,
                "invocations": metrics.count(hook_type),
            }))?;
        }

        Commands::Watch => {
            let host = Host::new(config)?;
            host.load_plugins().await?;

            let watcher = Arc::new(FileWatcher::new(host.config.watcher.watcher_config()));
            let lifecycle: Arc<dyn PluginLifecycle> = host.loader.clone();
            let reloader = Arc::new(
                HotReloadManager::new(lifecycle, watcher).with_grace_period(host.config.watcher.grace_period()),
            );
            for plugin in host.loader.list() {
                if let Some(dir) = plugin.manifest_path.parent() {
                    reloader.register(plugin.id.clone(), vec![dir.to_path_buf()], host.config.system.reload_strategy);
                }
            }
            reloader.start()?;
            info!(plugins = host.loader.list().len(), "Watching for plugin changes, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            reloader.stop().await;
            host.save_trust()?;
        }
    }

    Ok(())
}
