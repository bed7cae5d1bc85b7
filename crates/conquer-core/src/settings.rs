//! Settings resolution.
//!
//! Every setting is looked up once, at startup, through a fixed list of
//! sources in priority order:
//!
//! 1. explicit arguments passed by the host
//! 2. environment variables named `CONQUER_<NAME>`
//! 3. the `[conquer]` table of the config file (`conquer.toml`)
//! 4. the CI provider: the coordinator's env mapping once one was applied,
//!    otherwise the static provider table from [`crate::env`]
//! 5. built-in defaults
//!
//! The result is an immutable [`Settings`] value. Applying a coordinator env
//! mapping does not mutate it: [`SettingsResolver::apply_env`] resolves a new
//! value from the same sources and swaps it in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::env::{self, CUSTOM_PROVIDER, Environ, ProviderMapping, ProviderValues};
use crate::error::SettingsError;
use crate::logging::LogConfig;

/// Prefix of environment variables that set a setting directly.
pub const ENV_PREFIX: &str = "CONQUER_";

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "conquer.toml";

/// Table of the config file holding settings.
pub const CONFIG_SECTION: &str = "conquer";

/// Client identity reported to the coordinator.
pub const CLIENT_NAME: &str = "rust-official";

/// Every setting name accepted from arguments, environment and config file.
pub const SETTING_NAMES: &[&str] = &[
    "api_domain",
    "api_domain_fallback",
    "api_key",
    "api_region",
    "api_retry_limit",
    "api_timeout",
    "api_wait_limit",
    "build_dir",
    "build_id",
    "build_job",
    "build_node",
    "build_pool",
    "build_project",
    "build_url",
    "debug",
    "platform_name",
    "platform_version",
    "runner_name",
    "runner_root",
    "runner_version",
    "system_provider",
    "vcs_branch",
    "vcs_pr",
    "vcs_repo",
    "vcs_revision",
    "vcs_revision_message",
    "vcs_tag",
    "vcs_type",
    "workers",
];

/// Optional protocol features this client supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Fixtures,
    IsolatedProcess,
    LifecycleTimings,
    SplitByFile,
}

impl Capability {
    pub const ALL: [Self; 4] = [
        Self::Fixtures,
        Self::IsolatedProcess,
        Self::LifecycleTimings,
        Self::SplitByFile,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fixtures => "fixtures",
            Self::IsolatedProcess => "isolated_process",
            Self::LifecycleTimings => "lifecycle_timings",
            Self::SplitByFile => "split_by_file",
        }
    }
}

/// Fully resolved settings. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_key: Option<String>,
    pub api_domain: String,
    pub api_domain_fallback: String,
    pub api_region: String,
    pub api_retry_limit: u32,
    /// Seconds.
    pub api_wait_limit: u64,
    /// Seconds.
    pub api_timeout: u64,

    pub build_dir: String,
    pub build_id: Option<String>,
    pub build_job: Option<String>,
    pub build_node: String,
    pub build_pool: u32,
    pub build_project: Option<String>,
    pub build_url: Option<String>,

    pub client_capabilities: Vec<Capability>,
    pub client_name: String,
    pub client_version: String,
    pub client_workers: u32,

    pub debug: bool,

    pub platform_name: String,
    pub platform_version: Option<String>,

    pub runner_args: Vec<String>,
    pub runner_name: Option<String>,
    pub runner_plugins: Vec<(String, String)>,
    pub runner_root: Option<String>,
    pub runner_version: Option<String>,

    pub system_context: BTreeMap<String, String>,
    pub system_cpus: u32,
    pub system_os_name: String,
    pub system_os_version: Option<String>,
    pub system_provider: String,
    pub system_ram: Option<u64>,

    pub vcs_branch: Option<String>,
    pub vcs_pr: Option<String>,
    pub vcs_repo: Option<String>,
    pub vcs_revision: Option<String>,
    pub vcs_revision_message: Option<String>,
    pub vcs_tag: Option<String>,
    pub vcs_type: String,
}

impl Settings {
    /// Reject settings the coordinator cannot work with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let required = [
            (self.api_key.is_none(), "api_key", "API key"),
            (self.build_id.is_none(), "build_id", "build ID"),
            (self.vcs_branch.is_none(), "vcs_branch", "repository branch"),
            (self.vcs_revision.is_none(), "vcs_revision", "repository revision"),
        ];
        match required.into_iter().find(|(missing, _, _)| *missing) {
            Some((_, name, description)) => Err(SettingsError::Missing { name, description }),
            None => Ok(()),
        }
    }

    /// Websocket endpoints, primary first.
    #[must_use]
    pub fn api_urls(&self) -> Vec<String> {
        vec![
            to_url(&self.api_domain, &self.api_region),
            to_url(&self.api_domain_fallback, &self.api_region),
        ]
    }

    /// HTTP endpoints for the legacy client, primary first.
    #[must_use]
    pub fn http_urls(&self) -> Vec<String> {
        self.api_urls()
            .into_iter()
            .map(|url| {
                if let Some(rest) = url.strip_prefix("wss://") {
                    format!("https://{rest}")
                } else if let Some(rest) = url.strip_prefix("ws://") {
                    format!("http://{rest}")
                } else {
                    url
                }
            })
            .collect()
    }
}

/// Build the websocket URL for a coordinator domain.
///
/// Local domains (`localhost...`, `0.0.0.0...`) use plain `ws://`.
#[must_use]
pub fn to_url(domain: &str, region: &str) -> String {
    if domain.starts_with("localhost") || domain.starts_with("0.0.0.0") {
        format!("ws://{domain}")
    } else {
        format!("wss://equilibrium-{region}.{domain}")
    }
}

// =============================================================================
// Config file
// =============================================================================

/// On-disk config file layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Settings, same names as the arguments.
    pub conquer: BTreeMap<String, toml::Value>,
    /// Logging configuration for the CLI.
    pub logging: LogConfig,
}

impl FileConfig {
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|e| SettingsError::ConfigFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|reason| SettingsError::ConfigFile {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Scalar values of the `[conquer]` table as strings.
    #[must_use]
    pub fn values(&self) -> BTreeMap<String, String> {
        self.conquer
            .iter()
            .filter_map(|(key, value)| {
                let text = match value {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    _ => return None,
                };
                Some((key.clone(), text))
            })
            .collect()
    }
}

// =============================================================================
// Host defaults
// =============================================================================

/// Defaults that depend on the host. Captured once so resolution stays pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDefaults {
    pub build_dir: String,
    pub build_node: String,
    pub cpus: u32,
    pub os_name: String,
    pub os_version: Option<String>,
    pub ram: Option<u64>,
    pub runner_args: Vec<String>,
    pub git: GitInfo,
}

impl Default for HostDefaults {
    fn default() -> Self {
        Self {
            build_dir: String::new(),
            build_node: Uuid::new_v4().to_string(),
            cpus: 1,
            os_name: std::env::consts::OS.to_string(),
            os_version: None,
            ram: None,
            runner_args: Vec::new(),
            git: GitInfo::default(),
        }
    }
}

impl HostDefaults {
    /// Probe the running host.
    #[must_use]
    pub fn probe() -> Self {
        let build_dir = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let git = GitInfo::probe(Path::new(&build_dir));
        Self {
            cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            os_version: read_trimmed("/proc/sys/kernel/osrelease"),
            ram: read_mem_total(),
            runner_args: std::env::args().collect(),
            build_dir,
            git,
            ..Self::default()
        }
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_mem_total() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Repository facts read from `git`, used when nothing else provides them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub repo: Option<String>,
    pub revision: Option<String>,
    pub revision_message: Option<String>,
}

impl GitInfo {
    #[must_use]
    pub fn probe(dir: &Path) -> Self {
        Self {
            branch: git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]),
            repo: git(dir, &["config", "--get", "remote.origin.url"]),
            revision: git(dir, &["rev-parse", "HEAD"]),
            revision_message: git(dir, &["log", "-1", "--pretty=%B"]),
        }
    }
}

fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(dir).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

// =============================================================================
// Sources
// =============================================================================

/// Everything settings are resolved from.
#[derive(Debug, Clone, Default)]
pub struct SettingsSources {
    pub args: BTreeMap<String, String>,
    pub environ: Environ,
    pub file: BTreeMap<String, String>,
    pub provider: Option<ProviderValues>,
    pub defaults: HostDefaults,
}

type Source = fn(&SettingsSources, &str) -> Option<String>;

/// Lookup order, highest priority first. Defaults are applied per field.
const SOURCES: [(&str, Source); 4] = [
    ("args", |s, name| s.args.get(name).cloned()),
    ("env", |s, name| {
        s.environ
            .get(&format!("{ENV_PREFIX}{name}"))
            .map(str::to_string)
    }),
    ("file", |s, name| s.file.get(name).cloned()),
    ("provider", |s, name| {
        s.provider
            .as_ref()
            .and_then(|p| p.get(name))
            .map(str::to_string)
    }),
];

impl SettingsSources {
    /// Sources with only explicit arguments; no environment, file or host probing.
    #[must_use]
    pub fn from_args<K: Into<String>, V: Into<String>>(
        args: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            args: args
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// Capture the real process: environment, config file, CI provider and host defaults.
    ///
    /// Without an explicit `config_path`, `conquer.toml` in the working
    /// directory is read when it exists.
    pub fn capture(
        args: BTreeMap<String, String>,
        config_path: Option<&Path>,
    ) -> Result<Self, SettingsError> {
        let environ = Environ::capture();
        let file = match config_path {
            Some(path) => FileConfig::load_from(path)?,
            None => {
                let default_path = PathBuf::from(CONFIG_FILE);
                if default_path.exists() {
                    FileConfig::load_from(&default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        let provider = env::detect(&environ);
        Ok(Self {
            args,
            file: file.values(),
            provider,
            defaults: HostDefaults::probe(),
            environ,
        })
    }

    #[must_use]
    pub fn with_environ(mut self, environ: Environ) -> Self {
        self.environ = environ;
        self
    }

    #[must_use]
    pub fn with_file_values(mut self, values: BTreeMap<String, String>) -> Self {
        self.file = values;
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Option<ProviderValues>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_defaults(mut self, defaults: HostDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Same sources with the provider replaced by a coordinator mapping.
    #[must_use]
    pub fn with_mapping(&self, mapping: &ProviderMapping) -> Self {
        self.clone()
            .with_provider(Some(mapping.values(&self.environ)))
    }

    /// First value from the priority list, if any source has one.
    pub fn lookup(&self, name: &str) -> Option<String> {
        SOURCES.iter().find_map(|(source, lookup)| {
            let value = lookup(self, name)?;
            debug!(setting = name, source, "resolved setting");
            Some(value)
        })
    }

    fn string(&self, name: &str) -> Option<String> {
        self.lookup(name).filter(|value| !value.is_empty())
    }

    fn integer<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, SettingsError> {
        match self.string(name) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| SettingsError::NotAnInteger {
                    name: name.to_string(),
                    value,
                }),
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.string(name)
            .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
    }

    fn check_env_keys(&self) -> Result<(), SettingsError> {
        for key in self.environ.keys() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                let name = name.to_ascii_lowercase();
                if !SETTING_NAMES.contains(&name.as_str()) {
                    return Err(SettingsError::UnsupportedKey(key.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Evaluate every setting once.
    pub fn resolve(&self) -> Result<Settings, SettingsError> {
        self.check_env_keys()?;

        let defaults = &self.defaults;
        let client_workers = match self.string("workers") {
            Some(value) if value.eq_ignore_ascii_case("max") => defaults.cpus,
            _ => self.integer("workers", 1)?,
        };
        let system_provider = self
            .string("system_provider")
            .or_else(|| self.provider.as_ref().map(|p| p.provider.clone()))
            .unwrap_or_else(|| CUSTOM_PROVIDER.to_string());
        let system_context = self
            .provider
            .as_ref()
            .map(|p| p.context.clone())
            .unwrap_or_default();

        Ok(Settings {
            api_key: self.string("api_key"),
            api_domain: self
                .string("api_domain")
                .unwrap_or_else(|| "testandconquer.com".into()),
            api_domain_fallback: self
                .string("api_domain_fallback")
                .unwrap_or_else(|| "testconquer.com".into()),
            api_region: self
                .string("api_region")
                .unwrap_or_else(|| "us-east-1".into()),
            api_retry_limit: self.integer("api_retry_limit", 6)?,
            api_wait_limit: self.integer("api_wait_limit", 60)?,
            api_timeout: self.integer("api_timeout", 10)?,

            build_dir: self
                .string("build_dir")
                .unwrap_or_else(|| defaults.build_dir.clone()),
            build_id: self.string("build_id"),
            build_job: self.string("build_job"),
            build_node: self
                .string("build_node")
                .unwrap_or_else(|| defaults.build_node.clone()),
            build_pool: self.integer("build_pool", 0)?,
            build_project: self.string("build_project"),
            build_url: self.string("build_url"),

            client_capabilities: Capability::ALL.to_vec(),
            client_name: CLIENT_NAME.to_string(),
            client_version: crate::VERSION.to_string(),
            client_workers,

            debug: self.flag("debug"),

            platform_name: self
                .string("platform_name")
                .unwrap_or_else(|| "rust".into()),
            platform_version: self
                .string("platform_version")
                .or_else(|| option_env!("CARGO_PKG_RUST_VERSION").map(str::to_string)),

            runner_args: defaults.runner_args.clone(),
            runner_name: self.string("runner_name"),
            runner_plugins: Vec::new(),
            runner_root: self.string("runner_root"),
            runner_version: self.string("runner_version"),

            system_context,
            system_cpus: defaults.cpus,
            system_os_name: defaults.os_name.clone(),
            system_os_version: defaults.os_version.clone(),
            system_provider,
            system_ram: defaults.ram,

            vcs_branch: self
                .string("vcs_branch")
                .or_else(|| defaults.git.branch.clone()),
            vcs_pr: self.string("vcs_pr"),
            vcs_repo: self.string("vcs_repo").or_else(|| defaults.git.repo.clone()),
            vcs_revision: self
                .string("vcs_revision")
                .or_else(|| defaults.git.revision.clone()),
            vcs_revision_message: self
                .string("vcs_revision_message")
                .or_else(|| defaults.git.revision_message.clone()),
            vcs_tag: self.string("vcs_tag"),
            vcs_type: self.string("vcs_type").unwrap_or_else(|| "git".into()),
        })
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Holds the sources and the current settings value.
///
/// The coordinator's `env` message can change the provider source after
/// startup; [`apply_env`](Self::apply_env) swaps in a freshly resolved value.
#[derive(Debug)]
pub struct SettingsResolver {
    sources: SettingsSources,
    current: RwLock<Arc<Settings>>,
}

impl SettingsResolver {
    pub fn new(sources: SettingsSources) -> Result<Self, SettingsError> {
        let settings = sources.resolve()?;
        Ok(Self {
            sources,
            current: RwLock::new(Arc::new(settings)),
        })
    }

    /// Wrap an already resolved value (e.g. settings built by the host).
    #[must_use]
    pub fn fixed(settings: Settings) -> Self {
        Self {
            sources: SettingsSources::default(),
            current: RwLock::new(Arc::new(settings)),
        }
    }

    /// Snapshot of the current settings.
    pub fn current(&self) -> Arc<Settings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Handle an `env` payload and return the provider name to reply with.
    pub fn apply_env(&self, payload: &Value) -> Result<String, crate::Error> {
        let Some(mapping) = ProviderMapping::resolve(payload, &self.sources.environ)? else {
            info!("no provider mapping matched the environment");
            return Ok(CUSTOM_PROVIDER.to_string());
        };
        info!(provider = %mapping.name, "applying provider mapping");
        let settings = self.sources.with_mapping(&mapping).resolve()?;
        let name = mapping.name.clone();
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::new(settings),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(settings),
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sources(args: &[(&str, &str)]) -> SettingsSources {
        SettingsSources::from_args(args.iter().copied())
    }

    fn valid_args() -> Vec<(&'static str, &'static str)> {
        vec![
            ("api_key", "key"),
            ("build_id", "build-1"),
            ("vcs_branch", "main"),
            ("vcs_revision", "abc"),
        ]
    }

    #[test]
    fn defaults_apply_without_sources() {
        let settings = sources(&[]).resolve().unwrap();
        assert_eq!(settings.api_retry_limit, 6);
        assert_eq!(settings.api_wait_limit, 60);
        assert_eq!(settings.api_timeout, 10);
        assert_eq!(settings.build_pool, 0);
        assert_eq!(settings.client_workers, 1);
        assert_eq!(settings.api_domain, "testandconquer.com");
        assert_eq!(settings.api_domain_fallback, "testconquer.com");
        assert_eq!(settings.system_provider, "custom");
        assert_eq!(settings.vcs_type, "git");
        assert_eq!(settings.client_name, CLIENT_NAME);
        assert!(!settings.debug);
        assert!(Uuid::parse_str(&settings.build_node).is_ok());
    }

    #[test]
    fn argument_beats_env_beats_file_beats_provider() {
        let environ: Environ = [("CONQUER_BUILD_JOB", "env"), ("CONQUER_BUILD_URL", "env")]
            .into_iter()
            .collect();
        let file: BTreeMap<String, String> = [("build_job", "file"), ("build_url", "file"), ("build_project", "file")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let provider = ProviderValues {
            provider: "circle".into(),
            fields: [("build_job", "ci"), ("build_project", "ci"), ("build_id", "ci")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            context: BTreeMap::new(),
        };
        let settings = sources(&[("build_job", "arg")])
            .with_environ(environ)
            .with_file_values(file)
            .with_provider(Some(provider))
            .resolve()
            .unwrap();
        assert_eq!(settings.build_job.as_deref(), Some("arg"));
        assert_eq!(settings.build_url.as_deref(), Some("env"));
        assert_eq!(settings.build_project.as_deref(), Some("file"));
        assert_eq!(settings.build_id.as_deref(), Some("ci"));
        assert_eq!(settings.system_provider, "circle");
    }

    #[test]
    fn env_lookup_is_case_insensitive() {
        let environ: Environ = [("conquer_system_provider", "env-provider")].into_iter().collect();
        let settings = sources(&[]).with_environ(environ).resolve().unwrap();
        assert_eq!(settings.system_provider, "env-provider");
    }

    #[test]
    fn unsupported_env_key_is_rejected() {
        let environ: Environ = [("CONQUER_NON_EXISTING_VAR", "x")].into_iter().collect();
        let err = sources(&[]).with_environ(environ).resolve().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported key 'CONQUER_NON_EXISTING_VAR' in environment variables"
        );
    }

    #[test]
    fn non_integer_is_rejected() {
        let err = sources(&[("api_retry_limit", "many")]).resolve().unwrap_err();
        assert_eq!(
            err,
            SettingsError::NotAnInteger {
                name: "api_retry_limit".into(),
                value: "many".into()
            }
        );
    }

    #[test]
    fn workers_max_uses_cpu_count() {
        let defaults = HostDefaults {
            cpus: 12,
            ..HostDefaults::default()
        };
        let settings = sources(&[("workers", "MAX")])
            .with_defaults(defaults)
            .resolve()
            .unwrap();
        assert_eq!(settings.client_workers, 12);
        let settings = sources(&[("workers", "3")]).resolve().unwrap();
        assert_eq!(settings.client_workers, 3);
    }

    #[test]
    fn git_defaults_fill_vcs_fields() {
        let defaults = HostDefaults {
            git: GitInfo {
                branch: Some("dev".into()),
                revision: Some("cafe".into()),
                ..GitInfo::default()
            },
            ..HostDefaults::default()
        };
        let settings = sources(&[("vcs_branch", "main")])
            .with_defaults(defaults)
            .resolve()
            .unwrap();
        assert_eq!(settings.vcs_branch.as_deref(), Some("main"));
        assert_eq!(settings.vcs_revision.as_deref(), Some("cafe"));
    }

    #[test]
    fn validation_messages_in_order() {
        let cases = [
            ("api_key", "missing API key, please set 'api_key'"),
            ("build_id", "missing build ID, please set 'build_id'"),
            ("vcs_branch", "missing repository branch, please set 'vcs_branch'"),
            ("vcs_revision", "missing repository revision, please set 'vcs_revision'"),
        ];
        for (missing, message) in cases {
            let args: Vec<_> = valid_args().into_iter().filter(|(k, _)| *k != missing).collect();
            let err = sources(&args).resolve().unwrap().validate().unwrap_err();
            assert_eq!(err.to_string(), message);
        }
        assert!(sources(&valid_args()).resolve().unwrap().validate().is_ok());
    }

    #[test]
    fn urls_for_local_and_hosted_domains() {
        assert_eq!(to_url("localhost:8080", "eu"), "ws://localhost:8080");
        assert_eq!(to_url("0.0.0.0:1234", "eu"), "ws://0.0.0.0:1234");
        assert_eq!(
            to_url("testandconquer.com", "us-east-1"),
            "wss://equilibrium-us-east-1.testandconquer.com"
        );
        let settings = sources(&[("api_domain", "localhost:1"), ("api_domain_fallback", "example.com")])
            .resolve()
            .unwrap();
        assert_eq!(
            settings.http_urls(),
            vec!["http://localhost:1", "https://equilibrium-us-east-1.example.com"]
        );
    }

    #[test]
    fn config_file_values_are_read_from_conquer_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conquer.toml");
        std::fs::write(
            &path,
            "[conquer]\nsystem_provider = \"config-provider\"\napi_timeout = 3\ndebug = true\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();
        let file = FileConfig::load_from(&path).unwrap();
        assert_eq!(file.logging.format, crate::logging::LogFormat::Json);
        let settings = sources(&[]).with_file_values(file.values()).resolve().unwrap();
        assert_eq!(settings.system_provider, "config-provider");
        assert_eq!(settings.api_timeout, 3);
        assert!(settings.debug);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = FileConfig::load_from(Path::new("/nonexistent/conquer.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::ConfigFile { .. }));
    }

    #[test]
    fn resolver_applies_env_mapping() {
        let environ: Environ = [("CI_NAME", "mapping-provider"), ("ENV_NODE", "NODE"), ("ENV_HOST", "HOST")]
            .into_iter()
            .collect();
        let resolver = SettingsResolver::new(sources(&[]).with_environ(environ)).unwrap();
        let before = resolver.current();
        assert_eq!(before.system_provider, "custom");

        let payload = json!([{
            "name": "mapping-provider",
            "conditions": ["ci_name"],
            "mapping": {"build_node": "ENV_NODE", "system_context": ["ENV_HOST"]}
        }]);
        assert_eq!(resolver.apply_env(&payload).unwrap(), "mapping-provider");

        let after = resolver.current();
        assert_eq!(after.system_provider, "mapping-provider");
        assert_eq!(after.build_node, "NODE");
        assert_eq!(after.system_context.get("ENV_HOST").map(String::as_str), Some("HOST"));
        // earlier snapshots are unaffected
        assert_eq!(before.system_provider, "custom");
    }

    #[test]
    fn resolver_without_match_replies_custom() {
        let resolver = SettingsResolver::new(sources(&[])).unwrap();
        assert_eq!(resolver.apply_env(&json!([])).unwrap(), "custom");
    }
}
