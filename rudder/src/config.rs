use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{CommandFactory, Parser, ValueEnum, builder::BoolishValueParser};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Directories searched for a config file, in order.
pub const DEFAULT_CONFIG_DIRS: [&str; 2] = ["/etc/rudder", "."];
const CONFIG_FILE_NAMES: [&str; 2] = ["config.yaml", "config.yml"];

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_PORT: u16 = 9443;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid value {value:?} in environment variable {var}")]
    Env {
        var: String,
        value: String,
        #[source]
        source: clap::Error,
    },

    #[error("failed to parse flags: {0}")]
    Flags(#[from] clap::Error),

    #[error("invalid address {value:?} for {key}, expected [host]:port")]
    Address { key: &'static str, value: String },

    #[error("fields required outside dev mode are unset: {}", .0.join(", "))]
    Validation(Vec<&'static str>),
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(try_from = "String")]
pub enum Environment {
    Dev,
    Preprod,
    #[default]
    Prod,
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        <Self as ValueEnum>::from_str(&value, true)
            .map_err(|_| format!("unknown environment {value:?}, expected dev, preprod or prod"))
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Environment::Dev => "dev",
            Environment::Preprod => "preprod",
            Environment::Prod => "prod",
        };
        f.write_str(s)
    }
}

/// Operator configuration. Loaded once at startup, read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub env: Environment,
    pub debug: bool,
    /// Path to a kubeconfig. When unset the client configuration is inferred
    /// from the cluster or the default kubeconfig.
    pub kubeconfig: Option<PathBuf>,
    /// `host:port` the metrics endpoint binds to. Required unless dev.
    pub metrics_addr: Option<String>,
    /// `host:port` the probe endpoint binds to. Required unless dev.
    pub probe_addr: Option<String>,
    pub leader_election: bool,
    /// Port of the webhook server. Required unless dev.
    pub port: u16,
    pub enable_webhooks: bool,
}

impl Config {
    pub fn is_dev(&self) -> bool {
        self.env == Environment::Dev
    }

    /// Checks that every field required outside dev mode holds a non-zero
    /// value. All offending fields are reported at once.
    pub fn validate(&self) -> Result<()> {
        if self.is_dev() {
            return Ok(());
        }
        let unset: Vec<&'static str> = [
            ("metricsAddr", self.metrics_addr.is_zero()),
            ("probeAddr", self.probe_addr.is_zero()),
            ("port", self.port.is_zero()),
        ]
        .into_iter()
        .filter_map(|(key, zero)| zero.then_some(key))
        .collect();
        if unset.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(unset))
        }
    }
}

trait ZeroValue {
    fn is_zero(&self) -> bool;
}

impl ZeroValue for u16 {
    fn is_zero(&self) -> bool {
        *self == 0
    }
}

impl<T> ZeroValue for Option<T> {
    fn is_zero(&self) -> bool {
        self.is_none()
    }
}

/// Command line flags. Every flag is optional so that unset flags fall
/// through to the lower precedence sources.
///
/// Environment variables are parsed through the same definitions, one
/// `--key=value` at a time, so both sources accept the same values.
#[derive(Clone, Debug, Default, Parser)]
#[command(version, about = "Kubernetes operator reconciling cluster resources", long_about = None)]
pub struct Flags {
    /// The environment mode (dev/preprod/prod)
    #[arg(long, value_enum, ignore_case = true)]
    pub env: Option<Environment>,

    /// If debug mode activated, more logs to print
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub debug: Option<bool>,

    /// The path to the kubeconfig
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// The address the metric endpoint is bound to
    #[arg(long = "metricsAddr")]
    pub metrics_addr: Option<String>,

    /// The address the probe endpoint binds to
    #[arg(long = "probeAddr")]
    pub probe_addr: Option<String>,

    /// Enable leader election for controller manager
    #[arg(long = "leaderElection", num_args = 0..=1, require_equals = true, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub leader_election: Option<bool>,

    /// The port on which to expose the webhook server
    #[arg(long)]
    pub port: Option<u16>,

    /// Enable the webhook validator/defaulter
    #[arg(long = "enableWebhooks", num_args = 0..=1, require_equals = true, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub enable_webhooks: Option<bool>,
}

/// Source of environment variables.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the environment of the running process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Values contributed by one configuration source. `None` means the source
/// does not set the key.
///
/// File keys are lower-cased before deserializing, which is why the renames
/// are all lower case. Scalars may be quoted in the file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
struct Layer {
    env: Option<Environment>,
    #[serde(deserialize_with = "weakly_typed")]
    debug: Option<bool>,
    kubeconfig: Option<String>,
    #[serde(rename = "metricsaddr")]
    metrics_addr: Option<String>,
    #[serde(rename = "probeaddr")]
    probe_addr: Option<String>,
    #[serde(rename = "leaderelection", deserialize_with = "weakly_typed")]
    leader_election: Option<bool>,
    #[serde(deserialize_with = "weakly_typed")]
    port: Option<u16>,
    #[serde(rename = "enablewebhooks", deserialize_with = "weakly_typed")]
    enable_webhooks: Option<bool>,
}

impl Layer {
    fn defaults() -> Self {
        Self {
            env: Some(Environment::default()),
            debug: Some(false),
            kubeconfig: None,
            metrics_addr: Some(DEFAULT_METRICS_ADDR.into()),
            probe_addr: Some(DEFAULT_PROBE_ADDR.into()),
            leader_election: Some(false),
            port: Some(DEFAULT_PORT),
            enable_webhooks: Some(true),
        }
    }

    /// Returns `self` with every key set in `higher` replaced.
    fn overlay(self, higher: Layer) -> Self {
        Self {
            env: higher.env.or(self.env),
            debug: higher.debug.or(self.debug),
            kubeconfig: higher.kubeconfig.or(self.kubeconfig),
            metrics_addr: higher.metrics_addr.or(self.metrics_addr),
            probe_addr: higher.probe_addr.or(self.probe_addr),
            leader_election: higher.leader_election.or(self.leader_election),
            port: higher.port.or(self.port),
            enable_webhooks: higher.enable_webhooks.or(self.enable_webhooks),
        }
    }

    fn into_config(self) -> Result<Config> {
        Ok(Config {
            env: self.env.unwrap_or_default(),
            debug: self.debug.unwrap_or_default(),
            kubeconfig: self
                .kubeconfig
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            metrics_addr: bind_addr("metricsAddr", self.metrics_addr)?,
            probe_addr: bind_addr("probeAddr", self.probe_addr)?,
            leader_election: self.leader_election.unwrap_or_default(),
            port: self.port.unwrap_or_default(),
            enable_webhooks: self.enable_webhooks.unwrap_or_default(),
        })
    }

    /// Layer from the environment. Each variable is named after a flag and
    /// parsed as that flag.
    fn from_env(source: &impl EnvSource) -> Result<Self> {
        let command = Flags::command();
        let keys = command
            .get_arguments()
            .filter_map(|arg| arg.get_long())
            .filter(|key| !matches!(*key, "help" | "version"));

        let mut layer = Layer::default();
        for key in keys {
            let var = env_var_name(key);
            let Some(value) = source.var(&var).filter(|v| !v.is_empty()) else {
                continue;
            };
            let flags = Flags::try_parse_from(["rudder".to_owned(), format!("--{key}={value}")])
                .map_err(|source| ConfigError::Env {
                    var,
                    value,
                    source,
                })?;
            layer = layer.overlay(flags.into());
        }
        Ok(layer)
    }

    fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
        let value = match value {
            serde_yaml::Value::Null => return Ok(Self::default()),
            serde_yaml::Value::Mapping(mapping) => serde_yaml::Value::Mapping(
                mapping
                    .into_iter()
                    .map(|(key, value)| match key {
                        serde_yaml::Value::String(key) => {
                            (serde_yaml::Value::String(key.to_lowercase()), value)
                        }
                        other => (other, value),
                    })
                    .collect(),
            ),
            other => other,
        };
        serde_yaml::from_value(value)
    }
}

impl From<Flags> for Layer {
    fn from(flags: Flags) -> Self {
        Self {
            env: flags.env,
            debug: flags.debug,
            kubeconfig: flags.kubeconfig,
            metrics_addr: flags.metrics_addr,
            probe_addr: flags.probe_addr,
            leader_election: flags.leader_election,
            port: flags.port,
            enable_webhooks: flags.enable_webhooks,
        }
    }
}

/// Accepts either the typed scalar or its string form.
fn weakly_typed<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar<T> {
        Typed(T),
        Text(String),
    }

    match Option::<Scalar<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Scalar::Typed(value)) => Ok(Some(value)),
        Some(Scalar::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Environment variable holding the value of `key`: dots become
/// underscores and the result is upper-cased.
fn env_var_name(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}

/// Normalizes a bind address. An empty value is unset, `:port` binds every
/// interface. Host names are resolved when the listener binds.
fn bind_addr(key: &'static str, value: Option<String>) -> Result<Option<String>> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let valid = value
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if !valid {
        return Err(ConfigError::Address { key, value });
    }
    if value.starts_with(':') {
        Ok(Some(format!("0.0.0.0{value}")))
    } else {
        Ok(Some(value))
    }
}

/// Merges defaults, the config file, environment variables and flags, in
/// increasing order of precedence, into a validated [`Config`].
#[derive(Clone, Debug)]
pub struct ConfigResolver<E = ProcessEnv> {
    search_dirs: Vec<PathBuf>,
    env: E,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DIRS.iter().map(PathBuf::from).collect(), ProcessEnv)
    }
}

impl<E: EnvSource> ConfigResolver<E> {
    pub fn new(search_dirs: Vec<PathBuf>, env: E) -> Self {
        Self { search_dirs, env }
    }

    pub fn resolve(&self, flags: Flags) -> Result<Config> {
        let config = Layer::defaults()
            .overlay(self.file_layer()?)
            .overlay(Layer::from_env(&self.env)?)
            .overlay(flags.into())
            .into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses `args`, including the program name, as flags and resolves.
    pub fn resolve_from<I, T>(&self, args: I) -> Result<Config>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let flags = Flags::try_parse_from(args)?;
        self.resolve(flags)
    }

    /// Layer from the first config file found. A missing file sets nothing.
    fn file_layer(&self) -> Result<Layer> {
        let candidates = self
            .search_dirs
            .iter()
            .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)));
        for path in candidates {
            let contents = match std::fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(ConfigError::ReadFile { path, source }),
            };
            return Layer::from_yaml(&contents)
                .map_err(|source| ConfigError::ParseFile { path, source });
        }
        Ok(Layer::default())
    }
}

/// Loads the configuration from the process arguments, the process
/// environment and the default config directories.
pub fn load() -> Result<Config> {
    ConfigResolver::default().resolve_from(std::env::args_os())
}
