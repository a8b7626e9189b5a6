use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::iriswire::common::{Error, Result};
use crate::iriswire::config::enums::{AuthMode, IrisMode, TranslationPolicy};

pub const LISTEN_BACKLOG: u32 = 1024;

#[derive(Deserialize, Debug)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(skip_deserializing)]
    pub config_path: PathBuf,
    /// host to listen on, defaults to 0.0.0.0
    #[serde(default = "default_host")]
    pub host: String,
    /// port to listen on for PostgreSQL connections: default 5432
    #[serde(default = "default_port")]
    pub port: u16,
    /// recv_buffer_size is the default size for (user-space) buffers used to read from TCP sockets
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: u32,
    /// result_batch_size is the number of DataRows written between forced flushes
    #[serde(default = "default_result_batch_size")]
    pub result_batch_size: u32,
    /// write_highwater is the outbound pending-bytes watermark in bytes
    #[serde(default = "default_write_highwater")]
    pub write_highwater: usize,
    /// copy_buffer_bytes caps buffered CopyData before a forced partial-batch flush
    #[serde(default = "default_copy_buffer_bytes")]
    pub copy_buffer_bytes: usize,
    /// copy_batch_rows is the number of CSV rows per execute_many batch
    #[serde(default = "default_copy_batch_rows")]
    pub copy_batch_rows: usize,
    /// log_level for the tracing subscriber: trace|debug|info|warn|error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub iris: IrisSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub translation: TranslationSettings,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
const fn default_port() -> u16 {
    5432
}
const fn default_recv_buffer_size() -> u32 {
    32 * 1024
}
const fn default_result_batch_size() -> u32 {
    1000
}
const fn default_write_highwater() -> usize {
    5 * 1024 * 1024
}
const fn default_copy_buffer_bytes() -> usize {
    10 * 1024 * 1024
}
const fn default_copy_batch_rows() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Deserialize, Debug)]
pub struct IrisSettings {
    #[serde(default)]
    pub mode: IrisMode,
    /// host of the IRIS superserver
    #[serde(default = "default_iris_host")]
    pub host: String,
    #[serde(default = "default_iris_port")]
    pub port: u16,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// pool_size bounds the number of concurrent IRIS sessions
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_iris_host() -> String {
    "localhost".to_string()
}
const fn default_iris_port() -> u16 {
    1972
}
fn default_namespace() -> String {
    "USER".to_string()
}
const fn default_pool_size() -> u32 {
    8
}

impl Default for IrisSettings {
    fn default() -> Self {
        IrisSettings {
            mode: IrisMode::default(),
            host: default_iris_host(),
            port: default_iris_port(),
            namespace: default_namespace(),
            user: String::new(),
            password: String::new(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct AuthSettings {
    #[serde(default)]
    pub mode: AuthMode,
    /// users maps a username to its password for the scram mode.
    /// Stored keys are derived once at startup; the plain password is not kept.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
    #[serde(default)]
    pub oauth: Option<OauthSettings>,
    #[serde(default)]
    pub gssapi: Option<GssapiSettings>,
}

#[derive(Deserialize, Debug)]
pub struct OauthSettings {
    /// Names of the environment variables holding the client credentials.
    #[serde(default = "default_client_id_env")]
    pub client_id_env: String,
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    /// token endpoint of the identity provider
    #[serde(default)]
    pub token_url: String,
}

fn default_client_id_env() -> String {
    "IRISWIRE_CLIENT_ID".to_string()
}
fn default_client_secret_env() -> String {
    "IRISWIRE_CLIENT_SECRET".to_string()
}

#[derive(Deserialize, Debug)]
pub struct GssapiSettings {
    pub service_principal: String,
    #[serde(default)]
    pub keytab: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Deserialize, Debug)]
pub struct TranslationSettings {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub policy: TranslationPolicy,
}

const fn default_cache_size() -> usize {
    1024
}

impl Default for TranslationSettings {
    fn default() -> Self {
        TranslationSettings {
            cache_size: default_cache_size(),
            policy: TranslationPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings from the given file, or search the usual locations
    /// when path is None. Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => find_config_file("iriswire.yaml")?,
        };
        info!(config_path = %config_path.to_string_lossy(), "loading config file");
        let file = File::open(&config_path)?;
        let mut settings: Settings = serde_yaml::from_reader(file)?;
        settings.config_path = config_path;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults without a config file, used by tests and the memory-mode binary.
    pub fn default_for_tests() -> Settings {
        let mut settings: Settings =
            serde_yaml::from_str("{}").expect("empty settings must deserialize");
        settings.apply_env_overrides();
        settings
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("PGWIRE_LISTEN_HOST") {
            self.host = v;
        }
        if let Ok(v) = env::var("PGWIRE_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = env::var("PGWIRE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = env::var("IRIS_HOST") {
            self.iris.host = v;
        }
        if let Ok(v) = env::var("IRIS_PORT") {
            if let Ok(port) = v.parse() {
                self.iris.port = port;
            }
        }
        if let Ok(v) = env::var("IRIS_NAMESPACE") {
            self.iris.namespace = v;
        }
        if let Ok(v) = env::var("IRIS_USERNAME") {
            self.iris.user = v;
        }
        if let Ok(v) = env::var("IRIS_PASSWORD") {
            self.iris.password = v;
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.recv_buffer_size < 4096 {
            self.recv_buffer_size = default_recv_buffer_size();
        }
        if self.recv_buffer_size > 1024 * 1024 {
            return Err(Error::config("recv_buffer_size cannot be > 1MB"));
        }
        self.recv_buffer_size = self.recv_buffer_size.next_power_of_two();
        if self.result_batch_size == 0 {
            return Err(Error::config("result_batch_size cannot be 0"));
        }
        if self.copy_batch_rows == 0 {
            return Err(Error::config("copy_batch_rows cannot be 0"));
        }
        if self.iris.pool_size == 0 {
            return Err(Error::config("iris pool_size cannot be 0"));
        }
        if self.auth.mode == AuthMode::Oauth && self.auth.oauth.is_none() {
            return Err(Error::config("auth mode oauth requires an oauth section"));
        }
        if self.auth.mode == AuthMode::Gssapi && self.auth.gssapi.is_none() {
            return Err(Error::config("auth mode gssapi requires a gssapi section"));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    // Check the current directory or any of its parents for config_name
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            if let Some(parent) = dir.parent() {
                dir = parent;
            } else {
                break;
            }
        }
    }

    // Check ~/.config/iriswire/{config_name}
    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());
    let conf_path = Path::new(&home).join(".config/iriswire").join(config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    // Check /etc/iriswire/{config_name}
    let conf_path = Path::new("/etc/iriswire").join(config_name);
    debug!("checking for config file in {}", conf_path.to_string_lossy());
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::config(format!("config file {} not found", config_name)))
}
