use std::{collections::HashMap, fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};

use mailshield_protect::{
    ContentRewriter, FileScanner, FileScannerClient, MessageProtector, NoopFileScanner,
    NoopUrlScanner, UrlEncoder, UrlRewriter, UrlScanner, WebFilterClient,
    DEFAULT_ENCRYPTION_KEY, DEFAULT_MARKER_HEADER, DEFAULT_SCAN_CONCURRENCY,
};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::IpMask;

/// Top-level configuration for the Mailshield relay.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration, `RUST_LOG` takes precedence when set.
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// SMTP listener configuration.
#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name announced in the greeting and in `Received` headers.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,

    #[serde(default)]
    pub auth_required: bool,

    /// Maximum size in bytes of the `DATA` payload.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Regular expressions the envelope sender must match, empty allows all.
    #[serde(default)]
    pub allowed_senders: Vec<String>,

    /// Regular expressions every envelope recipient must match, empty allows all.
    #[serde(default)]
    pub allowed_recipients: Vec<String>,

    /// Client networks in CIDR notation allowed to connect, empty allows all.
    #[serde(default = "default_allowed_nets")]
    pub allowed_nets: Vec<String>,

    /// Seconds to wait for a command line before closing the session.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Seconds to wait for each line of the `DATA` payload.
    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,

    /// Maximum concurrent sessions, zero or a negative value disables the limit.
    #[serde(default = "default_max_connections")]
    pub max_connections: i64,

    /// Requires `STARTTLS` before any mail or authentication command.
    #[serde(default)]
    pub force_tls: bool,

    /// Address serving the Prometheus metrics, disabled when absent.
    pub metrics_address: Option<String>,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub handlers: HashMap<String, HandlerConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            welcome_message: default_welcome_message(),
            auth_required: false,
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            allowed_senders: Vec::new(),
            allowed_recipients: Vec::new(),
            allowed_nets: default_allowed_nets(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            data_timeout_secs: default_data_timeout_secs(),
            max_connections: default_max_connections(),
            force_tls: false,
            metrics_address: None,
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            handlers: HashMap::new(),
            routing: RoutingConfig::default(),
        }
    }
}

impl SmtpConfig {
    /// Compiles the sender allow-list.
    pub fn sender_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        compile_patterns(&self.allowed_senders)
    }

    /// Compiles the recipient allow-list.
    pub fn recipient_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        compile_patterns(&self.allowed_recipients)
    }

    /// Parses the client network allow-list.
    pub fn allowed_nets(&self) -> Result<Vec<IpMask>, ConfigError> {
        self.allowed_nets
            .iter()
            .map(|net| {
                net.parse::<IpMask>()
                    .map_err(|e| ConfigError::Invalid(format!("allowed_nets: {e}")))
            })
            .collect()
    }

    /// Returns the session limit, `None` when unlimited.
    pub fn connection_limit(&self) -> Option<usize> {
        usize::try_from(self.max_connections)
            .ok()
            .filter(|limit| *limit > 0)
    }
}

/// TLS certificate configuration used by `STARTTLS`.
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert")]
    pub cert: String,

    #[serde(default = "default_key")]
    pub key: String,

    #[serde(default)]
    pub enabled: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            enabled: false,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
        }
    }
}

/// Transport security towards an upstream relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySecurity {
    #[default]
    None,
    Starttls,
    Tls,
}

/// Configuration for a named message handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum HandlerConfig {
    /// Delivery to an upstream SMTP server.
    #[serde(rename = "relay")]
    Relay {
        #[serde(default = "default_relay_host")]
        host: String,
        #[serde(default = "default_relay_port")]
        port: u16,
        #[serde(default)]
        security: RelaySecurity,
        username: Option<String>,
        password: Option<String>,
    },

    /// Accepts and drops every message.
    #[serde(rename = "discard")]
    Discard,
}

/// Routing configuration with rules and a default handler.
#[derive(Debug, Deserialize)]
pub struct RoutingConfig {
    /// Default handler name for routed messages.
    #[serde(default = "default_handler_name")]
    pub default: String,

    /// Default transformers applied to all routed messages unless
    /// overridden per rule.
    #[serde(default = "default_transformers")]
    pub transformers: Vec<TransformerConfig>,

    #[serde(default)]
    pub rules: Vec<RoutingRuleConfig>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default: default_handler_name(),
            transformers: default_transformers(),
            rules: Vec::new(),
        }
    }
}

/// A single routing rule that matches the first recipient by address or domain.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingRuleConfig {
    /// Exact email address match (e.g. "admin@example.com").
    pub address: Option<String>,

    /// Domain match, supports wildcard prefix (e.g. "example.com" or "*.example.com").
    pub domain: Option<String>,

    pub handler: String,

    /// Transformers for this rule, overrides the default transformers if present.
    pub transformers: Option<Vec<TransformerConfig>>,
}

/// Configuration for a message transformer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum TransformerConfig {
    /// Prepends a `Received` trace header.
    #[serde(rename = "received")]
    Received,

    /// Rewrites links and marks malicious messages.
    #[serde(rename = "protection")]
    Protection,
}

/// Link rewriting and reputation service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    /// Base URL of the redirect service rewritten links point to.
    #[serde(default = "default_protection_url")]
    pub protection_url: String,

    #[serde(default = "default_marker_header")]
    pub marker_header: String,

    /// 32 byte key sealing the original URLs.
    #[serde(default = "default_encryption_key")]
    pub encryption_key: String,

    pub url_scanner_url: Option<String>,

    #[serde(default)]
    pub url_scanner_client_id: String,

    pub file_scanner_url: Option<String>,

    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,

    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            protection_url: default_protection_url(),
            marker_header: default_marker_header(),
            encryption_key: default_encryption_key(),
            url_scanner_url: None,
            url_scanner_client_id: String::new(),
            file_scanner_url: None,
            scan_concurrency: default_scan_concurrency(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl ProtectionConfig {
    /// Builds the message protector with its reputation clients.
    pub fn build_protector(&self) -> Result<MessageProtector, ConfigError> {
        let encoder = UrlEncoder::new(self.encryption_key.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("encryption_key: {e}")))?;
        let rewriter = ContentRewriter::new(UrlRewriter::new(&self.protection_url, encoder));
        let timeout = Duration::from_secs(self.scan_timeout_secs);

        let url_scanner: Arc<dyn UrlScanner> = match &self.url_scanner_url {
            Some(url) => Arc::new(
                WebFilterClient::new(url, &self.url_scanner_client_id, timeout)
                    .map_err(|e| ConfigError::Invalid(format!("url_scanner_url: {e}")))?,
            ),
            None => {
                warn!("No URL scanner configured, links are rewritten but never flagged");
                Arc::new(NoopUrlScanner)
            }
        };
        let file_scanner: Arc<dyn FileScanner> = match &self.file_scanner_url {
            Some(url) => Arc::new(
                FileScannerClient::new(url, timeout)
                    .map_err(|e| ConfigError::Invalid(format!("file_scanner_url: {e}")))?,
            ),
            None => Arc::new(NoopFileScanner),
        };

        info!(
            protection_url = %self.protection_url,
            url_scanner = url_scanner.name(),
            file_scanner = file_scanner.name(),
            scan_concurrency = self.scan_concurrency,
            "Message protector initialized"
        );
        Ok(MessageProtector::new(rewriter, url_scanner, file_scanner)
            .with_marker_header(&self.marker_header)
            .with_scan_concurrency(self.scan_concurrency))
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Loads configuration from a TOML file, falling back to the defaults when
/// the file does not exist.
pub fn load_config_or_default(path: &Path) -> Result<Config, ConfigError> {
    match load_config(path) {
        Err(ConfigError::Io(error)) if error.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Config::default())
        }
        result => result,
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
    /// An allow-list entry is not a valid regular expression.
    Regex(regex::Error),
    /// A value is syntactically valid but unusable.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
            ConfigError::Regex(e) => write!(f, "Config regex error: {e}"),
            ConfigError::Invalid(msg) => write!(f, "Config invalid value: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(ConfigError::Regex))
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2525
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_welcome_message() -> String {
    "Mailshield SMTP relay".to_string()
}

fn default_max_message_size() -> usize {
    10_240_000
}

fn default_max_recipients() -> usize {
    100
}

fn default_allowed_nets() -> Vec<String> {
    vec!["127.0.0.0/8".to_string(), "::1/128".to_string()]
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    60
}

fn default_data_timeout_secs() -> u64 {
    300
}

fn default_max_connections() -> i64 {
    100
}

fn default_cert() -> String {
    "certs/server.cert.pem".to_string()
}

fn default_key() -> String {
    "certs/server.key.pem".to_string()
}

fn default_credentials_file() -> String {
    "passwords/example.txt".to_string()
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    25
}

fn default_handler_name() -> String {
    "upstream".to_string()
}

fn default_transformers() -> Vec<TransformerConfig> {
    vec![TransformerConfig::Received, TransformerConfig::Protection]
}

fn default_protection_url() -> String {
    "http://127.0.0.1:8080/redirect".to_string()
}

fn default_marker_header() -> String {
    DEFAULT_MARKER_HEADER.to_string()
}

fn default_encryption_key() -> String {
    DEFAULT_ENCRYPTION_KEY.to_string()
}

fn default_scan_concurrency() -> usize {
    DEFAULT_SCAN_CONCURRENCY
}

fn default_scan_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[smtp]
host = "0.0.0.0"
port = 25
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.host, "0.0.0.0");
        assert_eq!(config.smtp.port, 25);
        assert!(!config.smtp.auth_required);
        assert_eq!(config.smtp.routing.default, "upstream");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[log]
level = "debug"

[smtp]
host = "0.0.0.0"
port = 25
hostname = "mx.example.com"
auth_required = true
max_message_size = 1024
max_recipients = 2
allowed_senders = [".*@example\\.com$"]

[smtp.tls]
cert = "my/cert.pem"
key = "my/key.pem"
enabled = true

[smtp.auth]
credentials_file = "my/passwords.txt"

[smtp.handlers.upstream]
type = "relay"
host = "smtp.example.com"
port = 587
security = "starttls"
username = "relay"
password = "secret"

[smtp.handlers.sink]
type = "discard"

[smtp.routing]
default = "upstream"

[[smtp.routing.rules]]
address = "abuse@example.com"
handler = "sink"

[[smtp.routing.rules]]
domain = "*.internal.org"
handler = "upstream"

[protection]
protection_url = "https://protect.example.com/r"
marker_header = "X-Action"
url_scanner_url = "https://filter.example.com/check"
url_scanner_client_id = "abc"
file_scanner_url = "https://files.example.com"
scan_concurrency = 8
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.smtp.hostname, "mx.example.com");
        assert!(config.smtp.auth_required);
        assert_eq!(config.smtp.max_message_size, 1024);
        assert_eq!(config.smtp.max_recipients, 2);
        assert!(config.smtp.tls.enabled);
        assert_eq!(config.smtp.tls.cert, "my/cert.pem");
        assert_eq!(config.smtp.auth.credentials_file, "my/passwords.txt");
        assert_eq!(config.smtp.handlers.len(), 2);
        assert_eq!(config.smtp.routing.rules.len(), 2);

        match &config.smtp.handlers["upstream"] {
            HandlerConfig::Relay {
                host,
                port,
                security,
                username,
                password,
            } => {
                assert_eq!(host, "smtp.example.com");
                assert_eq!(*port, 587);
                assert_eq!(*security, RelaySecurity::Starttls);
                assert_eq!(username.as_deref(), Some("relay"));
                assert_eq!(password.as_deref(), Some("secret"));
            }
            _ => panic!("Expected Relay handler"),
        }
        assert!(matches!(
            config.smtp.handlers["sink"],
            HandlerConfig::Discard
        ));

        assert_eq!(config.protection.marker_header, "X-Action");
        assert_eq!(config.protection.url_scanner_client_id, "abc");
        assert_eq!(config.protection.scan_concurrency, 8);
        assert_eq!(config.protection.scan_timeout_secs, 10);

        let senders = config.smtp.sender_patterns().unwrap();
        assert!(senders[0].is_match("alice@example.com"));
        assert!(!senders[0].is_match("alice@example.org"));
    }

    #[test]
    fn test_parse_transformers_config() {
        let toml = r#"
[smtp]

[[smtp.routing.transformers]]
type = "received"

[[smtp.routing.rules]]
domain = "example.com"
handler = "upstream"

  [[smtp.routing.rules.transformers]]
  type = "protection"

[[smtp.routing.rules]]
domain = "other.com"
handler = "upstream"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(
            config.smtp.routing.transformers,
            vec![TransformerConfig::Received]
        );
        assert_eq!(
            config.smtp.routing.rules[0].transformers,
            Some(vec![TransformerConfig::Protection])
        );
        assert!(config.smtp.routing.rules[1].transformers.is_none());
    }

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.smtp.host, "127.0.0.1");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.hostname, "localhost");
        assert_eq!(config.smtp.max_message_size, 10_240_000);
        assert_eq!(config.smtp.max_recipients, 100);
        assert!(!config.smtp.tls.enabled);
        assert_eq!(config.smtp.tls.cert, "certs/server.cert.pem");
        assert_eq!(config.smtp.auth.credentials_file, "passwords/example.txt");
        assert_eq!(
            config.smtp.routing.transformers,
            vec![TransformerConfig::Received, TransformerConfig::Protection]
        );
        assert_eq!(config.protection.marker_header, "X-Mailshield-Action");
        assert_eq!(
            config.protection.encryption_key,
            "passphrasewhichneedstobe32bytes!"
        );
        assert_eq!(config.protection.scan_concurrency, 4);
        assert!(config.protection.url_scanner_url.is_none());
        assert_eq!(config.smtp.read_timeout_secs, 60);
        assert_eq!(config.smtp.data_timeout_secs, 300);
        assert_eq!(config.smtp.connection_limit(), Some(100));
        assert!(!config.smtp.force_tls);
        assert!(config.smtp.metrics_address.is_none());
        assert_eq!(config.smtp.allowed_nets().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_session_limits() {
        let toml = r#"
[smtp]
allowed_nets = ["10.0.0.0/8", "2001:db8::/32"]
read_timeout_secs = 5
write_timeout_secs = 6
data_timeout_secs = 7
max_connections = -1
force_tls = true
metrics_address = "127.0.0.1:9090"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let nets = config.smtp.allowed_nets().unwrap();

        assert!(nets[0].matches(&"10.9.8.7".parse().unwrap()));
        assert!(nets[1].matches(&"2001:db8::1".parse().unwrap()));
        assert_eq!(config.smtp.write_timeout_secs, 6);
        assert_eq!(config.smtp.connection_limit(), None);
        assert!(config.smtp.force_tls);
        assert_eq!(config.smtp.metrics_address.as_deref(), Some("127.0.0.1:9090"));
    }

    #[test]
    fn test_invalid_allowed_nets() {
        let config: Config = toml::from_str("[smtp]\nallowed_nets = [\"10.0.0.0/40\"]\n").unwrap();
        assert!(matches!(
            config.smtp.allowed_nets(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_regex() {
        let config: Config = toml::from_str("[smtp]\nallowed_recipients = [\"(\"]\n").unwrap();
        assert!(matches!(
            config.smtp.recipient_patterns(),
            Err(ConfigError::Regex(_))
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[smtp]\nport = 2626").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.smtp.port, 2626);
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        assert!(matches!(load_config(&path), Err(ConfigError::Io(_))));
        let config = load_config_or_default(&path).unwrap();
        assert_eq!(config.smtp.port, 2525);
    }

    #[test]
    fn test_load_config_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[smtp\nport = ").unwrap();

        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_build_protector() {
        let protector = ProtectionConfig::default().build_protector().unwrap();
        assert_eq!(protector.marker_header(), "X-Mailshield-Action");

        let config = ProtectionConfig {
            encryption_key: "short".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.build_protector(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
