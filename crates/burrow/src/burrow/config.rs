use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::burrow::comm::{protocol::PeerKind, session::CommOptions};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps BURROW_CONFIG into the flag already; this covers callers that
    // bypass the CLI.
    if let Some(p) = std::env::var_os("BURROW_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("burrow.toml"));
        }
        return Ok(p);
    }

    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["burrow.toml", "burrow.yaml", "burrow.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no burrow.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/burrow/burrow.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("org", "burrow", "burrow")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("burrow.toml"))
    }
}

/// Writes the default template when `path` does not exist yet. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub identity: IdentityConfig,
    pub comm: CommConfig,
    pub endpoints: Vec<EndpointConfig>,
    /// Accepted peer key fingerprints; empty accepts any key.
    pub peer_fingerprints: Vec<String>,
    pub agent: Option<AgentConfig>,
    pub metrics_addr: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct CommConfig {
    pub keepalive_interval: Duration,
    pub keepalive_max_failures: u32,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub accept_backlog: usize,
}

impl CommConfig {
    pub fn options(&self) -> CommOptions {
        CommOptions {
            keepalive_interval: self.keepalive_interval,
            keepalive_max_failures: self.keepalive_max_failures,
            request_timeout: self.request_timeout,
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
            accept_backlog: self.accept_backlog,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    pub server_fingerprint: String,
    pub name: String,
    pub kind: PeerKind,
    pub interfaces: Vec<String>,
    pub dial_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    identity: Option<FileIdentity>,
    comm: Option<FileComm>,
    #[serde(default)]
    endpoints: Vec<FileEndpoint>,
    peers: Option<FilePeers>,
    agent: Option<FileAgent>,
    #[serde(default)]
    metrics_addr: String,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileIdentity {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileComm {
    keepalive_interval_ms: Option<i64>,
    keepalive_max_failures: Option<i64>,
    request_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    accept_backlog: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileEndpoint {
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
struct FilePeers {
    #[serde(default)]
    fingerprints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileAgent {
    server_addr: String,
    server_fingerprint: Option<String>,
    name: Option<String>,
    kind: Option<String>,
    #[serde(default)]
    interfaces: Vec<String>,
    dial_timeout_ms: Option<i64>,
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => Duration::from_millis(default_ms),
    }
}

fn trimmed(v: &Option<String>) -> String {
    v.as_deref().unwrap_or("").trim().to_string()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let defaults = CommOptions::default();
        let mut cfg = Config {
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            identity: IdentityConfig::default(),
            comm: CommConfig {
                keepalive_interval: defaults.keepalive_interval,
                keepalive_max_failures: defaults.keepalive_max_failures,
                request_timeout: defaults.request_timeout,
                dial_timeout: defaults.dial_timeout,
                handshake_timeout: defaults.handshake_timeout,
                accept_backlog: defaults.accept_backlog,
            },
            endpoints: vec![],
            peer_fingerprints: vec![],
            agent: None,
            metrics_addr: fc.metrics_addr.trim().to_string(),
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Identity ---
        if let Some(id) = &fc.identity {
            cfg.identity.cert_file = trimmed(&id.cert_file);
            cfg.identity.key_file = trimmed(&id.key_file);
            if cfg.identity.cert_file.is_empty() != cfg.identity.key_file.is_empty() {
                anyhow::bail!("config: identity needs both cert_file and key_file, or neither");
            }
        }

        // --- Comm ---
        if let Some(c) = &fc.comm {
            let d = &cfg.comm;
            cfg.comm = CommConfig {
                keepalive_interval: millis(
                    c.keepalive_interval_ms,
                    d.keepalive_interval.as_millis() as u64,
                ),
                keepalive_max_failures: c
                    .keepalive_max_failures
                    .map(|n| n.max(1) as u32)
                    .unwrap_or(d.keepalive_max_failures),
                request_timeout: millis(c.request_timeout_ms, d.request_timeout.as_millis() as u64),
                dial_timeout: millis(c.dial_timeout_ms, d.dial_timeout.as_millis() as u64),
                handshake_timeout: millis(
                    c.handshake_timeout_ms,
                    d.handshake_timeout.as_millis() as u64,
                ),
                accept_backlog: c
                    .accept_backlog
                    .map(|n| n.max(1) as usize)
                    .unwrap_or(d.accept_backlog),
            };
            if cfg.comm.request_timeout.is_zero() || cfg.comm.handshake_timeout.is_zero() {
                anyhow::bail!("config: comm request/handshake timeouts must be positive");
            }
        }

        // --- Endpoints ---
        for (i, ep) in fc.endpoints.iter().enumerate() {
            let addr = ep.listen_addr.trim();
            if addr.is_empty() {
                anyhow::bail!("config: endpoints[{}] missing listen_addr", i);
            }
            cfg.endpoints.push(EndpointConfig {
                listen_addr: addr.to_string(),
            });
        }

        // --- Peers ---
        if let Some(p) = &fc.peers {
            cfg.peer_fingerprints = p
                .fingerprints
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }

        // --- Agent ---
        if let Some(a) = &fc.agent {
            let server_addr = a.server_addr.trim().to_string();
            if server_addr.is_empty() {
                anyhow::bail!("config: agent.server_addr is required");
            }
            let kind = match trimmed(&a.kind).to_ascii_lowercase().as_str() {
                "" | "agent" => PeerKind::Agent,
                "console" => PeerKind::Console,
                other => anyhow::bail!("config: agent.kind {:?} (expected agent or console)", other),
            };
            let name = match trimmed(&a.name) {
                n if n.is_empty() => "burrow-agent".to_string(),
                n => n,
            };
            cfg.agent = Some(AgentConfig {
                server_addr,
                server_fingerprint: trimmed(&a.server_fingerprint),
                name,
                kind,
                interfaces: a
                    .interfaces
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                dial_timeout: millis(a.dial_timeout_ms, 10_000),
            });
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# burrow configuration (auto-generated)
#
# This file was created because burrow could not find a configuration file at
# the resolved config path. It runs a Comm server that accepts agents and
# consoles on :7100 with a throwaway identity.

metrics_addr = ""

[[endpoints]]
listen_addr = ":7100"

[identity]
# Leave both empty to generate an ephemeral key on every start.
cert_file = ""
key_file = ""

[peers]
# Base64 SHA-256 fingerprints of accepted peer certificates. Empty accepts any.
fingerprints = []

[comm]
keepalive_interval_ms = 30000
keepalive_max_failures = 3
request_timeout_ms = 10000
dial_timeout_ms = 10000
handshake_timeout_ms = 15000
accept_backlog = 128

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

# Run as an agent instead (or in addition):
# [agent]
# server_addr = "c2.example.net:7100"
# server_fingerprint = ""
# name = "web01"
# interfaces = ["10.0.0.12/24"]
# dial_timeout_ms = 10000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# burrow configuration (auto-generated)
#
# This file was created because burrow could not find a configuration file at
# the resolved config path. It runs a Comm server that accepts agents and
# consoles on :7100 with a throwaway identity.

metrics_addr: ""

endpoints:
  - listen_addr: ":7100"

identity:
  cert_file: ""
  key_file: ""

peers:
  fingerprints: []

comm:
  keepalive_interval_ms: 30000
  keepalive_max_failures: 3
  request_timeout_ms: 10000
  dial_timeout_ms: 10000
  handshake_timeout_ms: 15000
  accept_backlog: 128

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

# agent:
#   server_addr: "c2.example.net:7100"
#   name: "web01"
#   interfaces: ["10.0.0.12/24"]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "burrow_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn default_templates_are_loadable() {
        let dir = temp_dir("templates");
        for name in ["burrow.toml", "burrow.yaml"] {
            let path = dir.join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());

            let cfg = load_config(&path).unwrap();
            assert_eq!(cfg.endpoints.len(), 1);
            assert_eq!(cfg.endpoints[0].listen_addr, ":7100");
            assert!(cfg.agent.is_none());
            assert!(cfg.peer_fingerprints.is_empty());
            assert_eq!(cfg.comm.keepalive_interval, Duration::from_secs(30));
            assert_eq!(cfg.comm.options().accept_backlog, 128);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn agent_section_is_normalized() {
        let dir = temp_dir("agent");
        let path = dir.join("burrow.toml");
        std::fs::write(
            &path,
            r#"
[agent]
server_addr = " 198.51.100.4:7100 "
kind = "Console"
interfaces = ["10.0.0.2/24", " "]

[peers]
fingerprints = [" abc= ", ""]
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        let agent = cfg.agent.unwrap();
        assert_eq!(agent.server_addr, "198.51.100.4:7100");
        assert_eq!(agent.kind, PeerKind::Console);
        assert_eq!(agent.name, "burrow-agent");
        assert_eq!(agent.interfaces, vec!["10.0.0.2/24".to_string()]);
        assert_eq!(agent.dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.peer_fingerprints, vec!["abc=".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_and_half_identities_are_rejected() {
        let dir = temp_dir("reject");
        let path = dir.join("burrow.toml");

        std::fs::write(&path, "admin_addr = \":8080\"\n").unwrap();
        let msg = format!("{:#}", load_config(&path).unwrap_err());
        assert!(msg.contains("admin_addr"), "got: {msg}");

        std::fs::write(&path, "[identity]\ncert_file = \"a.pem\"\n").unwrap();
        let msg = format!("{:#}", load_config(&path).unwrap_err());
        assert!(msg.contains("key_file"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_resolves_to_default_file_name() {
        let dir = temp_dir("explicit");
        let resolved = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(resolved.path, dir.join("burrow.toml"));
        assert!(matches!(resolved.source, ConfigPathSource::Flag));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
