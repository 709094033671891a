//! Parsed form of a configured interpreter URI.
//!
//! A single string decides the whole runtime plan: which transport to
//! build, whether a child server has to be spawned and with which argv,
//! which extra module search paths the server gets, and how file paths
//! translate between the host's view and a remote or guest view.
//!
//! Recognized shapes:
//!
//! - `<empty-or-path>`: local child process, e.g. `/usr/bin/python3`.
//! - `tcp://host:port[?manual=1&pathmap=LOCAL,REMOTE]`: remote server,
//!   nothing is spawned.
//! - `vagrant://machine:port[?network=forwarded|private|public&dev=IFACE`
//!   `&address=IP&shared=DIR&os=posix|windows&interpreter=CMD&extra=PATH`
//!   `&pathmap=L,R&manual=1]`: server inside a Vagrant guest.

pub mod socket_path;

use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::warn;
use url::Url;

use crate::transport::Endpoint;

/// Default interpreter command when nothing usable is configured.
const DEFAULT_INTERPRETER: &str = "python";

/// Shared-folder defaults for vagrant guests, by guest OS.
const POSIX_SHARED: &str = "/anaconda";
const WINDOWS_SHARED: &str = "C:\\anaconda";

// ============================================================================
// Errors
// ============================================================================

/// The URI or its options are internally inconsistent or incomplete.
/// Fatal for the worker until the host reconfigures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized interpreter scheme `{0}`")]
    UnknownScheme(String),

    #[error("`{0}` is not a parseable interpreter URI")]
    MalformedUri(String),

    #[error("host and port must be configured for a remote interpreter")]
    MissingHostPort,

    #[error("vagrant network is public but no device is specified; add `dev=<net_iface>` or use a different network topology")]
    PublicNetworkWithoutDevice,

    #[error("vagrant network is private but no address has been supplied; add `address=<ip>` or switch to `network=forwarded`")]
    PrivateNetworkWithoutAddress,

    #[error("`{0}` is not a valid vagrant network mode")]
    InvalidNetwork(String),

    #[error("interpreter executable `{0}` can not be resolved")]
    ExecutableNotFound(String),

    #[error("pathmap prefixes `{0}` and `{1}` overlap")]
    OverlappingPathMap(String, String),

    #[error("could not reserve an ephemeral port: {0}")]
    EphemeralPort(#[from] std::io::Error),
}

// ============================================================================
// Path map
// ============================================================================

/// Bidirectional prefix substitution between local and remote directories.
///
/// Applied at most once per payload and direction. Overlapping prefixes
/// are rejected at construction, which makes the substitution idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMap {
    pairs: Vec<(String, String)>,
}

impl PathMap {
    pub fn new(pairs: Vec<(String, String)>) -> Result<Self, ConfigError> {
        let mut prefixes: Vec<&String> = Vec::new();
        for (local, remote) in &pairs {
            prefixes.push(local);
            prefixes.push(remote);
        }
        for (i, a) in prefixes.iter().enumerate() {
            for b in prefixes.iter().skip(i + 1) {
                if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                    return Err(ConfigError::OverlappingPathMap(
                        (*a).clone(),
                        (*b).clone(),
                    ));
                }
            }
        }
        Ok(Self { pairs })
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Replace a leading local directory with its remote counterpart.
    pub fn to_remote(&self, filename: &str) -> String {
        Self::substitute(filename, self.pairs.iter().map(|(l, r)| (l, r)))
    }

    /// Replace a leading remote directory with its local counterpart.
    pub fn to_local(&self, filename: &str) -> String {
        Self::substitute(filename, self.pairs.iter().map(|(l, r)| (r, l)))
    }

    fn substitute<'a>(
        filename: &str,
        pairs: impl Iterator<Item = (&'a String, &'a String)>,
    ) -> String {
        for (from, to) in pairs {
            if let Some(rest) = filename.strip_prefix(from.as_str()) {
                return format!("{to}{rest}");
            }
        }
        filename.to_string()
    }
}

// ============================================================================
// Scheme variants
// ============================================================================

/// Shallow tag for scheme comparisons across reconfigurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeKind {
    Local,
    RemoteTcp,
    Vagrant,
}

/// Vagrant guest network topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Forwarded,
    Private,
    Public,
}

/// Guest operating system flavour; decides path separators for the guest
/// script location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOs {
    Posix,
    Windows,
}

/// Runtime plan for a local child server.
#[derive(Debug, Clone)]
pub struct LocalPlan {
    /// Resolved interpreter executable.
    pub python: String,
    /// Server script on the host filesystem.
    pub script: PathBuf,
    /// Extra module search paths, filtered to existing directories at use.
    pub extra_paths: Vec<PathBuf>,
    /// Where the child will listen.
    pub endpoint: Endpoint,
}

/// Runtime plan for a remote TCP server. Nothing is spawned.
#[derive(Debug, Clone)]
pub struct RemotePlan {
    pub host: String,
    pub port: u16,
    pub manual: bool,
}

/// Runtime plan for a server inside a Vagrant guest.
#[derive(Debug, Clone)]
pub struct VagrantPlan {
    pub machine: String,
    /// Resolved lazily via `vagrant global-status`.
    pub machine_id: Option<String>,
    pub vagrant_root: Option<PathBuf>,
    pub port: u16,
    pub network: NetworkMode,
    pub dev: Option<String>,
    pub address: Option<String>,
    /// Host to connect to; `None` until a public-network address resolves.
    pub host: Option<String>,
    /// Shared folder holding the server inside the guest.
    pub shared: String,
    pub guest_os: GuestOs,
    /// Interpreter command inside the guest.
    pub interpreter: String,
    /// Extra guest module search paths.
    pub extra: Vec<String>,
    /// The server is assumed to be running already; never spawn.
    pub manual: bool,
}

impl VagrantPlan {
    /// Script location inside the guest, composed from the shared folder
    /// with guest-OS separators.
    pub fn guest_script(&self) -> String {
        let sep = match self.guest_os {
            GuestOs::Posix => '/',
            GuestOs::Windows => '\\',
        };
        format!("{0}{1}server{1}jsonserver.py", self.shared, sep)
    }
}

#[derive(Debug, Clone)]
pub enum Scheme {
    Local(LocalPlan),
    RemoteTcp(RemotePlan),
    Vagrant(VagrantPlan),
}

// ============================================================================
// Interpreter
// ============================================================================

/// Immutable descriptor parsed from the configured interpreter string.
#[derive(Debug, Clone)]
pub struct Interpreter {
    raw: String,
    project: String,
    folders: Vec<PathBuf>,
    scheme: Scheme,
    pathmap: PathMap,
}

impl Interpreter {
    /// Parse a raw interpreter string into a runtime plan.
    ///
    /// `project` is the stable identifier for the editor window or
    /// workspace; `folders` are the open workspace folders (the first
    /// existing one becomes the child's working directory); `script` is
    /// the host-side location of the bundled JSON server script.
    pub fn parse(
        raw: &str,
        project: &str,
        folders: &[PathBuf],
        script: &Path,
    ) -> Result<Self, ConfigError> {
        let (scheme, pathmap) = match split_scheme(raw) {
            None => (
                Scheme::Local(local_plan(raw, project, folders, script)?),
                PathMap::default(),
            ),
            Some("tcp") => {
                let url = parse_url(raw)?;
                let (plan, pathmap) = remote_plan(&url)?;
                (Scheme::RemoteTcp(plan), pathmap)
            }
            Some("vagrant") => {
                let url = parse_url(raw)?;
                let (plan, pathmap) = vagrant_plan(&url)?;
                (Scheme::Vagrant(plan), pathmap)
            }
            Some(other) => return Err(ConfigError::UnknownScheme(other.to_string())),
        };

        Ok(Self {
            raw: raw.to_string(),
            project: project.to_string(),
            folders: folders.to_vec(),
            scheme,
            pathmap,
        })
    }

    /// The original string, kept for equality checks on reconfiguration.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn kind(&self) -> SchemeKind {
        match self.scheme {
            Scheme::Local(_) => SchemeKind::Local,
            Scheme::RemoteTcp(_) => SchemeKind::RemoteTcp,
            Scheme::Vagrant(_) => SchemeKind::Vagrant,
        }
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn scheme_mut(&mut self) -> &mut Scheme {
        &mut self.scheme
    }

    pub fn pathmap(&self) -> &PathMap {
        &self.pathmap
    }

    /// Whether payload filenames need remapping before they leave the host.
    pub fn is_remote_session(&self) -> bool {
        !matches!(self.scheme, Scheme::Local(_)) && !self.pathmap.is_empty()
    }

    pub fn manual(&self) -> bool {
        match &self.scheme {
            Scheme::Local(_) => false,
            Scheme::RemoteTcp(plan) => plan.manual,
            Scheme::Vagrant(plan) => plan.manual,
        }
    }

    /// Where the worker connects.
    ///
    /// For a public-network vagrant guest the host resolves during the
    /// first health check; until then a loopback placeholder is returned
    /// and probes simply fail.
    pub fn endpoint(&self) -> Endpoint {
        match &self.scheme {
            Scheme::Local(plan) => plan.endpoint.clone(),
            Scheme::RemoteTcp(plan) => Endpoint::Tcp {
                host: plan.host.clone(),
                port: plan.port,
            },
            Scheme::Vagrant(plan) => Endpoint::Tcp {
                host: plan
                    .host
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string()),
                port: plan.port,
            },
        }
    }

    /// Rebuild the local endpoint for a reconnect: a fresh ephemeral port,
    /// or the (stable) socket path. No-op for other schemes.
    pub fn renew(&mut self) -> Result<(), ConfigError> {
        if let Scheme::Local(plan) = &mut self.scheme {
            plan.endpoint = local_endpoint(&self.project)?;
        }
        Ok(())
    }

    /// argv and working directory for the local child server:
    /// `<python> -B <script> -p <project> [-e <paths>] <port-or-socket>
    /// <host-pid>`. `None` unless the scheme is local.
    pub fn local_arguments(&self) -> Option<(Vec<String>, Option<PathBuf>)> {
        let Scheme::Local(plan) = &self.scheme else {
            return None;
        };

        let mut argv = vec![
            plan.python.clone(),
            "-B".to_string(),
            plan.script.to_string_lossy().into_owned(),
            "-p".to_string(),
            self.project.clone(),
        ];

        let existing: Vec<String> = plan
            .extra_paths
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if !existing.is_empty() {
            argv.push("-e".to_string());
            argv.push(existing.join(","));
        }

        match &plan.endpoint {
            Endpoint::Tcp { port, .. } => argv.push(port.to_string()),
            #[cfg(unix)]
            Endpoint::Unix(path) => argv.push(path.to_string_lossy().into_owned()),
        }
        // The server polls this PID and retires itself once the editor
        // host disappears.
        argv.push(std::process::id().to_string());

        let cwd = self.folders.iter().find(|f| f.exists()).cloned();
        Some((argv, cwd))
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Extract an explicit multi-character scheme; single letters are Windows
/// drive prefixes, which mean a local executable path.
fn split_scheme(raw: &str) -> Option<&str> {
    let (scheme, _) = raw.split_once("://")?;
    if scheme.len() <= 1 {
        return None;
    }
    Some(scheme)
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|_| ConfigError::MalformedUri(raw.to_string()))
}

/// Expand `~` and `$VAR` references. Unknown variables are left in place
/// so callers can detect them.
fn expand_user_vars(input: &str) -> String {
    let tilde_expanded = if let Some(rest) = input.strip_prefix("~") {
        match dirs::home_dir() {
            Some(home) => format!("{}{}", home.display(), rest),
            None => input.to_string(),
        }
    } else {
        input.to_string()
    };

    let Ok(var) = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)") else {
        return tilde_expanded;
    };
    var.replace_all(&tilde_expanded, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Collect a repeatable query option.
fn query_all(url: &Url, key: &str) -> Vec<String> {
    url.query_pairs()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .collect()
}

fn query_one(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn query_flag(url: &Url, key: &str) -> bool {
    query_one(url, key).is_some_and(|v| v != "0")
}

fn parse_pathmap(url: &Url) -> Result<PathMap, ConfigError> {
    let mut pairs = Vec::new();
    for entry in query_all(url, "pathmap") {
        let Some((local, remote)) = entry.split_once(',') else {
            warn!("pathmap corruption? -> {}", entry);
            continue;
        };
        pairs.push((expand_user_vars(local), expand_user_vars(remote)));
    }
    PathMap::new(pairs)
}

fn local_plan(
    raw: &str,
    project: &str,
    folders: &[PathBuf],
    script: &Path,
) -> Result<LocalPlan, ConfigError> {
    let expanded = expand_user_vars(raw.trim());
    let python = if expanded.is_empty() {
        DEFAULT_INTERPRETER.to_string()
    } else if expanded.contains("$VIRTUAL_ENV") {
        warn!(
            "configured interpreter is {} but there is no $VIRTUAL_ENV in \
             the environment, falling back to `{}`",
            expanded, DEFAULT_INTERPRETER
        );
        DEFAULT_INTERPRETER.to_string()
    } else {
        expanded
    };

    resolve_executable(&python)?;

    Ok(LocalPlan {
        python,
        script: script.to_path_buf(),
        extra_paths: folders.to_vec(),
        endpoint: local_endpoint(project)?,
    })
}

/// Check the configured command names something we could actually spawn.
fn resolve_executable(command: &str) -> Result<(), ConfigError> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        if path.is_file() {
            return Ok(());
        }
        return Err(ConfigError::ExecutableNotFound(command.to_string()));
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&search_path) {
        if dir.join(command).is_file() {
            return Ok(());
        }
    }
    Err(ConfigError::ExecutableNotFound(command.to_string()))
}

/// Endpoint for a local child: a per-project socket file where the OS
/// prefers one, a fresh ephemeral loopback port everywhere else.
fn local_endpoint(project: &str) -> Result<Endpoint, ConfigError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Endpoint::Unix(socket_path::for_project(project)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = project;
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(Endpoint::Tcp {
            host: "localhost".to_string(),
            port,
        })
    }
}

fn remote_plan(url: &Url) -> Result<(RemotePlan, PathMap), ConfigError> {
    let host = url.host_str().ok_or(ConfigError::MissingHostPort)?;
    let port = url.port().ok_or(ConfigError::MissingHostPort)?;
    let pathmap = parse_pathmap(url)?;

    Ok((
        RemotePlan {
            host: host.to_string(),
            port,
            manual: query_flag(url, "manual"),
        },
        pathmap,
    ))
}

fn vagrant_plan(url: &Url) -> Result<(VagrantPlan, PathMap), ConfigError> {
    let machine = url.host_str().ok_or(ConfigError::MissingHostPort)?;
    let port = url.port().ok_or(ConfigError::MissingHostPort)?;
    let pathmap = parse_pathmap(url)?;

    let network = match query_one(url, "network").as_deref() {
        None | Some("forwarded") => NetworkMode::Forwarded,
        Some("private") => NetworkMode::Private,
        Some("public") => NetworkMode::Public,
        Some(other) => return Err(ConfigError::InvalidNetwork(other.to_string())),
    };
    let dev = query_one(url, "dev");
    let address = query_one(url, "address");

    let host = match network {
        NetworkMode::Forwarded => Some("localhost".to_string()),
        NetworkMode::Private => Some(
            address
                .clone()
                .ok_or(ConfigError::PrivateNetworkWithoutAddress)?,
        ),
        NetworkMode::Public => {
            if dev.is_none() {
                return Err(ConfigError::PublicNetworkWithoutDevice);
            }
            // Resolved against the running machine during health checks.
            None
        }
    };

    let guest_os = match query_one(url, "os").as_deref() {
        Some("windows") => GuestOs::Windows,
        _ => GuestOs::Posix,
    };
    let shared = query_one(url, "shared").unwrap_or_else(|| {
        match guest_os {
            GuestOs::Posix => POSIX_SHARED,
            GuestOs::Windows => WINDOWS_SHARED,
        }
        .to_string()
    });

    Ok((
        VagrantPlan {
            machine: machine.to_string(),
            machine_id: None,
            vagrant_root: None,
            port,
            network,
            dev,
            address,
            host,
            shared,
            guest_os,
            interpreter: query_one(url, "interpreter")
                .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string()),
            extra: query_all(url, "extra")
                .into_iter()
                .map(|p| expand_user_vars(&p))
                .collect(),
            manual: query_flag(url, "manual"),
        },
        pathmap,
    ))
}
