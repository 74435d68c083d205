//! Host networking operations.
//!
//! Every kernel-facing mutation the orchestrator performs is a [`HostOp`]: a
//! closed set of typed operations, each of which knows its own inverse. The
//! orchestrator never builds command lines itself; it hands operations to a
//! [`NetworkHost`].
//!
//! [`IpCommandHost`] executes operations with `ip` (iproute2) and `iptables`,
//! the same tools an administrator would use by hand:
//!
//! ```text
//! ip netns add nsA
//! ip link add vh0 type veth peer name vn0
//! ip link set vn0 netns nsA
//! ip addr add 10.0.0.1/30 dev vh0
//! ip -n nsA addr add 10.0.0.2/30 dev vn0
//! ip -n nsA route add default via 10.0.0.1
//! iptables -w -t nat -A POSTROUTING -s 10.0.0.0/30 -j MASQUERADE
//! ip -n nsA tuntap add dev tun0 mode tun
//! ip -n nsA route add 0.0.0.0/1 dev tun0
//! ```
//!
//! # Requirements
//!
//! - `CAP_NET_ADMIN` and `CAP_SYS_ADMIN` (in practice: root)
//! - `ip` and `iptables` in PATH

use super::error::HostError;
use super::relay::RelayCommand;
use super::spec::Ipv4Cidr;
use super::state::Resource;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Directory holding named namespaces.
pub const NETNS_RUN_DIR: &str = "/run/netns";

/// Directory `ip netns exec` bind-mounts per-namespace config files from.
pub const NETNS_ETC_DIR: &str = "/etc/netns";

/// Kernel switch for IPv4 forwarding.
pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// A route inside a namespace (or on the host).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    /// `default` or a CIDR.
    pub destination: String,
    /// Gateway address.
    pub via: Option<Ipv4Addr>,
    /// Output device.
    pub dev: Option<String>,
}

impl RouteSpec {
    /// Default route via a gateway.
    pub fn default_via(gateway: Ipv4Addr) -> Self {
        Self {
            destination: "default".to_string(),
            via: Some(gateway),
            dev: None,
        }
    }

    /// Route a prefix out of a device.
    pub fn dev(destination: &str, dev: &str) -> Self {
        Self {
            destination: destination.to_string(),
            via: None,
            dev: Some(dev.to_string()),
        }
    }

    /// Route a prefix through a gateway.
    pub fn via(destination: Ipv4Cidr, gateway: Ipv4Addr) -> Self {
        Self {
            destination: destination.to_string(),
            via: Some(gateway),
            dev: None,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![self.destination.clone()];
        if let Some(via) = self.via {
            args.push("via".to_string());
            args.push(via.to_string());
        }
        if let Some(ref dev) = self.dev {
            args.push("dev".to_string());
            args.push(dev.clone());
        }
        args
    }
}

/// A single host mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostOp {
    /// `ip netns add`
    AddNamespace {
        /// Namespace name.
        name: String,
    },
    /// `ip netns delete`
    DeleteNamespace {
        /// Namespace name.
        name: String,
    },
    /// `ip link add <host> type veth peer name <peer>`
    AddVethPair {
        /// Host-side end.
        host: String,
        /// Peer end (moved into the namespace next).
        peer: String,
    },
    /// `ip link set <link> netns <namespace>`
    MoveLink {
        /// Link to move.
        link: String,
        /// Destination namespace.
        namespace: String,
    },
    /// `ip link delete`
    DeleteLink {
        /// Namespace holding the link (`None` for the host).
        namespace: Option<String>,
        /// Interface name.
        link: String,
    },
    /// `ip addr add`
    AddAddress {
        /// Namespace holding the link.
        namespace: Option<String>,
        /// Interface name.
        link: String,
        /// Address with prefix.
        address: Ipv4Cidr,
    },
    /// `ip link set <link> up`
    SetLinkUp {
        /// Namespace holding the link.
        namespace: Option<String>,
        /// Interface name.
        link: String,
    },
    /// `ip tuntap add dev <link> mode tun`
    AddTun {
        /// Namespace to create the device in.
        namespace: String,
        /// Device name.
        link: String,
    },
    /// `ip route add`
    AddRoute {
        /// Namespace holding the route.
        namespace: Option<String>,
        /// The route.
        route: RouteSpec,
    },
    /// `ip route del`
    DeleteRoute {
        /// Namespace holding the route.
        namespace: Option<String>,
        /// The route.
        route: RouteSpec,
    },
    /// Write `1` to `/proc/sys/net/ipv4/ip_forward`.
    EnableForwarding,
    /// Write `0` to `/proc/sys/net/ipv4/ip_forward`.
    DisableForwarding,
    /// `iptables -t nat -A POSTROUTING -s <source> -j MASQUERADE`
    AddMasquerade {
        /// Source subnet.
        source: Ipv4Cidr,
    },
    /// `iptables -t nat -D POSTROUTING -s <source> -j MASQUERADE`
    DeleteMasquerade {
        /// Source subnet.
        source: Ipv4Cidr,
    },
    /// Write `/etc/netns/<namespace>/resolv.conf`.
    WriteResolvConf {
        /// Namespace name.
        namespace: String,
        /// Nameservers.
        servers: Vec<Ipv4Addr>,
    },
    /// Remove `/etc/netns/<namespace>/resolv.conf`.
    RemoveResolvConf {
        /// Namespace name.
        namespace: String,
    },
}

/// How an operation is carried out on a real host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Run a program with arguments.
    Command(Vec<String>),
    /// Replace a file's contents.
    WriteFile {
        /// Target path.
        path: PathBuf,
        /// New contents.
        contents: String,
    },
    /// Remove a file (and its directory, when left empty).
    RemoveFile {
        /// Target path.
        path: PathBuf,
    },
}

impl HostOp {
    /// The operation that undoes this one, if it leaves anything behind.
    ///
    /// Addresses, link state and default routes vanish with the link or
    /// namespace they belong to. Callers apply `EnableForwarding` only when
    /// forwarding is off, so its inverse switches it back off.
    pub fn inverse(&self) -> Option<HostOp> {
        match self {
            HostOp::AddNamespace { name } => Some(HostOp::DeleteNamespace { name: name.clone() }),
            HostOp::AddVethPair { host, .. } => Some(HostOp::DeleteLink {
                namespace: None,
                link: host.clone(),
            }),
            HostOp::AddTun { namespace, link } => Some(HostOp::DeleteLink {
                namespace: Some(namespace.clone()),
                link: link.clone(),
            }),
            HostOp::AddRoute { namespace, route } => Some(HostOp::DeleteRoute {
                namespace: namespace.clone(),
                route: route.clone(),
            }),
            HostOp::AddMasquerade { source } => Some(HostOp::DeleteMasquerade { source: *source }),
            HostOp::WriteResolvConf { namespace, .. } => Some(HostOp::RemoveResolvConf {
                namespace: namespace.clone(),
            }),
            HostOp::EnableForwarding => Some(HostOp::DisableForwarding),
            HostOp::DeleteNamespace { .. }
            | HostOp::MoveLink { .. }
            | HostOp::DeleteLink { .. }
            | HostOp::AddAddress { .. }
            | HostOp::SetLinkUp { .. }
            | HostOp::DeleteRoute { .. }
            | HostOp::DisableForwarding
            | HostOp::DeleteMasquerade { .. }
            | HostOp::RemoveResolvConf { .. } => None,
        }
    }

    /// The resource a removal operation targets.
    pub fn target(&self) -> Option<Resource> {
        match self {
            HostOp::DeleteNamespace { name } => Some(Resource::Namespace { name: name.clone() }),
            HostOp::DeleteLink { namespace, link } => Some(Resource::Link {
                namespace: namespace.clone(),
                name: link.clone(),
            }),
            HostOp::DeleteRoute { namespace, route } => Some(Resource::Route {
                namespace: namespace.clone(),
                destination: route.destination.clone(),
            }),
            HostOp::DeleteMasquerade { source } => Some(Resource::NatRule { source: *source }),
            HostOp::RemoveResolvConf { namespace } => Some(Resource::ResolvConf {
                namespace: namespace.clone(),
            }),
            HostOp::DisableForwarding => Some(Resource::IpForwarding),
            _ => None,
        }
    }

    /// How to carry the operation out with iproute2/iptables.
    pub fn invocation(&self) -> Invocation {
        match self {
            HostOp::AddNamespace { name } => ip(None, &["netns", "add", name]),
            HostOp::DeleteNamespace { name } => ip(None, &["netns", "delete", name]),
            HostOp::AddVethPair { host, peer } => ip(
                None,
                &["link", "add", host, "type", "veth", "peer", "name", peer],
            ),
            HostOp::MoveLink { link, namespace } => {
                ip(None, &["link", "set", link, "netns", namespace])
            }
            HostOp::DeleteLink { namespace, link } => {
                ip(namespace.as_deref(), &["link", "delete", link])
            }
            HostOp::AddAddress {
                namespace,
                link,
                address,
            } => ip(
                namespace.as_deref(),
                &["addr", "add", &address.to_string(), "dev", link],
            ),
            HostOp::SetLinkUp { namespace, link } => {
                ip(namespace.as_deref(), &["link", "set", link, "up"])
            }
            HostOp::AddTun { namespace, link } => ip(
                Some(namespace),
                &["tuntap", "add", "dev", link, "mode", "tun"],
            ),
            HostOp::AddRoute { namespace, route } => {
                let mut args = vec!["route".to_string(), "add".to_string()];
                args.extend(route.args());
                ip_owned(namespace.as_deref(), args)
            }
            HostOp::DeleteRoute { namespace, route } => {
                let mut args = vec!["route".to_string(), "del".to_string()];
                args.extend(route.args());
                ip_owned(namespace.as_deref(), args)
            }
            HostOp::EnableForwarding => Invocation::WriteFile {
                path: PathBuf::from(IP_FORWARD_PATH),
                contents: "1\n".to_string(),
            },
            HostOp::DisableForwarding => Invocation::WriteFile {
                path: PathBuf::from(IP_FORWARD_PATH),
                contents: "0\n".to_string(),
            },
            HostOp::AddMasquerade { source } => masquerade("-A", source),
            HostOp::DeleteMasquerade { source } => masquerade("-D", source),
            HostOp::WriteResolvConf { namespace, servers } => Invocation::WriteFile {
                path: resolv_conf_path(namespace),
                contents: servers
                    .iter()
                    .map(|ip| format!("nameserver {}\n", ip))
                    .collect(),
            },
            HostOp::RemoveResolvConf { namespace } => Invocation::RemoveFile {
                path: resolv_conf_path(namespace),
            },
        }
    }

    /// Shell-like rendering for logs and dry runs.
    pub fn command_line(&self) -> String {
        match self.invocation() {
            Invocation::Command(argv) => argv.join(" "),
            Invocation::WriteFile { path, contents } => {
                format!("write {} ({})", path.display(), contents.trim().replace('\n', "; "))
            }
            Invocation::RemoveFile { path } => format!("rm -f {}", path.display()),
        }
    }
}

/// Path of a namespace's resolv.conf override.
pub fn resolv_conf_path(namespace: &str) -> PathBuf {
    Path::new(NETNS_ETC_DIR).join(namespace).join("resolv.conf")
}

fn ip(namespace: Option<&str>, args: &[&str]) -> Invocation {
    ip_owned(namespace, args.iter().map(|s| s.to_string()).collect())
}

fn ip_owned(namespace: Option<&str>, args: Vec<String>) -> Invocation {
    let mut argv = vec!["ip".to_string()];
    if let Some(ns) = namespace {
        argv.push("-n".to_string());
        argv.push(ns.to_string());
    }
    argv.extend(args);
    Invocation::Command(argv)
}

fn masquerade(action: &str, source: &Ipv4Cidr) -> Invocation {
    Invocation::Command(
        [
            "iptables",
            "-w",
            "-t",
            "nat",
            action,
            "POSTROUTING",
            "-s",
            &source.subnet().to_string(),
            "-j",
            "MASQUERADE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    )
}

/// Host facilities the orchestrator needs.
///
/// Implementations must be safe to share between threads; the orchestrator
/// serializes mutations itself.
pub trait NetworkHost: Send + Sync {
    /// Perform one mutation.
    fn apply(&self, op: &HostOp) -> Result<(), HostError>;

    /// Whether a named namespace exists.
    fn namespace_exists(&self, name: &str) -> bool;

    /// Whether an interface exists (`namespace: None` means the host).
    fn link_exists(&self, namespace: Option<&str>, link: &str) -> bool;

    /// Whether the NAT rule for `source` is installed.
    fn masquerade_exists(&self, source: &Ipv4Cidr) -> bool;

    /// Whether the namespace has a resolv.conf override.
    fn resolv_conf_exists(&self, namespace: &str) -> bool;

    /// Whether the host forwards IPv4 packets.
    fn forwarding_enabled(&self) -> bool;

    /// Start the relay inside `namespace`, returning its PID.
    fn spawn_relay(&self, namespace: &str, command: &RelayCommand) -> Result<u32, HostError>;

    /// Whether a process is still running.
    fn process_alive(&self, pid: u32) -> bool;

    /// Send a signal to a process.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), HostError>;
}

/// [`NetworkHost`] backed by iproute2, iptables and real processes.
#[derive(Debug, Default)]
pub struct IpCommandHost {
    /// Relays spawned by this process, kept so they can be reaped.
    children: Mutex<HashMap<u32, Child>>,
    /// File receiving the relay's stdout/stderr.
    relay_log: Option<PathBuf>,
}

impl IpCommandHost {
    /// Create a host that discards relay output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append relay output to `path`.
    pub fn with_relay_log(mut self, path: PathBuf) -> Self {
        self.relay_log = Some(path);
        self
    }

    fn relay_stdio(&self) -> (Stdio, Stdio) {
        let Some(ref path) = self.relay_log else {
            return (Stdio::null(), Stdio::null());
        };
        let opened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|f| Ok((f.try_clone()?, f)));
        match opened {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                warn!("Cannot open relay log {}: {}", path.display(), e);
                (Stdio::null(), Stdio::null())
            }
        }
    }
}

impl NetworkHost for IpCommandHost {
    fn apply(&self, op: &HostOp) -> Result<(), HostError> {
        match op.invocation() {
            Invocation::Command(argv) => run_command(&argv),
            Invocation::WriteFile { path, contents } => {
                debug!("Writing {}", path.display());
                if let Some(parent) = path.parent()
                    && !parent.exists()
                {
                    fs::create_dir_all(parent).map_err(|source| HostError::FileError {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                fs::write(&path, contents).map_err(|source| HostError::FileError { path, source })
            }
            Invocation::RemoveFile { path } => {
                debug!("Removing {}", path.display());
                crate::persist::remove(&path).map_err(|source| HostError::FileError {
                    path: path.clone(),
                    source,
                })?;
                // Drop the per-namespace directory once it is empty
                if let Some(parent) = path.parent()
                    && let Err(e) = fs::remove_dir(parent)
                {
                    debug!("Leaving {}: {}", parent.display(), e);
                }
                Ok(())
            }
        }
    }

    fn namespace_exists(&self, name: &str) -> bool {
        Path::new(NETNS_RUN_DIR).join(name).exists()
    }

    fn link_exists(&self, namespace: Option<&str>, link: &str) -> bool {
        let Invocation::Command(argv) = ip(namespace, &["link", "show", "dev", link]) else {
            return false;
        };
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn masquerade_exists(&self, source: &Ipv4Cidr) -> bool {
        let Invocation::Command(argv) = masquerade("-C", source) else {
            return false;
        };
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn resolv_conf_exists(&self, namespace: &str) -> bool {
        resolv_conf_path(namespace).exists()
    }

    fn forwarding_enabled(&self) -> bool {
        fs::read_to_string(IP_FORWARD_PATH).is_ok_and(|v| v.trim() == "1")
    }

    fn spawn_relay(&self, namespace: &str, command: &RelayCommand) -> Result<u32, HostError> {
        let (stdout, stderr) = self.relay_stdio();
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", namespace])
            .arg(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // Own process group: a Ctrl-C in the caller's terminal must not reach it
            .process_group(0);

        debug!(
            "Running: ip netns exec {} {}",
            namespace,
            command.command_line()
        );
        let child = cmd.spawn().map_err(|source| HostError::SpawnFailed {
            program: command.program.clone(),
            source,
        })?;

        // `ip netns exec` execs the program, so the child PID is the relay's PID
        let pid = child.id();
        info!("Relay started in namespace {} with PID {}", namespace, pid);
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);
        Ok(pid)
    }

    fn process_alive(&self, pid: u32) -> bool {
        {
            let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(child) = children.get_mut(&pid) {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("Relay {} exited with {}", pid, status);
                        children.remove(&pid);
                        return false;
                    }
                    Ok(None) => return true,
                    Err(e) => warn!("Failed to poll relay {}: {}", pid, e),
                }
            }
        }
        process_exists(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), HostError> {
        debug!("Sending {} to PID {}", signal, pid);
        match kill(to_pid(pid)?, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(HostError::NoSuchProcess { pid }),
            Err(source) => Err(HostError::SignalFailed { pid, source }),
        }
    }
}

fn to_pid(pid: u32) -> Result<Pid, HostError> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(Pid::from_raw)
        .ok_or(HostError::NoSuchProcess { pid })
}

/// Whether `pid` names a live (non-zombie) process.
pub fn process_exists(pid: u32) -> bool {
    let Ok(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// A zombie has exited and only waits for its parent to reap it.
fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // The command name may contain spaces and parentheses; state follows the last ')'
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

/// Run a command, failing with its stderr on a non-zero exit.
fn run_command(argv: &[String]) -> Result<(), HostError> {
    let cmd_str = argv.join(" ");
    debug!("Running: {}", cmd_str);

    let Some((program, args)) = argv.split_first() else {
        return Err(HostError::CommandError {
            cmd: cmd_str,
            stderr: "empty command".to_string(),
        });
    };

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| HostError::CommandFailed {
            cmd: cmd_str.clone(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(HostError::CommandError { cmd: cmd_str, stderr });
    }

    Ok(())
}
