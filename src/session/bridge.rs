//! Running commands inside a READY namespace as the invoking user.

use super::builder::BridgeCommandBuilder;
use super::environment::SessionEnvironment;
use super::error::RunError;
use crate::netns::NamespaceOrchestrator;
use crate::telemetry::{self, AuditEvent};
use std::fs::{self, File};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info};

/// PATH inside the namespace.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Elevation tools, in order of preference.
pub const ELEVATION_TOOLS: [&str; 3] = ["sudo", "pkexec", "doas"];

/// Starts a prepared command and waits for it.
pub trait Spawner: Send + Sync {
    /// Run `command` to completion.
    fn run(&self, command: Command) -> io::Result<ExitStatus>;
}

/// Runs the command attached to the caller's terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct InheritStdio;

impl Spawner for InheritStdio {
    fn run(&self, mut command: Command) -> io::Result<ExitStatus> {
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
    }
}

/// Facts about the calling process that decide how the namespace is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Effective uid of this process.
    pub euid: u32,
    /// Elevation tool to prefix when not root.
    pub elevation: Option<String>,
    /// `setpriv`, if installed.
    pub setpriv: Option<PathBuf>,
    /// Caller's `TERM`, carried into the namespace.
    pub term: Option<String>,
}

impl BridgeOptions {
    /// Options describing the current process.
    pub fn detect() -> Self {
        Self {
            euid: nix::unistd::geteuid().as_raw(),
            elevation: ELEVATION_TOOLS
                .iter()
                .find(|tool| which::which(tool).is_ok())
                .map(|tool| tool.to_string()),
            setpriv: which::which("setpriv").ok(),
            term: std::env::var("TERM").ok(),
        }
    }
}

/// Runs commands in the namespace with the user's session re-exposed.
pub struct SessionBridge<S: Spawner = InheritStdio> {
    spawner: S,
    options: BridgeOptions,
}

impl SessionBridge<InheritStdio> {
    /// Bridge for the current process, attached to its terminal.
    pub fn new() -> Self {
        Self::with_spawner(InheritStdio, BridgeOptions::detect())
    }
}

impl Default for SessionBridge<InheritStdio> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Spawner> SessionBridge<S> {
    /// Bridge with an explicit spawner and process facts.
    pub fn with_spawner(spawner: S, options: BridgeOptions) -> Self {
        Self { spawner, options }
    }

    /// Build the command for `env` without running it.
    ///
    /// Fails when a session resource is unreadable or the switch to
    /// `env.uid` is impossible.
    pub fn prepare(
        &self,
        env: &SessionEnvironment,
        namespace: &str,
        command: Option<&str>,
    ) -> Result<BridgeCommandBuilder, RunError> {
        let mut builder = BridgeCommandBuilder::new(namespace);

        // `ip netns exec` needs root; after it we are root until setpriv
        if self.options.euid != 0 {
            let tool = self.options.elevation.as_deref().ok_or_else(|| RunError::PrivilegeDrop {
                user: env.user.clone(),
                reason: "entering a namespace requires root and no sudo, pkexec or doas was found"
                    .to_string(),
            })?;
            builder = builder.elevate(tool);
        }
        if env.uid != 0 {
            if self.options.setpriv.is_none() {
                return Err(RunError::PrivilegeDrop {
                    user: env.user.clone(),
                    reason: "setpriv (util-linux) is not installed".to_string(),
                });
            }
            builder = builder.drop_privileges(env.uid, env.gid);
        }

        builder = builder
            .setenv("HOME", &env.home.to_string_lossy())
            .setenv("USER", &env.user)
            .setenv("LOGNAME", &env.user)
            .setenv("SHELL", &env.shell.to_string_lossy())
            .setenv("PATH", DEFAULT_PATH)
            .setenv("XDG_RUNTIME_DIR", &env.runtime_dir.to_string_lossy());
        if let Some(ref term) = self.options.term {
            builder = builder.setenv("TERM", term);
        }

        for (key, value) in session_variables(env)? {
            builder = builder.setenv(key, &value);
        }

        let args = match command {
            Some(cmd) if !cmd.trim().is_empty() => vec!["-c".to_string(), cmd.to_string()],
            _ => vec!["-l".to_string()],
        };
        Ok(builder.chdir(&env.home).command(&env.shell, &args))
    }

    /// Run `command` (an interactive login shell when `None`) in `namespace`.
    ///
    /// Holds the orchestrator's read lock until the command exits. Returns
    /// the command's exit code; signal deaths map to `128 + signal`.
    pub fn run(
        &self,
        orchestrator: &NamespaceOrchestrator,
        env: &SessionEnvironment,
        namespace: &str,
        command: Option<&str>,
    ) -> Result<i32, RunError> {
        let guard = orchestrator.read_ready(namespace)?;
        if !orchestrator.host().namespace_exists(guard.namespace()) {
            return Err(RunError::NamespaceMissing {
                namespace: namespace.to_string(),
            });
        }

        let builder = self.prepare(env, namespace, command)?;
        info!("Running in namespace {}: {}", namespace, builder.to_command_line());

        let program = builder
            .argv()
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let status = self
            .spawner
            .run(builder.build())
            .map_err(|source| RunError::Spawn { program, source })?;
        let code = exit_code(status);
        debug!("Command in namespace {} exited with {}", namespace, code);

        telemetry::record(AuditEvent::CommandRun {
            namespace: namespace.to_string(),
            user: env.user.clone(),
            uid: env.uid,
            command: command.unwrap_or_default().to_string(),
            exit_code: code,
        });
        drop(guard);
        Ok(code)
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Display, audio and bus variables, after checking every path they name.
fn session_variables(env: &SessionEnvironment) -> Result<Vec<(&'static str, String)>, RunError> {
    let mut vars = Vec::new();

    if let Some(ref socket) = env.audio_socket {
        check_present("audio socket", socket)?;
        if socket.ends_with("pulse/native") {
            vars.push(("PULSE_SERVER", format!("unix:{}", socket.display())));
        } else {
            vars.push(("PIPEWIRE_REMOTE", socket.to_string_lossy().into_owned()));
        }
    }
    if let Some(ref socket) = env.bus_socket {
        check_present("session bus socket", socket)?;
        vars.push((
            "DBUS_SESSION_BUS_ADDRESS",
            format!("unix:path={}", socket.display()),
        ));
    }
    if let Some(ref display) = env.display {
        vars.push(("DISPLAY", display.clone()));
    }
    if let Some(ref xauthority) = env.xauthority {
        check_readable("X authority file", xauthority)?;
        vars.push(("XAUTHORITY", xauthority.to_string_lossy().into_owned()));
    }
    if let Some(ref wayland) = env.wayland_display {
        let socket = env.runtime_dir.join(wayland);
        check_present("Wayland socket", &socket)?;
        vars.push(("WAYLAND_DISPLAY", wayland.clone()));
    }
    Ok(vars)
}

fn check_present(resource: &'static str, path: &Path) -> Result<(), RunError> {
    fs::metadata(path)
        .map(|_| ())
        .map_err(|source| RunError::ResourceUnavailable {
            resource,
            path: path.to_path_buf(),
            source,
        })
}

fn check_readable(resource: &'static str, path: &Path) -> Result<(), RunError> {
    File::open(path)
        .map(|_| ())
        .map_err(|source| RunError::ResourceUnavailable {
            resource,
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netns::memory::MemoryHost;
    use crate::netns::spec::tests::sample_spec;
    use crate::netns::{OrchestratorOptions, ReadyError};
    use crate::session::environment::tests::sample_environment;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records command lines instead of running them.
    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<Vec<String>>>,
        exit: i32,
    }

    impl Spawner for Recorder {
        fn run(&self, command: Command) -> io::Result<ExitStatus> {
            let mut argv = vec![command.get_program().to_string_lossy().into_owned()];
            argv.extend(command.get_args().map(|a| a.to_string_lossy().into_owned()));
            self.commands.lock().unwrap().push(argv);
            Ok(ExitStatus::from_raw(self.exit << 8))
        }
    }

    fn root_options() -> BridgeOptions {
        BridgeOptions {
            euid: 0,
            elevation: None,
            setpriv: Some(PathBuf::from("/usr/bin/setpriv")),
            term: Some("xterm-256color".to_string()),
        }
    }

    fn ready_orchestrator() -> NamespaceOrchestrator {
        let options = OrchestratorOptions {
            settle_delay: Duration::ZERO,
            ..OrchestratorOptions::default()
        };
        let orch = NamespaceOrchestrator::new(Arc::new(MemoryHost::new()), options);
        orch.setup(sample_spec()).unwrap();
        orch
    }

    #[test]
    fn test_prepare_as_root_drops_to_user() {
        let home = tempfile::tempdir().unwrap();
        let env = sample_environment(home.path());
        let bridge = SessionBridge::with_spawner(Recorder::default(), root_options());

        let line = bridge
            .prepare(&env, "nsA", Some("echo hi"))
            .unwrap()
            .to_command_line();
        assert!(line.starts_with("ip netns exec nsA setpriv --reuid=1000 --regid=1000"));
        assert!(line.contains("env -i"));
        assert!(line.contains("USER=alice"));
        assert!(line.contains("TERM=xterm-256color"));
        assert!(line.ends_with("/bin/bash -c 'echo hi'"));
    }

    #[test]
    fn test_prepare_unprivileged_needs_elevation() {
        let home = tempfile::tempdir().unwrap();
        let env = sample_environment(home.path());
        let mut options = root_options();
        options.euid = 1000;

        let bridge = SessionBridge::with_spawner(Recorder::default(), options.clone());
        assert!(matches!(
            bridge.prepare(&env, "nsA", None),
            Err(RunError::PrivilegeDrop { .. })
        ));

        options.elevation = Some("sudo".to_string());
        let bridge = SessionBridge::with_spawner(Recorder::default(), options);
        let line = bridge.prepare(&env, "nsA", None).unwrap().to_command_line();
        assert!(line.starts_with("sudo ip netns exec nsA setpriv"));
        assert!(line.ends_with("/bin/bash -l"));
    }

    #[test]
    fn test_prepare_without_setpriv_fails() {
        let home = tempfile::tempdir().unwrap();
        let env = sample_environment(home.path());
        let mut options = root_options();
        options.setpriv = None;
        let bridge = SessionBridge::with_spawner(Recorder::default(), options);
        assert!(matches!(
            bridge.prepare(&env, "nsA", None),
            Err(RunError::PrivilegeDrop { .. })
        ));
    }

    #[test]
    fn test_session_sockets_exported() {
        let home = tempfile::tempdir().unwrap();
        let runtime = tempfile::tempdir().unwrap();
        fs::create_dir(runtime.path().join("pulse")).unwrap();
        File::create(runtime.path().join("pulse/native")).unwrap();
        File::create(runtime.path().join("bus")).unwrap();
        File::create(runtime.path().join("wayland-0")).unwrap();
        let cookie = home.path().join(".Xauthority");
        File::create(&cookie).unwrap();

        let mut env = sample_environment(home.path());
        env.runtime_dir = runtime.path().to_path_buf();
        env.audio_socket = Some(runtime.path().join("pulse/native"));
        env.bus_socket = Some(runtime.path().join("bus"));
        env.display = Some(":0".to_string());
        env.xauthority = Some(cookie.clone());
        env.wayland_display = Some("wayland-0".to_string());

        let bridge = SessionBridge::with_spawner(Recorder::default(), root_options());
        let builder = bridge.prepare(&env, "nsA", Some("firefox")).unwrap();
        let vars = builder.env_vars();

        assert_eq!(
            vars.get("PULSE_SERVER"),
            Some(&format!("unix:{}", runtime.path().join("pulse/native").display()))
        );
        assert_eq!(
            vars.get("DBUS_SESSION_BUS_ADDRESS"),
            Some(&format!("unix:path={}", runtime.path().join("bus").display()))
        );
        assert_eq!(vars.get("DISPLAY").map(String::as_str), Some(":0"));
        assert_eq!(vars.get("WAYLAND_DISPLAY").map(String::as_str), Some("wayland-0"));
        assert_eq!(
            vars.get("XAUTHORITY"),
            Some(&cookie.to_string_lossy().into_owned())
        );
    }

    #[test]
    fn test_missing_socket_is_resource_error() {
        let home = tempfile::tempdir().unwrap();
        let mut env = sample_environment(home.path());
        env.bus_socket = Some(home.path().join("gone"));

        let bridge = SessionBridge::with_spawner(Recorder::default(), root_options());
        let err = bridge.prepare(&env, "nsA", None).unwrap_err();
        assert!(matches!(
            err,
            RunError::ResourceUnavailable {
                resource: "session bus socket",
                ..
            }
        ));
    }

    #[test]
    fn test_run_returns_command_exit_code() {
        let home = tempfile::tempdir().unwrap();
        let env = sample_environment(home.path());
        let orch = ready_orchestrator();
        let recorder = Recorder {
            exit: 3,
            ..Recorder::default()
        };
        let bridge = SessionBridge::with_spawner(recorder, root_options());

        let code = bridge.run(&orch, &env, "nsA", Some("false")).unwrap();
        assert_eq!(code, 3);
        let commands = bridge.spawner.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0][..4], ["ip", "netns", "exec", "nsA"]);
    }

    #[test]
    fn test_run_when_not_ready_launches_nothing() {
        let home = tempfile::tempdir().unwrap();
        let env = sample_environment(home.path());
        let orch = NamespaceOrchestrator::new(Arc::new(MemoryHost::new()), OrchestratorOptions::default());
        let bridge = SessionBridge::with_spawner(Recorder::default(), root_options());

        let err = bridge.run(&orch, &env, "nsA", Some("echo hi")).unwrap_err();
        assert!(matches!(err, RunError::NotReady(ReadyError::NotReady { .. })));
        assert!(bridge.spawner.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_exit_code_maps_signals() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(1 << 8)), 1);
        // Killed by SIGINT (2)
        assert_eq!(exit_code(ExitStatus::from_raw(2)), 130);
    }
}
