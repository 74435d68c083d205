//! Reconstruction of the invoking user's desktop session.
//!
//! proxyns usually runs under sudo, pkexec or doas, where the process
//! environment describes root rather than the person at the keyboard. The
//! [`EnvironmentReconstructor`] recovers who that person is and where their
//! session sockets live, so commands started in the namespace can still reach
//! the display, the audio server and the session bus.
//!
//! Identity is taken from the first of these that resolves:
//!
//! 1. `SUDO_UID` (or `SUDO_USER`)
//! 2. `PKEXEC_UID`
//! 3. `DOAS_USER`
//! 4. the real uid of the process
//!
//! The result is saved to `environment.json` so later invocations that lack
//! the original variables can reuse it.

use super::error::ReconstructError;
use crate::persist;
use crate::telemetry::{self, AuditEvent};
use nix::unistd::{Uid, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Side file name inside the state directory.
pub const ENVIRONMENT_FILE_NAME: &str = "environment.json";

/// Where X servers put their sockets.
pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Parent of per-user runtime directories.
pub const RUN_USER_DIR: &str = "/run/user";

/// The invoking user's identity and session resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnvironment {
    /// Login name.
    pub user: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
    /// Login shell.
    pub shell: PathBuf,
    /// XDG runtime directory.
    pub runtime_dir: PathBuf,
    /// PulseAudio or PipeWire socket.
    pub audio_socket: Option<PathBuf>,
    /// D-Bus session bus socket.
    pub bus_socket: Option<PathBuf>,
    /// X11 display (`:0`).
    pub display: Option<String>,
    /// X authority file.
    pub xauthority: Option<PathBuf>,
    /// Wayland socket name (`wayland-0`).
    pub wayland_display: Option<String>,
}

/// A passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Login name.
    pub name: String,
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
    /// Login shell.
    pub shell: PathBuf,
}

impl From<User> for Account {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
            shell: user.shell,
        }
    }
}

/// A passwd lookup key.
#[derive(Debug, Clone, Copy)]
pub enum AccountQuery<'a> {
    /// By user id.
    Uid(u32),
    /// By login name.
    Name(&'a str),
}

type AccountLookup = Box<dyn Fn(AccountQuery<'_>) -> Option<Account> + Send + Sync>;

fn system_lookup(query: AccountQuery<'_>) -> Option<Account> {
    let user = match query {
        AccountQuery::Uid(uid) => User::from_uid(Uid::from_raw(uid)),
        AccountQuery::Name(name) => User::from_name(name),
    };
    user.ok().flatten().map(Account::from)
}

/// Rebuilds a [`SessionEnvironment`] from process variables and the filesystem.
pub struct EnvironmentReconstructor {
    vars: HashMap<String, String>,
    real_uid: u32,
    x11_socket_dir: PathBuf,
    run_user_dir: PathBuf,
    lookup: AccountLookup,
}

impl EnvironmentReconstructor {
    /// Reconstructor for the current process.
    pub fn from_process() -> Self {
        Self::new(std::env::vars().collect(), nix::unistd::getuid().as_raw())
    }

    /// Reconstructor over explicit variables and real uid.
    pub fn new(vars: HashMap<String, String>, real_uid: u32) -> Self {
        Self {
            vars,
            real_uid,
            x11_socket_dir: PathBuf::from(X11_SOCKET_DIR),
            run_user_dir: PathBuf::from(RUN_USER_DIR),
            lookup: Box::new(system_lookup),
        }
    }

    /// Look for X11 sockets in `dir` instead of `/tmp/.X11-unix`.
    pub fn with_x11_socket_dir(mut self, dir: PathBuf) -> Self {
        self.x11_socket_dir = dir;
        self
    }

    /// Use `dir` instead of `/run/user` for the runtime directory fallback.
    pub fn with_run_user_dir(mut self, dir: PathBuf) -> Self {
        self.run_user_dir = dir;
        self
    }

    /// Resolve accounts with `lookup` instead of the system passwd database.
    pub fn with_account_lookup(
        mut self,
        lookup: impl Fn(AccountQuery<'_>) -> Option<Account> + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Work out who invoked us and where their session lives.
    pub fn reconstruct(&self) -> Result<SessionEnvironment, ReconstructError> {
        let account = self.identify()?;
        debug!("Invoking user is {} (uid {})", account.name, account.uid);

        if account.home.as_os_str().is_empty() || !account.home.is_dir() {
            return Err(ReconstructError::IdentityUnavailable(format!(
                "home directory '{}' of {} does not exist",
                account.home.display(),
                account.name
            )));
        }

        let runtime_dir = self.runtime_dir(account.uid);
        let env = SessionEnvironment {
            audio_socket: audio_socket(&runtime_dir),
            bus_socket: self.bus_socket(&runtime_dir),
            display: self.display(),
            xauthority: self.xauthority(&account.home, &runtime_dir),
            wayland_display: self.wayland_display(&runtime_dir),
            user: account.name,
            uid: account.uid,
            gid: account.gid,
            home: account.home,
            shell: account.shell,
            runtime_dir,
        };

        info!(
            "Session of {}: display={:?} wayland={:?} audio={:?} bus={:?}",
            env.user, env.display, env.wayland_display, env.audio_socket, env.bus_socket
        );
        telemetry::record(AuditEvent::EnvironmentReconstructed {
            user: env.user.clone(),
            uid: env.uid,
        });
        Ok(env)
    }

    fn identify(&self) -> Result<Account, ReconstructError> {
        if let Some(found) = self.elevating_account() {
            return found;
        }
        (self.lookup)(AccountQuery::Uid(self.real_uid)).ok_or_else(|| {
            ReconstructError::IdentityUnavailable(format!("no passwd entry for uid {}", self.real_uid))
        })
    }

    /// The account that elevated this process through sudo, pkexec or doas.
    ///
    /// `None` when none of their variables is set.
    pub fn elevating_account(&self) -> Option<Result<Account, ReconstructError>> {
        if let Some(uid) = self.var("SUDO_UID") {
            let by_uid = uid
                .parse()
                .ok()
                .and_then(|uid| (self.lookup)(AccountQuery::Uid(uid)));
            let found = by_uid.or_else(|| {
                self.var("SUDO_USER")
                    .and_then(|name| (self.lookup)(AccountQuery::Name(name)))
            });
            return Some(found.ok_or_else(|| {
                ReconstructError::IdentityUnavailable(format!("no passwd entry for SUDO_UID={}", uid))
            }));
        }
        if let Some(name) = self.var("SUDO_USER") {
            return Some((self.lookup)(AccountQuery::Name(name)).ok_or_else(|| {
                ReconstructError::IdentityUnavailable(format!("no passwd entry for SUDO_USER={}", name))
            }));
        }
        if let Some(uid) = self.var("PKEXEC_UID") {
            return Some(
                uid.parse()
                    .ok()
                    .and_then(|uid| (self.lookup)(AccountQuery::Uid(uid)))
                    .ok_or_else(|| {
                        ReconstructError::IdentityUnavailable(format!(
                            "no passwd entry for PKEXEC_UID={}",
                            uid
                        ))
                    }),
            );
        }
        if let Some(name) = self.var("DOAS_USER") {
            return Some((self.lookup)(AccountQuery::Name(name)).ok_or_else(|| {
                ReconstructError::IdentityUnavailable(format!("no passwd entry for DOAS_USER={}", name))
            }));
        }
        None
    }

    fn runtime_dir(&self, uid: u32) -> PathBuf {
        if let Some(dir) = self.var("XDG_RUNTIME_DIR")
            && fs::metadata(dir).is_ok_and(|m| m.is_dir() && m.uid() == uid)
        {
            return PathBuf::from(dir);
        }
        self.run_user_dir.join(uid.to_string())
    }

    fn bus_socket(&self, runtime_dir: &Path) -> Option<PathBuf> {
        self.var("DBUS_SESSION_BUS_ADDRESS")
            .and_then(parse_unix_bus_address)
            .filter(|p| p.exists())
            .or_else(|| Some(runtime_dir.join("bus")).filter(|p| p.exists()))
    }

    fn display(&self) -> Option<String> {
        if let Some(display) = self.var("DISPLAY") {
            return Some(display.to_string());
        }
        lowest_numbered(&self.x11_socket_dir, "X", "").map(|n| format!(":{}", n))
    }

    fn xauthority(&self, home: &Path, runtime_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = self.var("XAUTHORITY").map(PathBuf::from)
            && path.exists()
        {
            return Some(path);
        }
        let in_home = home.join(".Xauthority");
        if in_home.exists() {
            return Some(in_home);
        }
        // GDM and Xwayland keep the cookie in the runtime directory
        let mut candidates: Vec<PathBuf> = fs::read_dir(runtime_dir)
            .ok()?
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.starts_with("xauth_") || name.contains("Xwaylandauth")
            })
            .map(|entry| entry.path())
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    fn wayland_display(&self, runtime_dir: &Path) -> Option<String> {
        if let Some(display) = self.var("WAYLAND_DISPLAY") {
            return Some(display.to_string());
        }
        lowest_numbered(runtime_dir, "wayland-", "").map(|n| format!("wayland-{}", n))
    }
}

fn audio_socket(runtime_dir: &Path) -> Option<PathBuf> {
    [runtime_dir.join("pulse").join("native"), runtime_dir.join("pipewire-0")]
        .into_iter()
        .find(|p| p.exists())
}

/// Path from a `unix:path=/run/user/1000/bus,guid=...` address.
fn parse_unix_bus_address(address: &str) -> Option<PathBuf> {
    address.split(';').find_map(|entry| {
        let params = entry.strip_prefix("unix:")?;
        params
            .split(',')
            .find_map(|kv| kv.strip_prefix("path="))
            .map(PathBuf::from)
    })
}

/// Lowest `n` among entries named `<prefix><n><suffix>` in `dir`.
fn lowest_numbered(dir: &Path, prefix: &str, suffix: &str) -> Option<u32> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix(prefix)?
                .strip_suffix(suffix)?
                .parse::<u32>()
                .ok()
        })
        .min()
}

/// The `environment.json` side file.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    path: PathBuf,
}

impl EnvironmentStore {
    /// Store at `<dir>/environment.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(ENVIRONMENT_FILE_NAME),
        }
    }

    /// Path of the side file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the side file.
    pub fn save(&self, env: &SessionEnvironment) -> Result<(), ReconstructError> {
        persist::write_json(&self.path, env).map_err(|e| self.map_err(e))
    }

    /// Read the saved environment.
    pub fn load(&self) -> Result<SessionEnvironment, ReconstructError> {
        persist::read_json(&self.path)
            .map_err(|e| self.map_err(e))?
            .ok_or_else(|| ReconstructError::NotFound {
                path: self.path.clone(),
            })
    }

    fn map_err(&self, err: persist::JsonFileError) -> ReconstructError {
        match err {
            persist::JsonFileError::Io(source) => ReconstructError::Io {
                path: self.path.clone(),
                source,
            },
            persist::JsonFileError::Json(source) => ReconstructError::Parse {
                path: self.path.clone(),
                source,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    /// A session with no display resources, rooted in `home`.
    pub(crate) fn sample_environment(home: &Path) -> SessionEnvironment {
        SessionEnvironment {
            user: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home: home.to_path_buf(),
            shell: PathBuf::from("/bin/bash"),
            runtime_dir: PathBuf::from("/run/user/1000"),
            audio_socket: None,
            bus_socket: None,
            display: None,
            xauthority: None,
            wayland_display: None,
        }
    }

    struct Fixture {
        home: TempDir,
        runtime: TempDir,
        x11: TempDir,
        uid: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                home: tempfile::tempdir().unwrap(),
                runtime: tempfile::tempdir().unwrap(),
                x11: tempfile::tempdir().unwrap(),
                uid: nix::unistd::getuid().as_raw(),
            }
        }

        fn account(&self) -> Account {
            Account {
                name: "alice".to_string(),
                uid: self.uid,
                gid: 1000,
                home: self.home.path().to_path_buf(),
                shell: PathBuf::from("/bin/zsh"),
            }
        }

        fn reconstructor(&self, vars: &[(&str, &str)]) -> EnvironmentReconstructor {
            let account = self.account();
            let vars = vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            EnvironmentReconstructor::new(vars, 0)
                .with_x11_socket_dir(self.x11.path().to_path_buf())
                .with_run_user_dir(self.runtime.path().join("run-user"))
                .with_account_lookup(move |query| match query {
                    AccountQuery::Uid(uid) if uid == account.uid => Some(account.clone()),
                    AccountQuery::Name("alice") => Some(account.clone()),
                    _ => None,
                })
        }

        fn runtime_var(&self) -> String {
            self.runtime.path().to_string_lossy().into_owned()
        }
    }

    #[test]
    fn test_sudo_uid_identifies_user() {
        let fx = Fixture::new();
        let uid = fx.uid.to_string();
        let env = fx
            .reconstructor(&[("SUDO_UID", &uid), ("XDG_RUNTIME_DIR", &fx.runtime_var())])
            .reconstruct()
            .unwrap();

        assert_eq!(env.user, "alice");
        assert_eq!(env.uid, fx.uid);
        assert_eq!(env.gid, 1000);
        assert_eq!(env.shell, PathBuf::from("/bin/zsh"));
        assert_eq!(env.runtime_dir, fx.runtime.path());
        // Headless: display fields are unset, not errors
        assert_eq!(env.display, None);
        assert_eq!(env.wayland_display, None);
        assert_eq!(env.audio_socket, None);
    }

    #[test]
    fn test_doas_user_by_name() {
        let fx = Fixture::new();
        let env = fx
            .reconstructor(&[("DOAS_USER", "alice")])
            .reconstruct()
            .unwrap();
        assert_eq!(env.user, "alice");
    }

    #[test]
    fn test_elevating_account_only_for_elevated_runs() {
        let fx = Fixture::new();
        assert!(fx.reconstructor(&[]).elevating_account().is_none());

        let account = fx
            .reconstructor(&[("SUDO_USER", "alice")])
            .elevating_account()
            .unwrap()
            .unwrap();
        assert_eq!(account.home, fx.home.path());
    }

    #[test]
    fn test_unknown_identity_is_an_error() {
        let fx = Fixture::new();
        let err = fx
            .reconstructor(&[("PKEXEC_UID", "424242")])
            .reconstruct()
            .unwrap_err();
        assert!(matches!(err, ReconstructError::IdentityUnavailable(_)));
    }

    #[test]
    fn test_missing_home_is_an_error() {
        let fx = Fixture::new();
        let mut account = fx.account();
        account.home = fx.home.path().join("does-not-exist");
        let reconstructor = EnvironmentReconstructor::new(HashMap::new(), fx.uid)
            .with_account_lookup(move |_| Some(account.clone()));
        assert!(matches!(
            reconstructor.reconstruct(),
            Err(ReconstructError::IdentityUnavailable(_))
        ));
    }

    #[test]
    fn test_runtime_dir_falls_back_to_run_user() {
        let fx = Fixture::new();
        let uid = fx.uid.to_string();
        let env = fx
            .reconstructor(&[("SUDO_UID", &uid), ("XDG_RUNTIME_DIR", "/nonexistent/runtime")])
            .reconstruct()
            .unwrap();
        assert_eq!(
            env.runtime_dir,
            fx.runtime.path().join("run-user").join(&uid)
        );
    }

    #[test]
    fn test_sockets_discovered_in_runtime_dir() {
        let fx = Fixture::new();
        let rt = fx.runtime.path();
        fs::create_dir(rt.join("pulse")).unwrap();
        File::create(rt.join("pulse").join("native")).unwrap();
        File::create(rt.join("bus")).unwrap();
        File::create(rt.join("wayland-1")).unwrap();
        File::create(rt.join("wayland-1.lock")).unwrap();
        File::create(rt.join("wayland-0")).unwrap();
        File::create(rt.join(".mutter-Xwaylandauth.AB12CD")).unwrap();
        File::create(fx.x11.path().join("X1")).unwrap();
        File::create(fx.x11.path().join("X0")).unwrap();

        let uid = fx.uid.to_string();
        let env = fx
            .reconstructor(&[("SUDO_UID", &uid), ("XDG_RUNTIME_DIR", &fx.runtime_var())])
            .reconstruct()
            .unwrap();

        assert_eq!(env.audio_socket, Some(rt.join("pulse").join("native")));
        assert_eq!(env.bus_socket, Some(rt.join("bus")));
        assert_eq!(env.wayland_display.as_deref(), Some("wayland-0"));
        assert_eq!(env.display.as_deref(), Some(":0"));
        assert_eq!(env.xauthority, Some(rt.join(".mutter-Xwaylandauth.AB12CD")));
    }

    #[test]
    fn test_variables_take_precedence() {
        let fx = Fixture::new();
        let cookie = fx.home.path().join("cookie");
        File::create(&cookie).unwrap();
        let bus = fx.runtime.path().join("custom-bus");
        File::create(&bus).unwrap();
        let bus_address = format!("unix:path={},guid=deadbeef", bus.display());
        let uid = fx.uid.to_string();

        let env = fx
            .reconstructor(&[
                ("SUDO_UID", &uid),
                ("XDG_RUNTIME_DIR", &fx.runtime_var()),
                ("DISPLAY", ":7"),
                ("XAUTHORITY", &cookie.to_string_lossy()),
                ("WAYLAND_DISPLAY", "wayland-3"),
                ("DBUS_SESSION_BUS_ADDRESS", &bus_address),
            ])
            .reconstruct()
            .unwrap();

        assert_eq!(env.display.as_deref(), Some(":7"));
        assert_eq!(env.xauthority, Some(cookie));
        assert_eq!(env.wayland_display.as_deref(), Some("wayland-3"));
        assert_eq!(env.bus_socket, Some(bus));
    }

    #[test]
    fn test_pipewire_used_without_pulse() {
        let fx = Fixture::new();
        File::create(fx.runtime.path().join("pipewire-0")).unwrap();
        let uid = fx.uid.to_string();
        let env = fx
            .reconstructor(&[("SUDO_UID", &uid), ("XDG_RUNTIME_DIR", &fx.runtime_var())])
            .reconstruct()
            .unwrap();
        assert_eq!(env.audio_socket, Some(fx.runtime.path().join("pipewire-0")));
    }

    #[test]
    fn test_parse_unix_bus_address() {
        assert_eq!(
            parse_unix_bus_address("unix:path=/run/user/1000/bus"),
            Some(PathBuf::from("/run/user/1000/bus"))
        );
        assert_eq!(
            parse_unix_bus_address("tcp:host=localhost;unix:guid=1,path=/tmp/dbus"),
            Some(PathBuf::from("/tmp/dbus"))
        );
        assert_eq!(parse_unix_bus_address("unix:abstract=/tmp/dbus-x"), None);
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvironmentStore::in_dir(dir.path());
        assert!(matches!(store.load(), Err(ReconstructError::NotFound { .. })));

        let env = sample_environment(dir.path());
        store.save(&env).unwrap();
        assert_eq!(store.load().unwrap(), env);
    }
}
