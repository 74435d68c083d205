//! Command line construction for runs inside the namespace.
//!
//! The final argv is layered, each layer optional except the namespace entry
//! and the target program:
//!
//! ```text
//! sudo ip netns exec nsA setpriv --reuid=1000 --regid=1000 --init-groups \
//!     env -i HOME=/home/alice ... DISPLAY=:0 /bin/bash -c 'firefox'
//! ```
//!
//! # Example
//!
//! ```ignore
//! use proxyns::session::BridgeCommandBuilder;
//!
//! let cmd = BridgeCommandBuilder::new("nsA")
//!     .elevate("sudo")
//!     .drop_privileges(1000, 1000)
//!     .setenv("HOME", "/home/alice")
//!     .chdir(Path::new("/home/alice"))
//!     .command(Path::new("/bin/bash"), &["-c".to_string(), "echo hi".to_string()])
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Builds the command that enters the namespace and runs the target.
#[derive(Debug, Clone)]
pub struct BridgeCommandBuilder {
    namespace: String,
    elevation: Option<String>,
    privileges: Option<(u32, u32)>,
    env_vars: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    program: PathBuf,
    args: Vec<String>,
}

impl BridgeCommandBuilder {
    /// Start a command that runs in `namespace`.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            elevation: None,
            privileges: None,
            env_vars: BTreeMap::new(),
            cwd: None,
            program: PathBuf::from("/bin/sh"),
            args: Vec::new(),
        }
    }

    /// Prefix with an elevation tool (`sudo`, `doas`, `pkexec`).
    pub fn elevate(mut self, tool: &str) -> Self {
        self.elevation = Some(tool.to_string());
        self
    }

    /// Switch to `uid`/`gid` with the user's supplementary groups.
    pub fn drop_privileges(mut self, uid: u32, gid: u32) -> Self {
        self.privileges = Some((uid, gid));
        self
    }

    /// Set a variable in the otherwise empty environment.
    pub fn setenv(mut self, key: &str, value: &str) -> Self {
        self.env_vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Working directory for the command.
    pub fn chdir(mut self, path: &Path) -> Self {
        self.cwd = Some(path.to_path_buf());
        self
    }

    /// Program and arguments to run.
    pub fn command(mut self, program: &Path, args: &[String]) -> Self {
        self.program = program.to_path_buf();
        self.args = args.to_vec();
        self
    }

    /// Variables the command will see.
    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    /// Full argv, first element included.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::new();
        if let Some(ref tool) = self.elevation {
            argv.push(tool.into());
        }
        argv.extend(["ip", "netns", "exec"].map(OsString::from));
        argv.push((&self.namespace).into());

        if let Some((uid, gid)) = self.privileges {
            argv.push("setpriv".into());
            argv.push(format!("--reuid={}", uid).into());
            argv.push(format!("--regid={}", gid).into());
            argv.push("--init-groups".into());
        }

        argv.push("env".into());
        argv.push("-i".into());
        for (key, value) in &self.env_vars {
            argv.push(format!("{}={}", key, value).into());
        }

        argv.push(self.program.as_os_str().to_owned());
        argv.extend(self.args.iter().map(OsString::from));
        argv
    }

    /// Build the final Command (but don't execute it).
    pub fn build(self) -> Command {
        let argv = self.argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Get the command line as a string (for debugging/logging).
    pub fn to_command_line(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| shell_quote(&arg.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

const SHELL_SPECIAL: [char; 17] = [
    ' ', '\t', '\n', '"', '\'', '\\', '$', '`', ';', '&', '|', '<', '>', '(', ')', '*', '?',
];

/// Quote `arg` for a POSIX shell when it needs it.
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() || arg.contains(SHELL_SPECIAL) {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_command() {
        let builder = BridgeCommandBuilder::new("nsA")
            .command(Path::new("/bin/sh"), &["-c".to_string(), "echo hi".to_string()]);
        assert_eq!(
            builder.to_command_line(),
            "ip netns exec nsA env -i /bin/sh -c 'echo hi'"
        );
    }

    #[test]
    fn test_full_layering_order() {
        let builder = BridgeCommandBuilder::new("nsA")
            .elevate("sudo")
            .drop_privileges(1000, 1001)
            .setenv("HOME", "/home/alice")
            .setenv("DISPLAY", ":0")
            .command(Path::new("/bin/bash"), &[]);

        let argv: Vec<String> = builder
            .argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "sudo",
                "ip",
                "netns",
                "exec",
                "nsA",
                "setpriv",
                "--reuid=1000",
                "--regid=1001",
                "--init-groups",
                "env",
                "-i",
                "DISPLAY=:0",
                "HOME=/home/alice",
                "/bin/bash",
            ]
        );
    }

    #[test]
    fn test_build_sets_working_directory() {
        let cmd = BridgeCommandBuilder::new("nsA")
            .chdir(Path::new("/home/alice"))
            .build();
        assert_eq!(cmd.get_program(), "ip");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/home/alice")));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "plain");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_quoting_in_command_line() {
        let line = BridgeCommandBuilder::new("nsA")
            .command(
                Path::new("/bin/sh"),
                &["-c".to_string(), "echo 'it works'".to_string()],
            )
            .to_command_line();
        assert!(line.ends_with("-c 'echo '\\''it works'\\'''"));
    }
}
