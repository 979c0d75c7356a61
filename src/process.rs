use crate::error::CliCredentialError;
use std::{
    env,
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Everything a [`CommandRunner`] needs to know about how to execute a
/// command, passed explicitly so tests can substitute any part of it.
#[derive(Debug, Clone)]
pub(crate) struct ExecContext {
    pub(crate) working_dir: PathBuf,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) timeout: Duration,
}

/// Captured result of a completed subprocess. `code` is `None` when the
/// process was terminated by a signal.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam between credentials and the operating system. The real
/// implementation spawns a shell; tests substitute a scripted one.
pub(crate) trait CommandRunner: std::fmt::Debug + Send + Sync {
    /// Whether `name` resolves to an executable on the search path.
    fn find_executable(&self, name: &str) -> bool;

    /// Run `command` through the platform shell and capture its output.
    fn run(&self, command: &str, context: &ExecContext)
    -> Result<CommandOutput, CliCredentialError>;
}

/// Pick a working directory controlled by the OS rather than the calling
/// program, so a token request cannot be hijacked by binaries placed in the
/// caller's current directory.
pub(crate) fn safe_working_dir() -> Result<PathBuf, CliCredentialError> {
    if cfg!(windows) {
        match env::var_os("SYSTEMROOT") {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Err(CliCredentialError::EnvironmentMisconfigured(
                "environment variable 'SYSTEMROOT' has no value".into(),
            )),
        }
    } else {
        Ok(PathBuf::from("/bin"))
    }
}

const fn shell() -> (&'static str, &'static str) {
    if cfg!(windows) { ("cmd", "/c") } else { ("/bin/sh", "-c") }
}

#[cfg(windows)]
fn candidate_names(name: &str) -> Vec<String> {
    // Mirrors the resolution cmd.exe itself performs via PATHEXT.
    let pathext =
        env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    let mut names = vec![name.to_string()];
    names.extend(
        pathext
            .split(';')
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!("{name}{ext}")),
    );
    names
}

#[cfg(not(windows))]
fn candidate_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

fn drain<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn into_text(handle: JoinHandle<Vec<u8>>) -> String {
    String::from_utf8_lossy(&handle.join().unwrap_or_default()).into_owned()
}

/// Runs commands through `cmd /c` on Windows and `/bin/sh -c` elsewhere,
/// bounded by the context's timeout.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn find_executable(&self, name: &str) -> bool {
        let Some(paths) = env::var_os("PATH") else {
            return false;
        };
        let candidates = candidate_names(name);
        env::split_paths(&paths)
            .any(|dir| candidates.iter().any(|candidate| dir.join(candidate).is_file()))
    }

    fn run(
        &self,
        command: &str,
        context: &ExecContext,
    ) -> Result<CommandOutput, CliCredentialError> {
        let (shell, flag) = shell();
        let mut child = Command::new(shell)
            .args([flag, command])
            .current_dir(&context.working_dir)
            .envs(context.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CliCredentialError::ProcessSpawnFailed {
                shell: shell.to_string(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty child cannot
        // deadlock against a full pipe buffer while we wait on it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + context.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(CliCredentialError::ProcessUnavailable(format!(
                            "the command did not complete within {:?}",
                            context.timeout
                        )));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(error) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CliCredentialError::ProcessUnavailable(format!(
                        "failed to wait for the command: {error}"
                    )));
                }
            }
        };

        Ok(CommandOutput {
            code: status.code(),
            stdout: into_text(stdout),
            stderr: into_text(stderr),
        })
    }
}
