use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

/// Files that are never fetched through LFS when cloning model repos. The
/// loader only reads safetensors weights.
pub const LFS_FETCH_EXCLUDE: &str = "*.ckpt,*.bin,*.h5,*.msgpack,*.onnx";

/// Reads the credentials from the environment so they never appear on the
/// command line.
const CREDENTIAL_HELPER: &str = "!f() {\n  sleep 1\n  echo \"username=${GIT_USER}\"\n  echo \"password=${GIT_PASSWORD}\"\n}\nf";

/// Matches the branch of a `git ls-remote --heads` line, e.g.
/// `52b46db8e14744892bb7ee014fc1cbb8c408643f refs/heads/main`.
static BRANCH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // branch names containing '/' are not supported
    Regex::new(r"\brefs/heads/([^\s/]+)(?:\s+|$)").expect("valid branch regex")
});

/// Username and access token for a private model hub.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Thin client over the `git` executable.
#[derive(Debug, Clone)]
pub struct Git {
    program: PathBuf,
}

impl Default for Git {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Git {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Absolute path of the executable that will run, if it can be found.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return self.program.is_file().then(|| self.program.clone());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }

    fn command<I, S>(&self, args: I, credentials: Option<&Credentials>) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        if let Some(credentials) = credentials {
            command
                .arg("-c")
                .arg(format!("credential.helper={CREDENTIAL_HELPER}"))
                .env("GIT_USER", &credentials.username)
                .env("GIT_PASSWORD", &credentials.access_token);
        }
        command.args(args).stdin(Stdio::null());
        command
    }

    fn run(&self, mut command: Command) -> Result<Output> {
        let rendered = render(&command);
        tracing::info!("Running command: {rendered}");

        let output = command.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::GitCommand {
                command: rendered,
                status: format!("{} {}", output.status, stderr.trim()).trim_end().to_string(),
            });
        }
        Ok(output)
    }

    /// Fails unless Git LFS is installed for this executable.
    ///
    /// Without LFS, `git clone` quietly downloads pointer files instead of
    /// the weights.
    pub fn check_lfs(&self) -> Result<()> {
        let command = self.command(["config", "--get-regexp", r"^filter\.lfs\."], None);
        match self.run(command) {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::debug!("LFS check failed: {err}");
                let git_path = match self.resolved_path() {
                    Some(path) => path.display().to_string(),
                    None => {
                        tracing::warn!("Unable to find {:?} executable in PATH", self.program);
                        "<NOT FOUND>".to_string()
                    }
                };
                Err(Error::LfsNotInstalled { git_path })
            }
        }
    }

    /// Clones only the latest commit of `branch` into `dir`.
    pub fn shallow_clone(
        &self,
        repo: &str,
        dir: &Path,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let mut command = self.command(
            [
                "clone",
                "--depth=1",
                format!("--config=lfs.fetchexclude={LFS_FETCH_EXCLUDE}").as_str(),
                format!("--branch={branch}").as_str(),
                "--",
                repo,
            ],
            credentials,
        );
        command.arg(dir);
        self.run(command)?;
        Ok(())
    }

    /// Branch names of a remote repo, in the order the remote lists them.
    pub fn get_branches(
        &self,
        repo: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<String>> {
        let mut command = self.command(["ls-remote", "--heads", "--", repo], credentials);
        // stable output regardless of the user's locale
        command.env("LC_ALL", "C");
        let output = self.run(command)?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_branch_from_line)
            .collect())
    }
}

/// Branch name from one line of `git ls-remote --heads` output.
pub fn parse_branch_from_line(line: &str) -> Option<String> {
    match BRANCH_REGEX.captures(line) {
        Some(captures) => Some(captures[1].to_string()),
        None => {
            tracing::warn!("Unable to parse branch line: {line:?}");
            None
        }
    }
}

fn render(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
