//! Transport over a spawned `artsync server` process.
//!
//! Each exchange runs one server invocation: the request frame goes to its
//! stdin, the reply frame comes back on stdout, and the process exits.

use super::{read_batch, write_batch, Transport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Remote end reached with `ssh`
#[derive(Debug, Clone, Default)]
pub struct SshTarget {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Vec<PathBuf>,
}

/// Spawns a server process for every exchange.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: OsString,
    args: Vec<OsString>,
}

impl ProcessTransport {
    /// Serve `repo` with this executable (for local repositories and tests)
    pub fn local(repo: &Path) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate artsync executable")?;
        Ok(Self::command(exe, repo))
    }

    /// Run `<program> server <repo>`
    pub fn command(program: impl Into<OsString>, repo: &Path) -> Self {
        Self {
            program: program.into(),
            args: vec!["server".into(), repo.as_os_str().to_owned()],
        }
    }

    /// Append an argument to the server command line
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run `artsync server <remote_path>` on another host via ssh
    pub fn ssh(target: &SshTarget, remote_path: &Path) -> Self {
        let mut args: Vec<OsString> = vec![target.hostname.clone().into()];

        if !target.user.is_empty() {
            args.push("-l".into());
            args.push(target.user.clone().into());
        }

        if target.port != 0 && target.port != 22 {
            args.push("-p".into());
            args.push(target.port.to_string().into());
        }

        for key in &target.identity_file {
            args.push("-i".into());
            args.push(key.as_os_str().to_owned());
        }

        args.push("artsync".into());
        args.push("server".into());
        args.push(remote_path.as_os_str().to_owned());

        Self {
            program: "ssh".into(),
            args,
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn exchange(&mut self, request: Bytes) -> Result<Bytes> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.program))?;
        let mut stdin = child.stdin.take().context("Failed to open stdin")?;
        let mut stdout = child.stdout.take().context("Failed to open stdout")?;

        write_batch(&mut stdin, &request).await?;
        drop(stdin);

        let reply = read_batch(&mut stdout).await?;
        let status = child.wait().await.context("Failed to wait for server")?;
        if !status.success() {
            anyhow::bail!("Server exited with {}", status);
        }
        Ok(reply)
    }
}
