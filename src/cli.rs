//! Command line interface.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::SyncConfig;
use crate::server;
use crate::store::{snapshot, ArtifactStore, MemoryStore, Origin};
use crate::transport::process::{ProcessTransport, SshTarget};
use crate::xfer::client::{self, Credentials, SyncReport, SyncRequest};

#[derive(Parser, Debug)]
#[command(name = "artsync")]
#[command(version, about = "Content-addressed repository sync", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (default: ~/.config/artsync/config.toml)
    #[arg(long, global = true, env = "ARTSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an empty repository
    Init {
        repo: PathBuf,

        /// Join an existing project instead of starting a new one
        #[arg(long)]
        project_code: Option<String>,
    },

    /// Answer one sync exchange on stdin/stdout
    Server { repo: PathBuf },

    /// Copy a remote repository into a new local one
    Clone {
        remote: String,
        repo: PathBuf,
        #[command(flatten)]
        login: LoginArgs,
    },

    /// Fetch artifacts the remote has and we lack
    Pull {
        repo: PathBuf,
        remote: String,
        #[command(flatten)]
        login: LoginArgs,
    },

    /// Send local artifacts the remote lacks
    Push {
        repo: PathBuf,
        remote: String,
        #[command(flatten)]
        login: LoginArgs,
    },

    /// Pull and push in one run
    Sync {
        repo: PathBuf,
        remote: String,
        #[command(flatten)]
        login: LoginArgs,
    },

    /// Store files as new local artifacts
    Put {
        repo: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoginArgs {
    /// User to log in as
    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(long, env = "ARTSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl LoginArgs {
    fn credentials(&self) -> Option<Credentials> {
        self.user.as_ref().map(|user| {
            Credentials::new(user.clone(), self.password.clone().unwrap_or_default())
        })
    }
}

/// Where the other repository lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote {
    Local(PathBuf),
    /// `[user@]host:path`
    Ssh {
        host: String,
        user: String,
        path: PathBuf,
    },
}

impl Remote {
    pub fn parse(text: &str) -> Self {
        if let Some((host_part, path)) = text.split_once(':') {
            let looks_local = host_part.is_empty()
                || host_part.contains('/')
                || host_part.starts_with('.')
                || (host_part.len() == 1 && path.starts_with('\\'));
            if !looks_local {
                let (user, host) = match host_part.split_once('@') {
                    Some((user, host)) => (user.to_string(), host.to_string()),
                    None => (String::new(), host_part.to_string()),
                };
                return Remote::Ssh {
                    host,
                    user,
                    path: PathBuf::from(path),
                };
            }
        }
        Remote::Local(PathBuf::from(text))
    }

    /// `config` is forwarded to a local server process
    fn transport(&self, config: Option<&Path>) -> Result<ProcessTransport> {
        match self {
            Remote::Local(path) => {
                let transport = ProcessTransport::local(path)?;
                Ok(match config {
                    Some(config) => transport.arg("--config").arg(config),
                    None => transport,
                })
            }
            Remote::Ssh { host, user, path } => {
                let target = SshTarget {
                    hostname: host.clone(),
                    user: user.clone(),
                    ..Default::default()
                };
                Ok(ProcessTransport::ssh(&target, path))
            }
        }
    }
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::load_default()?,
    };
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Init { repo, project_code } => {
            if repo.exists() {
                anyhow::bail!("{} already exists", repo.display());
            }
            let store = match project_code {
                Some(code) => MemoryStore::new(code),
                None => MemoryStore::new_project(),
            };
            snapshot::save(&store, &repo)?;
            println!("initialized project {}", store.project_code());
        }

        Command::Server { repo } => server::run_server(&repo, config).await?,

        Command::Clone {
            remote,
            repo,
            login,
        } => {
            if repo.exists() {
                anyhow::bail!("{} already exists", repo.display());
            }
            let mut store = MemoryStore::new("");
            let report =
                run_sync(&mut store, &remote, &config, config_path, SyncRequest::clone_repo(), &login)
                    .await?;
            snapshot::save(&store, &repo)?;
            print_report("clone", &report);
        }

        Command::Pull {
            repo,
            remote,
            login,
        } => sync_repo(&repo, &remote, &config, config_path, SyncRequest::pull(), &login).await?,

        Command::Push {
            repo,
            remote,
            login,
        } => sync_repo(&repo, &remote, &config, config_path, SyncRequest::push(), &login).await?,

        Command::Sync {
            repo,
            remote,
            login,
        } => sync_repo(&repo, &remote, &config, config_path, SyncRequest::sync(), &login).await?,

        Command::Put { repo, files } => {
            let mut store = open(&repo)?;
            for file in &files {
                let content = std::fs::read(file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let id = store.put(content.into(), Origin::Local)?;
                println!("{}  {}", id, file.display());
            }
            snapshot::save(&store, &repo)?;
        }
    }
    Ok(())
}

fn open(repo: &Path) -> Result<MemoryStore> {
    snapshot::load(repo).with_context(|| format!("Failed to open repository {}", repo.display()))
}

async fn sync_repo(
    repo: &Path,
    remote: &str,
    config: &SyncConfig,
    config_path: Option<&Path>,
    request: SyncRequest,
    login: &LoginArgs,
) -> Result<()> {
    let mut store = open(repo)?;
    let result = run_sync(&mut store, remote, config, config_path, request, login).await;
    // Completed rounds are committed even when a later one fails
    snapshot::save(&store, repo)?;
    let report = result?;
    let what = match (request.pull, request.push) {
        (true, true) => "sync",
        (false, true) => "push",
        _ => "pull",
    };
    print_report(what, &report);
    Ok(())
}

async fn run_sync(
    store: &mut MemoryStore,
    remote: &str,
    config: &SyncConfig,
    config_path: Option<&Path>,
    request: SyncRequest,
    login: &LoginArgs,
) -> Result<SyncReport> {
    let mut transport = Remote::parse(remote).transport(config_path)?;
    let credentials = login.credentials();
    let report = client::sync(store, &mut transport, config, request, credentials.as_ref())
        .await
        .with_context(|| format!("Sync with {} failed", remote))?;
    Ok(report)
}

fn print_report(what: &str, report: &SyncReport) {
    println!(
        "{} finished in {} round(s): {} sent, {} received ({} bytes out, {} bytes in)",
        what,
        report.rounds,
        report.stats.sent(),
        report.stats.received(),
        report.bytes_sent,
        report.bytes_received
    );
}
