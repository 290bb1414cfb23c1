//! Server mode - runs when invoked as `artsync server <repo>`
//!
//! Reads one request frame from stdin, answers it on stdout, saves the
//! repository and exits. Logging goes to stderr.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{self, AsyncRead, AsyncWrite};

use crate::config::SyncConfig;
use crate::store::{snapshot, ArtifactStore};
use crate::transport::{read_batch, write_batch};
use crate::xfer::codec::Message;
use crate::xfer::server::Server;

/// Main server entry point
pub async fn run_server(repo: &Path, config: SyncConfig) -> Result<()> {
    let store = snapshot::load(repo)
        .with_context(|| format!("Failed to open repository {}", repo.display()))?;
    let mut server = Server::new(store, config);

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    serve_one(&mut server, &mut stdin, &mut stdout).await?;

    snapshot::save(server.store(), repo)
        .with_context(|| format!("Failed to save repository {}", repo.display()))?;
    Ok(())
}

/// Answer exactly one request frame.
pub async fn serve_one<S, R, W>(server: &mut Server<S>, input: &mut R, output: &mut W) -> Result<()>
where
    S: ArtifactStore,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = read_batch(input).await?;
    tracing::debug!("request of {} bytes", request.len());

    let body = match server.handle(&request) {
        Ok(reply) => reply.body,
        Err(e) => {
            // Store failure: the transaction is already rolled back
            tracing::error!("exchange failed: {}", e);
            Message::Error(e.to_string()).to_bytes()
        }
    };
    write_batch(output, &body).await
}
