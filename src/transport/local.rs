//! In-process transport: the "server" is a [`Server`] owned by the client.

use super::Transport;
use crate::store::ArtifactStore;
use crate::xfer::server::Server;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub struct LocalTransport<S> {
    server: Server<S>,
}

impl<S: ArtifactStore> LocalTransport<S> {
    pub fn new(server: Server<S>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Server<S> {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server<S> {
        &mut self.server
    }
}

#[async_trait]
impl<S: ArtifactStore + Send> Transport for LocalTransport<S> {
    async fn exchange(&mut self, request: Bytes) -> Result<Bytes> {
        let reply = self.server.handle(&request)?;
        Ok(reply.body)
    }
}
