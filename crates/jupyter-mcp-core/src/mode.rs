//! Decides, once per process, which backend serves each concern.

use std::sync::{Arc, OnceLock};

use jupyter_server_client::JupyterServer;

use crate::backend::{
    Backend, BackendKind, DocumentBackend, HostManagers, InterpreterBackend, LocalDocuments,
    LocalInterpreters, RemoteDocuments, RemoteInterpreters,
};
use crate::config::{Access, Config};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMode {
    pub documents: BackendKind,
    pub runtime: BackendKind,
}

fn kind_of(access: &Access) -> BackendKind {
    match access {
        Access::Local => BackendKind::Local,
        Access::Remote { .. } => BackendKind::Remote,
    }
}

/// Configuration plus the lazily resolved [`Backend`]. Build one at startup
/// and share it by reference.
#[derive(Debug)]
pub struct ModeContext {
    config: Config,
    host: Option<HostManagers>,
    backend: OnceLock<Backend>,
}

impl ModeContext {
    /// `host` carries the embedding server's managers when there is one.
    pub fn new(config: Config, host: Option<HostManagers>) -> Self {
        Self {
            config,
            host,
            backend: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> ResolvedMode {
        ResolvedMode {
            documents: kind_of(&self.config.document),
            runtime: kind_of(&self.config.runtime),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.backend.get().is_some()
    }

    /// The backend pair, built on first use. Later calls return the cached
    /// pair without looking at the configuration again.
    pub fn resolve(&self) -> Result<Backend> {
        if let Some(backend) = self.backend.get() {
            return Ok(backend.clone());
        }
        let built = self.build()?;
        let backend = self.backend.get_or_init(|| built);
        let mode = self.mode();
        tracing::info!(documents = %mode.documents, runtime = %mode.runtime, "resolved backends");
        Ok(backend.clone())
    }

    /// Drops stale connections held by the resolved backends.
    pub async fn reconnect(&self) -> Result<()> {
        let backend = self.resolve()?;
        backend.documents.reconnect().await?;
        backend.interpreters.reconnect().await
    }

    fn host(&self, concern: &str) -> Result<&HostManagers> {
        self.host.as_ref().ok_or_else(|| {
            Error::Configuration(format!(
                "{concern} access is 'local' but no host managers are available"
            ))
        })
    }

    fn build(&self) -> Result<Backend> {
        let documents: Arc<dyn DocumentBackend> = match &self.config.document {
            Access::Local => {
                let host = self.host("document")?;
                if self.config.collaboration && host.rooms.is_none() {
                    return Err(Error::Configuration(
                        "collaboration is enabled but the host has no room manager".into(),
                    ));
                }
                Arc::new(LocalDocuments::new(host))
            }
            Access::Remote { url, token } => Arc::new(RemoteDocuments::new(server(url, token)?)),
        };
        let interpreters: Arc<dyn InterpreterBackend> = match &self.config.runtime {
            Access::Local => Arc::new(LocalInterpreters::new(self.host("runtime")?)),
            Access::Remote { url, token } => Arc::new(RemoteInterpreters::new(server(url, token)?)),
        };
        Ok(Backend {
            documents,
            interpreters,
        })
    }
}

fn server(url: &url::Url, token: &Option<String>) -> Result<JupyterServer> {
    JupyterServer::new(url.as_str(), token.clone())
        .map_err(|e| Error::Configuration(format!("bad server address {url}: {e}")))
}
