// Orchestrator wiring
// Builds the transport, transfer, executor and engine stack from settings

use crate::config::Settings;
use crate::errors::WorkflowError;
use crate::executor::RemoteExecutor;
use crate::models::WorkflowReport;
use crate::retry::FixedDelay;
use crate::transfer::TransferService;
use crate::transport::{Connector, CredentialProvider, SessionRegistry, Ssh2Connector};
use crate::workflow::{WorkflowCatalog, WorkflowEngine, WorkflowKind};
use std::sync::Arc;
use tracing::{info, instrument};

/// Orchestrator owns the session registry for the lifetime of the process
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    catalog: WorkflowCatalog,
    engine: WorkflowEngine,
}

impl Orchestrator {
    /// Wire the production SSH connector
    pub fn new(settings: Settings, credentials: Arc<dyn CredentialProvider>) -> Self {
        let transport = &settings.transport;
        let connector = Ssh2Connector::new(transport.connect_timeout(), transport.io_timeout())
            .with_retry(FixedDelay::new(
                transport.retry_delay(),
                transport.connect_retries,
            ));
        Self::with_connector(settings, Arc::new(connector), credentials)
    }

    pub fn with_connector(
        settings: Settings,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let registry = Arc::new(
            SessionRegistry::new(connector, credentials)
                .with_session_reuse(settings.transport.reuse_sessions),
        );
        let transfer = Arc::new(TransferService::new(Arc::clone(&registry)));
        let runner = Arc::new(RemoteExecutor::new(Arc::clone(&registry)));

        info!(
            reuse_sessions = settings.transport.reuse_sessions,
            "Deployment stack initialized"
        );
        Self {
            registry,
            catalog: WorkflowCatalog::new(settings),
            engine: WorkflowEngine::new(transfer, runner),
        }
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Plan `kind` from local artifacts, then run it
    #[instrument(skip(self))]
    pub async fn run(&self, kind: WorkflowKind) -> Result<WorkflowReport, WorkflowError> {
        let workflow = self.catalog.plan(kind)?;
        self.engine.run(&workflow).await
    }

    /// Close every cached session; call on every exit path
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
