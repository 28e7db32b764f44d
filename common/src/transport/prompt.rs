// Credential providers
// Passwords are requested per invocation and kept in memory only

use crate::errors::DeployError;
use crate::models::{Credential, RemoteTarget};
use async_trait::async_trait;

/// CredentialProvider supplies the password for a target on first use
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, target: &RemoteTarget) -> Result<Credential, DeployError>;
}

/// Interactive hidden-input prompt on the controlling terminal
#[derive(Debug, Default, Clone)]
pub struct TerminalPrompt;

#[async_trait]
impl CredentialProvider for TerminalPrompt {
    async fn credential(&self, target: &RemoteTarget) -> Result<Credential, DeployError> {
        let prompt = format!("Password for {}: ", target);
        let secret = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
            .await
            .map_err(|e| DeployError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(Credential::new(secret))
    }
}

/// Fixed credential, for non-interactive runs and tests
#[derive(Debug, Clone)]
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(secret),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self, _target: &RemoteTarget) -> Result<Credential, DeployError> {
        Ok(self.credential.clone())
    }
}
