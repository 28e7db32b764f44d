// Remote command executor
// Runs one shell line per call and classifies the result by exit code

use crate::errors::DeployError;
use crate::models::{Credential, RemoteCommand, RemoteTarget};
use crate::transport::SessionRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// CommandRunner executes remote commands; exactly one attempt per call
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` on `target` and return its stdout
    ///
    /// A non-zero exit code fails with [`DeployError::Command`] carrying the
    /// exit code and captured output.
    async fn run(&self, target: &RemoteTarget, command: &RemoteCommand)
        -> Result<String, DeployError>;
}

/// RemoteExecutor runs commands over sessions leased from the registry
pub struct RemoteExecutor {
    registry: Arc<SessionRegistry>,
}

impl RemoteExecutor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CommandRunner for RemoteExecutor {
    #[instrument(skip(self, target, command), fields(target = %target, command = %command))]
    async fn run(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
    ) -> Result<String, DeployError> {
        let lease = self.registry.lease(target).await?;
        let credential = lease.session().credential().clone();
        let (line, stdin) = build_invocation(target, command, &credential);

        debug!("Executing remote command");
        let outcome = lease
            .session()
            .connection()
            .exec(&line, stdin.as_deref())
            .await;
        self.registry.release_after(lease, &outcome).await;

        let result = outcome?;
        // Only output of a process that was handed the secret can echo it
        let (stdout, stderr) = match stdin {
            Some(_) => (
                credential.redact(&result.stdout),
                credential.redact(&result.stderr),
            ),
            None => (result.stdout, result.stderr),
        };

        if result.exit_code == 0 {
            info!(outcome = "success", "Remote command succeeded");
            return Ok(stdout);
        }

        if stdin.is_some() && escalation_rejected(&stdout, &stderr) {
            warn!("Privilege escalation rejected the credential");
            return Err(DeployError::Auth {
                target: target.session_key().to_string(),
                reason: "sudo rejected the credential".to_string(),
            });
        }

        warn!(exit_code = result.exit_code, "Remote command failed");
        Err(DeployError::Command {
            command: command.to_string(),
            exit_code: result.exit_code,
            stderr,
            stdout,
        })
    }
}

/// sudo messages printed when the password on stdin was wrong or missing
const ESCALATION_FAILURES: [&str; 3] = [
    "Sorry, try again",
    "incorrect password attempt",
    "no password was provided",
];

fn escalation_rejected(stdout: &str, stderr: &str) -> bool {
    ESCALATION_FAILURES
        .iter()
        .any(|marker| stderr.contains(marker) || stdout.contains(marker))
}

/// Wrap privileged lines for sudo; the secret travels on stdin, never in argv
///
/// The wrapped line runs with stdin on /dev/null, so a secret sudo did not
/// consume (cached timestamp, NOPASSWD) never reaches the command itself.
fn build_invocation(
    target: &RemoteTarget,
    command: &RemoteCommand,
    credential: &Credential,
) -> (String, Option<String>) {
    if !command.privileged || target.is_root() {
        return (command.line.clone(), None);
    }
    (
        format!(
            "sudo -S -p '' sh -c {}",
            shell_quote(&format!("exec </dev/null; {}", command.line))
        ),
        Some(credential.expose().to_string()),
    )
}

/// Quote `value` as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
