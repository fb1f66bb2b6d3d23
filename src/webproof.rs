//! Web proof generation through the vlayer CLI
//!
//! The CLI is invoked with an explicit argument vector (never a shell
//! string) through a [`CommandRunner`], so tests can swap in a fake process.
//! The proof is the last JSON object the CLI prints on stdout.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::CollaboratorError;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CollaboratorError>;
}

/// Runs real processes with `tokio::process`. The child is killed when the
/// future is dropped, so a caller-side timeout does not leak processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CollaboratorError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Produces a web proof for a URL.
#[async_trait]
pub trait WebProofFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Value, CollaboratorError>;
}

pub struct VlayerCli<R = TokioCommandRunner> {
    runner: R,
    binary: Option<PathBuf>,
    notary_url: Option<String>,
}

impl VlayerCli<TokioCommandRunner> {
    pub fn new(binary: Option<PathBuf>, notary_url: Option<String>) -> Self {
        Self::with_runner(TokioCommandRunner, binary, notary_url)
    }
}

impl<R: CommandRunner> VlayerCli<R> {
    pub fn with_runner(runner: R, binary: Option<PathBuf>, notary_url: Option<String>) -> Self {
        Self {
            runner,
            binary,
            notary_url: notary_url.filter(|u| !u.is_empty()),
        }
    }

    fn command(&self, locator: &str) -> Result<(String, Vec<String>), CollaboratorError> {
        let notary = self.notary_url.as_ref().ok_or_else(|| {
            CollaboratorError::Config("VLAYER_NOTARY_URL is not set".to_string())
        })?;
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| CollaboratorError::Config("VLAYER_BIN_PATH is not set".to_string()))?;

        let args = vec![
            "web-proof-fetch".to_string(),
            "--notary".to_string(),
            notary.clone(),
            "--url".to_string(),
            locator.to_string(),
        ];
        Ok((binary.to_string_lossy().into_owned(), args))
    }
}

#[async_trait]
impl<R: CommandRunner> WebProofFetcher for VlayerCli<R> {
    async fn fetch(&self, locator: &str) -> Result<Value, CollaboratorError> {
        let (program, args) = self.command(locator)?;
        info!("Fetching web proof for {}", locator);

        let output = self.runner.run(&program, &args).await?;
        if !output.success {
            let stderr = output.stderr.trim();
            error!("vlayer web-proof-fetch failed: {}", stderr);
            return Err(CollaboratorError::Process(format!(
                "Failed to execute vlayer: {}",
                if stderr.is_empty() { "non-zero exit" } else { stderr }
            )));
        }

        let proof = last_json_object(&output.stdout).ok_or_else(|| {
            CollaboratorError::NoProof("No JSON object found in vlayer output".to_string())
        })?;
        if is_placeholder(&proof) {
            return Err(CollaboratorError::NoProof(
                "vlayer returned an empty proof".to_string(),
            ));
        }

        debug!("Parsed web proof for {}", locator);
        Ok(proof)
    }
}

/// Last complete top-level JSON object embedded in `output`.
pub fn last_json_object(output: &str) -> Option<Value> {
    let mut last = None;
    let mut cursor = 0;

    while let Some(offset) = output[cursor..].find('{') {
        let start = cursor + offset;
        let mut stream = serde_json::Deserializer::from_str(&output[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                cursor = start + stream.byte_offset();
                last = Some(value);
            }
            _ => cursor = start + 1,
        }
    }

    last
}

fn is_placeholder(proof: &Value) -> bool {
    proof.as_object().map_or(true, |map| map.is_empty())
}
