use crate::config::CopierConfig;
use crate::error::{PullThroughError, Result};
use std::future::Future;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Scheme prefix of the local registry address handed to copiers
pub const REGISTRY_SCHEME: &str = "registry://";

/// Moves an image from its upstream into the local registry.
///
/// `source` is the local registry as `registry://127.0.0.1:<port>`, `image` is
/// the canonical reference to fetch and `destination` the `<repository>:<tag>`
/// it is stored under locally. Never called concurrently for the same image
/// by the coordinator.
pub trait ImageCopier: Send + Sync + 'static {
    fn copy(
        &self,
        source: &str,
        image: &str,
        destination: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Runs an external program (skopeo by default) for every copy
#[derive(Debug, Clone)]
pub struct CommandCopier {
    program: String,
    args: Vec<String>,
}

impl CommandCopier {
    pub fn new(config: &CopierConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument list with placeholders filled in; `{repository}` is the
    /// destination
    pub fn render_args(&self, source: &str, image: &str, destination: &str) -> Vec<String> {
        let registry = source.strip_prefix(REGISTRY_SCHEME).unwrap_or(source);
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{registry}", registry)
                    .replace("{repository}", destination)
                    .replace("{image}", image)
            })
            .collect()
    }
}

impl ImageCopier for CommandCopier {
    async fn copy(&self, source: &str, image: &str, destination: &str) -> Result<()> {
        let args = self.render_args(source, image, destination);
        tracing::debug!(program = %self.program, ?args, "Running image copy command");

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                PullThroughError::Copy(format!("failed to run {}: {}", self.program, e))
            })?;

        if output.status.success() {
            tracing::debug!(
                image = %image,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Image copy command finished"
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PullThroughError::Copy(format!(
            "{} exited with {} for {}: {}",
            self.program,
            output.status,
            image,
            stderr.trim()
        )))
    }
}
