use std::time::Duration;

use async_trait::async_trait;

use crate::HealthCheckError;

/// Abstracts "start this container by name" so the revival loop is testable
/// without Docker. A real deployment uses `DockerRuntime`; tests swap in a
/// recording fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, name: &str) -> Result<(), HealthCheckError>;
}

pub struct DockerRuntime;

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, name: &str) -> Result<(), HealthCheckError> {
        let run = tokio::process::Command::new("docker").arg("start").arg(name).output();

        let output = tokio::time::timeout(Duration::from_secs(30), run)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "docker start timed out"))??;

        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(String::from_utf8_lossy(&output.stderr).into_owned()).into())
        }
    }
}
