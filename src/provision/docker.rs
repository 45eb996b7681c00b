use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashMap, process::Stdio, time::Duration};
use tokio::{process::Command, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Environment, Provisioner};
use crate::error::ProvisioningError;

pub const DEFAULT_IMAGE: &str = "localstack/localstack:latest";
pub const DEFAULT_SERVICE_PORT: u16 = 4566;
const HEALTH_PATH: &str = "_localstack/health";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Body of the emulator's health endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub services: HashMap<String, String>,
}

impl HealthReport {
    /// The emulator reports services it can serve as "available" until
    /// first use, then "running".
    pub fn s3_ready(&self) -> bool {
        matches!(
            self.services.get("s3").map(String::as_str),
            Some("available" | "running")
        )
    }
}

/// Runs the emulator image through the `docker` CLI.
///
/// The service port is published on a random host port. `start` waits until
/// the health endpoint reports S3 ready, and removes the container again if
/// it never gets there. Startup stops early, and the container is removed,
/// once the cancellation token fires.
pub struct DockerProvisioner {
    program: String,
    image: String,
    host: String,
    service_port: u16,
    startup_timeout: Duration,
    cancel: CancellationToken,
    http: reqwest::Client,
}

/// `docker port` prints one `address:port` line per bound address family.
fn parse_mapped_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
}

impl DockerProvisioner {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            program: "docker".to_string(),
            image: image.into(),
            host: "127.0.0.1".to_string(),
            service_port: DEFAULT_SERVICE_PORT,
            startup_timeout: Duration::from_secs(90),
            cancel: CancellationToken::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_service_port(mut self, service_port: u16) -> Self {
        self.service_port = service_port;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    async fn docker(&self, args: &[&str]) -> Result<String, ProvisioningError> {
        debug!(program = %self.program, ?args, "running");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProvisioningError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProvisioningError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn check_health(&self, environment: &Environment) -> Option<HealthReport> {
        let port = self.mapped_port(environment, self.service_port).await.ok()?;
        let url = environment.endpoint(port).ok()?.join(HEALTH_PATH).ok()?;
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<HealthReport>().await.ok()
    }

    async fn wait_ready(&self, environment: &Environment) -> Result<(), ProvisioningError> {
        let started = Instant::now();
        loop {
            let remaining = self.startup_timeout.saturating_sub(started.elapsed());
            let checked = tokio::time::timeout(remaining, self.check_health(environment)).await;
            if let Ok(Some(report)) = checked {
                if report.s3_ready() {
                    info!(
                        environment = environment.name(),
                        waited = ?started.elapsed(),
                        "storage emulator ready"
                    );
                    return Ok(());
                }
                debug!(services = ?report.services, "emulator not ready yet");
            }

            if started.elapsed() >= self.startup_timeout {
                return Err(ProvisioningError::NotReady {
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn launch(
        &self,
        environment: &Environment,
        publish: &str,
    ) -> Result<(), ProvisioningError> {
        let container_id = self
            .docker(&[
                "run",
                "--detach",
                "--rm",
                "--name",
                environment.name(),
                "--publish",
                publish,
                self.image.as_str(),
            ])
            .await?;
        debug!(%container_id, "container launched");

        self.wait_ready(environment).await
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    #[instrument(skip(self), fields(image = %self.image))]
    async fn start(&self) -> Result<Environment, ProvisioningError> {
        let name = format!("s3bug-{}", Uuid::new_v4().simple());
        let mut environment = Environment::new(name, self.host.clone());
        let publish = self.service_port.to_string();

        let ready = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProvisioningError::Cancelled),
            ready = self.launch(&environment, &publish) => ready,
        };

        if let Err(err) = ready {
            if let Err(stop_error) = self.stop(&mut environment).await {
                warn!(error = %stop_error, "cleanup after failed start also failed");
            }
            return Err(err);
        }

        Ok(environment)
    }

    async fn mapped_port(
        &self,
        environment: &Environment,
        internal_port: u16,
    ) -> Result<u16, ProvisioningError> {
        if environment.is_stopped() {
            return Err(ProvisioningError::NotRunning {
                name: environment.name().to_string(),
            });
        }

        let container_port = format!("{internal_port}/tcp");
        let output = self
            .docker(&["port", environment.name(), container_port.as_str()])
            .await?;

        parse_mapped_port(&output).ok_or(ProvisioningError::PortNotMapped {
            port: internal_port,
            output,
        })
    }

    #[instrument(skip(self, environment), fields(environment = environment.name()))]
    async fn stop(&self, environment: &mut Environment) -> Result<(), ProvisioningError> {
        if environment.is_stopped() {
            return Ok(());
        }

        match self.docker(&["rm", "--force", environment.name()]).await {
            Ok(_) => info!("environment removed"),
            Err(ProvisioningError::CommandFailed { stderr, .. }) if is_missing_container(&stderr) => {
                debug!("container already gone")
            }
            Err(err) => return Err(err),
        }

        environment.mark_stopped();
        Ok(())
    }
}
