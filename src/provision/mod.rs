//! Ephemeral storage environments.
//!
//! A [`Provisioner`] starts an isolated storage emulator and hands back an
//! [`Environment`] handle. [`with_environment`] is the scoped way to use one:
//! the handle is released on every exit path of the body.

use async_trait::async_trait;
use std::future::Future;
use tracing::{info, warn};
use url::Url;

use crate::error::ProvisioningError;

mod docker;

pub use docker::{DEFAULT_IMAGE, DEFAULT_SERVICE_PORT, DockerProvisioner, HealthReport};

/// Handle to a running (or once-running) environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    name: String,
    host: String,
    stopped: bool,
}

impl Environment {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            stopped: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn mark_stopped(&mut self) {
        self.stopped = true;
    }

    /// `http://<host>:<port>` for a port mapped on the host.
    pub fn endpoint(&self, host_port: u16) -> Result<Url, ProvisioningError> {
        let endpoint = format!("http://{}:{}", self.host, host_port);
        Url::parse(&endpoint).map_err(|source| ProvisioningError::InvalidEndpoint {
            endpoint,
            source,
        })
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn start(&self) -> Result<Environment, ProvisioningError>;

    /// Host port that `internal_port` inside the environment is reachable on.
    async fn mapped_port(
        &self,
        environment: &Environment,
        internal_port: u16,
    ) -> Result<u16, ProvisioningError>;

    /// Release the environment. Stopping twice, or stopping a handle whose
    /// start failed half way, succeeds.
    async fn stop(&self, environment: &mut Environment) -> Result<(), ProvisioningError>;
}

/// Start an environment, run `body` against the endpoint of `service_port`,
/// then stop the environment whatever `body` returned.
///
/// A failed stop is reported only when `body` succeeded; otherwise it is
/// logged and the body's error wins.
pub async fn with_environment<P, F, Fut, T, E>(
    provisioner: &P,
    service_port: u16,
    body: F,
) -> Result<T, E>
where
    P: Provisioner + ?Sized,
    F: FnOnce(Url) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<ProvisioningError>,
{
    let mut environment = provisioner.start().await?;
    info!(environment = environment.name(), "environment started");

    let endpoint = match provisioner.mapped_port(&environment, service_port).await {
        Ok(port) => environment.endpoint(port),
        Err(err) => Err(err),
    };

    let result = match endpoint {
        Ok(endpoint) => body(endpoint).await,
        Err(err) => Err(E::from(err)),
    };

    let stopped = provisioner.stop(&mut environment).await;
    match (result, stopped) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(stop_error)) => Err(E::from(stop_error)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(stop_error)) => {
            warn!(
                environment = environment.name(),
                error = %stop_error,
                "failed to stop environment after an earlier failure"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct FakeProvisioner {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_port: bool,
        fail_stop: bool,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn start(&self) -> Result<Environment, ProvisioningError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Environment::new("fake", "127.0.0.1"))
        }

        async fn mapped_port(
            &self,
            environment: &Environment,
            internal_port: u16,
        ) -> Result<u16, ProvisioningError> {
            if self.fail_port {
                return Err(ProvisioningError::PortNotMapped {
                    port: internal_port,
                    output: String::new(),
                });
            }
            if environment.is_stopped() {
                return Err(ProvisioningError::NotRunning {
                    name: environment.name().to_string(),
                });
            }
            Ok(internal_port + 1000)
        }

        async fn stop(&self, environment: &mut Environment) -> Result<(), ProvisioningError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            environment.mark_stopped();
            if self.fail_stop {
                return Err(ProvisioningError::CommandFailed {
                    command: "rm".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error(transparent)]
        Provisioning(#[from] ProvisioningError),
        #[error("body failed")]
        Body,
    }

    #[tokio::test]
    async fn test_body_receives_mapped_endpoint_and_environment_is_stopped() {
        let provisioner = FakeProvisioner::default();
        let endpoint = with_environment(&provisioner, 4566, |endpoint| async move {
            Ok::<_, TestError>(endpoint)
        })
        .await
        .unwrap();

        assert_eq!(endpoint.as_str(), "http://127.0.0.1:5566/");
        assert_eq!(provisioner.starts.load(Ordering::SeqCst), 1);
        assert_eq!(provisioner.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_environment_is_stopped_when_body_fails() {
        let provisioner = FakeProvisioner::default();
        let result: Result<(), TestError> =
            with_environment(&provisioner, 4566, |_| async { Err(TestError::Body) }).await;

        assert!(matches!(result, Err(TestError::Body)));
        assert_eq!(provisioner.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_environment_is_stopped_when_port_lookup_fails() {
        let provisioner = FakeProvisioner {
            fail_port: true,
            ..Default::default()
        };
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_body = ran.clone();
        let result: Result<(), TestError> = with_environment(&provisioner, 4566, |_| async move {
            ran_in_body.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(TestError::Provisioning(ProvisioningError::PortNotMapped { port: 4566, .. }))
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(provisioner.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_failure_surfaces_only_after_success() {
        let provisioner = FakeProvisioner {
            fail_stop: true,
            ..Default::default()
        };

        let result: Result<(), TestError> =
            with_environment(&provisioner, 4566, |_| async { Ok(()) }).await;
        assert!(matches!(
            result,
            Err(TestError::Provisioning(ProvisioningError::CommandFailed { .. }))
        ));

        let result: Result<(), TestError> =
            with_environment(&provisioner, 4566, |_| async { Err(TestError::Body) }).await;
        assert!(matches!(result, Err(TestError::Body)));
    }

    #[test]
    fn test_endpoint_formatting() {
        let environment = Environment::new("x", "localhost");
        assert_eq!(
            environment.endpoint(49153).unwrap().as_str(),
            "http://localhost:49153/"
        );
    }
}
