use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::HostConfig,
};
use futures_util::StreamExt;

use crate::engine::sandbox::{ContainerEngine, ContainerError, ContainerSpec};

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to `socket` when given, otherwise to the local daemon defaults
    /// (`DOCKER_HOST` or the platform socket).
    pub fn connect(socket: Option<&str>) -> Result<Self, ContainerError> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|err| ContainerError::Connect(err.to_string()))?;
        Ok(Self { docker })
    }

    /// Pulls every image that is not present locally. Failures are logged so
    /// a missing registry never blocks startup.
    pub async fn ensure_images(&self, images: &[String]) {
        for image in images {
            if self.docker.inspect_image(image).await.is_ok() {
                tracing::debug!(image = %image, "sandbox image already present");
                continue;
            }
            tracing::info!(image = %image, "pulling sandbox image");
            let options = Some(CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            });
            let mut stream = self.docker.create_image(options, None, None);
            while let Some(progress) = stream.next().await {
                if let Err(err) = progress {
                    tracing::warn!(image = %image, error = %err, "failed to pull sandbox image");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let working_dir = spec.working_dir.to_string_lossy().into_owned();
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(working_dir),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                // Equal to memory: no swap on top of the cap.
                memory_swap: Some(spec.memory_bytes),
                binds: Some(spec.binds.clone()),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|err| ContainerError::operation("create", &spec.image, err))?;
        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, warning = %warning, "docker create warning");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| ContainerError::operation("start", id, err))
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut stream = self.docker.wait_container(id, options);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(ContainerError::operation("wait", id, err)),
            None => Err(ContainerError::operation("wait", id, "wait stream ended early")),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 404 gone, 409 not running.
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(err) => Err(ContainerError::operation("kill", id, err)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(ContainerError::operation("remove", id, err)),
        }
    }

    async fn count_running(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<usize, ContainerError> {
        let filters = HashMap::from([
            ("label".to_string(), vec![format!("{label_key}={label_value}")]),
            ("status".to_string(), vec!["running".to_string()]),
        ]);
        let options = Some(ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        });
        self.docker
            .list_containers(options)
            .await
            .map(|containers| containers.len())
            .map_err(|err| ContainerError::operation("list", label_value, err))
    }
}
