//! Docker engine implementation using bollard

use crate::{
    ContainerDetails, ContainerEngine, ContainerId, ContainerStatus, CreateContainerConfig,
    EngineError, EngineInfo, LogAttachConfig, LogStream, MountType, NetworkSpec, Result,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::service::{HostConfig, Mount, PortBinding};
use bollard::Docker;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Docker engine using the bollard crate
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the Docker socket and verify it responds
    pub async fn new(socket_path: &str) -> Result<Self> {
        let client = if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| EngineError::ConnectionError(e.to_string()))?
        } else {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| EngineError::ConnectionError(e.to_string()))?
        };

        client
            .ping()
            .await
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;

        Ok(Self { client })
    }

    /// Get the underlying Docker client
    pub fn client(&self) -> &Docker {
        &self.client
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, config: &CreateContainerConfig) -> Result<ContainerId> {
        let options = config.name.as_ref().map(|name| CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        });

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for port in &config.ports {
            let container_port = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            let binding = PortBinding {
                host_ip: None,
                host_port: port.host_port.map(|p| p.to_string()),
            };
            port_bindings.insert(container_port, Some(vec![binding]));
        }

        let mounts: Vec<Mount> = config
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(match m.mount_type {
                    MountType::Bind => bollard::service::MountTypeEnum::BIND,
                    MountType::Volume => bollard::service::MountTypeEnum::VOLUME,
                    MountType::Tmpfs => bollard::service::MountTypeEnum::TMPFS,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: config.network.clone(),
            ..Default::default()
        };

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            env: if env.is_empty() { None } else { Some(env) },
            tty: Some(config.tty),
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.clone())
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(options, container_config)
            .await?;

        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, grace_secs: Option<u32>) -> Result<()> {
        let options = StopContainerOptions {
            t: grace_secs.unwrap_or(10) as i64,
        };
        self.client.stop_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(&id.0, Some(options)).await?;
        Ok(())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetails> {
        let info = self.client.inspect_container(&id.0, None).await?;

        let state = info.state.as_ref();
        let status = state
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from(format!("{:?}", s).to_lowercase().as_str()))
            .unwrap_or(ContainerStatus::Unknown);

        let started_at = state
            .and_then(|s| s.started_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());

        let finished_at = state
            .and_then(|s| s.finished_at.as_ref())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .filter(|dt| dt.timestamp() > 0)
            .map(|dt| dt.timestamp());

        Ok(ContainerDetails {
            id: id.clone(),
            name: info
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: info
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            status,
            started_at,
            finished_at,
            exit_code: state.and_then(|s| s.exit_code),
        })
    }

    async fn attach_logs(&self, id: &ContainerId, config: &LogAttachConfig) -> Result<LogStream> {
        let options = LogsOptions {
            follow: config.follow,
            stdout: config.stdout,
            stderr: config.stderr,
            tail: config
                .tail
                .map(|t| t.to_string())
                .unwrap_or_else(|| "all".to_string()),
            timestamps: config.timestamps,
            since: config.since.unwrap_or(0),
            ..Default::default()
        };

        let stream = self.client.logs(&id.0, Some(options));
        let reader = MuxFrameReader::new(stream);

        Ok(LogStream {
            stream: Box::pin(reader),
        })
    }

    async fn ensure_network(&self, spec: &NetworkSpec) -> Result<()> {
        match self
            .client
            .inspect_network(&spec.name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => {
                let existing_subnet = network
                    .ipam
                    .as_ref()
                    .and_then(|ipam| ipam.config.as_ref())
                    .and_then(|cfgs| cfgs.first())
                    .and_then(|c| c.subnet.clone());

                match existing_subnet {
                    Some(ref subnet) if subnet == &spec.subnet => Ok(()),
                    other => Err(EngineError::NetworkConflict(format!(
                        "network '{}' exists with subnet {:?}, expected {}",
                        spec.name, other, spec.subnet
                    ))),
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let options = CreateNetworkOptions {
                    name: spec.name.as_str(),
                    driver: "bridge",
                    ipam: bollard::models::Ipam {
                        config: Some(vec![bollard::models::IpamConfig {
                            subnet: Some(spec.subnet.clone()),
                            gateway: Some(spec.gateway.clone()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                    labels: spec
                        .labels
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .collect(),
                    ..Default::default()
                };
                self.client.create_network(options).await?;
                tracing::info!(network = %spec.name, subnet = %spec.subnet, "created bridge network");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn image_present(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            version: "unknown".to_string(),
            api_version: bollard::API_DEFAULT_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Reader that re-frames bollard's demultiplexed log items into the engine's
/// wire format: 8-byte header (stream id, 3 reserved bytes, big-endian u32
/// length) followed by the payload. The collector owns the single demux
/// implementation, so the adapter must hand it framed bytes.
struct MuxFrameReader<S> {
    stream: S,
    buffer: Vec<u8>,
    pos: usize,
}

impl<S> MuxFrameReader<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            pos: 0,
        }
    }
}

fn frame_chunk(stream_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.push(stream_id);
    framed.extend_from_slice(&[0, 0, 0]);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

impl<S> AsyncRead for MuxFrameReader<S>
where
    S: Stream<Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>>
        + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        // Drain buffered bytes first
        if self.pos < self.buffer.len() {
            let remaining = &self.buffer[self.pos..];
            let to_copy = std::cmp::min(remaining.len(), buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return std::task::Poll::Ready(Ok(()));
        }

        self.buffer.clear();
        self.pos = 0;

        match Pin::new(&mut self.stream).poll_next(cx) {
            std::task::Poll::Ready(Some(Ok(output))) => {
                let (stream_id, data) = match output {
                    bollard::container::LogOutput::StdOut { message } => (1u8, message),
                    bollard::container::LogOutput::StdErr { message } => (2u8, message),
                    bollard::container::LogOutput::StdIn { message } => (0u8, message),
                    bollard::container::LogOutput::Console { message } => (1u8, message),
                };
                self.buffer = frame_chunk(stream_id, &data);

                let to_copy = std::cmp::min(self.buffer.len(), buf.remaining());
                buf.put_slice(&self.buffer[..to_copy]);
                self.pos = to_copy;
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(Some(Err(e))) => std::task::Poll::Ready(Err(
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )),
            std::task::Poll::Ready(None) => std::task::Poll::Ready(Ok(())),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}
