//! Docker implementation of the container engine client
//!
//! Everything goes through bollard against the local daemon; the exec
//! stream demultiplexing (8-byte header framing) is handled by the
//! library's `LogOutput` type.

use super::{
    cpus_to_nano, parse_memory_bytes, ContainerEngine, ContainerSummary, CreateContainerSpec,
    CreateNetworkSpec, ExecOptions, ExecOutput, InteractiveExec, NetworkInspect, NetworkSummary,
    OutputChunk, OutputKind,
};
use crate::submission::FileEntry;
use crate::{Error, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::network::{
    CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions, ListNetworksOptions,
    PruneNetworksOptions,
};
use bollard::models::{HostConfig, Ipam, IpamConfig};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Command a container idles on when the caller supplies none, so that
/// later execs attach into a running container
const IDLE_CMD: &[&str] = &["tail", "-f", "/dev/null"];

/// Container engine client over the local Docker daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect with the platform defaults and verify the daemon responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::EngineUnavailable(format!("failed to connect to daemon: {}", e)))?;

        match docker.version().await {
            Ok(version) => {
                info!(
                    daemon_version = %version.version.unwrap_or_else(|| "unknown".to_string()),
                    api_version = %version.api_version.unwrap_or_else(|| "unknown".to_string()),
                    "connected to container engine"
                );
            }
            Err(e) => {
                warn!("could not retrieve engine version info: {}", e);
            }
        }

        Ok(Self { docker })
    }
}

fn engine_err(context: &str, err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => Error::ResourceConflict(format!("{}: {}", context, message)),
        other => Error::EngineUnavailable(format!("{}: {}", context, other)),
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn label_filters(filters: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "label".to_string(),
        filters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect(),
    );
    map
}

/// Build an in-memory POSIX tar of the submitted files
pub(crate) fn build_archive(files: &[FileEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let data = file.content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header
            .set_path(&file.path)
            .map_err(|e| Error::Internal(format!("tar path '{}': {}", file.path, e)))?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data)?;
    }
    Ok(builder.into_inner()?)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::EngineUnavailable(format!("daemon ping failed: {}", e)))
    }

    async fn image_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_image(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(engine_err("inspect image", e)),
        }
    }

    async fn create_container(&self, spec: CreateContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            memory: Some(parse_memory_bytes(&spec.memory)?),
            nano_cpus: Some(cpus_to_nano(spec.cpus)),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let cmd = spec
            .cmd
            .clone()
            .unwrap_or_else(|| IDLE_CMD.iter().map(|s| s.to_string()).collect());

        let config = Config::<String> {
            image: Some(spec.image.clone()),
            cmd: Some(cmd),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: Some("/app".to_string()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| engine_err("create container", e))?;

        debug!(container_id = %response.id, image = %spec.image, "container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| engine_err("start container", e))
    }

    async fn exec_collect(
        &self,
        id: &str,
        cmd: Vec<String>,
        opts: ExecOptions,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: opts.work_dir.clone().or_else(|| Some("/app".to_string())),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| engine_err("create exec", e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| engine_err("start exec", e))?;

        let mut output = match started {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(Error::Internal("exec unexpectedly detached".to_string()))
            }
        };

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some(item) = output.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(engine_err("exec stream", e)),
                }
            }
            Ok((stdout, stderr))
        };

        let (stdout, stderr) = match opts.timeout {
            Some(deadline) => tokio::time::timeout(deadline, collect)
                .await
                .map_err(|_| {
                    // Dropping the hijacked stream destroys it
                    Error::Timeout(format!("exec in container {} exceeded {:?}", id, deadline))
                })??,
            None => collect.await?,
        };

        let exit_code = self.exec_exit_code(&exec.id).await?.unwrap_or(-1);
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn exec_interactive(
        &self,
        id: &str,
        cmd: Vec<String>,
        opts: ExecOptions,
    ) -> Result<InteractiveExec> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: opts.work_dir.clone().or_else(|| Some("/app".to_string())),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| engine_err("create exec", e))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_err("start exec", e))?;

        let (mut output, mut input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(Error::Internal("exec unexpectedly detached".to_string()))
            }
        };

        // Demultiplex onto one ordered channel. The channel closes when the
        // underlying stream ends, closes, or errors, whichever comes first;
        // daemon implementations differ on which of those is observed.
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            while let Some(item) = output.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk {
                            kind: OutputKind::Stdout,
                            data: message,
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => OutputChunk {
                        kind: OutputKind::Stderr,
                        data: message,
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("interactive exec stream ended with error: {}", e);
                        break;
                    }
                };
                if chunk_tx.send(chunk).is_err() {
                    break;
                }
            }
        });

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if input.write_all(&data).await.is_err() {
                    break;
                }
                let _ = input.flush().await;
            }
        });

        Ok(InteractiveExec::new(
            exec.id,
            chunk_rx,
            stdin_tx,
            vec![pump.abort_handle(), writer.abort_handle()],
        ))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| engine_err("inspect exec", e))?;
        Ok(inspect.exit_code)
    }

    async fn put_files(&self, id: &str, files: &[FileEntry], dest: &str) -> Result<()> {
        let archive = build_archive(files)?;
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: dest.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| engine_err("upload archive", e))
    }

    async fn remove_containers(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            let result = self
                .docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await;
            match result {
                Ok(_) => removed += 1,
                // Already gone; not an error
                Err(e) if is_not_found(&e) => removed += 1,
                Err(e) => {
                    warn!(container_id = %id, "container removal failed: {}", e);
                }
            }
        }
        Ok(removed)
    }

    async fn list_containers(
        &self,
        filters: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: label_filters(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| engine_err("list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_network(&self, spec: CreateNetworkSpec) -> Result<()> {
        self.docker
            .create_network(CreateNetworkOptions::<String> {
                name: spec.name.clone(),
                driver: spec.driver.clone(),
                ipam: Ipam {
                    driver: Some("default".to_string()),
                    config: Some(vec![IpamConfig {
                        subnet: Some(spec.subnet.clone()),
                        ..Default::default()
                    }]),
                    options: None,
                },
                labels: spec.labels.clone(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| engine_err("create network", e))
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(engine_err("inspect network", e)),
        }
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInspect> {
        let network = self
            .docker
            .inspect_network(
                name,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_err("inspect network", e))?;

        let subnet = network
            .ipam
            .as_ref()
            .and_then(|ipam| ipam.config.as_ref())
            .and_then(|configs| configs.first())
            .and_then(|config| config.subnet.clone());

        Ok(NetworkInspect {
            name: network.name.unwrap_or_else(|| name.to_string()),
            subnet,
            container_count: network.containers.map(|c| c.len()).unwrap_or(0),
            created: network.created.map(|c| c.to_string()),
        })
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        match self.docker.remove_network(name).await {
            Ok(_) => Ok(()),
            // Already gone; not an error
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(engine_err("remove network", e)),
        }
    }

    async fn list_networks(&self, prefix: &str) -> Result<Vec<NetworkSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| engine_err("list networks", e))?;

        // The engine's name filter is a substring match; re-check the prefix
        Ok(networks
            .into_iter()
            .filter_map(|n| {
                let name = n.name?;
                if !name.starts_with(prefix) {
                    return None;
                }
                Some(NetworkSummary {
                    name,
                    id: n.id.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn disconnect_all_from_network(&self, name: &str) -> Result<usize> {
        let network = self
            .docker
            .inspect_network(
                name,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| engine_err("inspect network", e))?;

        let attached: Vec<String> = network
            .containers
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();

        let mut detached = 0;
        for container in attached {
            let result = self
                .docker
                .disconnect_network(
                    name,
                    DisconnectNetworkOptions {
                        container: container.clone(),
                        force: true,
                    },
                )
                .await;
            match result {
                Ok(_) => detached += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    warn!(network = %name, container = %container, "disconnect failed: {}", e);
                }
            }
        }
        Ok(detached)
    }

    async fn prune_networks(&self, filters: &[(String, String)]) -> Result<usize> {
        let response = self
            .docker
            .prune_networks(Some(PruneNetworksOptions {
                filters: label_filters(filters),
            }))
            .await
            .map_err(|e| engine_err("prune networks", e))?;
        Ok(response.networks_deleted.map(|n| n.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, content: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: content.to_string(),
            to_be_exec: false,
        }
    }

    #[test]
    fn test_build_archive_roundtrip() {
        let files = vec![
            entry("main.py", "print('hi')"),
            entry("pkg/util.py", "x = 1"),
        ];
        let bytes = build_archive(&files).unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = String::new();
            std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
            seen.push((path, content));
        }
        assert_eq!(
            seen,
            vec![
                ("main.py".to_string(), "print('hi')".to_string()),
                ("pkg/util.py".to_string(), "x = 1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_engine_connect() {
        // Requires a local daemon; skip when unavailable
        if std::env::var("SKIP_DOCKER_TESTS").is_ok() {
            return;
        }
        match DockerEngine::connect().await {
            Ok(_) => {}
            Err(e) => println!("daemon not accessible: {}", e),
        }
    }
}
