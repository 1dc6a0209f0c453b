//! Scripted engine fake for exercising the pipeline without a daemon
//!
//! Tests register [`FakeProgram`]s keyed by a command substring; an
//! interactive exec whose command matches plays the program's chunks and
//! exit code. Containers, networks and uploads are tracked in memory so
//! tests can assert on what the pipeline did.

use crate::engine::{
    ContainerEngine, ContainerSummary, CreateContainerSpec, CreateNetworkSpec, ExecOptions,
    ExecOutput, InteractiveExec, NetworkInspect, NetworkSummary, OutputChunk, OutputKind,
};
use crate::submission::FileEntry;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// A canned program played by `exec_interactive`
#[derive(Debug, Clone)]
pub struct FakeProgram {
    /// Substring matched against the joined exec command
    pub match_substr: String,
    /// Chunks emitted in order
    pub chunks: Vec<(OutputKind, String)>,
    /// Exit code reported once the stream ends
    pub exit_code: i64,
    /// Keep the stream open after the chunks until killed
    pub hang: bool,
    /// With `hang`, re-emit the chunks on this interval forever
    pub repeat_interval: Option<Duration>,
}

impl FakeProgram {
    pub fn new(match_substr: impl Into<String>) -> Self {
        Self {
            match_substr: match_substr.into(),
            chunks: Vec::new(),
            exit_code: 0,
            hang: false,
            repeat_interval: None,
        }
    }

    pub fn stdout(mut self, data: impl Into<String>) -> Self {
        self.chunks.push((OutputKind::Stdout, data.into()));
        self
    }

    pub fn stderr(mut self, data: impl Into<String>) -> Self {
        self.chunks.push((OutputKind::Stderr, data.into()));
        self
    }

    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Keep running until killed, re-emitting the chunks on an interval
    pub fn looping(mut self, interval: Duration) -> Self {
        self.hang = true;
        self.repeat_interval = Some(interval);
        self
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    labels: HashMap<String, String>,
    network: Option<String>,
    running: bool,
}

#[derive(Debug, Clone)]
struct FakeNetwork {
    spec: CreateNetworkSpec,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, FakeNetwork>,
    uploads: HashMap<String, Vec<FileEntry>>,
    exec_exit: HashMap<String, i64>,
    exec_log: Vec<(String, String)>,
    stdin_bufs: Vec<std::sync::Arc<Mutex<Vec<u8>>>>,
    next_id: u64,
    fail_container_creates: usize,
    fail_network_creates: usize,
    container_create_delay: Option<Duration>,
}

/// In-memory engine double
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    programs: Mutex<Vec<FakeProgram>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canned program
    pub fn add_program(&self, program: FakeProgram) {
        self.programs.lock().push(program);
    }

    /// Make the next `n` container creations fail
    pub fn fail_container_creates(&self, n: usize) {
        self.state.lock().fail_container_creates = n;
    }

    /// Make the next `n` network creations fail
    pub fn fail_network_creates(&self, n: usize) {
        self.state.lock().fail_network_creates = n;
    }

    /// Delay each container creation (for warm-reuse latency assertions)
    pub fn set_container_create_delay(&self, delay: Duration) {
        self.state.lock().container_create_delay = Some(delay);
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.state.lock().containers.contains_key(id)
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    pub fn network_subnet(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .networks
            .get(name)
            .map(|n| n.spec.subnet.clone())
    }

    pub fn uploaded_files(&self, container_id: &str) -> Vec<FileEntry> {
        self.state
            .lock()
            .uploads
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Everything written to any exec's stdin, concatenated
    pub fn stdin_received(&self) -> Vec<u8> {
        let state = self.state.lock();
        let mut all = Vec::new();
        for buf in &state.stdin_bufs {
            all.extend_from_slice(&buf.lock());
        }
        all
    }

    /// Every exec command seen, joined with spaces
    pub fn exec_history(&self) -> Vec<String> {
        self.state
            .lock()
            .exec_log
            .iter()
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    fn find_program(&self, cmd: &str) -> Option<FakeProgram> {
        self.programs
            .lock()
            .iter()
            .find(|p| cmd.contains(&p.match_substr))
            .cloned()
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn create_container(&self, spec: CreateContainerSpec) -> Result<String> {
        let delay = {
            let mut state = self.state.lock();
            if state.fail_container_creates > 0 {
                state.fail_container_creates -= 1;
                return Err(Error::EngineUnavailable(
                    "injected container create failure".to_string(),
                ));
            }
            state.container_create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id("ctr");
        self.state.lock().containers.insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels,
                network: spec.network,
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(Error::EngineUnavailable(format!(
                "no such container {}",
                id
            ))),
        }
    }

    async fn exec_collect(
        &self,
        id: &str,
        cmd: Vec<String>,
        _opts: ExecOptions,
    ) -> Result<ExecOutput> {
        let joined = cmd.join(" ");
        {
            let mut state = self.state.lock();
            if !state.containers.contains_key(id) {
                return Err(Error::EngineUnavailable(format!(
                    "no such container {}",
                    id
                )));
            }
            state.exec_log.push((id.to_string(), joined.clone()));
        }

        match self.find_program(&joined) {
            Some(program) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                for (kind, data) in &program.chunks {
                    match kind {
                        OutputKind::Stdout => stdout.push_str(data),
                        OutputKind::Stderr => stderr.push_str(data),
                    }
                }
                Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: program.exit_code,
                })
            }
            None => Ok(ExecOutput::default()),
        }
    }

    async fn exec_interactive(
        &self,
        id: &str,
        cmd: Vec<String>,
        _opts: ExecOptions,
    ) -> Result<InteractiveExec> {
        let joined = cmd.join(" ");
        {
            let mut state = self.state.lock();
            if !state.containers.contains_key(id) {
                return Err(Error::EngineUnavailable(format!(
                    "no such container {}",
                    id
                )));
            }
            state.exec_log.push((id.to_string(), joined.clone()));
        }

        let exec_id = self.next_id("exec");
        let program = self.find_program(&joined).unwrap_or_else(|| {
            FakeProgram::new("")
        });

        self.state
            .lock()
            .exec_exit
            .insert(exec_id.clone(), program.exit_code);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Bytes>();

        let pump = tokio::spawn(async move {
            loop {
                for (kind, data) in &program.chunks {
                    let chunk = OutputChunk {
                        kind: *kind,
                        data: Bytes::from(data.clone()),
                    };
                    if chunk_tx.send(chunk).is_err() {
                        return;
                    }
                }
                match (program.hang, program.repeat_interval) {
                    (true, Some(interval)) => tokio::time::sleep(interval).await,
                    (true, None) => std::future::pending::<()>().await,
                    (false, _) => return,
                }
            }
        });

        let stdin_buf = std::sync::Arc::new(Mutex::new(Vec::new()));
        self.state.lock().stdin_bufs.push(stdin_buf.clone());
        let writer = tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                stdin_buf.lock().extend_from_slice(&data);
            }
        });

        Ok(InteractiveExec::new(
            exec_id,
            chunk_rx,
            stdin_tx,
            vec![pump.abort_handle(), writer.abort_handle()],
        ))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        Ok(self.state.lock().exec_exit.get(exec_id).copied())
    }

    async fn put_files(&self, id: &str, files: &[FileEntry], _dest: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.containers.contains_key(id) {
            return Err(Error::EngineUnavailable(format!(
                "no such container {}",
                id
            )));
        }
        state.uploads.insert(id.to_string(), files.to_vec());
        Ok(())
    }

    async fn remove_containers(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock();
        for id in ids {
            state.containers.remove(id);
            state.uploads.remove(id);
        }
        Ok(ids.len())
    }

    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| {
                label_filters
                    .iter()
                    .all(|(k, v)| c.labels.get(k) == Some(v))
            })
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn create_network(&self, spec: CreateNetworkSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_network_creates > 0 {
            state.fail_network_creates -= 1;
            return Err(Error::EngineUnavailable(
                "injected network create failure".to_string(),
            ));
        }
        if state.networks.contains_key(&spec.name) {
            return Err(Error::ResourceConflict(format!(
                "network {} already exists",
                spec.name
            )));
        }
        state
            .networks
            .insert(spec.name.clone(), FakeNetwork { spec });
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().networks.contains_key(name))
    }

    async fn inspect_network(&self, name: &str) -> Result<NetworkInspect> {
        let state = self.state.lock();
        let network = state.networks.get(name).ok_or_else(|| {
            Error::EngineUnavailable(format!("no such network {}", name))
        })?;
        let container_count = state
            .containers
            .values()
            .filter(|c| c.network.as_deref() == Some(name))
            .count();
        Ok(NetworkInspect {
            name: name.to_string(),
            subnet: Some(network.spec.subnet.clone()),
            container_count,
            created: None,
        })
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        // Missing networks are tolerated, like the engine's 404
        self.state.lock().networks.remove(name);
        Ok(())
    }

    async fn list_networks(&self, prefix: &str) -> Result<Vec<NetworkSummary>> {
        Ok(self
            .state
            .lock()
            .networks
            .keys()
            .filter(|name| name.starts_with(prefix))
            .map(|name| NetworkSummary {
                name: name.clone(),
                id: format!("id-{}", name),
            })
            .collect())
    }

    async fn disconnect_all_from_network(&self, name: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let mut detached = 0;
        for container in state.containers.values_mut() {
            if container.network.as_deref() == Some(name) {
                container.network = None;
                detached += 1;
            }
        }
        Ok(detached)
    }

    async fn prune_networks(&self, label_filters: &[(String, String)]) -> Result<usize> {
        let mut state = self.state.lock();
        let attached: Vec<String> = state
            .containers
            .values()
            .filter_map(|c| c.network.clone())
            .collect();
        let before = state.networks.len();
        state.networks.retain(|name, network| {
            let matches = label_filters
                .iter()
                .all(|(k, v)| network.spec.labels.get(k) == Some(v));
            !(matches && !attached.contains(name))
        });
        Ok(before - state.networks.len())
    }
}
