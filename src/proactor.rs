//! # Proactor and Initiator
//!
//! Supervision of the worker processes that host additional nodes.
//!
//! The initiator owns a hierarchical configuration document with one
//! section per worker guid, a queue of pending launches, and the set of
//! listen ports known busy. A worker is spawned with its guid and port
//! on the command line and the whole serialized configuration piped to
//! its standard input; the child that is still running once the config
//! window has passed is presumed to be serving.
//!
//! The processor side reads that document back, records its own
//! coordinates, and keeps the document fresh against the parent's
//! management surface.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use configparser::ini::Ini;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::defaults;

#[derive(Debug, Error)]
pub enum SpawnError {
    /// Every port in the child range is taken or reserved.
    #[error("no free port in [{0}, {1}]")]
    NoFreePort(u16, u16),

    /// The configuration did not arrive within the startup window.
    #[error("timed out reading configuration")]
    ConfigTimeout,

    #[error("spawn failure: {0}")]
    Io(#[from] std::io::Error),
}

/// What the initiator needs to know to raise children.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Executable spawned for each worker; normally this process's own
    /// image, re-entered in worker mode.
    pub program: PathBuf,
    /// Arguments placed ahead of the worker arguments.
    pub program_args: Vec<String>,
    /// Registry root handed down to every child.
    pub connect: String,
    pub listen_addr: String,
    pub listen_port: u16,
    pub child_port_min: u16,
    pub child_port_max: u16,
    /// Startup window within which a failing child is expected to exit.
    pub config_timeout: Duration,
}

impl SupervisorOptions {
    pub fn new(connect: &str) -> Result<Self, SpawnError> {
        Ok(Self {
            program: std::env::current_exe()?,
            program_args: Vec::new(),
            connect: connect.to_string(),
            listen_addr: defaults::LOOPBACK_ADDR.to_string(),
            listen_port: defaults::PARENT_PORT,
            child_port_min: defaults::CHILD_PORT_MIN,
            child_port_max: defaults::CHILD_PORT_MAX,
            config_timeout: Duration::from_secs(defaults::CONFIG_TIMEOUT_SEC),
        })
    }
}

/// A supervised child process.
#[derive(Debug)]
pub struct Worker {
    pub guid: String,
    /// The child's bound listen port; `None` marks a failed launch.
    pub port: Option<u16>,
    pub session: Option<String>,
    pub module: Option<String>,
    pub process: Option<Child>,
}

/// A launch in flight or finished.
#[derive(Debug)]
pub enum Job {
    Pending { module: String, attempts: u32 },
    Done(Worker),
}

/// Spawns and supervises worker processes.
pub struct Initiator {
    options: SupervisorOptions,
    cfg: Arc<Mutex<Ini>>,
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    busy: Arc<Mutex<HashSet<u16>>>,
    queue: mpsc::Sender<String>,
}

impl Initiator {
    /// Build an initiator around a configuration document.
    ///
    /// Returns the guid queue's receiving end for [`run_jobs`].
    pub fn new(options: SupervisorOptions, cfg: Ini) -> (Self, mpsc::Receiver<String>) {
        let (queue, pending) = mpsc::channel(defaults::QUEUE_DEPTH);
        (
            Self {
                options,
                cfg: Arc::new(Mutex::new(cfg)),
                jobs: Arc::new(Mutex::new(HashMap::new())),
                busy: Arc::new(Mutex::new(HashSet::new())),
                queue,
            },
            pending,
        )
    }

    /// Schedule a worker launch; returns the job's guid.
    pub async fn launch(&self, module: &str, guid: Option<String>) -> String {
        let guid = guid.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        self.jobs.lock().await.insert(
            guid.clone(),
            Job::Pending {
                module: module.to_string(),
                attempts: 0,
            },
        );
        if self.queue.send(guid.clone()).await.is_err() {
            warn!("job queue closed; launch of '{}' dropped", module);
        }
        guid
    }

    /// The job runner: one long-lived task draining the guid queue.
    ///
    /// A child that exits inside the startup window is retried once,
    /// after its configuration section is removed. A launch that finds
    /// no free port is abandoned and forgotten.
    pub async fn run_jobs(
        &self,
        mut pending: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("running jobs");
        loop {
            let guid = tokio::select! {
                _ = shutdown.changed() => break,
                guid = pending.recv() => match guid {
                    Some(guid) => guid,
                    None => break,
                },
            };

            let (module, attempts) = match self.jobs.lock().await.get(&guid) {
                Some(Job::Pending { module, attempts }) => (module.clone(), *attempts),
                _ => continue,
            };

            match self.spawn_worker(&guid, &module).await {
                Err(SpawnError::NoFreePort(lo, hi)) => {
                    warn!("no free port in [{}, {}]; job {} abandoned", lo, hi, guid);
                    self.jobs.lock().await.remove(&guid);
                }
                Err(fault) => {
                    warn!("launch of job {} failed: {}", guid, fault);
                    self.jobs.lock().await.remove(&guid);
                }
                Ok(worker) => match worker.port {
                    Some(port) => {
                        info!("worker {} serving on port {}", guid, port);
                        self.busy.lock().await.insert(port);
                        self.jobs.lock().await.insert(guid, Job::Done(worker));
                    }
                    None => {
                        self.cfg.lock().await.remove_section(&guid);
                        if attempts == 0 {
                            warn!("worker {} exited early; retrying", guid);
                            self.jobs.lock().await.insert(
                                guid.clone(),
                                Job::Pending {
                                    module,
                                    attempts: 1,
                                },
                            );
                            if self.queue.send(guid).await.is_err() {
                                break;
                            }
                        } else {
                            warn!("worker {} failed twice; giving up", guid);
                            self.jobs.lock().await.insert(guid, Job::Done(worker));
                        }
                    }
                },
            }
        }
        debug!("job runner drained");
    }

    /// Raise one child and wait out its startup window.
    async fn spawn_worker(&self, guid: &str, module: &str) -> Result<Worker, SpawnError> {
        let port = self.free_port().await.ok_or(SpawnError::NoFreePort(
            self.options.child_port_min,
            self.options.child_port_max,
        ))?;

        // The child's section derives from its module's, with the
        // parent's coordinates threaded through so it can call back.
        let document = {
            let mut cfg = self.cfg.lock().await;
            clone_section(&mut cfg, module, guid);
            cfg.set(guid, "listen_addr", Some(self.options.listen_addr.clone()));
            cfg.set(guid, "listen_port", Some(port.to_string()));
            reference_parent(
                &mut cfg,
                guid,
                &self.options.listen_addr,
                self.options.listen_port,
            );
            cfg.writes()
        };

        let mut child = Command::new(&self.options.program)
            .args(&self.options.program_args)
            .arg("--mode")
            .arg(module)
            .arg("--connect")
            .arg(&self.options.connect)
            .arg("--guid")
            .arg(guid)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::piped())
            .spawn()?;
        debug!("spawned worker {} (pid {:?})", guid, child.id());

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(document.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        // A child that is still alive after the window has read its
        // configuration and bound its port.
        let window = self.options.config_timeout + Duration::from_secs(2);
        match timeout(window, child.wait()).await {
            Err(_elapsed) => Ok(Worker {
                guid: guid.to_string(),
                port: Some(port),
                session: None,
                module: Some(module.to_string()),
                process: Some(child),
            }),
            Ok(status) => {
                debug!("worker {} exited early: {:?}", guid, status);
                Ok(Worker {
                    guid: guid.to_string(),
                    port: None,
                    session: None,
                    module: Some(module.to_string()),
                    process: Some(child),
                })
            }
        }
    }

    /// The first port in the child range neither reserved nor claimed
    /// by any configuration section.
    async fn free_port(&self) -> Option<u16> {
        let cfg = self.cfg.lock().await;
        let busy = self.busy.lock().await;
        let claimed: HashSet<u16> = cfg
            .sections()
            .iter()
            .filter_map(|section| cfg.getuint(section, "listen_port").ok().flatten())
            .filter_map(|port| u16::try_from(port).ok())
            .collect();

        (self.options.child_port_min..=self.options.child_port_max)
            .find(|port| !busy.contains(port) && !claimed.contains(port))
    }

    /// Whether a guid still names a job, and the port it settled on.
    pub async fn job(&self, guid: &str) -> Option<Option<u16>> {
        match self.jobs.lock().await.get(guid) {
            Some(Job::Done(worker)) => Some(worker.port),
            Some(Job::Pending { .. }) => Some(None),
            None => None,
        }
    }

    /// The configuration document the management surface serves.
    pub async fn config_document(&self) -> String {
        self.cfg.lock().await.writes()
    }
}

/// Copy every key of `source`'s section into a new section `target`.
pub fn clone_section(cfg: &mut Ini, source: &str, target: &str) {
    let entries: Vec<(String, Option<String>)> = cfg
        .get_map_ref()
        .get(&source.to_lowercase())
        .map(|section| {
            section
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();
    for (key, value) in entries {
        cfg.set(target, &key, value);
    }
}

/// Record the parent's coordinates in a child's section so the child
/// can call back for configuration.
pub fn reference_parent(cfg: &mut Ini, target: &str, addr: &str, port: u16) {
    cfg.set(target, "parent_addr", Some(addr.to_string()));
    cfg.set(target, "parent_port", Some(port.to_string()));
}

/// The worker-process side of the supervision contract.
#[derive(Clone)]
pub struct Processor {
    pub guid: String,
    pub cfg: Arc<Mutex<Ini>>,
}

impl Processor {
    pub fn new(guid: &str) -> Self {
        Self {
            guid: guid.to_string(),
            cfg: Arc::new(Mutex::new(Ini::new())),
        }
    }

    /// Read the configuration document piped to standard input.
    ///
    /// Bounded by the startup window; expiry is fatal for the startup
    /// sequence and the caller exits non-zero.
    pub async fn read_config_stdin(&self, window: Duration) -> Result<(), SpawnError> {
        let read = tokio::task::spawn_blocking(|| {
            use std::io::Read;
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).map(|_| text)
        });
        let text = timeout(window, read)
            .await
            .map_err(|_| SpawnError::ConfigTimeout)?
            .map_err(|fault| SpawnError::Io(std::io::Error::new(std::io::ErrorKind::Other, fault)))??;
        self.load(&text).await;
        Ok(())
    }

    /// Read the configuration document from a file instead.
    pub async fn read_config_file(&self, path: &std::path::Path, window: Duration) -> Result<(), SpawnError> {
        let read = tokio::fs::read_to_string(path.to_path_buf());
        let text = timeout(window, read)
            .await
            .map_err(|_| SpawnError::ConfigTimeout)??;
        self.load(&text).await;
        Ok(())
    }

    async fn load(&self, text: &str) {
        let mut cfg = self.cfg.lock().await;
        if let Err(fault) = cfg.read(text.to_string()) {
            warn!("unreadable configuration: {}", fault);
        }
    }

    /// Record this worker's own coordinates in its section.
    pub async fn register_connection(&self, port: u16) -> (String, u16) {
        let mut cfg = self.cfg.lock().await;
        let addr = cfg
            .get(&self.guid, "listen_addr")
            .unwrap_or_else(|| defaults::LOOPBACK_ADDR.to_string());
        cfg.set(&self.guid, "listen_addr", Some(addr.clone()));
        cfg.set(&self.guid, "listen_port", Some(port.to_string()));
        (addr, port)
    }

    /// Keep the configuration fresh against the parent's management
    /// surface.
    ///
    /// Periodically fetches `/config/<guid>` with the bearer token from
    /// the document; a successful response replaces the in-memory
    /// document. Missing host coordinates disable the refresh.
    pub async fn refresh_config(&self, mut shutdown: watch::Receiver<bool>) {
        let (endpoint, bearer) = {
            let cfg = self.cfg.lock().await;
            let scheme = cfg.get(&self.guid, "host_scheme");
            let addr = cfg.get(&self.guid, "host_addr");
            let port = cfg.get(&self.guid, "host_port");
            let bearer = cfg.get(&self.guid, "token");
            match (scheme, addr, port) {
                (Some(scheme), Some(addr), Some(port)) => (
                    format!("{}://{}:{}/config/{}", scheme, addr, port, self.guid),
                    bearer,
                ),
                _ => {
                    debug!("no management coordinates; config refresh disabled");
                    return;
                }
            }
        };

        let client = reqwest::Client::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(defaults::REFRESH_INTERVAL_SEC)) => {}
            }

            let mut request = client.get(&endpoint);
            if let Some(ref bearer) = bearer {
                request = request.bearer_auth(bearer);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(text) => {
                            self.load(&text).await;
                            debug!("configuration refreshed from {}", endpoint);
                        }
                        Err(fault) => warn!("config refresh unreadable: {}", fault),
                    }
                }
                Ok(response) => warn!("config refresh rejected: {}", response.status()),
                Err(fault) => warn!("config refresh failed: {}", fault),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(range: (u16, u16)) -> SupervisorOptions {
        SupervisorOptions {
            program: PathBuf::from("/bin/sh"),
            program_args: vec!["-c".to_string(), "true".to_string()],
            connect: "file:///tmp/fabric-test".to_string(),
            listen_addr: defaults::LOOPBACK_ADDR.to_string(),
            listen_port: defaults::PARENT_PORT,
            child_port_min: range.0,
            child_port_max: range.1,
            config_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_free_port_skips_configured_and_busy() {
        let mut cfg = Ini::new();
        cfg.set("aaaa", "listen_port", Some("60000".to_string()));
        let (initiator, _pending) = Initiator::new(options((60000, 60003)), cfg);
        initiator.busy.lock().await.insert(60001);

        assert_eq!(initiator.free_port().await, Some(60002));
    }

    #[tokio::test]
    async fn test_free_port_exhaustion() {
        let mut cfg = Ini::new();
        cfg.set("aaaa", "listen_port", Some("60000".to_string()));
        cfg.set("bbbb", "listen_port", Some("60001".to_string()));
        let (initiator, _pending) = Initiator::new(options((60000, 60001)), cfg);

        assert_eq!(initiator.free_port().await, None);
    }

    #[tokio::test]
    async fn test_clone_section_copies_keys() {
        let mut cfg = Ini::new();
        cfg.set("work", "child_port_min", Some("60000".to_string()));
        cfg.set("work", "child_port_max", Some("60001".to_string()));

        clone_section(&mut cfg, "work", "deadbeef");
        assert_eq!(
            cfg.get("deadbeef", "child_port_min"),
            Some("60000".to_string())
        );
        assert_eq!(
            cfg.get("deadbeef", "child_port_max"),
            Some("60001".to_string())
        );
    }

    #[tokio::test]
    async fn test_reference_parent_records_coordinates() {
        let mut cfg = Ini::new();
        reference_parent(&mut cfg, "deadbeef", "127.0.0.1", 8080);
        assert_eq!(cfg.get("deadbeef", "parent_addr"), Some("127.0.0.1".to_string()));
        assert_eq!(cfg.getuint("deadbeef", "parent_port"), Ok(Some(8080)));
    }

    #[tokio::test]
    async fn test_launch_registers_pending_job() {
        let (initiator, _pending) = Initiator::new(options((60000, 60001)), Ini::new());
        let guid = initiator.launch("work", None).await;
        assert_eq!(initiator.job(&guid).await, Some(None));
    }
}
