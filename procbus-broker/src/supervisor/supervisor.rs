//! Child lifecycle management and pipeline bridging.

// Layer 1: Standard library imports
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

// Layer 3: Internal module imports
use super::descriptor::{ProcessDescriptor, ProcessStatus, RestartConfig};
use super::spawner::{spawn_child, HandleSlots, SpawnedChild};
use crate::error::BrokerError;
use crate::optimizer::Optimizer;
use crate::router::{mailbox, Router};
use procbus_wire::rpc::INVALID_RPC_HANDLE_EXIT;
use procbus_wire::{WireCodec, WireEncoding};

/// Supervisor tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Descriptor slots wired into RPC children
    pub slots: HandleSlots,
    /// Capacity of each child's mailbox
    pub mailbox_capacity: usize,
    /// How long shutdown waits after SIGTERM before SIGKILL
    pub shutdown_grace: Duration,
    /// Frame encoding on the RPC handles
    pub encoding: WireEncoding,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            slots: HandleSlots::default(),
            mailbox_capacity: 256,
            shutdown_grace: Duration::from_secs(5),
            encoding: WireEncoding::default(),
        }
    }
}

/// Control signals delivered to a supervision task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Keep supervising
    Run,
    /// Kill immediately; cancels any pending restart
    Kill,
    /// SIGTERM, bounded grace, then SIGKILL
    Graceful,
}

struct ProcEntry {
    descriptor: RwLock<ProcessDescriptor>,
    control: watch::Sender<Control>,
    done: watch::Sender<bool>,
    supervision: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Spawns and supervises the child fleet.
///
/// Each child gets one supervision task owning the OS process. RPC
/// children additionally get a reader task (outbound handle into the
/// optimizer) and a writer task (mailbox onto the inbound handle), both
/// re-created on restart.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    router: Arc<Router>,
    optimizer: Arc<Optimizer>,
    procs: DashMap<String, Arc<ProcEntry>>,
}

impl Supervisor {
    /// Create a supervisor bridging children into `router` and `optimizer`.
    pub fn new(config: SupervisorConfig, router: Arc<Router>, optimizer: Arc<Optimizer>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                router,
                optimizer,
                procs: DashMap::new(),
            }),
        }
    }

    /// Spawn a plain child with no restart budget.
    pub fn spawn(
        &self,
        id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.spawn_internal(id, command, args, RestartConfig::default(), false)
    }

    /// Spawn a child with RPC handles wired at the configured slots.
    pub fn spawn_rpc(
        &self,
        id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.spawn_internal(id, command, args, RestartConfig::default(), true)
    }

    /// Spawn a plain child with a restart budget.
    pub fn spawn_with_restart(
        &self,
        id: &str,
        command: &str,
        max_restarts: i32,
        delay: Duration,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.spawn_internal(id, command, args, RestartConfig::new(max_restarts, delay), false)
    }

    /// Spawn an RPC child with a restart budget.
    pub fn spawn_rpc_with_restart(
        &self,
        id: &str,
        command: &str,
        max_restarts: i32,
        delay: Duration,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.spawn_internal(id, command, args, RestartConfig::new(max_restarts, delay), true)
    }

    fn spawn_internal(
        &self,
        id: &str,
        command: &str,
        args: &[String],
        restart: RestartConfig,
        rpc: bool,
    ) -> Result<ProcessDescriptor, BrokerError> {
        if id.is_empty() {
            return Err(BrokerError::MissingId);
        }

        let slots = rpc.then_some(self.inner.config.slots);

        // Registration is atomic with the fork: the entry slot is held
        // while the child starts, and nothing is retained on failure.
        let (entry, mut spawned, control_rx) = match self.inner.procs.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BrokerError::DuplicateId { id: id.to_string() })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let spawned = spawn_child(command, args, slots)?;

                let mut argv = vec![command.to_string()];
                argv.extend(args.iter().cloned());
                let descriptor = ProcessDescriptor::new(id, spawned.pid, argv, restart, rpc);

                // The receiver is created before the entry is visible, so
                // a racing kill cannot be missed by the supervision task.
                let (control, control_rx) = watch::channel(Control::Run);
                let (done, _) = watch::channel(false);
                let entry = Arc::new(ProcEntry {
                    descriptor: RwLock::new(descriptor),
                    control,
                    done,
                    supervision: Mutex::new(None),
                });
                slot.insert(Arc::clone(&entry));
                (entry, spawned, control_rx)
            }
        };

        info!(id = %id, pid = spawned.pid, rpc, "child spawned");
        let descriptor = entry.descriptor.read().clone();
        attach_channels(&self.inner, &entry, &mut spawned);

        let task = tokio::spawn(supervise(
            Arc::clone(&self.inner),
            Arc::clone(&entry),
            spawned,
            control_rx,
            command.to_string(),
            args.to_vec(),
            slots,
        ));
        *entry.supervision.lock() = Some(task);

        Ok(descriptor)
    }

    /// Kill `id` immediately, canceling any pending restart, and wait for
    /// its supervision task to finish.
    pub async fn kill(&self, id: &str) -> Result<(), BrokerError> {
        let entry = self
            .inner
            .procs
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BrokerError::Unknown {
                reason: format!("no such process: {id}"),
            })?;

        let mut done = entry.done.subscribe();
        let _ = entry.control.send(Control::Kill);
        if !*done.borrow() {
            let _ = done.changed().await;
        }
        Ok(())
    }

    /// Snapshot of every supervised child.
    pub fn list(&self) -> Vec<ProcessDescriptor> {
        self.inner
            .procs
            .iter()
            .map(|e| e.value().descriptor.read().clone())
            .collect()
    }

    /// Snapshot of one child.
    pub fn get(&self, id: &str) -> Option<ProcessDescriptor> {
        self.inner
            .procs
            .get(id)
            .map(|e| e.value().descriptor.read().clone())
    }

    /// Supervised child count, terminal children included.
    pub fn process_count(&self) -> usize {
        self.inner.procs.len()
    }

    /// Terminate every child: SIGTERM, bounded grace, then SIGKILL.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<ProcEntry>> = self
            .inner
            .procs
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        for entry in &entries {
            let _ = entry.control.send(Control::Graceful);
        }

        for entry in &entries {
            let task = entry.supervision.lock().take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        self.inner.procs.clear();
        info!("supervisor shut down");
    }
}

/// Wire one incarnation's channels: register the route, start the writer
/// and reader tasks.
fn attach_channels(
    inner: &Arc<SupervisorInner>,
    entry: &Arc<ProcEntry>,
    spawned: &mut SpawnedChild,
) {
    #[cfg(unix)]
    {
        let id = entry.descriptor.read().id.clone();
        let Some(rpc) = spawned.rpc.take() else {
            return;
        };

        let (sender, mut mb) = mailbox(id.clone(), inner.config.mailbox_capacity);
        if let Err(err) = inner.router.register_route(id.clone(), sender) {
            error!(id = %id, error = %err, "route registration failed");
            return;
        }

        let codec = WireCodec::new(inner.config.encoding);
        let wire_metrics = codec.metrics();

        // Writer: drain the child's mailbox onto its inbound handle.
        let writer_id = id.clone();
        let mut writer = FramedWrite::new(rpc.inbound, codec.clone());
        tokio::spawn(async move {
            while let Some(msg) = mb.recv().await {
                if let Err(err) = writer.send(msg).await {
                    warn!(id = %writer_id, error = %err, "inbound write failed");
                    break;
                }
            }
            debug!(id = %writer_id, "writer task finished");
        });

        // Reader: feed the child's outbound frames into the optimizer.
        let reader_id = id;
        let optimizer = Arc::clone(&inner.optimizer);
        let mut reader = FramedRead::new(rpc.outbound, codec);
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(msg) => {
                        if !optimizer.offer(msg).await {
                            debug!(id = %reader_id, "ingress refused a frame");
                        }
                    }
                    Err(err) => {
                        warn!(id = %reader_id, error = %err, "outbound frame decode failed");
                        optimizer.collector().record_error();
                    }
                }
            }
            debug!(
                id = %reader_id,
                encoding = %wire_metrics.encoding(),
                frames_in = wire_metrics.frames_in(),
                frames_out = wire_metrics.frames_out(),
                "reader task finished"
            );
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (inner, entry, spawned);
    }
}

/// Classify an exit status into lifecycle state.
fn classify_exit(status: std::process::ExitStatus) -> (ProcessStatus, Option<i32>) {
    if status.success() {
        (ProcessStatus::Exited, Some(0))
    } else {
        (ProcessStatus::Failed, status.code())
    }
}

/// Send SIGTERM to `pid`, best-effort.
#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

/// One child's supervision loop: observe exits, enforce the restart
/// budget, honor kill and shutdown signals.
async fn supervise(
    inner: Arc<SupervisorInner>,
    entry: Arc<ProcEntry>,
    spawned: SpawnedChild,
    mut control: watch::Receiver<Control>,
    command: String,
    args: Vec<String>,
    slots: Option<HandleSlots>,
) {
    let mut child = spawned.child;
    let id = entry.descriptor.read().id.clone();

    loop {
        let exit = tokio::select! {
            status = child.wait() => status,
            _ = control.changed() => {
                let signal = *control.borrow();
                match signal {
                    Control::Run => continue,
                    Control::Kill => {
                        let _ = child.start_kill();
                        let status = child.wait().await;
                        record_exit(&entry, status, &id);
                        break;
                    }
                    Control::Graceful => {
                        let pid = entry.descriptor.read().pid;
                        send_sigterm(pid);
                        let grace = inner.config.shutdown_grace;
                        let status = match tokio::time::timeout(grace, child.wait()).await {
                            Ok(status) => status,
                            Err(_) => {
                                warn!(id = %id, "grace period expired; killing");
                                let _ = child.start_kill();
                                child.wait().await
                            }
                        };
                        record_exit(&entry, status, &id);
                        break;
                    }
                }
            }
        };

        record_exit(&entry, exit, &id);
        inner.router.unregister_route(&id);

        // Restart decision
        let (allows, delay, restart_count) = {
            let descriptor = entry.descriptor.read();
            (
                descriptor.restart.allows_restart(descriptor.restart_count),
                descriptor.restart.delay,
                descriptor.restart_count,
            )
        };
        if !allows {
            debug!(id = %id, restart_count, "restart budget exhausted or absent");
            break;
        }

        // Wait out the delay; a concurrent kill cancels the restart.
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = control.changed() => {
                    if *control.borrow() != Control::Run {
                        debug!(id = %id, "pending restart canceled");
                        break;
                    }
                }
            }
        } else if *control.borrow() != Control::Run {
            break;
        }

        match spawn_child(&command, &args, slots) {
            Ok(mut next) => {
                {
                    let mut descriptor = entry.descriptor.write();
                    descriptor.pid = next.pid;
                    descriptor.status = ProcessStatus::Running;
                    descriptor.restart_count += 1;
                    descriptor.started_at = chrono::Utc::now();
                }
                info!(id = %id, pid = next.pid, attempt = restart_count + 1, "child restarted");
                attach_channels(&inner, &entry, &mut next);
                child = next.child;
            }
            Err(err) => {
                error!(id = %id, error = %err, "restart spawn failed");
                entry.descriptor.write().status = ProcessStatus::Failed;
                break;
            }
        }
    }

    inner.router.unregister_route(&id);
    let _ = entry.done.send(true);
}

/// Record a child's exit status onto its descriptor.
fn record_exit(
    entry: &Arc<ProcEntry>,
    status: std::io::Result<std::process::ExitStatus>,
    id: &str,
) {
    match status {
        Ok(status) => {
            let (state, code) = classify_exit(status);
            if code == Some(INVALID_RPC_HANDLE_EXIT) {
                error!(id = %id, "child reported invalid RPC handles (exit 254)");
            } else {
                info!(id = %id, status = %state, code = ?code, "child terminated");
            }
            let mut descriptor = entry.descriptor.write();
            descriptor.status = state;
            descriptor.exit_code = code;
        }
        Err(err) => {
            warn!(id = %id, error = %err, "wait on child failed");
            entry.descriptor.write().status = ProcessStatus::Failed;
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerConfig;

    fn fixture() -> Supervisor {
        let router = Arc::new(Router::new());
        let config = OptimizerConfig::builder()
            .with_buffer_cap(64)
            .with_num_workers(1)
            .build()
            .unwrap();
        let optimizer = Arc::new(Optimizer::new(config, Arc::clone(&router)).unwrap());
        Supervisor::new(SupervisorConfig::default(), router, optimizer)
    }

    async fn wait_for_status(supervisor: &Supervisor, id: &str, status: ProcessStatus) {
        for _ in 0..200 {
            if supervisor.get(id).map(|d| d.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let last = supervisor.get(id);
        assert_eq!(last.map(|d| d.status), Some(status), "status never reached");
    }

    #[tokio::test]
    async fn test_spawn_reports_running_descriptor() {
        let supervisor = fixture();
        let descriptor = supervisor.spawn("w1", "/bin/sleep", &["5".to_string()]).unwrap();
        assert_eq!(descriptor.id, "w1");
        assert!(descriptor.pid > 0);
        assert_eq!(descriptor.status, ProcessStatus::Running);

        supervisor.kill("w1").await.unwrap();
        assert_eq!(supervisor.get("w1").unwrap().status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let supervisor = fixture();
        supervisor.spawn("w1", "/bin/sleep", &["5".to_string()]).unwrap();

        let err = supervisor.spawn("w1", "/bin/true", &[]).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateId { id } if id == "w1"));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let supervisor = fixture();
        let err = supervisor.spawn("", "/bin/true", &[]).unwrap_err();
        assert!(matches!(err, BrokerError::MissingId));
    }

    #[tokio::test]
    async fn test_failed_spawn_releases_the_id() {
        let supervisor = fixture();
        let err = supervisor.spawn("w1", "/bin/definitely-not-here", &[]).unwrap_err();
        assert!(matches!(err, BrokerError::SpawnFailure { .. }));
        assert_eq!(supervisor.process_count(), 0);

        // The id is free for the next attempt.
        supervisor.spawn("w1", "/bin/true", &[]).unwrap();
        wait_for_status(&supervisor, "w1", ProcessStatus::Exited).await;
    }

    #[tokio::test]
    async fn test_normal_exit_observed() {
        let supervisor = fixture();
        supervisor.spawn("w1", "/bin/true", &[]).unwrap();
        wait_for_status(&supervisor, "w1", ProcessStatus::Exited).await;
        assert_eq!(supervisor.get("w1").unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let supervisor = fixture();
        supervisor.spawn("w1", "/bin/false", &[]).unwrap();
        wait_for_status(&supervisor, "w1", ProcessStatus::Failed).await;
        assert_eq!(supervisor.get("w1").unwrap().exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_restart_budget_consumed_then_terminal() {
        let supervisor = fixture();
        supervisor
            .spawn_with_restart("w1", "/bin/false", 2, Duration::ZERO, &[])
            .unwrap();

        // Two restarts, then the third failure is terminal.
        for _ in 0..300 {
            let descriptor = supervisor.get("w1").unwrap();
            if descriptor.restart_count == 2 && descriptor.status == ProcessStatus::Failed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let descriptor = supervisor.get("w1").unwrap();
        assert_eq!(descriptor.restart_count, 2);
        assert_eq!(descriptor.status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn test_kill_cancels_pending_restart() {
        let supervisor = fixture();
        supervisor
            .spawn_with_restart("w1", "/bin/true", -1, Duration::from_secs(30), &[])
            .unwrap();

        // Let the first incarnation exit into its long restart delay.
        wait_for_status(&supervisor, "w1", ProcessStatus::Exited).await;
        supervisor.kill("w1").await.unwrap();

        let descriptor = supervisor.get("w1").unwrap();
        assert_eq!(descriptor.restart_count, 0);
        assert_ne!(descriptor.status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_fleet() {
        let supervisor = fixture();
        supervisor.spawn("a", "/bin/sleep", &["30".to_string()]).unwrap();
        supervisor.spawn("b", "/bin/sleep", &["30".to_string()]).unwrap();

        supervisor.shutdown().await;
        assert_eq!(supervisor.process_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_unknown_id() {
        let supervisor = fixture();
        let err = supervisor.kill("ghost").await.unwrap_err();
        assert!(matches!(err, BrokerError::Unknown { .. }));
    }
}
