//! The broker facade: subsystem ownership and method dispatch.

// Layer 1: Standard library imports
use std::sync::{Arc, Weak};
use std::time::Duration;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

// Layer 3: Internal module imports
use super::config::BrokerConfig;
use crate::error::BrokerError;
use crate::optimizer::{AnalysisOptimizer, BrokerHandler, Optimizer, OptimizerMetrics};
use crate::permits::{PermitManager, PermitStats, QuotaNotifier};
use crate::router::{CorrelationOutcome, CorrelationTable, RouteOutcome, Router};
use crate::supervisor::{ProcessDescriptor, Supervisor};
use procbus_wire::rpc::{
    self, method, MessageCountReply, MessageStatsReply, PermitGrantReply, PermitParams,
    PermitReleaseReply, QuotaUpdate, SpawnParams, SpawnReply,
};
use procbus_wire::{KernelMetrics, Message, MessageKind, BROKER_TARGET};

/// The assembled broker core.
///
/// Owns the supervisor, router, correlation table, optimizer, permit
/// manager, and statistics, and implements the ten broker-addressed
/// methods. Cheap to clone.
///
/// # Example
///
/// ```rust,no_run
/// use procbus_broker::{Broker, BrokerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), procbus_broker::BrokerError> {
/// let broker = Broker::start(BrokerConfig::default())?;
/// let grant = broker.request_permits("etl-1", 4)?;
/// assert!(grant.granted > 0);
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    router: Arc<Router>,
    correlations: Arc<CorrelationTable>,
    optimizer: Arc<Optimizer>,
    supervisor: Supervisor,
    permits: Arc<PermitManager>,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Assemble and start the broker core on the current runtime.
    pub fn start(config: BrokerConfig) -> Result<Self, BrokerError> {
        config
            .validate()
            .map_err(|reason| BrokerError::InvalidArgument { reason })?;

        let router = Arc::new(Router::new());
        let optimizer = Arc::new(Optimizer::new(config.optimizer.clone(), Arc::clone(&router))?);
        let permits = Arc::new(PermitManager::new(config.total_permits));
        optimizer.set_permit_manager(Arc::clone(&permits));

        let supervisor = Supervisor::new(
            config.supervisor_config(),
            Arc::clone(&router),
            Arc::clone(&optimizer),
        );

        let correlations = Arc::new(CorrelationTable::new());
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(BrokerInner {
            config,
            router,
            correlations: Arc::clone(&correlations),
            optimizer: Arc::clone(&optimizer),
            supervisor,
            permits,
            shutdown,
        });

        optimizer.set_broker_handler(Arc::new(HandlerBridge {
            inner: Arc::downgrade(&inner),
        }));
        optimizer.start()?;

        correlations.spawn_sweeper(inner.config.sweep_interval, inner.shutdown.subscribe());

        if let Some(policy) = inner.config.conflict_policy {
            optimizer.set_analysis_optimizer(Arc::new(AnalysisOptimizer::new(policy)));
            optimizer.start_conflict_monitor();
        }

        optimizer.start_revocation_monitor(
            inner.config.revocation,
            QuotaEventNotifier {
                inner: Arc::downgrade(&inner),
            },
        )?;

        info!(
            permits = inner.config.total_permits,
            encoding = %inner.config.encoding,
            "broker started"
        );
        Ok(Self { inner })
    }

    /// Spawn a plain child (RPCSpawn).
    pub fn spawn(
        &self,
        id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.inner.supervisor.spawn(id, command, args)
    }

    /// Spawn an RPC child (RPCSpawnRPC).
    pub fn spawn_rpc(
        &self,
        id: &str,
        command: &str,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.inner.supervisor.spawn_rpc(id, command, args)
    }

    /// Spawn a plain child with a restart budget (RPCSpawnWithRestart).
    pub fn spawn_with_restart(
        &self,
        id: &str,
        command: &str,
        max_restarts: i32,
        delay: Duration,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.inner
            .supervisor
            .spawn_with_restart(id, command, max_restarts, delay, args)
    }

    /// Spawn an RPC child with a restart budget (RPCSpawnRPCWithRestart).
    pub fn spawn_rpc_with_restart(
        &self,
        id: &str,
        command: &str,
        max_restarts: i32,
        delay: Duration,
        args: &[String],
    ) -> Result<ProcessDescriptor, BrokerError> {
        self.inner
            .supervisor
            .spawn_rpc_with_restart(id, command, max_restarts, delay, args)
    }

    /// Kill a child, canceling any pending restart.
    pub async fn kill(&self, id: &str) -> Result<(), BrokerError> {
        self.inner.supervisor.kill(id).await
    }

    /// Snapshot of every supervised child.
    pub fn list_processes(&self) -> Vec<ProcessDescriptor> {
        self.inner.supervisor.list()
    }

    /// Offer a message into the pipeline, as an ingress reader would.
    pub async fn offer(&self, msg: Message) -> bool {
        self.inner.optimizer.offer(msg).await
    }

    /// Request permits (RPCRequestPermits).
    pub fn request_permits(
        &self,
        provider_id: &str,
        count: u64,
    ) -> Result<crate::permits::GrantOutcome, BrokerError> {
        self.inner.permits.request(provider_id, count)
    }

    /// Release permits (RPCReleasePermits).
    pub fn release_permits(
        &self,
        provider_id: &str,
        count: u64,
    ) -> Result<crate::permits::ReleaseOutcome, BrokerError> {
        self.inner.permits.release(provider_id, count)
    }

    /// Permit pool snapshot.
    pub fn permit_stats(&self) -> PermitStats {
        self.inner.permits.stats()
    }

    /// Kernel metrics snapshot (RPCGetKernelMetrics).
    pub fn kernel_metrics(&self) -> KernelMetrics {
        self.inner.kernel_metrics()
    }

    /// Message statistics snapshot (RPCGetMessageStats).
    pub fn message_stats(&self) -> MessageStatsReply {
        self.inner.optimizer.stats().snapshot()
    }

    /// Total routed message count (RPCGetMessageCount).
    pub fn message_count(&self) -> u64 {
        self.inner.optimizer.stats().message_count()
    }

    /// Optimizer pipeline metrics.
    pub fn optimizer_metrics(&self) -> OptimizerMetrics {
        self.inner.optimizer.metrics()
    }

    /// The routing table, for registering non-child targets.
    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Send a broker-originated request to `target` and await its
    /// correlated response.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Timeout`] after the configured request timeout,
    /// [`BrokerError::Canceled`] at shutdown, and routing errors when the
    /// target is unreachable.
    pub async fn request(&self, target: &str, payload: Value) -> Result<Message, BrokerError> {
        let timeout = self.inner.config.request_timeout;
        let cid = self.inner.correlations.next_correlation_id();
        let deadline = tokio::time::Instant::now() + timeout;
        let sink = self
            .inner
            .correlations
            .register_pending(cid.as_str(), BROKER_TARGET, deadline);

        let msg = Message::request(cid.clone(), BROKER_TARGET, target, payload);
        match self.inner.router.route(msg, BROKER_TARGET) {
            RouteOutcome::Delivered => {}
            RouteOutcome::NoRoute => {
                self.inner.correlations.cancel(&cid);
                return Err(BrokerError::NoRoute {
                    target: target.to_string(),
                });
            }
            RouteOutcome::Full => {
                self.inner.correlations.cancel(&cid);
                return Err(BrokerError::MailboxFull {
                    target: target.to_string(),
                });
            }
        }

        match sink.await {
            Ok(CorrelationOutcome::Response(response)) => Ok(response),
            Ok(CorrelationOutcome::Timeout) => Err(BrokerError::Timeout { timeout }),
            Ok(CorrelationOutcome::Canceled) | Err(_) => Err(BrokerError::Canceled),
        }
    }

    /// Stop everything: pipeline, children, monitors, pending requests.
    pub async fn shutdown(&self) {
        info!("broker shutting down");
        let _ = self.inner.shutdown.send(true);
        self.inner.optimizer.stop().await;
        self.inner.supervisor.shutdown().await;
        self.inner.correlations.cancel_all();
        info!("broker shut down");
    }
}

impl BrokerInner {
    fn kernel_metrics(&self) -> KernelMetrics {
        let stats = self.permits.stats();
        self.optimizer.collector().kernel_metrics(
            self.optimizer.active_workers(),
            stats.total,
            stats.allocated,
            stats.available,
        )
    }

    fn next_event_id(&self) -> String {
        format!("evt-{}", Uuid::new_v4().simple())
    }

    /// Dispatch one broker-addressed request through the method table.
    async fn dispatch_request(&self, msg: &Message) -> Message {
        let Some(method_name) = rpc::method_of(&msg.payload) else {
            return Message::error_to(msg, BROKER_TARGET, "Unknown: payload carries no method");
        };

        let result: Result<Value, BrokerError> = match method_name {
            method::SPAWN => self.handle_spawn(msg, false, false),
            method::SPAWN_RPC => self.handle_spawn(msg, true, false),
            method::SPAWN_WITH_RESTART => self.handle_spawn(msg, false, true),
            method::SPAWN_RPC_WITH_RESTART => self.handle_spawn(msg, true, true),
            method::GET_MESSAGE_STATS => to_reply(self.optimizer.stats().snapshot()),
            method::GET_MESSAGE_COUNT => to_reply(MessageCountReply {
                count: self.optimizer.stats().message_count(),
            }),
            method::REQUEST_PERMITS => self.handle_request_permits(msg),
            method::RELEASE_PERMITS => self.handle_release_permits(msg),
            method::GET_KERNEL_METRICS => to_reply(self.kernel_metrics()),
            method::ON_QUOTA_UPDATE => Err(BrokerError::InvalidArgument {
                reason: "RPCOnQuotaUpdate is broker-originated".to_string(),
            }),
            other => Err(BrokerError::Unknown {
                reason: format!("unknown method: {other}"),
            }),
        };

        match result {
            Ok(payload) => Message::response_to(msg, BROKER_TARGET, payload),
            Err(err) => {
                debug!(method = method_name, error = %err, "method dispatch failed");
                Message::error_to(msg, BROKER_TARGET, format!("{}: {err}", err.code()))
            }
        }
    }

    fn handle_spawn(&self, msg: &Message, rpc: bool, restart: bool) -> Result<Value, BrokerError> {
        let params: SpawnParams = parse_params(&msg.payload)?;
        if params.id.is_empty() {
            return Err(BrokerError::MissingId);
        }

        let descriptor = if restart {
            let max_restarts = params.max_restarts.unwrap_or(0);
            let delay = Duration::from_millis(params.restart_delay_ms.unwrap_or(0));
            if rpc {
                self.supervisor.spawn_rpc_with_restart(
                    &params.id,
                    &params.command,
                    max_restarts,
                    delay,
                    &params.args,
                )?
            } else {
                self.supervisor.spawn_with_restart(
                    &params.id,
                    &params.command,
                    max_restarts,
                    delay,
                    &params.args,
                )?
            }
        } else if rpc {
            self.supervisor
                .spawn_rpc(&params.id, &params.command, &params.args)?
        } else {
            self.supervisor
                .spawn(&params.id, &params.command, &params.args)?
        };

        to_reply(SpawnReply {
            id: descriptor.id,
            pid: descriptor.pid,
            status: descriptor.status.as_str().to_string(),
        })
    }

    fn handle_request_permits(&self, msg: &Message) -> Result<Value, BrokerError> {
        let params: PermitParams = parse_params(&msg.payload)?;
        let grant = self.permits.request(&params.provider_id, params.permit_count)?;
        to_reply(PermitGrantReply {
            granted: grant.granted,
            available: grant.available,
            provider_id: params.provider_id,
        })
    }

    fn handle_release_permits(&self, msg: &Message) -> Result<Value, BrokerError> {
        let params: PermitParams = parse_params(&msg.payload)?;
        let release = self
            .permits
            .release(&params.provider_id, params.permit_count)?;
        to_reply(PermitReleaseReply {
            success: release.released > 0,
            available: release.available,
            provider_id: params.provider_id,
        })
    }
}

/// Weak bridge from the optimizer workers into the facade, so the
/// optimizer's handler reference does not keep the broker alive.
struct HandlerBridge {
    inner: Weak<BrokerInner>,
}

#[async_trait]
impl BrokerHandler for HandlerBridge {
    async fn process_broker_message(&self, msg: Message) -> Option<Message> {
        let inner = self.inner.upgrade()?;

        match msg.kind {
            MessageKind::Request => Some(inner.dispatch_request(&msg).await),
            MessageKind::Response | MessageKind::Error => {
                match msg.correlation_id.clone() {
                    Some(cid) => {
                        let result = inner.correlations.complete(&cid, msg);
                        debug!(correlation_id = %cid, ?result, "completion processed");
                    }
                    None => {
                        warn!(id = %msg.id, kind = %msg.kind, "uncorrelated completion dropped");
                    }
                }
                None
            }
            MessageKind::Event => {
                debug!(id = %msg.id, source = %msg.source, "broker event observed");
                None
            }
        }
    }
}

/// Quota-update broadcast through the router, one event per provider.
struct QuotaEventNotifier {
    inner: Weak<BrokerInner>,
}

#[async_trait]
impl QuotaNotifier for QuotaEventNotifier {
    async fn notify_quota_update(
        &self,
        provider_id: &str,
        update: QuotaUpdate,
    ) -> Result<(), BrokerError> {
        let inner = self.inner.upgrade().ok_or(BrokerError::Canceled)?;

        let payload = rpc::call(method::ON_QUOTA_UPDATE, &update)?;
        let event = Message::event(inner.next_event_id(), BROKER_TARGET, provider_id, payload);
        match inner.router.route(event, BROKER_TARGET) {
            RouteOutcome::Delivered => Ok(()),
            RouteOutcome::NoRoute => Err(BrokerError::NoRoute {
                target: provider_id.to_string(),
            }),
            RouteOutcome::Full => Err(BrokerError::MailboxFull {
                target: provider_id.to_string(),
            }),
        }
    }
}

fn parse_params<T: DeserializeOwned>(payload: &Value) -> Result<T, BrokerError> {
    serde_json::from_value(payload.clone()).map_err(|e| BrokerError::InvalidArgument {
        reason: format!("malformed parameters: {e}"),
    })
}

fn to_reply<T: Serialize>(reply: T) -> Result<Value, BrokerError> {
    serde_json::to_value(reply).map_err(|e| BrokerError::Unknown {
        reason: format!("reply serialization failed: {e}"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerConfig;
    use crate::router::mailbox;

    fn small_config() -> BrokerConfig {
        BrokerConfig::builder()
            .with_total_permits(10)
            .with_optimizer(
                OptimizerConfig::builder()
                    .with_buffer_cap(64)
                    .with_num_workers(1)
                    .with_batch_size(1)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_permit_rpc_round_trip() {
        let broker = Broker::start(small_config()).unwrap();
        let (sender, mut mb) = mailbox("p", 8);
        broker.router().register_route("p", sender).unwrap();

        let request = Message::request(
            "r1",
            "p",
            BROKER_TARGET,
            rpc::call(
                method::REQUEST_PERMITS,
                PermitParams {
                    provider_id: "p".into(),
                    permit_count: 7,
                },
            )
            .unwrap(),
        );
        assert!(broker.offer(request).await);

        let response = mb.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.correlation_id.as_deref(), Some("r1"));
        let reply: PermitGrantReply = serde_json::from_value(response.payload).unwrap();
        assert_eq!(reply.granted, 7);
        assert_eq!(reply.available, 3);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_method_produces_error_message() {
        let broker = Broker::start(small_config()).unwrap();
        let (sender, mut mb) = mailbox("w1", 8);
        broker.router().register_route("w1", sender).unwrap();

        let request = Message::request(
            "r1",
            "w1",
            BROKER_TARGET,
            serde_json::json!({"method": "RPCNoSuchThing"}),
        );
        assert!(broker.offer(request).await);

        let response = mb.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::Error);
        assert!(response.error.unwrap().contains("Unknown"));

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_message_count_method() {
        let broker = Broker::start(small_config()).unwrap();
        let (sender, mut mb) = mailbox("w1", 8);
        broker.router().register_route("w1", sender).unwrap();

        let request = Message::request(
            "r1",
            "w1",
            BROKER_TARGET,
            rpc::call(method::GET_MESSAGE_COUNT, ()).unwrap(),
        );
        assert!(broker.offer(request).await);

        let response = mb.recv().await.unwrap();
        let reply: MessageCountReply = serde_json::from_value(response.payload).unwrap();
        // The counted message is the request itself.
        assert_eq!(reply.count, 1);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_kernel_metrics_method() {
        let broker = Broker::start(small_config()).unwrap();
        broker.request_permits("p", 4).unwrap();

        let metrics = broker.kernel_metrics();
        assert_eq!(metrics.total_permits, 10);
        assert_eq!(metrics.allocated_permits, 4);
        assert_eq!(metrics.available_permits, 6);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_to_missing_target_is_no_route() {
        let broker = Broker::start(small_config()).unwrap();
        let err = broker.request("ghost", Value::Null).await.unwrap_err();
        assert!(matches!(err, BrokerError::NoRoute { .. }));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_payload_without_method_is_error_message() {
        let broker = Broker::start(small_config()).unwrap();
        let (sender, mut mb) = mailbox("w1", 8);
        broker.router().register_route("w1", sender).unwrap();

        let request = Message::request("r1", "w1", BROKER_TARGET, serde_json::json!({}));
        assert!(broker.offer(request).await);

        let response = mb.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::Error);

        broker.shutdown().await;
    }
}
