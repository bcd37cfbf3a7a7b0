//! Service-conflict detection and throttling.
//!
//! Optional sub-module attached to the optimizer. Registered services are
//! classified, their in-flight request counts tracked, and a periodic
//! monitor throttles the contending classes whenever frontend, ETL, and
//! analysis work collide.

// Layer 1: Standard library imports
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// How often the monitor re-evaluates conflicts.
pub const CONFLICT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Frontend in-flight count that contends with any analysis work.
const FRONTEND_CONFLICT_THRESHOLD: u64 = 5;

/// ETL in-flight count that contends with any analysis work.
const ETL_CONFLICT_THRESHOLD: u64 = 3;

/// Moderate activity levels; all three classes at or above these levels
/// at once is a three-way conflict.
const MODERATE_FRONTEND: u64 = 3;
const MODERATE_ETL: u64 = 2;
const MODERATE_ANALYSIS: u64 = 2;

/// Classification of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    /// Long-running analysis work
    Analysis,
    /// Interactive frontend traffic
    Frontend,
    /// Extract-transform-load pipelines
    Etl,
    /// The broker's own housekeeping
    Broker,
    /// Anything else
    Other,
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analysis => "analysis",
            Self::Frontend => "frontend",
            Self::Etl => "etl",
            Self::Broker => "broker",
            Self::Other => "other",
        };
        write!(f, "{name}")
    }
}

/// Scheduling priority of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Throttle policy applied when classes collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Interactive traffic wins; analysis is throttled to 1 or 0
    #[default]
    FrontendFirst,
    /// Every class gets a third of its base limit
    FairShare,
    /// 50/30/20 split of the combined base limits
    Weighted,
}

impl FromStr for ResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "frontend_first" => Ok(Self::FrontendFirst),
            "fair_share" => Ok(Self::FairShare),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!("unknown resolution policy: {other}")),
        }
    }
}

/// Detected contention between service classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Heavy frontend traffic while analysis runs
    FrontendAnalysis,
    /// Heavy ETL traffic while analysis runs
    EtlAnalysis,
    /// All three classes busy at moderate levels
    AllServices,
}

impl Conflict {
    /// Stable conflict name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrontendAnalysis => "frontend_analysis_conflict",
            Self::EtlAnalysis => "etl_analysis_conflict",
            Self::AllServices => "all_services_conflict",
        }
    }
}

/// Concurrent-request limits per contended class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimits {
    /// Frontend in-flight ceiling
    pub frontend: u64,
    /// ETL in-flight ceiling
    pub etl: u64,
    /// Analysis in-flight ceiling
    pub analysis: u64,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            frontend: 10,
            etl: 6,
            analysis: 4,
        }
    }
}

#[derive(Debug)]
struct ServiceEntry {
    class: ServiceClass,
    priority: ServicePriority,
    active: AtomicU64,
}

/// Classifies registered services and throttles contending classes.
///
/// # Example
///
/// ```rust
/// use procbus_broker::optimizer::conflict::{
///     AnalysisOptimizer, Conflict, ResolutionPolicy, ServiceClass, ServicePriority,
/// };
///
/// let optimizer = AnalysisOptimizer::new(ResolutionPolicy::FrontendFirst);
/// optimizer.register_service("web", ServiceClass::Frontend, ServicePriority::High);
/// optimizer.register_service("ml", ServiceClass::Analysis, ServicePriority::Low);
///
/// for _ in 0..5 {
///     optimizer.begin_request("web");
/// }
/// optimizer.begin_request("ml");
///
/// assert_eq!(optimizer.detect(), Some(Conflict::FrontendAnalysis));
/// ```
#[derive(Debug)]
pub struct AnalysisOptimizer {
    services: DashMap<String, ServiceEntry>,
    policy: ResolutionPolicy,
    base: ServiceLimits,
    limits: RwLock<ServiceLimits>,
    conflicts_detected: AtomicU64,
}

impl AnalysisOptimizer {
    /// Create a resolver with default base limits.
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self::with_limits(policy, ServiceLimits::default())
    }

    /// Create a resolver with explicit base limits.
    pub fn with_limits(policy: ResolutionPolicy, base: ServiceLimits) -> Self {
        Self {
            services: DashMap::new(),
            policy,
            base,
            limits: RwLock::new(base),
            conflicts_detected: AtomicU64::new(0),
        }
    }

    /// Register or reclassify a service.
    pub fn register_service(
        &self,
        id: impl Into<String>,
        class: ServiceClass,
        priority: ServicePriority,
    ) {
        let id = id.into();
        debug!(service = %id, class = %class, "service registered");
        self.services.insert(
            id,
            ServiceEntry {
                class,
                priority,
                active: AtomicU64::new(0),
            },
        );
    }

    /// Remove a service from conflict tracking.
    pub fn unregister_service(&self, id: &str) -> bool {
        self.services.remove(id).is_some()
    }

    /// Note one request starting on `id`. Unknown services are ignored.
    pub fn begin_request(&self, id: &str) {
        if let Some(entry) = self.services.get(id) {
            entry.active.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Note one request finishing on `id`.
    pub fn end_request(&self, id: &str) {
        if let Some(entry) = self.services.get(id) {
            let _ = entry
                .active
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// In-flight requests summed over one class.
    pub fn active_by_class(&self, class: ServiceClass) -> u64 {
        self.services
            .iter()
            .filter(|e| e.value().class == class)
            .map(|e| e.value().active.load(Ordering::Relaxed))
            .sum()
    }

    /// Priority of a registered service.
    pub fn priority_of(&self, id: &str) -> Option<ServicePriority> {
        self.services.get(id).map(|e| e.value().priority)
    }

    /// Detect the current conflict, if any.
    ///
    /// The three-way conflict takes precedence; the pairwise conflicts are
    /// checked frontend-first.
    pub fn detect(&self) -> Option<Conflict> {
        let frontend = self.active_by_class(ServiceClass::Frontend);
        let etl = self.active_by_class(ServiceClass::Etl);
        let analysis = self.active_by_class(ServiceClass::Analysis);

        if frontend >= MODERATE_FRONTEND && etl >= MODERATE_ETL && analysis >= MODERATE_ANALYSIS {
            return Some(Conflict::AllServices);
        }
        if frontend >= FRONTEND_CONFLICT_THRESHOLD && analysis > 0 {
            return Some(Conflict::FrontendAnalysis);
        }
        if etl >= ETL_CONFLICT_THRESHOLD && analysis > 0 {
            return Some(Conflict::EtlAnalysis);
        }
        None
    }

    /// Throttle limits for `conflict` under the configured policy.
    fn throttled_limits(&self, _conflict: Conflict) -> ServiceLimits {
        match self.policy {
            ResolutionPolicy::FrontendFirst => {
                let frontend = self.active_by_class(ServiceClass::Frontend);
                ServiceLimits {
                    analysis: if frontend >= 2 * FRONTEND_CONFLICT_THRESHOLD {
                        0
                    } else {
                        1
                    },
                    ..self.base
                }
            }
            ResolutionPolicy::FairShare => ServiceLimits {
                frontend: (self.base.frontend / 3).max(1),
                etl: (self.base.etl / 3).max(1),
                analysis: (self.base.analysis / 3).max(1),
            },
            ResolutionPolicy::Weighted => {
                let pool = self.base.frontend + self.base.etl + self.base.analysis;
                ServiceLimits {
                    frontend: pool * 50 / 100,
                    etl: pool * 30 / 100,
                    analysis: pool * 20 / 100,
                }
            }
        }
    }

    /// One monitor pass: detect, throttle or restore, report the conflict.
    pub fn evaluate(&self) -> Option<Conflict> {
        match self.detect() {
            Some(conflict) => {
                self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                let limits = self.throttled_limits(conflict);
                info!(conflict = conflict.as_str(), ?limits, "service conflict throttled");
                *self.limits.write() = limits;
                Some(conflict)
            }
            None => {
                *self.limits.write() = self.base;
                None
            }
        }
    }

    /// Limits currently in effect.
    pub fn current_limits(&self) -> ServiceLimits {
        *self.limits.read()
    }

    /// Conflicts observed since startup. Monotonic.
    pub fn conflicts_detected(&self) -> u64 {
        self.conflicts_detected.load(Ordering::Relaxed)
    }

    /// Run the periodic monitor until `shutdown` observes `true`.
    pub fn spawn_monitor(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let resolver = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONFLICT_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        resolver.evaluate();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
