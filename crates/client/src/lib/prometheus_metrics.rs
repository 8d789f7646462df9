use std::future::Future;
use std::time::Instant;

use prometheus::{
    core::{Atomic, GenericCounterVec, GenericGauge, GenericGaugeVec},
    HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
};

pub mod outcome {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
}

pub mod operations {
    pub mod consensus_client {
        pub const GET_GENESIS: &str = "get_genesis";
        pub const GET_CONFIG_SPEC: &str = "get_config_spec";
        pub const GET_BLOCK_ROOT: &str = "get_block_root";
        pub const GET_BLOCK_HEADER: &str = "get_block_header";
        pub const GET_BLOCK_DETAILS: &str = "get_block_details";
        pub const GET_BLOCK_ATTESTATIONS_AND_SYNC: &str = "get_block_attestations_and_sync";
        pub const GET_ATTESTATION_COMMITTEES: &str = "get_attestation_committees";
        pub const GET_PROPOSER_DUTIES: &str = "get_proposer_duties";
        pub const GET_SYNC_COMMITTEE: &str = "get_sync_committee";
        pub const GET_STATE_BLOCK_ROOTS: &str = "get_state_block_roots";
        pub const GET_VALIDATORS: &str = "get_validators";
        pub const GET_VALIDATOR_STATE: &str = "get_validator_state";
        pub const GET_STATE_VIEW: &str = "get_state_view";
    }

    pub mod execution_client {
        pub const CONTRACT_CALL: &str = "contract_call";
        pub const GET_EVENTS: &str = "get_events";
        pub const SUBMIT_TX: &str = "submit_tx";
    }

    pub mod ipfs {
        pub const PUBLISH: &str = "publish";
        pub const FETCH: &str = "fetch";
    }
}

pub type UIntGauge = GenericGauge<prometheus::core::AtomicU64>;
pub type UIntGaugeVec = GenericGaugeVec<prometheus::core::AtomicU64>;
pub type UIntCounterVec = GenericCounterVec<prometheus::core::AtomicU64>;

pub trait Registar {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()>;
}

/// Per-external-dependency call metrics plus the instrumented-call helper.
#[derive(Clone)]
pub struct Service {
    pub call_count: UIntCounterVec,
    pub execution_time_seconds: HistogramVec,
    pub status: UIntCounterVec,
}

impl Registar for Service {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.call_count.clone()))?;
        registry.register(Box::new(self.execution_time_seconds.clone()))?;
        registry.register(Box::new(self.status.clone()))?;
        Ok(())
    }
}

impl Service {
    fn new(namespace: &str, component: &str) -> Self {
        Self {
            call_count: counter_vec(
                namespace,
                &format!("external__{component}__call_count"),
                "Total call count",
                &["operation"],
            ),
            execution_time_seconds: histogram_vec(
                namespace,
                &format!("{component}_execution_time_seconds"),
                "Execution time in seconds",
                &["operation"],
            ),
            status: counter_vec(
                namespace,
                &format!("external__{component}__status"),
                "Call outcomes",
                &["operation", "status"],
            ),
        }
    }

    pub async fn run_with_metrics_and_logs_async<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, E>
    where
        E: std::fmt::Debug,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_count.with_label_values(&[operation]).inc();
        let started = Instant::now();
        let result = f().await;
        self.execution_time_seconds
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => self.status.with_label_values(&[operation, outcome::SUCCESS]).inc(),
            Err(error) => {
                tracing::debug!(operation, ?error, "External call failed");
                self.status.with_label_values(&[operation, outcome::ERROR]).inc();
            }
        }
        result
    }
}

/// Business-level gauges the oracle sets while driving a frame.
pub struct Frame {
    pub current_ref_slot: UIntGauge,
    pub deadline_slot: UIntGauge,
    pub last_report_ref_slot: UIntGauge,
    pub member_info: UIntGaugeVec,
    pub contract_on_pause: UIntGaugeVec,
}

impl Registar for Frame {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.current_ref_slot.clone()))?;
        registry.register(Box::new(self.deadline_slot.clone()))?;
        registry.register(Box::new(self.last_report_ref_slot.clone()))?;
        registry.register(Box::new(self.member_info.clone()))?;
        registry.register(Box::new(self.contract_on_pause.clone()))?;
        Ok(())
    }
}

pub struct Collector {
    pub min_stored_epoch: UIntGauge,
    pub max_stored_epoch: UIntGauge,
    pub processed_epochs: UIntGauge,
}

impl Registar for Collector {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.min_stored_epoch.clone()))?;
        registry.register(Box::new(self.max_stored_epoch.clone()))?;
        registry.register(Box::new(self.processed_epochs.clone()))?;
        Ok(())
    }
}

pub struct Metadata {
    pub genesis_time: IntGauge,
    pub oracle_slot_number: UIntGaugeVec,
    pub oracle_block_number: UIntGaugeVec,
}

impl Registar for Metadata {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        registry.register(Box::new(self.genesis_time.clone()))?;
        registry.register(Box::new(self.oracle_slot_number.clone()))?;
        registry.register(Box::new(self.oracle_block_number.clone()))?;
        Ok(())
    }
}

pub struct Services {
    pub consensus_client: Service,
    pub execution_client: Service,
    pub ipfs: Service,
}

impl Registar for Services {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        self.consensus_client.register_on(registry)?;
        self.execution_client.register_on(registry)?;
        self.ipfs.register_on(registry)?;
        Ok(())
    }
}

pub struct Metrics {
    pub metadata: Metadata,
    pub frame: Frame,
    pub collector: Collector,
    pub services: Services,
}

impl Registar for Metrics {
    fn register_on(&self, registry: &Registry) -> anyhow::Result<()> {
        self.metadata.register_on(registry)?;
        self.frame.register_on(registry)?;
        self.collector.register_on(registry)?;
        self.services.register_on(registry)?;
        Ok(())
    }
}

fn gauge<TVal: Atomic>(namespace: &str, name: &str, help: &str) -> GenericGauge<TVal> {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    GenericGauge::with_opts(opts).unwrap()
}

fn gauge_vec<TVal: Atomic>(namespace: &str, name: &str, help: &str, labels: &[&str]) -> GenericGaugeVec<TVal> {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    GenericGaugeVec::new(opts, labels).unwrap()
}

fn int_gauge(namespace: &str, name: &str, help: &str) -> IntGauge {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    IntGauge::with_opts(opts).unwrap()
}

fn counter_vec<TVal: Atomic>(namespace: &str, name: &str, help: &str, labels: &[&str]) -> GenericCounterVec<TVal> {
    let opts = Opts::new(name, help).namespace(namespace.to_string());
    GenericCounterVec::new(opts, labels).unwrap()
}

fn histogram_vec(namespace: &str, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let opts = HistogramOpts::new(name, help).namespace(namespace.to_string());
    HistogramVec::new(opts, labels).unwrap()
}

impl Metrics {
    pub fn new(namespace: &str) -> Self {
        Metrics {
            metadata: Metadata {
                genesis_time: int_gauge(namespace, "metadata__genesis_time", "Genesis time of the chain"),
                oracle_slot_number: gauge_vec(
                    namespace,
                    "metadata__oracle_slot_number",
                    "Latest observed slot number",
                    &["state"],
                ),
                oracle_block_number: gauge_vec(
                    namespace,
                    "metadata__oracle_block_number",
                    "Latest observed block number",
                    &["state"],
                ),
            },
            frame: Frame {
                current_ref_slot: gauge(namespace, "frame__current_ref_slot", "Current frame reference slot"),
                deadline_slot: gauge(namespace, "frame__deadline_slot", "Current frame deadline slot"),
                last_report_ref_slot: gauge(
                    namespace,
                    "frame__member_last_report_ref_slot",
                    "Last reference slot the member reported for",
                ),
                member_info: gauge_vec(
                    namespace,
                    "frame__member_info",
                    "Membership flags of the configured account",
                    &["flag"],
                ),
                contract_on_pause: gauge_vec(
                    namespace,
                    "frame__contract_on_pause",
                    "Whether the report contract is paused",
                    &["contract"],
                ),
            },
            collector: Collector {
                min_stored_epoch: gauge(namespace, "collector__min_stored_epoch", "Oldest epoch in the duty store"),
                max_stored_epoch: gauge(namespace, "collector__max_stored_epoch", "Newest epoch in the duty store"),
                processed_epochs: gauge(
                    namespace,
                    "collector__processed_epochs",
                    "Epochs processed since startup",
                ),
            },
            services: Services {
                consensus_client: Service::new(namespace, "consensus_client"),
                execution_client: Service::new(namespace, "execution_client"),
                ipfs: Service::new(namespace, "ipfs"),
            },
        }
    }
}
