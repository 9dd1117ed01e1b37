use crate::store::Store;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub server_devices_total: Gauge,
    pub server_devices_online: Gauge,
    pub server_status_samples_total: Gauge,
    pub server_error_samples_total: Gauge,
    pub server_reports_received_total: CounterVec,
    pub server_reports_unauthorized_total: CounterVec,
    pub server_sweep_runs_total: Counter,
    pub server_sweep_marked_offline_total: Counter,
    pub server_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let server_devices_total = Gauge::with_opts(opts!(
            "server_devices_total",
            "Number of registered devices"
        ))?;
        let server_devices_online = Gauge::with_opts(opts!(
            "server_devices_online",
            "Number of devices currently marked online"
        ))?;
        let server_status_samples_total = Gauge::with_opts(opts!(
            "server_status_samples_total",
            "Number of stored status samples"
        ))?;
        let server_error_samples_total = Gauge::with_opts(opts!(
            "server_error_samples_total",
            "Number of stored error samples"
        ))?;
        let server_reports_received_total = CounterVec::new(
            opts!(
                "server_reports_received_total",
                "Accepted ingestion reports by kind"
            ),
            &["kind"],
        )?;
        let server_reports_unauthorized_total = CounterVec::new(
            opts!(
                "server_reports_unauthorized_total",
                "Rejected ingestion reports with unknown API key by kind"
            ),
            &["kind"],
        )?;
        let server_sweep_runs_total = Counter::with_opts(opts!(
            "server_sweep_runs_total",
            "Completed liveness sweep runs"
        ))?;
        let server_sweep_marked_offline_total = Counter::with_opts(opts!(
            "server_sweep_marked_offline_total",
            "Devices flipped offline by the liveness sweep"
        ))?;
        let server_scrape_count_total = Counter::with_opts(opts!(
            "server_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &server_devices_total)?;
        register(&registry, &server_devices_online)?;
        register(&registry, &server_status_samples_total)?;
        register(&registry, &server_error_samples_total)?;
        register(&registry, &server_reports_received_total)?;
        register(&registry, &server_reports_unauthorized_total)?;
        register(&registry, &server_sweep_runs_total)?;
        register(&registry, &server_sweep_marked_offline_total)?;
        register(&registry, &server_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            server_devices_total,
            server_devices_online,
            server_status_samples_total,
            server_error_samples_total,
            server_reports_received_total,
            server_reports_unauthorized_total,
            server_sweep_runs_total,
            server_sweep_marked_offline_total,
            server_scrape_count_total,
        }))
    }

    pub fn update_from_store(&self, store: &Store) {
        let devices = store.list_devices();
        let online = devices.iter().filter(|d| d.is_online).count();
        self.server_devices_total.set(devices.len() as f64);
        self.server_devices_online.set(online as f64);
        self.server_status_samples_total
            .set(store.statuses().len() as f64);
        self.server_error_samples_total
            .set(store.error_count() as f64);
    }

    pub fn inc_report_received(&self, kind: &str) {
        self.server_reports_received_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_report_unauthorized(&self, kind: &str) {
        self.server_reports_unauthorized_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn observe_sweep(&self, marked_offline: usize) {
        self.server_sweep_runs_total.inc();
        self.server_sweep_marked_offline_total
            .inc_by(marked_offline as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.server_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
