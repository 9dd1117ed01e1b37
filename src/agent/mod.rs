pub mod logtail;
pub mod report;
pub mod sessions;
pub mod system;

#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_total: f64,
    pub memory_used: f64,
    pub disk_percent: f64,
    pub disk_total: f64,
    pub disk_used: f64,
    pub upload_speed: f64,
    pub download_speed: f64,
}

// Срез сетевых счётчиков; им владеет цикл статус-отчётов,
// глобального состояния нет.
#[derive(Debug, Clone, Copy)]
pub struct NetCounters {
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub at_unix: i64,
}

impl NetCounters {
    pub fn rates_since(&self, prev: &NetCounters) -> (f64, f64) {
        let dt = self.at_unix.saturating_sub(prev.at_unix).max(1) as f64;
        let upload = self.tx_bytes_total.saturating_sub(prev.tx_bytes_total) as f64 / dt;
        let download = self.rx_bytes_total.saturating_sub(prev.rx_bytes_total) as f64 / dt;
        (upload, download)
    }
}
