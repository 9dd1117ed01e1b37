use crate::store::{Device, StatusSample, Store};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct FleetStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub today_tokens: u64,
    pub yesterday_tokens: u64,
    pub total_tokens: u64,
    pub total_errors: usize,
    pub devices: Vec<DeviceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: u64,
    pub name: String,
    pub device_type: String,
    pub public_ip: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub runtime_status: Option<String>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_total: f64,
    pub memory_used: f64,
    pub disk_percent: f64,
    pub disk_total: f64,
    pub disk_used: f64,
    pub upload_speed: f64,
    pub download_speed: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub time: DateTime<Utc>,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

pub fn fleet_stats(store: &Store, now: DateTime<Utc>) -> FleetStats {
    let devices = store.list_devices();
    let total_devices = devices.len();
    let online_devices = devices.iter().filter(|d| d.is_online).count();

    let all = store.statuses();
    let total_tokens = token_watermark(all);

    let today_start = start_of_utc_day(now);
    let yesterday_start = today_start - Duration::days(1);

    let mut today: Vec<&StatusSample> = all
        .iter()
        .filter(|s| s.timestamp >= today_start)
        .collect();
    today.sort_by_key(|s| s.timestamp);

    // Единственный замер за сегодня даёт своё значение как есть,
    // за вчера же ноль; расхождение сохранено намеренно.
    let today_tokens = if today.len() == 1 {
        today[0].total_tokens
    } else {
        window_token_delta(&today)
    };

    let mut yesterday: Vec<&StatusSample> = all
        .iter()
        .filter(|s| s.timestamp >= yesterday_start && s.timestamp < today_start)
        .collect();
    yesterday.sort_by_key(|s| s.timestamp);
    let yesterday_tokens = window_token_delta(&yesterday);

    let summaries = devices
        .iter()
        .map(|device| device_summary(device, all))
        .collect();

    FleetStats {
        total_devices,
        online_devices,
        offline_devices: total_devices - online_devices,
        today_tokens,
        yesterday_tokens,
        total_tokens,
        total_errors: store.error_count(),
        devices: summaries,
    }
}

// Максимум total_tokens по отчётам всех устройств разом: независимые
// счётчики устройств смешиваются в одну «накопительную» величину.
pub fn token_watermark(samples: &[StatusSample]) -> u64 {
    samples.iter().map(|s| s.total_tokens).max().unwrap_or(0)
}

fn window_token_delta(window: &[&StatusSample]) -> u64 {
    if window.len() < 2 {
        return 0;
    }
    let first = window[0].total_tokens as i64;
    let last = window[window.len() - 1].total_tokens as i64;
    (last - first).max(0) as u64
}

fn device_summary(device: &Device, all: &[StatusSample]) -> DeviceSummary {
    // Последний по порядку поступления отчёт устройства в уже
    // загруженном наборе.
    let latest = all.iter().rev().find(|s| s.device_id == device.id);

    DeviceSummary {
        id: device.id,
        name: device.name.clone(),
        device_type: device.device_type.clone(),
        public_ip: device.public_ip.clone(),
        is_online: device.is_online,
        last_seen: device.last_seen,
        runtime_status: latest.and_then(|s| s.runtime_status.clone()),
        cpu_percent: latest.map_or(0.0, |s| s.cpu_percent),
        memory_percent: latest.map_or(0.0, |s| s.memory_percent),
        memory_total: latest.map_or(0.0, |s| s.memory_total),
        memory_used: latest.map_or(0.0, |s| s.memory_used),
        disk_percent: latest.map_or(0.0, |s| s.disk_percent),
        disk_total: latest.map_or(0.0, |s| s.disk_total),
        disk_used: latest.map_or(0.0, |s| s.disk_used),
        upload_speed: latest.map_or(0.0, |s| s.upload_speed),
        download_speed: latest.map_or(0.0, |s| s.download_speed),
        total_tokens: latest.map_or(0, |s| s.total_tokens),
    }
}

pub fn trends(store: &Store, hours: i64, now: DateTime<Utc>) -> Vec<TrendPoint> {
    let since = now - Duration::hours(hours);

    #[derive(Default)]
    struct Bucket {
        cpu_sum: f64,
        cpu_n: u32,
        memory_sum: f64,
        memory_n: u32,
        disk_sum: f64,
        disk_n: u32,
    }

    let mut buckets: BTreeMap<DateTime<Utc>, Bucket> = BTreeMap::new();
    for sample in store.statuses_since(since) {
        let bucket = buckets
            .entry(bucket_floor_5min(sample.timestamp))
            .or_default();
        // Нулевое значение неотличимо от отсутствующего и в среднее
        // своей метрики не входит.
        if sample.cpu_percent != 0.0 {
            bucket.cpu_sum += sample.cpu_percent;
            bucket.cpu_n += 1;
        }
        if sample.memory_percent != 0.0 {
            bucket.memory_sum += sample.memory_percent;
            bucket.memory_n += 1;
        }
        if sample.disk_percent != 0.0 {
            bucket.disk_sum += sample.disk_percent;
            bucket.disk_n += 1;
        }
    }

    buckets
        .into_iter()
        .map(|(time, b)| TrendPoint {
            time,
            cpu: mean(b.cpu_sum, b.cpu_n),
            memory: mean(b.memory_sum, b.memory_n),
            disk: mean(b.disk_sum, b.disk_n),
        })
        .collect()
}

fn mean(sum: f64, n: u32) -> f64 {
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub fn bucket_floor_5min(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(ts.minute() / 5 * 5)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}
