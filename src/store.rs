use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

pub const MESSAGE_MAX_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("устройство с таким API-ключом уже зарегистрировано")]
    DuplicateApiKey,
    #[error("устройство {0} не найдено")]
    DeviceNotFound(u64),
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: u64,
    pub name: String,
    pub device_type: String,
    pub api_key: String,
    pub public_ip: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub name: String,
    pub device_type: String,
    pub api_key: Option<String>,
    pub public_ip: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub public_ip: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSample {
    pub device_id: u64,
    pub timestamp: DateTime<Utc>,
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
    pub context_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub device_id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub source: Option<String>,
    pub stack_trace: Option<String>,
}

#[derive(Debug, Default)]
pub struct Store {
    devices: HashMap<u64, Device>,
    api_key_index: HashMap<String, u64>,
    next_device_id: u64,
    statuses: Vec<StatusSample>,
    errors: Vec<ErrorSample>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            next_device_id: 1,
            ..Self::default()
        }
    }

    pub fn register(&mut self, new: NewDevice, now: DateTime<Utc>) -> Result<Device, StoreError> {
        let api_key = match new.api_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => key,
            None => generate_api_key(),
        };
        if self.api_key_index.contains_key(&api_key) {
            return Err(StoreError::DuplicateApiKey);
        }

        let id = self.next_device_id;
        self.next_device_id += 1;

        let device = Device {
            id,
            name: new.name,
            device_type: new.device_type,
            api_key: api_key.clone(),
            public_ip: new.public_ip,
            is_online: false,
            last_seen: None,
            created_at: now,
            notes: new.notes,
        };
        self.api_key_index.insert(api_key, id);
        self.devices.insert(id, device.clone());
        Ok(device)
    }

    pub fn lookup_by_api_key(&self, api_key: &str) -> Option<&Device> {
        let id = self.api_key_index.get(api_key)?;
        self.devices.get(id)
    }

    pub fn device(&self, id: u64) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn list_devices(&self) -> Vec<Device> {
        let mut out: Vec<Device> = self.devices.values().cloned().collect();
        out.sort_by_key(|d| d.id);
        out
    }

    pub fn update_device(&mut self, id: u64, upd: DeviceUpdate) -> Result<Device, StoreError> {
        let device = self
            .devices
            .get_mut(&id)
            .ok_or(StoreError::DeviceNotFound(id))?;

        if let Some(name) = upd.name {
            device.name = name;
        }
        if let Some(device_type) = upd.device_type {
            device.device_type = device_type;
        }
        if let Some(public_ip) = upd.public_ip {
            device.public_ip = Some(public_ip);
        }
        if let Some(notes) = upd.notes {
            device.notes = Some(notes);
        }

        Ok(device.clone())
    }

    pub fn delete_device(&mut self, id: u64) -> Result<(), StoreError> {
        let device = self
            .devices
            .remove(&id)
            .ok_or(StoreError::DeviceNotFound(id))?;
        self.api_key_index.remove(&device.api_key);
        // Отчёты устройства намеренно остаются: связь по device_id,
        // а не по живой ссылке.
        Ok(())
    }

    pub fn mark_seen(&mut self, id: u64, observed_public_ip: Option<&str>, now: DateTime<Utc>) {
        if let Some(device) = self.devices.get_mut(&id) {
            device.is_online = true;
            device.last_seen = Some(now);
            if let Some(ip) = observed_public_ip.filter(|ip| !ip.trim().is_empty()) {
                device.public_ip = Some(ip.to_string());
            }
        }
    }

    pub fn sweep_stale(&mut self, now: DateTime<Utc>, threshold: Duration) -> usize {
        let mut marked = 0;
        for device in self.devices.values_mut() {
            if let Some(last_seen) = device.last_seen {
                if now - last_seen > threshold && device.is_online {
                    device.is_online = false;
                    marked += 1;
                }
            }
        }
        marked
    }

    pub fn append_status(&mut self, sample: StatusSample) {
        self.statuses.push(sample);
    }

    pub fn append_error(&mut self, sample: ErrorSample) {
        self.errors.push(sample);
    }

    pub fn statuses(&self) -> &[StatusSample] {
        &self.statuses
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn statuses_since(&self, since: DateTime<Utc>) -> Vec<&StatusSample> {
        self.statuses
            .iter()
            .filter(|s| s.timestamp >= since)
            .collect()
    }

    pub fn device_statuses_since(&self, device_id: u64, since: DateTime<Utc>) -> Vec<StatusSample> {
        let mut out: Vec<StatusSample> = self
            .statuses
            .iter()
            .filter(|s| s.device_id == device_id && s.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    pub fn errors_filtered(
        &self,
        device_id: Option<u64>,
        level: Option<&str>,
        limit: usize,
    ) -> Vec<ErrorSample> {
        let mut out: Vec<ErrorSample> = self
            .errors
            .iter()
            .filter(|e| device_id.map_or(true, |id| e.device_id == id))
            .filter(|e| level.map_or(true, |lvl| e.level == lvl))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        out
    }
}

pub fn generate_api_key() -> String {
    let mut bytes = [0_u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn clamp_message(message: &str) -> String {
    if message.chars().count() <= MESSAGE_MAX_CHARS {
        return message.to_string();
    }
    message.chars().take(MESSAGE_MAX_CHARS).collect()
}
