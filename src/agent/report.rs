use crate::config::AgentConfig;
use crate::http::{ErrorReport, StatusReport};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn post_status(client: &Client, cfg: &AgentConfig, report: &StatusReport) {
    let url = format!("{}/api/report/status", cfg.server_url);
    match client
        .post(&url)
        .timeout(REPORT_TIMEOUT)
        .json(report)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            debug!("статус-отчёт доставлен");
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "статус-отчёт отклонён сервером");
        }
        Err(err) => {
            warn!(error = %err, "не удалось отправить статус-отчёт");
        }
    }
}

pub async fn post_error(client: &Client, cfg: &AgentConfig, report: &ErrorReport) {
    let url = format!("{}/api/report/error", cfg.server_url);
    match client
        .post(&url)
        .timeout(REPORT_TIMEOUT)
        .json(report)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            debug!("отчёт об ошибке доставлен");
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "отчёт об ошибке отклонён сервером");
        }
        Err(err) => {
            warn!(error = %err, "не удалось отправить отчёт об ошибке");
        }
    }
}

pub async fn fetch_public_ip(client: &Client) -> Option<String> {
    let resp = match client
        .get("https://api.ipify.org")
        .timeout(PUBLIC_IP_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            debug!(error = %err, "не удалось запросить публичный IP");
            return None;
        }
    };

    match resp.text().await {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(_) => None,
        Err(err) => {
            debug!(error = %err, "не удалось прочитать ответ сервиса публичного IP");
            None
        }
    }
}
