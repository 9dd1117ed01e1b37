use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTokens {
    pub context_tokens: u64,
    pub total_tokens: u64,
}

// Суммирует накопительные счётчики токенов по всем сессиям из файла
// вида {"sessions": {"<id>": {"contextTokens": N, "totalTokens": N}}};
// допускается и плоская карта сессий без обёртки.
pub fn read_session_tokens(path: &Path) -> Option<SessionTokens> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "файл сессий недоступен");
            return None;
        }
    };
    let root: Value = match serde_json::from_str(&text) {
        Ok(root) => root,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "файл сессий не разобран");
            return None;
        }
    };

    let sessions = root.get("sessions").unwrap_or(&root);
    let map = sessions.as_object()?;

    let mut totals = SessionTokens::default();
    for session in map.values() {
        if let Some(session) = session.as_object() {
            totals.context_tokens += session
                .get("contextTokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            totals.total_tokens += session
                .get("totalTokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
        }
    }
    Some(totals)
}
