use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

pub trait LineClassifier {
    /// Возвращает уровень серьёзности, если строка похожа на ошибку.
    fn classify(&self, line: &str) -> Option<&str>;
}

#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

const KEYWORDS: [&str; 4] = ["error", "exception", "fail", "critical"];

impl LineClassifier for KeywordClassifier {
    fn classify(&self, line: &str) -> Option<&str> {
        let lower = line.to_lowercase();
        if KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            Some("error")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogCursor {
    pub position: u64,
}

pub fn read_new_lines(path: &Path, cursor: &mut LogCursor) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < cursor.position {
        // Файл усечён или пересоздан: читаем с начала.
        cursor.position = 0;
    }
    file.seek(SeekFrom::Start(cursor.position))?;

    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        cursor.position += read as u64;
        let line = buf.trim_end_matches(['\n', '\r']).to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}
