use std::path::Path;

/** \brief 按扩展名判定为纯文本、可直接按 UTF-8 读取的文件类型。 */
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "log", "xml", "html", "htm", "yaml", "yml",
    "toml", "ini", "cfg", "conf", "rs", "py", "js", "ts", "go", "java", "c", "h", "cpp", "sh",
    "sql",
];

/**
 * \brief 文档抽取失败原因，可直接渲染给用户。
 */
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("unsupported document type: {0}")]
    Unsupported(String),
    #[error("document {0} is not valid UTF-8 text")]
    NotText(String),
    #[error("document {0} is empty")]
    Empty(String),
    #[error("read {name} failed: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/**
 * \brief 从磁盘文件抽取纯文本。
 */
pub fn extract(path: impl AsRef<Path>) -> Result<String, ExtractionError> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    ensure_supported(&name)?;
    let bytes = std::fs::read(path).map_err(|source| ExtractionError::Io {
        name: name.clone(),
        source,
    })?;
    decode(&name, bytes)
}

/**
 * \brief 对上传内容抽取纯文本，`name` 为客户端提供的文件名。
 */
pub fn extract_bytes(name: &str, bytes: Vec<u8>) -> Result<String, ExtractionError> {
    ensure_supported(name)?;
    decode(name, bytes)
}

fn ensure_supported(name: &str) -> Result<(), ExtractionError> {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        Ok(())
    } else if ext.is_empty() {
        Err(ExtractionError::Unsupported(format!("{} (no extension)", name)))
    } else {
        Err(ExtractionError::Unsupported(format!(".{}", ext)))
    }
}

fn decode(name: &str, bytes: Vec<u8>) -> Result<String, ExtractionError> {
    let text = String::from_utf8(bytes).map_err(|_| ExtractionError::NotText(name.to_string()))?;
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(ExtractionError::Empty(name.to_string()));
    }
    Ok(text.to_string())
}
