use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::TransferError;

/// Bytes inspected by the content sniff.
const SNIFF_LEN: usize = 512;

/// Default upper bound on a single upload: 2 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Content category detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    Pdf,
    /// ZIP container; also DOCX, ODT, EPUB.
    Zip,
    Gzip,
    Png,
    Jpeg,
    PostScript,
    /// UTF-8 text: TeX, Markdown, CSV, plain text.
    Text,
}

impl ContentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentCategory::Pdf => "pdf",
            ContentCategory::Zip => "zip",
            ContentCategory::Gzip => "gzip",
            ContentCategory::Png => "png",
            ContentCategory::Jpeg => "jpeg",
            ContentCategory::PostScript => "postscript",
            ContentCategory::Text => "text",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a file was refused before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("type not allowed: {0}")]
    DisallowedType(String),

    #[error("content does not match declared type {declared}")]
    ContentMismatch {
        declared: String,
        detected: Option<ContentCategory>,
    },
}

/// One entry of the type allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedType {
    /// Lowercase extension without the dot.
    pub extension: String,
    pub mime: String,
    pub category: ContentCategory,
}

impl AllowedType {
    fn new(extension: &str, mime: &str, category: ContentCategory) -> Self {
        Self {
            extension: extension.into(),
            mime: mime.into(),
            category,
        }
    }
}

/// Validator limits and allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_file_size: u64,
    pub allowed: Vec<AllowedType>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        use ContentCategory::*;
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed: vec![
                AllowedType::new("pdf", "application/pdf", Pdf),
                AllowedType::new("ps", "application/postscript", PostScript),
                AllowedType::new("zip", "application/zip", Zip),
                AllowedType::new(
                    "docx",
                    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                    Zip,
                ),
                AllowedType::new("odt", "application/vnd.oasis.opendocument.text", Zip),
                AllowedType::new("epub", "application/epub+zip", Zip),
                AllowedType::new("gz", "application/gzip", Gzip),
                AllowedType::new("tgz", "application/gzip", Gzip),
                AllowedType::new("png", "image/png", Png),
                AllowedType::new("jpg", "image/jpeg", Jpeg),
                AllowedType::new("jpeg", "image/jpeg", Jpeg),
                AllowedType::new("tex", "application/x-tex", Text),
                AllowedType::new("tex", "text/x-tex", Text),
                AllowedType::new("bib", "application/x-bibtex", Text),
                AllowedType::new("md", "text/markdown", Text),
                AllowedType::new("txt", "text/plain", Text),
                AllowedType::new("csv", "text/csv", Text),
            ],
        }
    }
}

/// Metadata of a file that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub category: ContentCategory,
}

/// Pre-flight check of candidate files.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Checks size, then type allow-list, then content sniff.
    ///
    /// `declared_mime` defaults to the allow-list MIME for the extension.
    /// I/O failures surface as [`TransferError::Io`], refusals as
    /// [`TransferError::Rejected`].
    pub fn validate(
        &self,
        path: &Path,
        declared_mime: Option<&str>,
    ) -> Result<ValidatedFile, TransferError> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Rejection::DisallowedType("not a regular file".into()).into());
        }
        let size = metadata.len();
        if size > self.config.max_file_size {
            return Err(Rejection::TooLarge {
                size,
                max: self.config.max_file_size,
            }
            .into());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = self.allowed_entry(path, declared_mime)?;

        let mut header = Vec::with_capacity(SNIFF_LEN);
        std::fs::File::open(path)?
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut header)?;
        let detected = sniff(&header);
        if detected != Some(entry.category) {
            debug!(
                file = %name,
                declared = %entry.mime,
                detected = ?detected,
                "content sniff mismatch"
            );
            return Err(Rejection::ContentMismatch {
                declared: entry.mime.clone(),
                detected,
            }
            .into());
        }

        Ok(ValidatedFile {
            path: path.to_path_buf(),
            name,
            size,
            mime: entry.mime.clone(),
            category: entry.category,
        })
    }

    fn allowed_entry(
        &self,
        path: &Path,
        declared_mime: Option<&str>,
    ) -> Result<&AllowedType, Rejection> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .ok_or_else(|| Rejection::DisallowedType("missing extension".into()))?;

        let mut candidates = self
            .config
            .allowed
            .iter()
            .filter(|a| a.extension == ext)
            .peekable();
        if candidates.peek().is_none() {
            return Err(Rejection::DisallowedType(format!(".{ext}")));
        }

        match declared_mime {
            None => candidates
                .next()
                .ok_or_else(|| Rejection::DisallowedType(format!(".{ext}"))),
            Some(mime) => {
                let mime = mime.trim().to_lowercase();
                candidates
                    .find(|a| a.mime == mime)
                    .ok_or(Rejection::DisallowedType(mime))
            }
        }
    }
}

/// Detects the content category from the leading bytes of a file.
///
/// Returns `None` when nothing matches with confidence; callers treat that
/// as a rejection.
pub fn sniff(header: &[u8]) -> Option<ContentCategory> {
    const MAGIC: &[(&[u8], ContentCategory)] = &[
        (b"%PDF-".as_slice(), ContentCategory::Pdf),
        (b"PK\x03\x04".as_slice(), ContentCategory::Zip),
        (b"\x1f\x8b".as_slice(), ContentCategory::Gzip),
        (b"\x89PNG\r\n\x1a\n".as_slice(), ContentCategory::Png),
        (b"\xff\xd8\xff".as_slice(), ContentCategory::Jpeg),
        (b"%!PS".as_slice(), ContentCategory::PostScript),
    ];

    if let Some((_, category)) = MAGIC.iter().find(|(magic, _)| header.starts_with(magic)) {
        return Some(*category);
    }
    if looks_like_text(header) {
        return Some(ContentCategory::Text);
    }
    None
}

fn looks_like_text(header: &[u8]) -> bool {
    if header.is_empty() || header.contains(&0) {
        return false;
    }
    match std::str::from_utf8(header) {
        Ok(_) => true,
        // A multi-byte sequence cut by the sniff window is still text.
        Err(e) => e.error_len().is_none() && e.valid_up_to() > 0,
    }
}
