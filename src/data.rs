use std::path::Path;

pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const PDF_MIME: &str = "application/pdf";

/// Upload formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Docx,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<SourceKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(SourceKind::Pdf),
            "docx" => Some(SourceKind::Docx),
            _ => None,
        }
    }

    /// Trusts the file name first and falls back to sniffing the bytes.
    pub fn detect(name: &str, bytes: &[u8]) -> Option<SourceKind> {
        if let Some(kind) = SourceKind::from_path(Path::new(name)) {
            return Some(kind);
        }
        match infer::get(bytes)?.mime_type() {
            PDF_MIME => Some(SourceKind::Pdf),
            DOCX_MIME => Some(SourceKind::Docx),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Docx => "docx",
        }
    }

    /// `name` with this kind's extension appended unless it already ends in it,
    /// so `from_path` on the stored file agrees with the detected kind.
    pub fn file_name(&self, name: &str) -> String {
        if SourceKind::from_path(Path::new(name)) == Some(*self) {
            name.to_string()
        } else {
            format!("{}.{}", name, self.extension())
        }
    }
}

/// Keeps only the final path component and characters that are safe in a
/// file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned = base
        .chars()
        .map(|ch| {
            if ch.is_control() || matches!(ch, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                ch
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}
