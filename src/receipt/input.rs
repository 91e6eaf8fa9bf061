use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::warn;

/// `data:<mime>[;params];base64,` at the start of an encoded payload.
static DATA_URI_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^data:([^;,]*)[^,]*;base64,").unwrap());

/// Receipt formats the extraction service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Jpeg,
    Png,
    Pdf,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Jpeg => "image/jpeg",
            MimeType::Png => "image/png",
            MimeType::Pdf => "application/pdf",
        }
    }

    /// Map a declared content type onto the allow-list. `image/jpg` is a
    /// common alias for JPEG.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(MimeType::Jpeg),
            "image/png" => Some(MimeType::Png),
            "application/pdf" => Some(MimeType::Pdf),
            _ => None,
        }
    }

    /// Detect the format from the first characters of base64 text. These are
    /// the encodings of the JPEG, PNG and `%PDF-` magic bytes.
    pub fn sniff(base64: &str) -> Option<Self> {
        if base64.starts_with("/9j") {
            Some(MimeType::Jpeg)
        } else if base64.starts_with("iVBOR") {
            Some(MimeType::Png)
        } else if base64.starts_with("JVBERi0") {
            Some(MimeType::Pdf)
        } else {
            None
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(MimeType::Jpeg),
            "png" => Ok(MimeType::Png),
            "pdf" => Ok(MimeType::Pdf),
            other => MimeType::from_declared(other)
                .ok_or_else(|| format!("unsupported receipt type: {other}")),
        }
    }
}

/// Receipt payload as handed over by the upload boundary: base64 text plus
/// the resolved content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReceiptInput {
    data: String,
    mime: MimeType,
}

impl RawReceiptInput {
    /// Accept a data URI or bare base64 text.
    pub fn from_encoded(payload: &str) -> Self {
        let payload = payload.trim();
        let (declared, data) = match DATA_URI_PREFIX.captures(payload) {
            Some(caps) => {
                let prefix_len = caps.get(0).map_or(0, |m| m.end());
                (
                    caps.get(1)
                        .and_then(|m| MimeType::from_declared(m.as_str())),
                    &payload[prefix_len..],
                )
            }
            None => (None, payload),
        };
        let mime = declared.unwrap_or_else(|| sniff_or_fallback(data));
        Self {
            data: data.to_string(),
            mime,
        }
    }

    /// Accept raw file bytes. Without a declared type the format is sniffed.
    pub fn from_bytes(bytes: &[u8], declared: Option<MimeType>) -> Self {
        let data = STANDARD.encode(bytes);
        let mime = declared.unwrap_or_else(|| sniff_or_fallback(&data));
        Self { data, mime }
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn mime(&self) -> MimeType {
        self.mime
    }

    pub fn is_empty(&self) -> bool {
        self.data.trim().is_empty()
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

// TODO: reject undetectable payloads instead of assuming JPEG once upload
// validation guarantees a declared type.
fn sniff_or_fallback(data: &str) -> MimeType {
    MimeType::sniff(data).unwrap_or_else(|| {
        if !data.is_empty() {
            warn!(
                prefix = %data.chars().take(8).collect::<String>(),
                "Could not detect receipt format, assuming JPEG"
            );
        }
        MimeType::Jpeg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_strips_prefix() {
        let input = RawReceiptInput::from_encoded("data:image/png;base64,iVBORw0KGgo=");
        assert_eq!(input.mime(), MimeType::Png);
        assert_eq!(input.data(), "iVBORw0KGgo=");
    }

    #[test]
    fn test_data_uri_jpg_alias() {
        let input = RawReceiptInput::from_encoded("data:image/jpg;base64,AAAA");
        assert_eq!(input.mime(), MimeType::Jpeg);
        assert_eq!(input.data(), "AAAA");
    }

    #[test]
    fn test_data_uri_declared_type_wins_over_sniffing() {
        let input = RawReceiptInput::from_encoded("data:application/pdf;base64,/9j/4AAQ");
        assert_eq!(input.mime(), MimeType::Pdf);
    }

    #[test]
    fn test_unlisted_declared_type_is_sniffed() {
        let input = RawReceiptInput::from_encoded("data:image/webp;base64,JVBERi0xLjQ=");
        assert_eq!(input.mime(), MimeType::Pdf);
        assert_eq!(input.data(), "JVBERi0xLjQ=");
    }

    #[test]
    fn test_sniff_bare_base64() {
        assert_eq!(RawReceiptInput::from_encoded("/9j/4AAQSk").mime(), MimeType::Jpeg);
        assert_eq!(RawReceiptInput::from_encoded("iVBORw0KGgo").mime(), MimeType::Png);
        assert_eq!(RawReceiptInput::from_encoded("JVBERi0xLjQK").mime(), MimeType::Pdf);
    }

    #[test]
    fn test_unknown_falls_back_to_jpeg() {
        // GIF header
        let input = RawReceiptInput::from_encoded("R0lGODlhAQABAAAAACw=");
        assert_eq!(input.mime(), MimeType::Jpeg);
    }

    #[test]
    fn test_from_bytes_sniffs_magic() {
        let png = RawReceiptInput::from_bytes(b"\x89PNG\r\n\x1a\n", None);
        assert_eq!(png.mime(), MimeType::Png);
        assert_eq!(png.data(), "iVBORw0KGgo=");

        let jpeg = RawReceiptInput::from_bytes(&[0xFF, 0xD8, 0xFF, 0xE0], None);
        assert_eq!(jpeg.mime(), MimeType::Jpeg);

        let pdf = RawReceiptInput::from_bytes(b"%PDF-1.4", None);
        assert_eq!(pdf.mime(), MimeType::Pdf);
        assert_eq!(pdf.data_uri(), "data:application/pdf;base64,JVBERi0xLjQ=");

        let declared = RawReceiptInput::from_bytes(b"%PDF-1.4", Some(MimeType::Png));
        assert_eq!(declared.mime(), MimeType::Png);
    }

    #[test]
    fn test_empty_payload() {
        assert!(RawReceiptInput::from_encoded("  ").is_empty());
        assert!(RawReceiptInput::from_encoded("data:image/png;base64,").is_empty());
        assert!(RawReceiptInput::from_bytes(&[], None).is_empty());
    }

    #[test]
    fn test_parse_cli_names() {
        assert_eq!("jpg".parse::<MimeType>(), Ok(MimeType::Jpeg));
        assert_eq!("application/pdf".parse::<MimeType>(), Ok(MimeType::Pdf));
        assert!("gif".parse::<MimeType>().is_err());
    }
}
