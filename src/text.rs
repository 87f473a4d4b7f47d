//! Plain-text extraction from document formats
//!
//! In `extract-text` mode the attachment processor reduces documents to
//! plain text before they reach a model. Supported inputs: UTF-8 text and
//! Markdown, HTML (tag strip), RTF (control-word strip), PDF (object-stream
//! extraction with a raw-literal fallback), and Word documents (DOCX; legacy
//! DOC through a printable-run heuristic). Unknown types go through a small
//! UTF-8 sniff that rejects binary garbage.
//!
//! Extraction is pure and synchronous; the caller owns the per-file time
//! budget and runs these on the blocking pool.
//!
//! Extracted text is capped at [`MAX_EXTRACTED_CHARS`]; overflow is truncated
//! with a warning rather than failing the attachment.

use std::io::Read;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Maximum characters of extracted text per attachment.
pub const MAX_EXTRACTED_CHARS: usize = 100_000;

/// Bytes inspected by the unknown-type UTF-8 sniff.
const SNIFF_BYTES: usize = 5_000;
/// NUL count above which the sniff rejects the input as binary.
const SNIFF_MAX_NULS: usize = 5;

/// Errors surfaced by text extraction.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The format is recognized but this instance cannot be decoded.
    #[error("unreadable {format} content: {reason}")]
    Unreadable {
        /// Short format label for diagnostics.
        format: &'static str,
        /// Human-readable failure reason.
        reason: String,
    },
    /// The unknown-type sniff found binary content.
    #[error("content looks binary ({nuls} NUL bytes in first {inspected} bytes)")]
    Binary {
        /// NUL bytes observed.
        nuls: usize,
        /// Bytes inspected.
        inspected: usize,
    },
}

/// Extract plain text from `bytes` according to `media_type`.
pub fn extract_text(bytes: &[u8], media_type: &str) -> Result<String, TextError> {
    let mt = media_type.to_ascii_lowercase();
    let text = match mt.as_str() {
        "utf8" | "text/plain" | "text/markdown" | "text/csv" => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        "text/html" | "application/xhtml+xml" => strip_html(&String::from_utf8_lossy(bytes)),
        "text/rtf" | "application/rtf" => strip_rtf(&String::from_utf8_lossy(bytes)),
        "application/pdf" => pdf_text(bytes)?,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            docx_text(bytes)?
        }
        "application/msword" => printable_runs(bytes),
        _ => sniff_utf8(bytes)?,
    };
    Ok(truncate_chars(text, media_type))
}

fn truncate_chars(text: String, media_type: &str) -> String {
    if text.chars().count() <= MAX_EXTRACTED_CHARS {
        return text;
    }
    warn!(
        media_type,
        limit = MAX_EXTRACTED_CHARS,
        "extracted text exceeds cap; truncating"
    );
    text.chars().take(MAX_EXTRACTED_CHARS).collect()
}

// ============================================================================
// HTML
// ============================================================================

static HTML_DROP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("static regex")
});
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));
static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));

/// Drop script/style bodies, strip tags, decode the common entities, and
/// collapse runs of blank lines.
pub fn strip_html(html: &str) -> String {
    let no_scripts = HTML_DROP.replace_all(html, "");
    // Block-level closers become line breaks so paragraphs stay separated.
    let with_breaks = no_scripts
        .replace("</p>", "\n")
        .replace("</P>", "\n")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("</div>", "\n")
        .replace("</li>", "\n")
        .replace("</h1>", "\n")
        .replace("</h2>", "\n")
        .replace("</h3>", "\n")
        .replace("</tr>", "\n");
    let stripped = HTML_TAG.replace_all(&with_breaks, "");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    BLANK_RUNS.replace_all(decoded.trim(), "\n\n").into_owned()
}

// ============================================================================
// RTF
// ============================================================================

static RTF_DESTINATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\\\*?\\?(fonttbl|colortbl|stylesheet|info|pict|themedata)[^{}]*\}")
        .expect("static regex")
});
static RTF_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[a-zA-Z]+-?\d* ?").expect("static regex"));
static RTF_HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\'([0-9a-fA-F]{2})").expect("static regex"));

/// Strip RTF formatting: destination groups, control words, group braces.
pub fn strip_rtf(rtf: &str) -> String {
    let no_dests = RTF_DESTINATION.replace_all(rtf, "");
    // Paragraph markers first, before generic control words are erased.
    let with_breaks = no_dests.replace("\\par", "\n").replace("\\line", "\n");
    let hex_decoded = RTF_HEX.replace_all(&with_breaks, |c: &regex::Captures<'_>| {
        u8::from_str_radix(&c[1], 16)
            .map(|b| (b as char).to_string())
            .unwrap_or_default()
    });
    let no_controls = RTF_CONTROL.replace_all(&hex_decoded, "");
    no_controls.replace(['{', '}'], "").trim().to_string()
}

// ============================================================================
// PDF
// ============================================================================

/// Extract text from a PDF.
///
/// Primary path: inflate every FlateDecode content stream and pull the
/// literals used by text-showing operators. Fallback: scan the raw bytes for
/// parenthesized literals (covers uncompressed writers). An empty result in
/// both paths is an error rather than silently attaching nothing.
pub fn pdf_text(bytes: &[u8]) -> Result<String, TextError> {
    if !bytes.starts_with(b"%PDF") {
        return Err(TextError::Unreadable {
            format: "pdf",
            reason: "missing %PDF header".into(),
        });
    }
    let mut out = String::new();
    for stream in raw_streams(bytes) {
        let mut inflated = Vec::new();
        let mut decoder = flate2::read::ZlibDecoder::new(stream);
        if decoder.read_to_end(&mut inflated).is_ok() && !inflated.is_empty() {
            collect_pdf_literals(&String::from_utf8_lossy(&inflated), &mut out);
        }
    }
    if out.trim().is_empty() {
        // Uncompressed or unusual writer: scan the whole body.
        collect_pdf_literals(&String::from_utf8_lossy(bytes), &mut out);
    }
    if out.trim().is_empty() {
        return Err(TextError::Unreadable {
            format: "pdf",
            reason: "no extractable text operators".into(),
        });
    }
    Ok(out.trim().to_string())
}

/// Byte ranges between `stream` and `endstream` keywords.
fn raw_streams(bytes: &[u8]) -> Vec<&[u8]> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(start) = find_from(bytes, b"stream", pos) {
        let mut body = start + b"stream".len();
        // Keyword is followed by CRLF or LF per the PDF grammar.
        if bytes.get(body) == Some(&b'\r') {
            body += 1;
        }
        if bytes.get(body) == Some(&b'\n') {
            body += 1;
        }
        match find_from(bytes, b"endstream", body) {
            Some(end) => {
                found.push(&bytes[body..end]);
                pos = end + b"endstream".len();
            }
            None => break,
        }
    }
    found
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Pull parenthesized string literals out of a content stream, handling the
/// PDF escape forms, and insert line breaks at text-positioning operators.
fn collect_pdf_literals(content: &str, out: &mut String) {
    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '(' => {
                let mut depth = 1;
                let mut lit = String::new();
                i += 1;
                while i < chars.len() && depth > 0 {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            let esc = chars[i + 1];
                            match esc {
                                'n' => lit.push('\n'),
                                't' => lit.push('\t'),
                                'r' => lit.push('\r'),
                                '(' | ')' | '\\' => lit.push(esc),
                                _ => lit.push(esc),
                            }
                            i += 2;
                            continue;
                        }
                        '(' => {
                            depth += 1;
                            lit.push('(');
                        }
                        ')' => {
                            depth -= 1;
                            if depth > 0 {
                                lit.push(')');
                            }
                        }
                        c => lit.push(c),
                    }
                    i += 1;
                }
                out.push_str(&lit);
            }
            'T' if matches!(chars.get(i + 1), Some(&'d') | Some(&'D') | Some(&'*')) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
}

// ============================================================================
// Word
// ============================================================================

static XML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));

/// DOCX is a zip container; the body lives in `word/document.xml`.
pub fn docx_text(bytes: &[u8]) -> Result<String, TextError> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| TextError::Unreadable {
            format: "docx",
            reason: e.to_string(),
        })?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| TextError::Unreadable {
            format: "docx",
            reason: format!("word/document.xml: {e}"),
        })?
        .read_to_string(&mut xml)
        .map_err(|e| TextError::Unreadable {
            format: "docx",
            reason: e.to_string(),
        })?;
    let with_breaks = xml
        .replace("</w:p>", "\n")
        .replace("<w:tab/>", "\t")
        .replace("<w:br/>", "\n");
    let stripped = XML_TAG.replace_all(&with_breaks, "");
    let decoded = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&");
    Ok(decoded.trim().to_string())
}

/// Legacy-DOC heuristic: keep runs of printable characters of length ≥ 4.
pub fn printable_runs(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut run = String::new();
    for &b in bytes {
        let c = b as char;
        if c.is_ascii_graphic() || c == ' ' {
            run.push(c);
        } else {
            if run.trim().len() >= 4 {
                out.push_str(run.trim());
                out.push('\n');
            }
            run.clear();
        }
    }
    if run.trim().len() >= 4 {
        out.push_str(run.trim());
        out.push('\n');
    }
    out.trim().to_string()
}

/// Unknown-type sniff: inspect the head for NUL bytes, then decode lossily.
pub fn sniff_utf8(bytes: &[u8]) -> Result<String, TextError> {
    let head = &bytes[..bytes.len().min(SNIFF_BYTES)];
    let nuls = head.iter().filter(|&&b| b == 0).count();
    if nuls > SNIFF_MAX_NULS {
        return Err(TextError::Binary {
            nuls,
            inspected: head.len(),
        });
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn html_strip_drops_scripts_and_decodes_entities() {
        let html = "<html><head><style>p{color:red}</style></head>\
            <body><h1>Title</h1><p>A &amp; B</p><script>alert(1)</script>\
            <p>second&nbsp;para</p></body></html>";
        let text = strip_html(html);
        assert!(text.contains("Title"));
        assert!(text.contains("A & B"));
        assert!(text.contains("second para"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color:red"));
    }

    #[test]
    fn rtf_strip_keeps_body_text() {
        let rtf = r"{\rtf1\ansi{\fonttbl\f0 Helvetica;}\f0\fs24 Hello \b bold\b0 world\par done}";
        let text = strip_rtf(rtf);
        assert!(text.contains("Hello"));
        assert!(text.contains("bold"));
        assert!(text.contains("world"));
        assert!(text.contains("done"));
        assert!(!text.contains("rtf1"));
        assert!(!text.contains("Helvetica"));
    }

    #[test]
    fn pdf_fallback_reads_uncompressed_literals() {
        let pdf = b"%PDF-1.4\nBT (Hello) Tj (World) Tj ET\n%%EOF";
        let text = pdf_text(pdf).unwrap();
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
    }

    #[test]
    fn pdf_inflates_compressed_streams() {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"BT (Compressed text) Tj ET").unwrap();
        let deflated = enc.finish().unwrap();
        let mut pdf = b"%PDF-1.4\n1 0 obj\n<< /Filter /FlateDecode >>\nstream\n".to_vec();
        pdf.extend_from_slice(&deflated);
        pdf.extend_from_slice(b"\nendstream\nendobj\n%%EOF");
        let text = pdf_text(&pdf).unwrap();
        assert!(text.contains("Compressed text"));
    }

    #[test]
    fn pdf_without_text_is_unreadable() {
        let err = pdf_text(b"%PDF-1.4\n1 0 obj << >> endobj\n%%EOF").unwrap_err();
        assert!(matches!(err, TextError::Unreadable { format: "pdf", .. }));
    }

    #[test]
    fn docx_reads_document_xml() {
        let mut w = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        w.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        w.write_all(
            b"<w:document><w:body><w:p><w:r><w:t>First paragraph</w:t></w:r></w:p>\
              <w:p><w:r><w:t>Second</w:t></w:r></w:p></w:body></w:document>",
        )
        .unwrap();
        let bytes = w.finish().unwrap().into_inner();
        let text = docx_text(&bytes).unwrap();
        assert_eq!(text, "First paragraph\nSecond");
    }

    #[test]
    fn sniff_rejects_binary_heads() {
        let mut blob = vec![0u8; 16];
        blob.extend_from_slice(b"trailing text");
        assert!(matches!(sniff_utf8(&blob), Err(TextError::Binary { .. })));
        assert_eq!(sniff_utf8(b"plain text").unwrap(), "plain text");
    }

    #[test]
    fn extraction_truncates_at_cap() {
        let big = "x".repeat(MAX_EXTRACTED_CHARS + 500);
        let text = extract_text(big.as_bytes(), "text/plain").unwrap();
        assert_eq!(text.chars().count(), MAX_EXTRACTED_CHARS);
    }
}
