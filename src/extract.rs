//! Multi-format text extraction for indexed documents.
//!
//! Turns a [`KnowledgeDocument`] into normalized plain text, dispatching
//! on the file type:
//!
//! | Format | Path |
//! |--------|------|
//! | PDF | byte download → `pdf-extract` |
//! | Word (`doc`/`docx`) | byte download → ZIP → `word/document.xml` text runs |
//! | Markup page (`aspx`) | provider page parts → HTML strip, falling back to the raw page file |
//! | Anything else | empty text (the pipeline treats it as "skip") |
//!
//! HTML stripping is deliberately small: `<script>`/`<style>` subtrees are
//! dropped, block-closing tags and `<br>` become newlines, remaining tags
//! are removed, and exactly six common entities are decoded. Richer HTML
//! parsing is out of scope.
//!
//! After extraction the text is normalized (LF line endings, collapsed
//! space runs, at most one blank line between paragraphs, trimmed lines).
//! Callers drop documents whose normalized content is shorter than
//! [`MIN_CONTENT_CHARS`].

use async_trait::async_trait;
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::graph::{DocumentProvider, PagePart, ProviderError};
use crate::models::{FileType, KnowledgeDocument};

/// Documents with less normalized content than this are skipped.
pub const MIN_CONTENT_CHARS: usize = 50;

/// Bound on a decompressed ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction failure. The pipeline maps these to "skip this document";
/// they never abort a pass.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("Word extraction failed: {0}")]
    Word(String),
    #[error("page extraction failed: {0}")]
    Page(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Extraction seam between the pipeline and the format decoders.
///
/// [`FormatExtractor`] is the production implementation; tests substitute
/// fakes that return canned text or canned failures.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Extract normalized plain text for a document. An `Ok` result may
    /// be empty or too short to index; length policy belongs to callers.
    async fn extract(&self, doc: &KnowledgeDocument) -> Result<String, ExtractError>;
}

/// Production extractor: downloads content through the provider and
/// decodes it per format.
pub struct FormatExtractor {
    provider: Arc<dyn DocumentProvider>,
}

impl FormatExtractor {
    pub fn new(provider: Arc<dyn DocumentProvider>) -> Self {
        Self { provider }
    }

    /// Extract a markup page via the structured pages endpoint, falling
    /// back to the raw page file when the endpoint yields nothing.
    async fn extract_page(&self, doc: &KnowledgeDocument) -> Result<String, ExtractError> {
        let hostname = doc
            .site_url
            .strip_prefix("https://")
            .or_else(|| doc.site_url.strip_prefix("http://"))
            .map(|rest| rest.split('/').next().unwrap_or(rest))
            .unwrap_or(&doc.site_url);
        let page_name = doc.web_url.rsplit('/').next().unwrap_or(&doc.web_url);

        let site = self.provider.resolve_site(hostname, &doc.site_name).await?;
        let parts = self.provider.get_page_parts(&site.id, page_name).await?;

        let mut sections = Vec::new();
        for part in &parts {
            let section = part_text(part);
            if !section.trim().is_empty() {
                sections.push(section);
            }
        }

        if sections.is_empty() {
            debug!(page = page_name, "no web parts with content, fetching raw page file");
            let bytes = self.provider.download_bytes(doc).await?;
            return Ok(strip_html(&String::from_utf8_lossy(&bytes)));
        }
        Ok(sections.join("\n\n"))
    }
}

#[async_trait]
impl ContentExtractor for FormatExtractor {
    async fn extract(&self, doc: &KnowledgeDocument) -> Result<String, ExtractError> {
        let raw = match doc.file_type {
            FileType::Pdf => {
                let bytes = self.provider.download_bytes(doc).await?;
                extract_pdf(&bytes)?
            }
            FileType::Doc | FileType::Docx => {
                let bytes = self.provider.download_bytes(doc).await?;
                extract_word(&bytes)?
            }
            FileType::Aspx => self.extract_page(doc).await?,
            FileType::Unknown => String::new(),
        };
        Ok(normalize_text(&raw))
    }
}

/// Preferred payload of a page part: explicit HTML, else the plain-text
/// property.
fn part_text(part: &PagePart) -> String {
    if let Some(html) = part.inner_html.as_deref() {
        return strip_html(html);
    }
    part.text.clone().unwrap_or_default()
}

/// Decode a PDF byte buffer into plain text.
fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Decode a Word document into plain text.
///
/// Reads `word/document.xml` from the OOXML container and collects the
/// `w:t` text runs, emitting a newline at each paragraph end.
fn extract_word(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Word(e.to_string()))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ExtractError::Word("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ExtractError::Word(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::Word(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Word(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Strip HTML down to plain text.
///
/// Single pass: `<script>`/`<style>` subtrees are dropped entirely,
/// block-closing tags (`p`, `div`, `h1`–`h6`, `li`, `tr`) and `<br>`
/// emit a newline, all other tags vanish, then the six common entities
/// are decoded.
pub fn strip_html(html: &str) -> String {
    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'<' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'<' {
                i += 1;
            }
            out.push_str(&html[start..i]);
            continue;
        }

        let tag_end = match html[i..].find('>') {
            Some(offset) => i + offset,
            None => {
                // Unterminated tag: drop the rest.
                break;
            }
        };
        let tag_body = html[i + 1..tag_end].trim();
        let tag_name = tag_name_of(tag_body);

        match tag_name.as_str() {
            "script" | "style" => {
                let close = format!("</{}", tag_name);
                let rest = html[tag_end + 1..].to_ascii_lowercase();
                match rest.find(&close) {
                    Some(offset) => {
                        let close_start = tag_end + 1 + offset;
                        let close_end = html[close_start..]
                            .find('>')
                            .map(|o| close_start + o + 1)
                            .unwrap_or(html.len());
                        i = close_end;
                    }
                    None => break,
                }
            }
            "/p" | "/div" | "/h1" | "/h2" | "/h3" | "/h4" | "/h5" | "/h6" | "/li" | "/tr"
            | "br" | "br/" => {
                out.push('\n');
                i = tag_end + 1;
            }
            _ => {
                i = tag_end + 1;
            }
        }
    }

    decode_entities(&out)
}

/// Lowercased tag name including a leading slash for closing tags;
/// `<br />` normalizes to `br/`.
fn tag_name_of(tag_body: &str) -> String {
    let mut name = String::new();
    for c in tag_body.chars() {
        match c {
            '/' if name.is_empty() => name.push('/'),
            c if c.is_ascii_alphanumeric() => name.push(c.to_ascii_lowercase()),
            _ => break,
        }
    }
    if name == "br" && tag_body.ends_with('/') {
        name.push('/');
    }
    name
}

/// Decode the six entities the markup pages actually use.
fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Normalize extracted text:
/// CRLF/CR → LF, space/tab runs → one space, each line trimmed,
/// three or more consecutive newlines → exactly two, ends trimmed.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let lines: Vec<String> = unified
        .split('\n')
        .map(|line| {
            let mut collapsed = String::with_capacity(line.len());
            let mut in_gap = false;
            for c in line.chars() {
                if c == ' ' || c == '\t' {
                    if !in_gap {
                        collapsed.push(' ');
                        in_gap = true;
                    }
                } else {
                    collapsed.push(c);
                    in_gap = false;
                }
            }
            collapsed.trim().to_string()
        })
        .collect();

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in &lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}
