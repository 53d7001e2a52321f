//! NZB documents
//!
//! Releases are stored as gzip-compressed NZB 1.1 documents: one `file` per
//! part, each listing its segments by message id. [`decode`] and
//! [`decode_reader`] read plain or gzip input back into an [`NzbSummary`] for
//! importing documents produced elsewhere.

use crate::error::{ParseError, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};

const NZB_NAMESPACE: &str = "http://www.newzbin.com/DTD/2003/nzb";
const NZB_DOCTYPE: &str =
    r#"nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd""#;

/// Two leading bytes of every gzip stream
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One segment entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NzbSegment {
    /// 1-based position in the file
    pub number: u32,
    /// Size in bytes
    pub bytes: u64,
    /// Message-ID without angle brackets
    pub message_id: String,
}

/// One file entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NzbFile {
    /// Subject, written as `"{subject} (1/{total_segments})"`
    pub subject: String,
    /// Declared segment count
    pub total_segments: u32,
    /// Poster
    pub poster: String,
    /// Posting time, unix seconds
    pub date: i64,
    /// Groups the file was posted to
    pub groups: Vec<String>,
    /// Segments in number order
    pub segments: Vec<NzbSegment>,
}

/// A document ready to encode
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NzbDocument {
    /// Release name, written as `name` meta
    pub name: String,
    /// Category label, written as `category` meta
    pub category: String,
    /// Files in order
    pub files: Vec<NzbFile>,
}

/// Groups listed in an Xref header (`host group:id group:id ...`)
pub fn parse_xref(xref: &str) -> Vec<String> {
    xref.split_whitespace()
        .filter_map(|entry| entry.split_once(':').map(|(group, _)| group))
        .filter(|group| !group.is_empty())
        .map(str::to_string)
        .collect()
}

fn xml_error(e: impl std::fmt::Display) -> ParseError {
    ParseError::Nzb(e.to_string())
}

/// Serialize a document to NZB XML
pub fn encode_xml(document: &NzbDocument) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 1);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::DocType(BytesText::from_escaped(NZB_DOCTYPE)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(
            BytesStart::new("nzb").with_attributes([("xmlns", NZB_NAMESPACE)]),
        ))
        .map_err(xml_error)?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .map_err(xml_error)?;
    for (kind, value) in [("category", &document.category), ("name", &document.name)] {
        writer
            .create_element("meta")
            .with_attribute(("type", kind))
            .write_text_content(BytesText::new(value))
            .map_err(xml_error)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .map_err(xml_error)?;

    for file in &document.files {
        let subject = format!("{} (1/{})", file.subject, file.total_segments);
        let date = file.date.to_string();
        writer
            .write_event(Event::Start(BytesStart::new("file").with_attributes([
                ("poster", file.poster.as_str()),
                ("date", date.as_str()),
                ("subject", subject.as_str()),
            ])))
            .map_err(xml_error)?;

        writer
            .write_event(Event::Start(BytesStart::new("groups")))
            .map_err(xml_error)?;
        for group in &file.groups {
            writer
                .create_element("group")
                .write_text_content(BytesText::new(group))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("groups")))
            .map_err(xml_error)?;

        writer
            .write_event(Event::Start(BytesStart::new("segments")))
            .map_err(xml_error)?;
        for segment in &file.segments {
            let bytes = segment.bytes.to_string();
            let number = segment.number.to_string();
            let message_id = segment
                .message_id
                .trim_start_matches('<')
                .trim_end_matches('>');
            writer
                .create_element("segment")
                .with_attributes([("bytes", bytes.as_str()), ("number", number.as_str())])
                .write_text_content(BytesText::new(message_id))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("segments")))
            .map_err(xml_error)?;

        writer
            .write_event(Event::End(BytesEnd::new("file")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("nzb")))
        .map_err(xml_error)?;

    Ok(writer.into_inner())
}

/// Serialize a document and gzip it for storage
pub fn encode(document: &NzbDocument) -> Result<Vec<u8>> {
    compress(&encode_xml(document)?)
}

/// Gzip a document unless it already is
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    compress_reader(data)
}

/// Gzip a document read from `reader` unless it already is
///
/// Plain input is compressed as it is read, so only the compressed output
/// is held in memory.
pub fn compress_reader<R: BufRead>(mut reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if is_gzip(&mut reader)? {
        reader.read_to_end(&mut out)?;
        return Ok(out);
    }
    let mut encoder = GzEncoder::new(out, Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    Ok(encoder.finish()?)
}

fn is_gzip<R: BufRead>(reader: &mut R) -> Result<bool> {
    Ok(reader.fill_buf()?.starts_with(&GZIP_MAGIC))
}

/// Undo gzip compression if present
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data.to_vec());
    }
    let mut xml = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut xml)
        .map_err(|e| ParseError::Nzb(format!("invalid gzip stream: {}", e)))?;
    Ok(xml)
}

/// One file as read back from a document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NzbFileSummary {
    /// Subject attribute as written
    pub subject: String,
    /// Poster attribute
    pub poster: String,
    /// Date attribute, unix seconds (0 when absent or unparsable)
    pub date: i64,
    /// Listed groups
    pub groups: Vec<String>,
    /// Number of segment entries
    pub segment_count: u64,
    /// Sum of segment `bytes` attributes
    pub bytes: u64,
}

/// What [`decode`] extracts from a document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NzbSummary {
    /// Release name from `name` (or `title`) meta
    pub name: String,
    /// Every meta entry by type
    pub meta: BTreeMap<String, String>,
    /// Files in document order
    pub files: Vec<NzbFileSummary>,
}

impl NzbSummary {
    /// Number of file entries
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Sum of all segment sizes
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }

    /// Earliest file date
    pub fn earliest_date(&self) -> Option<i64> {
        self.files.iter().map(|f| f.date).filter(|&d| d > 0).min()
    }

    /// `category` meta, if any
    pub fn category(&self) -> Option<&str> {
        self.meta.get("category").map(String::as_str)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    Other,
    Meta,
    Group,
    Segment,
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(xml_error)?;
        if attr.key.as_ref() == key {
            let value = attr.unescape_value().map_err(xml_error)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parse a plain or gzip-compressed NZB document
///
/// Fails when the document is not well formed or carries no `name` or
/// `title` meta entry.
pub fn decode(data: &[u8]) -> Result<NzbSummary> {
    decode_reader(data)
}

/// Parse a plain or gzip-compressed NZB document from a stream
///
/// Gzip input is inflated while it is parsed; the document is never held
/// in memory as a whole.
pub fn decode_reader<R: BufRead>(mut reader: R) -> Result<NzbSummary> {
    if is_gzip(&mut reader)? {
        parse_summary(BufReader::new(GzDecoder::new(reader)))
    } else {
        parse_summary(reader)
    }
}

fn parse_summary<R: BufRead>(input: R) -> Result<NzbSummary> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut summary = NzbSummary::default();
    let mut current: Option<NzbFileSummary> = None;
    let mut scope = Scope::Other;
    let mut meta_type: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"meta" => {
                    scope = Scope::Meta;
                    meta_type = attribute(&element, b"type")?;
                }
                b"file" => {
                    current = Some(NzbFileSummary {
                        subject: attribute(&element, b"subject")?.unwrap_or_default(),
                        poster: attribute(&element, b"poster")?.unwrap_or_default(),
                        date: attribute(&element, b"date")?
                            .and_then(|d| d.trim().parse().ok())
                            .unwrap_or(0),
                        ..NzbFileSummary::default()
                    });
                }
                b"group" => scope = Scope::Group,
                b"segment" => {
                    scope = Scope::Segment;
                    if let Some(file) = current.as_mut() {
                        file.segment_count += 1;
                        file.bytes += attribute(&element, b"bytes")?
                            .and_then(|b| b.trim().parse::<u64>().ok())
                            .unwrap_or(0);
                    }
                }
                _ => {}
            },
            Event::Empty(element) if element.local_name().as_ref() == b"segment" => {
                if let Some(file) = current.as_mut() {
                    file.segment_count += 1;
                    file.bytes += attribute(&element, b"bytes")?
                        .and_then(|b| b.trim().parse::<u64>().ok())
                        .unwrap_or(0);
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(xml_error)?;
                match scope {
                    Scope::Meta => {
                        if let Some(kind) = meta_type.take() {
                            summary.meta.insert(kind, text.into_owned());
                        }
                    }
                    Scope::Group => {
                        if let Some(file) = current.as_mut() {
                            file.groups.push(text.into_owned());
                        }
                    }
                    Scope::Segment | Scope::Other => {}
                }
            }
            Event::End(element) => {
                match element.local_name().as_ref() {
                    b"file" => {
                        if let Some(file) = current.take() {
                            summary.files.push(file);
                        }
                    }
                    b"meta" => meta_type = None,
                    _ => {}
                }
                scope = Scope::Other;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let name = summary
        .meta
        .get("name")
        .or_else(|| summary.meta.get("title"))
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or(ParseError::MissingName)?;
    summary.name = name;

    Ok(summary)
}
