//! OAI-PMH `ListMetadataFormats` envelope parsing.

use std::fmt;

use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;

/// The OAI-PMH 2.0 namespace.
pub const OAI_NS: &[u8] = b"http://www.openarchives.org/OAI/2.0/";

/// A protocol-level `<error code="...">` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiError {
    pub code: Option<String>,
    pub message: String,
}

impl fmt::Display for OaiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_deref().unwrap_or("error"), self.message)
    }
}

/// What a response body said about the endpoint's metadata formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatsResponse {
    /// Lower-cased, trimmed `metadataPrefix` values in document order.
    Formats(Vec<String>),
    /// No prefixes; the endpoint reported protocol errors instead.
    ProtocolErrors(Vec<OaiError>),
    /// Well-formed, but neither prefixes nor errors.
    Empty,
    /// The body is not well-formed XML.
    Malformed(String),
}

impl FormatsResponse {
    /// Diagnostic message for every outcome except [`FormatsResponse::Formats`].
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Formats(_) => None,
            Self::ProtocolErrors(errors) => Some(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            Self::Empty => Some("No metadataPrefix elements returned".into()),
            Self::Malformed(msg) => Some(format!("XML parse error: {msg}")),
        }
    }
}

enum Capture {
    Prefix,
    Error { code: Option<String> },
}

/// Parse a `ListMetadataFormats` response.
///
/// Only elements in the OAI-PMH namespace count; prefixes that are blank
/// after trimming are ignored.
pub fn parse_metadata_formats(body: &[u8]) -> FormatsResponse {
    match scan(body) {
        Ok((prefixes, _)) if !prefixes.is_empty() => FormatsResponse::Formats(prefixes),
        Ok((_, errors)) if !errors.is_empty() => FormatsResponse::ProtocolErrors(errors),
        Ok(_) => FormatsResponse::Empty,
        Err(msg) => FormatsResponse::Malformed(msg),
    }
}

fn scan(body: &[u8]) -> Result<(Vec<String>, Vec<OaiError>), String> {
    let mut reader = NsReader::from_reader(body);

    let mut prefixes = Vec::new();
    let mut errors = Vec::new();
    let mut capture: Option<Capture> = None;
    let mut text = String::new();
    let mut saw_root = false;

    loop {
        let (ns, event) = reader.read_resolved_event().map_err(|e| e.to_string())?;
        let in_oai = matches!(ns, ResolveResult::Bound(Namespace(uri)) if uri == OAI_NS);

        match event {
            Event::Start(e) => {
                saw_root = true;
                if !in_oai {
                    continue;
                }
                match e.local_name().as_ref() {
                    b"metadataPrefix" => {
                        capture = Some(Capture::Prefix);
                        text.clear();
                    }
                    b"error" => {
                        capture = Some(Capture::Error {
                            code: attribute(&e, "code")?,
                        });
                        text.clear();
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                saw_root = true;
                if in_oai && e.local_name().as_ref() == b"error" {
                    errors.push(OaiError {
                        code: attribute(&e, "code")?,
                        message: String::new(),
                    });
                }
            }
            Event::Text(t) if capture.is_some() => {
                text.push_str(&t.unescape().map_err(|e| e.to_string())?);
            }
            Event::CData(c) if capture.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Event::End(e) => {
                let local = e.local_name();
                match capture.take() {
                    Some(Capture::Prefix) if local.as_ref() == b"metadataPrefix" => {
                        let prefix = text.trim().to_lowercase();
                        if !prefix.is_empty() {
                            prefixes.push(prefix);
                        }
                    }
                    Some(Capture::Error { code }) if local.as_ref() == b"error" => {
                        errors.push(OaiError {
                            code,
                            message: text.trim().to_string(),
                        });
                    }
                    // Nested element closed inside a captured one.
                    other => capture = other,
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err("no root element".into());
    }
    Ok((prefixes, errors))
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Result<Option<String>, String> {
    let Some(attr) = e.try_get_attribute(name).map_err(|e| e.to_string())? else {
        return Ok(None);
    };
    let value = attr.unescape_value().map_err(|e| e.to_string())?;
    Ok(Some(value.into_owned()))
}
