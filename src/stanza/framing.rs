//! XMPP stream framing over a byte stream.
//!
//! A TCP stream carries one long `<stream:stream>` document. [`extract_frame`] finds
//! the next frame boundary in a buffer (stream header, stream close, or a complete
//! top-level stanza) and [`FrameBuffer`] accumulates reads and enforces a size limit.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::error;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// A unit extracted from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` opening tag, with attributes (`id`, `from`, `version`).
    StreamOpen(Vec<(String, String)>),
    /// `</stream:stream>`
    StreamClose,
    /// A complete top-level element, as raw XML text.
    Stanza(String),
}

impl Frame {
    pub fn stream_attr(&self, key: &str) -> Option<&str> {
        match self {
            Frame::StreamOpen(attrs) => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Opening tag the client sends at stream start and after every stream restart.
pub fn stream_header(to: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        quick_xml::escape::escape(to)
    )
}

/// Parser position relative to top-level stanzas.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between stanzas, or before stream open.
    Idle,
    /// Inside a top-level stanza, collecting events.
    InStanza,
}

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(qualified: &[u8], local: &[u8]) -> bool {
    qualified == b"stream:stream" || local == b"stream"
}

/// Extract the next complete frame from `buffer`.
///
/// Returns `Some((frame, bytes_consumed))`, or `None` when the buffer does not hold
/// a complete frame yet. The caller advances past the consumed bytes.
pub fn extract_frame(buffer: &[u8]) -> Option<(Frame, usize)> {
    // The closing tag arrives alone, without its opening tag in this buffer.
    let first = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'));
    if let Some(start) = first {
        if buffer[start..].starts_with(STREAM_CLOSE) {
            return Some((Frame::StreamClose, start + STREAM_CLOSE.len()));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle
                    && is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let attrs = e
                        .attributes()
                        .flatten()
                        .map(|a| {
                            (
                                bytes_to_string(a.key.as_ref()),
                                a.unescape_value()
                                    .map(|v| v.into_owned())
                                    .unwrap_or_else(|_| bytes_to_string(&a.value)),
                            )
                        })
                        .collect();
                    return Some((Frame::StreamOpen(attrs), reader.buffer_position() as usize));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(_)) => {
                // Self-closing top-level stanza, e.g. <presence/>
                if state == ParserState::Idle && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::Stanza(bytes_to_string(&buffer[pos..end])), end));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref()) {
                    return Some((Frame::StreamClose, reader.buffer_position() as usize));
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::Stanza(bytes_to_string(&buffer[stanza_start..end])), end));
                }
            }
            Ok(Event::Eof) => return None,
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                // Partial stanza; the next read completes it.
                return None;
            }
            Err(e) => {
                error!(error = ?e, "XML parsing error");
                return None;
            }
        }
    }
}

/// Frame buffer exceeded its size limit without yielding a complete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOverflow {
    pub buffered: usize,
    pub limit: usize,
}

/// Accumulates raw reads and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    limit: usize,
}

impl FrameBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    /// Append `bytes` and return every complete frame now available.
    ///
    /// Fails when the leftover partial data exceeds the limit, which means the
    /// peer is sending something that never forms a stanza.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, BufferOverflow> {
        self.buffer.extend_from_slice(bytes);

        // Track the consumed offset and compact once at the end.
        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((frame, used)) = extract_frame(&self.buffer[consumed..]) {
            consumed += used;
            frames.push(frame);
        }
        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        if self.buffer.len() > self.limit {
            return Err(BufferOverflow {
                buffered: self.buffer.len(),
                limit: self.limit,
            });
        }
        Ok(frames)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(frame: Frame) -> String {
        match frame {
            Frame::Stanza(s) => s,
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>";
        let (frame, consumed) = extract_frame(buf).unwrap();
        assert_eq!(frame.stream_attr("id"), Some("s1"));
        assert_eq!(frame.stream_attr("from"), Some("example.com"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_stream_features() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let (frame, consumed) = extract_frame(buf).unwrap();
        let text = stanza(frame);
        assert!(text.starts_with("<stream:features"));
        assert!(text.ends_with("</stream:features>"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_simple_stanza() {
        let buf = b"<presence/>";
        let (frame, consumed) = extract_frame(buf).unwrap();
        assert_eq!(stanza(frame), "<presence/>");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_multiple_stanzas() {
        let buf = b"<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message>";
        let (first, c1) = extract_frame(buf).unwrap();
        assert!(stanza(first).starts_with("<presence"));
        let (second, c2) = extract_frame(&buf[c1..]).unwrap();
        assert!(stanza(second).contains("Hello"));
        assert_eq!(c1 + c2, buf.len());
    }

    #[test]
    fn test_extract_incomplete_stanza() {
        let buf = b"<iq type='get'><query xmlns='jabber:iq:roster'>";
        assert!(extract_frame(buf).is_none());
    }

    #[test]
    fn test_extract_stream_closing() {
        let buf = b"  </stream:stream>";
        let (frame, consumed) = extract_frame(buf).unwrap();
        assert_eq!(frame, Frame::StreamClose);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_empty_and_whitespace() {
        assert!(extract_frame(b"").is_none());
        assert!(extract_frame(b"   \n  ").is_none());
    }

    #[test]
    fn test_extract_stanza_with_entities_and_cdata() {
        let buf = b"<message from='a@b'><body>Hello &amp; <![CDATA[<raw>]]></body></message>";
        let (frame, consumed) = extract_frame(buf).unwrap();
        let text = stanza(frame);
        assert!(text.contains("&amp;"));
        assert!(text.contains("CDATA"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_frame_buffer_handles_fragmentation() {
        let mut buffer = FrameBuffer::new(1024);
        let frames = buffer
            .push(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='x'><stream:features><bind")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::StreamOpen(_)));
        assert!(!buffer.is_empty());

        let frames = buffer
            .push(b" xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features><presence/>")
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_buffer_enforces_limit() {
        let mut buffer = FrameBuffer::new(16);
        let err = buffer
            .push(b"<message><body>this never ends and keeps growing")
            .unwrap_err();
        assert_eq!(err.limit, 16);
        assert!(err.buffered > 16);
    }

    #[test]
    fn test_stream_header_is_extractable() {
        let header = stream_header("example.com");
        let (frame, consumed) = extract_frame(header.as_bytes()).unwrap();
        assert_eq!(frame.stream_attr("to"), Some("example.com"));
        assert_eq!(consumed, header.len());
    }
}
