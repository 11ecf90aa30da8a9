use std::collections::BTreeMap;

use anyhow::Context;
use quick_xml::events::{BytesDecl, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};

use crate::error::FillError;

/// One event of a flattened XML part. Parts round-trip losslessly through
/// `Vec<XmlEvent>`: attribute values keep their raw (already-escaped) bytes,
/// text is re-escaped minimally, CDATA passes through untouched.
#[derive(Clone, Debug)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    PI {
        content: String,
    },
    DocType {
        text: String,
    },
}

#[derive(Clone)]
pub struct XmlPart {
    pub name: String,
    pub events: Vec<XmlEvent>,
    baseline_hash: String,
}

/// Events to splice in front of an existing event index at serialize time.
/// Keeping insertions out of `events` means node addresses (event indices)
/// captured at parse time stay valid for the whole pass.
#[derive(Clone, Debug, Default)]
pub struct PendingInsertions {
    inserts: BTreeMap<usize, Vec<XmlEvent>>,
}

impl PendingInsertions {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
    }

    pub fn insert_before(&mut self, event_index: usize, events: Vec<XmlEvent>) {
        self.inserts.entry(event_index).or_default().extend(events);
    }
}

impl XmlPart {
    pub fn parse(name: &str, xml_bytes: &[u8]) -> Result<Self, FillError> {
        let events = read_events(xml_bytes)
            .map_err(|e| FillError::TemplateUnreadable(format!("{name}: {e:#}")))?;
        let baseline_hash = structure_hash(&events);
        Ok(Self {
            name: name.to_string(),
            events,
            baseline_hash,
        })
    }

    /// Fails when any event outside `w:t` text content changed since parse.
    /// Writers only rewrite text inside `w:t`; anything else tripping this is
    /// corruption and must not reach the output package.
    pub fn verify_structure_unchanged(&self) -> Result<(), FillError> {
        let cur = structure_hash(&self.events);
        if cur != self.baseline_hash {
            return Err(FillError::FormattingPreservation {
                part: self.name.clone(),
                detail: format!("baseline={} current={cur}", self.baseline_hash),
            });
        }
        Ok(())
    }

    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        self.serialize_with(&PendingInsertions::default())
    }

    pub fn serialize_with(&self, insertions: &PendingInsertions) -> anyhow::Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        for (idx, ev) in self.events.iter().enumerate() {
            if let Some(extra) = insertions.inserts.get(&idx) {
                for e in extra {
                    write_event(&mut out, e)?;
                }
            }
            write_event(&mut out, ev)?;
        }
        if let Some(extra) = insertions.inserts.get(&self.events.len()) {
            for e in extra {
                write_event(&mut out, e)?;
            }
        }
        Ok(out)
    }
}

fn read_events(xml_bytes: &[u8]) -> anyhow::Result<Vec<XmlEvent>> {
    let mut reader = Reader::from_reader(xml_bytes);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let ev = reader.read_event_into(&mut buf).context("read xml event")?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().context("decl version")?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                let mut attrs: Vec<(String, String)> = Vec::new();
                for a in s.attributes() {
                    let a = a.context("attr")?;
                    // Raw attribute bytes: unescaping and re-escaping would
                    // normalize entity references (e.g. &#13;&#10; in VML
                    // blobs) and corrupt embedded objects.
                    attrs.push((
                        bytes_to_string(a.key.as_ref()),
                        bytes_to_string(a.value.as_ref()),
                    ));
                }
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                let mut attrs: Vec<(String, String)> = Vec::new();
                for a in s.attributes() {
                    let a = a.context("attr")?;
                    attrs.push((
                        bytes_to_string(a.key.as_ref()),
                        bytes_to_string(a.value.as_ref()),
                    ));
                }
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs,
                });
            }
            Event::Text(t) => {
                let txt = t.unescape().context("unescape text")?.into_owned();
                events.push(XmlEvent::Text { text: txt });
            }
            Event::CData(t) => {
                events.push(XmlEvent::CData {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::Comment(t) => {
                events.push(XmlEvent::Comment {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::PI(t) => {
                let target = bytes_to_string(t.target());
                let content = bytes_to_string(t.content());
                events.push(XmlEvent::PI {
                    content: format!("{target}{content}"),
                });
            }
            Event::DocType(t) => {
                events.push(XmlEvent::DocType {
                    text: bytes_to_string(t.into_inner()),
                });
            }
        }
    }
    Ok(events)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

fn write_event(out: &mut Vec<u8>, ev: &XmlEvent) -> anyhow::Result<()> {
    match ev {
        XmlEvent::Decl {
            version,
            encoding,
            standalone,
        } => {
            let d = BytesDecl::new(version.as_str(), encoding.as_deref(), standalone.as_deref());
            let mut writer = quick_xml::Writer::new(Vec::new());
            writer.write_event(Event::Decl(d)).context("write decl")?;
            out.extend_from_slice(&writer.into_inner());
        }
        XmlEvent::Start { name, attrs } => {
            write_start_like(out, name, attrs, false);
        }
        XmlEvent::End { name } => {
            out.extend_from_slice(b"</");
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b">");
        }
        XmlEvent::Empty { name, attrs } => {
            write_start_like(out, name, attrs, true);
        }
        XmlEvent::Text { text } => {
            escape_text_into(out, text);
        }
        XmlEvent::CData { text } => {
            out.extend_from_slice(b"<![CDATA[");
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"]]>");
        }
        XmlEvent::Comment { text } => {
            out.extend_from_slice(b"<!--");
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"-->");
        }
        XmlEvent::PI { content } => {
            out.extend_from_slice(b"<?");
            out.extend_from_slice(content.as_bytes());
            out.extend_from_slice(b"?>");
        }
        XmlEvent::DocType { text } => {
            out.extend_from_slice(b"<!DOCTYPE");
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b">");
        }
    }
    Ok(())
}

fn write_start_like(out: &mut Vec<u8>, name: &str, attrs: &[(String, String)], empty: bool) {
    out.extend_from_slice(b"<");
    out.extend_from_slice(name.as_bytes());
    // Attribute values are raw (already-escaped) bytes. Do NOT escape again.
    for (k, v) in attrs {
        out.extend_from_slice(b" ");
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(b"=\"");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\"");
    }
    if empty {
        out.extend_from_slice(b"/>");
    } else {
        out.extend_from_slice(b">");
    }
}

fn escape_text_into(out: &mut Vec<u8>, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

pub fn find_attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn set_attr(ev: &mut XmlEvent, key: &str, value: &str) {
    match ev {
        XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } => {
            for (k, v) in attrs.iter_mut() {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
            attrs.push((key.to_string(), value.to_string()));
        }
        _ => {}
    }
}

fn is_writable_text_tag(name: &str) -> bool {
    name == "w:t"
}

fn structure_hash(events: &[XmlEvent]) -> String {
    let mut hasher = Sha256::new();
    let mut stack: Vec<String> = Vec::new();

    for ev in events {
        match ev {
            XmlEvent::Start { name, attrs } => {
                stack.push(name.clone());
                hash_open(&mut hasher, name, attrs);
            }
            XmlEvent::Empty { name, attrs } => {
                hash_open(&mut hasher, name, attrs);
                hasher.update(b"E:");
                hasher.update(name.as_bytes());
                hasher.update(b"\n");
            }
            XmlEvent::End { name } => {
                hasher.update(b"E:");
                hasher.update(name.as_bytes());
                hasher.update(b"\n");
                let _ = stack.pop();
            }
            XmlEvent::Text { text } => {
                let cur = stack.last().map(|s| s.as_str()).unwrap_or("");
                if is_writable_text_tag(cur) {
                    continue;
                }
                hasher.update(b"T:");
                hasher.update(text.as_bytes());
                hasher.update(b"\n");
            }
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                hasher.update(b"D:");
                hasher.update(version.as_bytes());
                hasher.update(b"|");
                hasher.update(encoding.as_deref().unwrap_or("").as_bytes());
                hasher.update(b"|");
                hasher.update(standalone.as_deref().unwrap_or("").as_bytes());
                hasher.update(b"\n");
            }
            XmlEvent::CData { text }
            | XmlEvent::Comment { text }
            | XmlEvent::DocType { text } => {
                hasher.update(b"X:");
                hasher.update(text.as_bytes());
                hasher.update(b"\n");
            }
            XmlEvent::PI { content } => {
                hasher.update(b"P:");
                hasher.update(content.as_bytes());
                hasher.update(b"\n");
            }
        }
    }
    hex::encode(hasher.finalize())
}

fn hash_open(hasher: &mut Sha256, name: &str, attrs: &[(String, String)]) {
    hasher.update(b"S:");
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    let mut map: BTreeMap<&str, &str> = BTreeMap::new();
    for (k, v) in attrs {
        if k == "xml:space" {
            continue;
        }
        map.insert(k, v);
    }
    for (k, v) in map {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    hasher.update(b"\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_preserves_attr_entity_refs() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?><root xmlns:o="urn:test" o:gfxdata="A&#xD;&#xA;B"/>"#;
        let part = XmlPart::parse("test.xml", xml).expect("parse xml");
        let out = part.serialize().expect("serialize xml");
        let s = String::from_utf8(out).expect("utf8");

        assert!(s.contains(r#"o:gfxdata="A&#xD;&#xA;B""#));
        assert!(!s.contains(r#"o:gfxdata="A&amp;#xD;"#));
    }

    #[test]
    fn text_rewrite_inside_wt_keeps_structure_hash() {
        let xml = br#"<?xml version="1.0"?><w:p><w:r><w:t>____</w:t></w:r></w:p>"#;
        let mut part = XmlPart::parse("document.xml", xml).expect("parse");
        for ev in part.events.iter_mut() {
            if let XmlEvent::Text { text } = ev {
                *text = "value".to_string();
            }
        }
        part.verify_structure_unchanged().expect("hash stable");
    }

    #[test]
    fn non_text_mutation_fails_verification() {
        let xml = br#"<?xml version="1.0"?><w:p><w:r><w:t>x</w:t></w:r></w:p>"#;
        let mut part = XmlPart::parse("document.xml", xml).expect("parse");
        if let XmlEvent::Start { name, .. } = &mut part.events[1] {
            *name = "w:tbl".to_string();
        }
        assert!(part.verify_structure_unchanged().is_err());
    }

    #[test]
    fn insertions_splice_before_target_event() {
        let xml = br#"<?xml version="1.0"?><w:p><w:r><w:t>a</w:t></w:r></w:p>"#;
        let part = XmlPart::parse("document.xml", xml).expect("parse");
        // Splice a run before </w:p>.
        let end_p = part
            .events
            .iter()
            .position(|e| matches!(e, XmlEvent::End { name } if name == "w:p"))
            .expect("end of paragraph");
        let mut ins = PendingInsertions::default();
        ins.insert_before(
            end_p,
            vec![
                XmlEvent::Start {
                    name: "w:r".into(),
                    attrs: vec![],
                },
                XmlEvent::Start {
                    name: "w:t".into(),
                    attrs: vec![],
                },
                XmlEvent::Text { text: "b".into() },
                XmlEvent::End { name: "w:t".into() },
                XmlEvent::End { name: "w:r".into() },
            ],
        );
        let out = part.serialize_with(&ins).expect("serialize");
        let s = String::from_utf8(out).expect("utf8");
        assert!(s.contains("<w:t>a</w:t></w:r><w:r><w:t>b</w:t></w:r></w:p>"));
    }
}
