use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::Context;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::FillError;

/// A DOCX template as an ordered list of zip entries. Entries the engine does
/// not touch are written back byte-for-byte with their original compression,
/// timestamps and permissions, so an untouched template round-trips exactly.
#[derive(Debug)]
pub struct TemplatePackage {
    entries: Vec<PackageEntry>,
}

#[derive(Debug)]
pub struct PackageEntry {
    pub name: String,
    pub data: Vec<u8>,
    compression: CompressionMethod,
    last_modified: zip::DateTime,
    unix_mode: Option<u32>,
    is_dir: bool,
}

impl TemplatePackage {
    pub fn read_path(path: &Path) -> Result<Self, FillError> {
        let data = std::fs::read(path).map_err(|e| {
            FillError::TemplateUnreadable(format!("{}: {e}", path.display()))
        })?;
        Self::read_bytes(&data)
    }

    pub fn read_bytes(data: &[u8]) -> Result<Self, FillError> {
        let mut zip = ZipArchive::new(Cursor::new(data)).map_err(|e| {
            FillError::TemplateUnreadable(format!(
                "not a zip archive (is this a real .docx, not a renamed .doc?): {e}"
            ))
        })?;
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut file = zip
                .by_index(i)
                .map_err(|e| FillError::TemplateUnreadable(format!("zip entry {i}: {e}")))?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .map_err(|e| FillError::TemplateUnreadable(format!("read {}: {e}", file.name())))?;
            entries.push(PackageEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        if !entries.iter().any(|e| e.name == "word/document.xml") {
            return Err(FillError::TemplateUnreadable(
                "missing word/document.xml".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    /// Parts that may contain fillable nodes, in a fixed scan order: the body
    /// first, then headers, then footers.
    pub fn fillable_parts(&self) -> Vec<&PackageEntry> {
        let mut parts: Vec<&PackageEntry> = self
            .entries
            .iter()
            .filter(|e| !e.data.is_empty() && is_fillable_part(&e.name))
            .collect();
        parts.sort_by_key(|e| (part_rank(&e.name), e.name.clone()));
        parts
    }

    pub fn write_bytes(
        &self,
        replacements: &HashMap<String, Vec<u8>>,
    ) -> anyhow::Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write_to(&mut cursor, replacements)?;
        Ok(cursor.into_inner())
    }

    pub fn write_path(
        &self,
        output_path: &Path,
        replacements: &HashMap<String, Vec<u8>>,
    ) -> anyhow::Result<()> {
        let f = File::create(output_path)
            .with_context(|| format!("create output docx: {}", output_path.display()))?;
        self.write_to(f, replacements)
    }

    fn write_to<W: Write + std::io::Seek>(
        &self,
        writer: W,
        replacements: &HashMap<String, Vec<u8>>,
    ) -> anyhow::Result<()> {
        let mut zout = ZipWriter::new(writer);
        for ent in &self.entries {
            let data = replacements.get(&ent.name).unwrap_or(&ent.data);
            let mut opts = SimpleFileOptions::default()
                .compression_method(ent.compression)
                .last_modified_time(ent.last_modified);
            if let Some(mode) = ent.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if ent.is_dir || ent.name.ends_with('/') {
                zout.add_directory(&ent.name, opts)
                    .with_context(|| format!("add zip dir: {}", ent.name))?;
            } else {
                zout.start_file(&ent.name, opts)
                    .with_context(|| format!("start zip file: {}", ent.name))?;
                zout.write_all(data)
                    .with_context(|| format!("write zip file: {}", ent.name))?;
            }
        }
        zout.finish().context("finish zip")?;
        Ok(())
    }
}

fn is_fillable_part(name: &str) -> bool {
    name == "word/document.xml"
        || (name.starts_with("word/header") && name.ends_with(".xml"))
        || (name.starts_with("word/footer") && name.ends_with(".xml"))
}

fn part_rank(name: &str) -> u8 {
    if name == "word/document.xml" {
        0
    } else if name.starts_with("word/header") {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_docx(document_xml: &str) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(&mut cursor);
        let opts =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("[Content_Types].xml", opts).unwrap();
        zip.write_all(b"<Types/>").unwrap();
        zip.start_file("word/document.xml", opts).unwrap();
        zip.write_all(document_xml.as_bytes()).unwrap();
        zip.finish().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn rejects_non_zip_input() {
        let err = TemplatePackage::read_bytes(b"plain old doc file").unwrap_err();
        assert!(matches!(err, FillError::TemplateUnreadable(_)));
    }

    #[test]
    fn untouched_template_round_trips_byte_identical() {
        let bytes = minimal_docx("<w:document><w:body/></w:document>");
        let pkg = TemplatePackage::read_bytes(&bytes).expect("read");
        let out = pkg.write_bytes(&HashMap::new()).expect("write");
        assert_eq!(bytes, out);
    }

    #[test]
    fn fillable_parts_orders_body_first() {
        let mut cursor = Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(&mut cursor);
        let opts =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for name in ["word/header1.xml", "word/document.xml", "word/footer1.xml"] {
            zip.start_file(name, opts).unwrap();
            zip.write_all(b"<w:p/>").unwrap();
        }
        zip.finish().unwrap();
        let pkg = TemplatePackage::read_bytes(&cursor.into_inner()).expect("read");
        let names: Vec<&str> = pkg.fillable_parts().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["word/document.xml", "word/header1.xml", "word/footer1.xml"]
        );
    }
}
