//! Source parsing and export writing for enrichment.
//!
//! CSV sources are read row-at-a-time with BOM tolerance, relaxed quoting
//! and trimmed values; XLSX sources are fully buffered and the first
//! worksheet converted to rows. Every export writer emits a UTF-8 BOM and a
//! header row lazily on its first data row, so empty partitions produce no
//! object at all.

use std::io::Cursor;

use calamine::{Reader, Xlsx};
use csv::{ReaderBuilder, StringRecordsIntoIter, Trim, WriterBuilder};

use crate::errors::{Error, Result};
use crate::store::SourceMeta;
use crate::types::ExportKind;

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Whether the source object needs the XLSX path.
pub(crate) fn is_spreadsheet(meta: &SourceMeta) -> bool {
    let mime = meta.mime_type.to_ascii_lowercase();
    if mime.contains("spreadsheet") || mime.contains("ms-excel") {
        return true;
    }
    meta.file_name
        .as_deref()
        .unwrap_or(&meta.s3_key)
        .to_ascii_lowercase()
        .ends_with(".xlsx")
}

/// Row iterator over either source format.
pub(crate) enum SourceRows {
    Csv(StringRecordsIntoIter<Cursor<Vec<u8>>>),
    Sheet(std::vec::IntoIter<Vec<String>>),
}

impl Iterator for SourceRows {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SourceRows::Csv(records) => records.next().map(|record| {
                record
                    .map(|r| r.iter().map(|cell| cell.to_string()).collect())
                    .map_err(|e| Error::EnrichmentSource(format!("csv parse error: {e}")))
            }),
            SourceRows::Sheet(rows) => rows.next().map(Ok),
        }
    }
}

/// Open the source bytes as a row iterator.
pub(crate) fn source_rows(bytes: Vec<u8>, spreadsheet: bool) -> Result<SourceRows> {
    if spreadsheet {
        let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes))
            .map_err(|e| Error::EnrichmentSource(format!("xlsx open error: {e}")))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| Error::EnrichmentSource("xlsx has no worksheets".into()))?
            .map_err(|e| Error::EnrichmentSource(format!("xlsx read error: {e}")))?;
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();
        Ok(SourceRows::Sheet(rows.into_iter()))
    } else {
        let offset = if bytes.starts_with(UTF8_BOM) { 3 } else { 0 };
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(Cursor::new(bytes[offset..].to_vec()));
        Ok(SourceRows::Csv(reader.into_records()))
    }
}

/// Finished export: kind, data-row count and encoded bytes.
pub(crate) struct ExportFile {
    pub kind: ExportKind,
    pub rows: i64,
    pub bytes: Vec<u8>,
}

/// CSV writer for one export object. The BOM and header row are written on
/// the first data row.
pub(crate) struct ExportWriter {
    kind: ExportKind,
    headers: Vec<String>,
    writer: Option<csv::Writer<Vec<u8>>>,
    rows: i64,
}

impl ExportWriter {
    pub fn new(kind: ExportKind, headers: Vec<String>) -> Self {
        Self {
            kind,
            headers,
            writer: None,
            rows: 0,
        }
    }

    pub fn write_row(&mut self, row: &[String]) -> Result<()> {
        if self.writer.is_none() {
            let mut buffer = Vec::new();
            buffer.extend_from_slice(UTF8_BOM);
            let mut writer = WriterBuilder::new().flexible(true).from_writer(buffer);
            writer
                .write_record(&self.headers)
                .map_err(|e| Error::EnrichmentSource(format!("write header: {e}")))?;
            self.writer = Some(writer);
        }
        self.writer
            .as_mut()
            .expect("writer was just initialised")
            .write_record(row)
            .map_err(|e| Error::EnrichmentSource(format!("write row: {e}")))?;
        self.rows += 1;
        Ok(())
    }

    /// Returns `None` when no data row was ever written.
    pub fn finish(self) -> Result<Option<ExportFile>> {
        let Some(writer) = self.writer else {
            return Ok(None);
        };
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::EnrichmentSource(format!("flush export: {e}")))?;
        Ok(Some(ExportFile {
            kind: self.kind,
            rows: self.rows,
            bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnMapping;

    fn meta(mime: &str, name: Option<&str>) -> SourceMeta {
        SourceMeta {
            s3_key: "uploads/test".into(),
            upload_timestamp: None,
            file_size: None,
            mime_type: mime.into(),
            file_name: name.map(|n| n.to_string()),
            column_mapping: ColumnMapping { email: 0 },
        }
    }

    #[test]
    fn detects_spreadsheets() {
        assert!(is_spreadsheet(&meta(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            None
        )));
        assert!(is_spreadsheet(&meta("application/octet-stream", Some("list.XLSX"))));
        assert!(!is_spreadsheet(&meta("text/csv", Some("list.csv"))));
    }

    #[test]
    fn csv_rows_tolerate_bom_and_ragged_rows() {
        let bytes = b"\xef\xbb\xbfemail,name\na@x.com , Alice\nb@x.com\n".to_vec();
        let rows: Vec<Vec<String>> = source_rows(bytes, false)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows[0], vec!["email", "name"]);
        assert_eq!(rows[1], vec!["a@x.com", "Alice"]);
        assert_eq!(rows[2], vec!["b@x.com"]);
    }

    #[test]
    fn export_writer_is_lazy() {
        let empty = ExportWriter::new(ExportKind::ValidOnly, vec!["email".into()]);
        assert!(empty.finish().unwrap().is_none());

        let mut writer = ExportWriter::new(ExportKind::ValidOnly, vec!["email".into(), "status".into()]);
        writer
            .write_row(&["a@x.com".to_string(), "Valid".to_string()])
            .unwrap();
        let file = writer.finish().unwrap().unwrap();
        assert_eq!(file.rows, 1);
        assert!(file.bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(file.bytes[3..].to_vec()).unwrap();
        assert_eq!(text, "email,status\na@x.com,Valid\n");
    }
}
