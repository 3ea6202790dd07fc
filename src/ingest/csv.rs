//! Minimal header-driven CSV reader for the ingestion files.
//!
//! Handles RFC 4180 quoting (embedded commas, doubled quotes, quoted
//! newlines), CRLF line endings, a leading byte-order mark and blank lines.
//! Each record remembers the line it started on so rejected rows can be
//! reported against the source file.

use crate::ingest::IngestError;

#[derive(Debug, Clone, PartialEq)]
pub struct CsvRecord {
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub records: Vec<CsvRecord>,
}

impl CsvTable {
    /// Parses `text`; the first non-blank record is the header row.
    /// Header names are trimmed and lowercased.
    pub fn parse(dataset: &'static str, text: &str) -> Result<Self, IngestError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut records = parse_records(dataset, text)?.into_iter();

        let header = records.next().ok_or(IngestError::Empty { dataset })?;
        let headers = header
            .fields
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();

        Ok(CsvTable {
            headers,
            records: records.collect(),
        })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Fails with every missing column named, not just the first.
    pub fn require_columns(&self, dataset: &'static str, columns: &[&str]) -> Result<(), IngestError> {
        let missing: Vec<String> = columns
            .iter()
            .filter(|c| self.column(c).is_none())
            .map(|c| c.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IngestError::MissingColumns { dataset, columns: missing })
        }
    }

    /// The trimmed cell for `name` in `record`; `None` when the column is
    /// absent or the cell is empty.
    pub fn get<'a>(&self, record: &'a CsvRecord, name: &str) -> Option<&'a str> {
        let index = self.column(name)?;
        record
            .fields
            .get(index)
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    }
}

fn parse_records(dataset: &'static str, text: &str) -> Result<Vec<CsvRecord>, IngestError> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;

    let mut finish_record = |fields: &mut Vec<String>, record_line: usize| {
        let blank = fields.len() == 1 && fields[0].trim().is_empty();
        if !blank {
            records.push(CsvRecord {
                line: record_line,
                fields: std::mem::take(fields),
            });
        } else {
            fields.clear();
        }
    };

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push('\n');
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                finish_record(&mut fields, record_line);
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(IngestError::Csv {
            dataset,
            line: record_line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        finish_record(&mut fields, record_line);
    }

    Ok(records)
}
