use crate::config::ColumnConfig;
use crate::types::AdminLevel;
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::io::{Read, Write};

/// Sort and replacement key of a published row. Field order gives the
/// published ordering: country, then level, then place code. Country codes
/// are upper-cased, matching the boundary store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub country_code: String,
    pub admin_level: AdminLevel,
    pub place_code: String,
}

/// One published row: its key plus every field, aligned with the table headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRow {
    pub key: RowKey,
    pub fields: Vec<String>,
}

/// The previously published per-place facility counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedTable {
    pub headers: Vec<String>,
    pub rows: Vec<PublishedRow>,
    columns: ColumnConfig,
}

impl PublishedTable {
    pub fn empty(columns: &ColumnConfig) -> Self {
        Self {
            headers: Vec::new(),
            rows: Vec::new(),
            columns: columns.clone(),
        }
    }

    pub fn columns(&self) -> &ColumnConfig {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Adds a column at the end, padding existing rows with empty fields.
    /// Returns the column's index.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.fields.push(String::new());
        }
        self.headers.len() - 1
    }

    pub fn from_csv<R: Read>(reader: R, columns: &ColumnConfig) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("Column '{}' not found in published table", name))
        };
        let country_idx = find(&columns.country_code)?;
        let level_idx = find(&columns.admin_level)?;
        let place_idx = find(&columns.place_code)?;

        let mut rows = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.with_context(|| format!("Bad published record {}", line + 1))?;
            let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
            fields.resize(headers.len(), String::new());

            let level_raw = &fields[level_idx];
            let admin_level = parse_level(level_raw).ok_or_else(|| {
                anyhow!("Invalid admin level '{}' in published record {}", level_raw, line + 1)
            })?;

            rows.push(PublishedRow {
                key: RowKey {
                    country_code: fields[country_idx].trim().to_uppercase(),
                    admin_level,
                    place_code: fields[place_idx].clone(),
                },
                fields,
            });
        }

        Ok(Self {
            headers,
            rows,
            columns: columns.clone(),
        })
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(&row.fields)?;
        }
        wtr.flush().context("Failed to flush published table")?;
        Ok(())
    }
}

// Levels come back from spreadsheet tooling as "1" or "1.0"
fn parse_level(raw: &str) -> Option<AdminLevel> {
    let raw = raw.trim();
    if let Ok(level) = raw.parse::<AdminLevel>() {
        return Some(level);
    }
    let value: f64 = raw.parse().ok()?;
    if value.fract() == 0.0 && value >= 0.0 && value <= AdminLevel::MAX as f64 {
        Some(value as AdminLevel)
    } else {
        None
    }
}
