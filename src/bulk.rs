//! Bulk transfer sources
//!
//! A bulk source turns an externally supplied batch file into an ordered
//! list of transfer lines for the scheduler. It knows nothing about the
//! pipeline beyond `TransferLine`.
//!
//! CSV layout (header names are case-insensitive, `From` is optional):
//!
//! ```text
//! From,To,Amount
//! ACC-1,ACC-2,300
//! ,ACC-3,125.50
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use rust_decimal::Decimal;
use tracing::debug;

use crate::transfer::types::TransferLine;

/// An ordered batch from one source account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkBatch {
    /// Source named by the file, if any
    pub source_account_number: Option<String>,
    pub lines: Vec<TransferLine>,
}

pub trait BulkIntentSource {
    fn load(&self) -> Result<BulkBatch>;
}

/// CSV file source
pub struct CsvBulkSource {
    path: PathBuf,
}

impl CsvBulkSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Parse CSV text from any reader
    pub fn parse<R: BufRead>(reader: R) -> Result<BulkBatch> {
        let mut rows = reader.lines();
        let header = rows
            .next()
            .ok_or_else(|| anyhow!("Empty bulk file: missing header"))??;

        let columns: Vec<String> = header
            .trim_start_matches('\u{feff}')
            .split(',')
            .map(|c| c.trim().to_ascii_lowercase())
            .collect();
        let find = |name: &str| columns.iter().position(|c| c == name);
        let to_idx = find("to").ok_or_else(|| anyhow!("Missing 'To' column"))?;
        let amount_idx = find("amount").ok_or_else(|| anyhow!("Missing 'Amount' column"))?;
        let from_idx = find("from");

        let mut source: Option<String> = None;
        let mut lines = Vec::new();

        for (i, row) in rows.enumerate() {
            let row_num = i + 2;
            let row = row.with_context(|| format!("Failed to read row {}", row_num))?;
            let fields: Vec<&str> = row.split(',').map(str::trim).collect();
            let field = |idx: usize| fields.get(idx).copied().unwrap_or("");

            let to = field(to_idx);
            let amount = field(amount_idx);
            if to.is_empty() || amount.is_empty() {
                continue;
            }

            if let Some(from) = from_idx.map(field).filter(|f| !f.is_empty()) {
                match &source {
                    None => source = Some(from.to_string()),
                    Some(existing) if existing != from => bail!(
                        "Row {}: source {} differs from batch source {}",
                        row_num,
                        from,
                        existing
                    ),
                    Some(_) => {}
                }
            }

            let amount = Decimal::from_str(amount)
                .with_context(|| format!("Invalid amount '{}' at row {}", amount, row_num))?;
            lines.push(TransferLine::new(to, amount));
        }

        debug!(lines = lines.len(), source = ?source, "Bulk batch parsed");
        Ok(BulkBatch {
            source_account_number: source,
            lines,
        })
    }
}

impl BulkIntentSource for CsvBulkSource {
    fn load(&self) -> Result<BulkBatch> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        Self::parse(BufReader::new(file))
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}
