use popbls_core::BlsRecord;
use tracing::warn;

use crate::SourceError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlsTable {
    pub records: Vec<BlsRecord>,
    /// Data lines that could not be parsed (bad year/value, too few columns).
    pub skipped_lines: usize,
}

/// Parse a BLS `*.data.*` time-series file.
///
/// The upstream file is tab-separated and pads both header names and cells
/// with spaces (`series_id        `, `       value`), so every field is
/// trimmed before use.
pub fn parse_bls_table(bytes: &[u8]) -> Result<BlsTable, SourceError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header = lines.next().ok_or(SourceError::Empty)?;
    let columns: Vec<&str> = header.split('\t').map(str::trim).collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SourceError::MissingColumn(name.to_string()))
    };
    let series_idx = column("series_id")?;
    let year_idx = column("year")?;
    let period_idx = column("period")?;
    let value_idx = column("value")?;
    let footnote_idx = columns.iter().position(|c| *c == "footnote_codes");

    let mut table = BlsTable::default();
    for (line_no, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split('\t').map(str::trim).collect();
        let cell = |idx: usize| cells.get(idx).copied();

        let parsed = (|| {
            let series_id = cell(series_idx).filter(|s| !s.is_empty())?;
            let year = cell(year_idx)?.parse::<i32>().ok()?;
            let period = cell(period_idx).filter(|s| !s.is_empty())?;
            let value = cell(value_idx)?.parse::<f64>().ok()?;
            let footnote_codes = footnote_idx
                .and_then(cell)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(BlsRecord {
                series_id: series_id.to_string(),
                year,
                period: period.to_string(),
                value,
                footnote_codes,
            })
        })();

        match parsed {
            Some(record) => table.records.push(record),
            None => {
                warn!(line = line_no + 2, "skipping malformed bls row");
                table.skipped_lines += 1;
            }
        }
    }
    Ok(table)
}
