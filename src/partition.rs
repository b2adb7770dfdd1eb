//! Partition offset discovery from `fdisk -l` output.
//!
//! `fdisk -l` prints a semi-structured report: prose lines (disk size,
//! sector size), then a header row naming fixed-width columns, then one data
//! row per partition. The boot-flag column may be blank, so rows cannot be
//! split on whitespace; instead the header's character positions define the
//! column boundaries and each data row is sliced by them. Numeric columns
//! are right-aligned, so a field ends where its header label ends.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// A report with fewer lines than this cannot contain a partition table.
const MIN_REPORT_LINES: usize = 3;

/// One row of the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRow {
    pub device: String,
    pub boot: bool,
    pub start_sector: u64,
    pub end_sector: Option<u64>,
}

/// Parsed `fdisk -l` report: sector size plus the rows of the last table
/// header seen. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub sector_size: u64,
    pub rows: Vec<PartitionRow>,
}

impl PartitionTable {
    /// Two-pass parse: locate the column boundaries from the header row,
    /// then slice every following data row by those boundaries. A new
    /// header resets row collection.
    pub fn parse(report: &str) -> Result<Self> {
        let lines: Vec<&str> = report.lines().collect();
        if lines.len() < MIN_REPORT_LINES {
            bail!("partition report is too short ({} lines)", lines.len());
        }

        let mut sector_size = None;
        let mut columns: Option<Columns> = None;
        let mut rows = Vec::new();

        for line in &lines[1..] {
            if let Some(rest) = line.strip_prefix("Sector size") {
                sector_size = Some(parse_sector_size(rest)?);
                continue;
            }
            if line.starts_with("Device") {
                columns = Some(Columns::from_header(line)?);
                rows.clear();
                continue;
            }
            if let Some(columns) = &columns {
                if line.trim().is_empty() {
                    continue;
                }
                rows.push(columns.parse_row(line)?);
            }
        }

        let sector_size =
            sector_size.ok_or_else(|| anyhow::anyhow!("partition report has no sector size"))?;
        Ok(Self { sector_size, rows })
    }

    /// Byte offset of the partition's filesystem inside the image.
    pub fn byte_offset(&self, index: usize) -> Result<u64> {
        let row = self.rows.get(index).ok_or_else(|| {
            anyhow::anyhow!(
                "partition index {} out of range (table has {} rows)",
                index,
                self.rows.len()
            )
        })?;
        Ok(self.sector_size * row.start_sector)
    }
}

/// Run the partition inspection tool on `image` and return the byte offset
/// of partition `index`. One-shot: malformed output is fatal, never retried.
pub fn locate(image: &Path, index: usize) -> Result<u64> {
    let output = Command::new("fdisk")
        .arg("-l")
        .arg(image)
        .output()
        .with_context(|| format!("running fdisk -l on '{}'", image.display()))?;
    if !output.status.success() {
        bail!(
            "fdisk -l failed for '{}': {}",
            image.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let report = String::from_utf8_lossy(&output.stdout);
    let table = PartitionTable::parse(&report)
        .with_context(|| format!("parsing partition table of '{}'", image.display()))?;
    table.byte_offset(index)
}

/// Column boundaries derived from a header row's character positions.
#[derive(Debug, Clone)]
struct Columns {
    /// Where the `Boot` label starts; the device field ends here.
    boot_from: usize,
    /// Where the `Boot` label ends; the start field begins here.
    boot_to: usize,
    /// Where the `Start` label (and the right-aligned start field) ends.
    start_to: usize,
    /// Where the `End` label ends, when the column is present.
    end_to: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self> {
        let (boot, start) = match (header.find("Boot"), header.find("Start")) {
            (Some(boot), Some(start)) => (boot, start),
            _ => bail!("partition table header is missing Boot/Start columns: '{header}'"),
        };
        Ok(Self {
            boot_from: boot,
            boot_to: boot + "Boot".len(),
            start_to: start + "Start".len(),
            end_to: header.find("End").map(|end| end + "End".len()),
        })
    }

    fn parse_row(&self, line: &str) -> Result<PartitionRow> {
        let device = field(line, 0, self.boot_from).to_string();
        let boot = !field(line, self.boot_from, self.boot_to).is_empty();
        let start = field(line, self.boot_to, self.start_to);
        let start_sector = start
            .parse()
            .with_context(|| format!("unparseable start sector '{start}' in row '{line}'"))?;
        let end_sector = self
            .end_to
            .and_then(|end_to| field(line, self.start_to, end_to).parse().ok());
        Ok(PartitionRow {
            device,
            boot,
            start_sector,
            end_sector,
        })
    }
}

/// Bounds-clamped slice of a data row, trimmed of column padding.
fn field(line: &str, from: usize, to: usize) -> &str {
    let from = from.min(line.len());
    let to = to.clamp(from, line.len());
    line.get(from..to).unwrap_or("").trim()
}

/// Parse the remainder of a `Sector size (logical/physical): 512 bytes ...`
/// line, keeping the most recently seen value.
fn parse_sector_size(rest: &str) -> Result<u64> {
    let value = rest
        .split(':')
        .nth(1)
        .and_then(|after| after.split_whitespace().next())
        .ok_or_else(|| anyhow::anyhow!("malformed sector size line: 'Sector size{rest}'"))?;
    value
        .parse()
        .with_context(|| format!("unparseable sector size '{value}'"))
}
