use std::path::Path;

use calamine::{Data, Reader, open_workbook_auto};
use tracing::debug;

use crate::error::{CatalogError, Result};

/// First worksheet of a workbook as text cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetRows {
    pub headers: Vec<String>,
    /// One entry per data row; `None` marks a cell holding a spreadsheet error.
    pub rows: Vec<Vec<Option<String>>>,
}

pub fn read_first_sheet(path: &Path) -> Result<SheetRows> {
    let mut workbook = open_workbook_auto(path).map_err(|err| {
        CatalogError::SpreadsheetInvalid(format!("failed to open {}: {err}", path.display()))
    })?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| {
            CatalogError::SpreadsheetInvalid(format!("{} has no sheets", path.display()))
        })?;
    let range = workbook.worksheet_range(&sheet_name).map_err(|err| {
        CatalogError::SpreadsheetInvalid(format!("failed to read sheet {sheet_name}: {err}"))
    })?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .ok_or_else(|| CatalogError::SpreadsheetInvalid(format!("sheet {sheet_name} is empty")))?
        .iter()
        .map(|cell| cell_text(cell).unwrap_or_default())
        .collect::<Vec<_>>();

    let rows = rows
        .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    debug!(sheet = %sheet_name, columns = headers.len(), rows = rows.len(), "sheet loaded");
    Ok(SheetRows { headers, rows })
}

/// Trimmed display text. Whole floats print without a fraction, so a code
/// typed as `1234` reads back as `"1234"`.
pub fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Error(_) => None,
        Data::Empty => Some(String::new()),
        other => Some(other.to_string().trim().to_string()),
    }
}
