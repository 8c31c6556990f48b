//! Spreadsheet import: header resolution, row normalization, and the
//! transactional upsert of brands, vehicles, products, and their links.

mod headers;
mod tokenize;
mod upsert;
mod workbook;


use std::collections::BTreeSet;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{CatalogError, Result};
use crate::model::ImportReport;
use crate::store::{read_db_version, write_db_version};

pub use workbook::{SheetRows, read_first_sheet};

use headers::{ColumnMap, resolve_columns};
use tokenize::{VehicleTokenizer, vehicle_list};

use upsert::{ProductRow, replace_vehicle_links, resolve_brand, resolve_vehicle, upsert_product};

/// Imports an already-loaded sheet into the store as one transaction.
///
/// `db_version` moves by exactly one when any row changed persisted state and
/// stays put otherwise. A store failure rolls every row back.
pub fn import_sheet(connection: &mut Connection, sheet: &SheetRows) -> Result<ImportReport> {
    let columns = resolve_columns(&sheet.headers)?;
    let tokenizer = VehicleTokenizer::new()?;

    let tx = connection
        .transaction()
        .map_err(|err| CatalogError::ImportTransactionFailed(err.to_string()))?;

    let report = apply_rows(&tx, &columns, &tokenizer, sheet).map_err(into_transaction_failure)?;
    tx.commit()
        .map_err(|err| CatalogError::ImportTransactionFailed(err.to_string()))?;

    info!(
        processed = report.processed_rows,
        skipped = report.skipped_rows,
        upserted = report.upserted_products,
        linked = report.linked_vehicles,
        db_version = report.new_db_version,
        "import committed"
    );
    Ok(report)
}

fn apply_rows(
    connection: &Connection,
    columns: &ColumnMap,
    tokenizer: &VehicleTokenizer,
    sheet: &SheetRows,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut changed = false;

    for (index, cells) in sheet.rows.iter().enumerate() {
        report.processed_rows += 1;
        // Sheet row number as a person would read it, header on row 1.
        let row_number = index + 2;

        let parsed = match parse_row(columns, tokenizer, cells, row_number) {
            Ok(parsed) => parsed,
            Err(skip) => {
                warn!(error = %skip, "import row skipped");
                report.skipped_rows += 1;
                continue;
            }
        };

        let brand_id = match &parsed.brand {
            None => None,
            Some(None) => Some(None),
            Some(Some(name)) => {
                let brand = resolve_brand(connection, name)?;
                changed |= brand.created;
                Some(Some(brand.id))
            }
        };

        let product = ProductRow {
            brand_id,
            ..parsed.product
        };
        let (product_id, written) = upsert_product(connection, &product)?;
        changed |= written;
        report.upserted_products += 1;

        if let Some(names) = parsed.vehicles {
            let mut vehicle_ids = BTreeSet::new();
            for name in &names {
                let vehicle = resolve_vehicle(connection, name)?;
                changed |= vehicle.created;
                vehicle_ids.insert(vehicle.id);
            }
            let links = replace_vehicle_links(connection, product_id, &vehicle_ids)?;
            changed |= links.changed();
            report.linked_vehicles += links.total;
            debug!(
                code = %product.code,
                added = links.added,
                removed = links.removed,
                "vehicle links updated"
            );
        }
    }

    let current = read_db_version(connection)?;
    report.new_db_version = if changed {
        let next = current + 1;
        write_db_version(connection, next)?;
        next
    } else {
        current
    };

    Ok(report)
}

struct ParsedRow {
    product: ProductRow,
    /// Outer `None`: no brand column.
    brand: Option<Option<String>>,
    /// `None` when the sheet carries neither a vehicles nor an application column.
    vehicles: Option<Vec<String>>,
}

fn parse_row(
    columns: &ColumnMap,
    tokenizer: &VehicleTokenizer,
    cells: &[Option<String>],
    row_number: usize,
) -> std::result::Result<ParsedRow, CatalogError> {
    let skip = |reason: String| CatalogError::ImportRowSkipped {
        row: row_number,
        reason,
    };

    let code = required_cell(cells, columns.code)
        .ok_or_else(|| skip("unreadable code cell".to_string()))?;
    if code.is_empty() {
        return Err(skip("blank code".to_string()));
    }
    let description = required_cell(cells, columns.description)
        .ok_or_else(|| skip(format!("unreadable description for code {code}")))?;

    let optional = |position: Option<usize>, label: &str| {
        optional_cell(cells, position)
            .map_err(|()| skip(format!("unreadable {label} cell for code {code}")))
    };

    let brand = optional(columns.brand, "brand")?;
    let pgroup = optional(columns.group, "group")?;
    let application = optional(columns.application, "application")?;
    let vehicles_cell = optional(columns.vehicles, "vehicles")?;
    let details = optional(columns.details, "details")?;
    let oem = optional(columns.oem, "oem")?;
    let similar = optional(columns.similar, "similar")?;

    let vehicles = match (&vehicles_cell, &application) {
        (Some(list), _) => Some(list.as_deref().map(vehicle_list).unwrap_or_default()),
        (None, Some(text)) => Some(
            text.as_deref()
                .map(|text| tokenizer.vehicle_tokens(text))
                .unwrap_or_default(),
        ),
        (None, None) => None,
    };

    Ok(ParsedRow {
        product: ProductRow {
            code: code.to_string(),
            description: description.to_string(),
            brand_id: None,
            pgroup,
            application,
            details,
            oem,
            similar,
        },
        brand,
        vehicles,
    })
}

/// A missing trailing cell reads as blank; a spreadsheet error as `None`.
fn required_cell(cells: &[Option<String>], position: usize) -> Option<&str> {
    match cells.get(position) {
        None => Some(""),
        Some(cell) => cell.as_deref().map(str::trim),
    }
}

/// `Ok(None)`: column absent. `Ok(Some(None))`: present but blank.
fn optional_cell(
    cells: &[Option<String>],
    position: Option<usize>,
) -> std::result::Result<Option<Option<String>>, ()> {
    let Some(position) = position else {
        return Ok(None);
    };
    match required_cell(cells, position) {
        None => Err(()),
        Some("") => Ok(Some(None)),
        Some(value) => Ok(Some(Some(value.to_string()))),
    }
}

fn into_transaction_failure(err: CatalogError) -> CatalogError {
    match err {
        CatalogError::ImportTransactionFailed(_) => err,
        other => CatalogError::ImportTransactionFailed(other.to_string()),
    }
}
