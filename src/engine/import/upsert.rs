//! Row-level writes. Every function reports whether persisted state changed
//! so the importer can decide on the version bump.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::util::fold_key;

/// Incoming product values. An outer `None` means the sheet has no such
/// column and the stored value is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductRow {
    pub code: String,
    pub description: String,
    pub brand_id: Option<Option<i64>>,
    pub pgroup: Option<Option<String>>,
    pub application: Option<Option<String>>,
    pub details: Option<Option<String>>,
    pub oem: Option<Option<String>>,
    pub similar: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredProduct {
    description: String,
    brand_id: Option<i64>,
    pgroup: Option<String>,
    application: Option<String>,
    details: Option<String>,
    oem: Option<String>,
    similar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: i64,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkChange {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

impl LinkChange {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// Finds a brand by its folded name or creates it as typed.
pub fn resolve_brand(connection: &Connection, name: &str) -> Result<Resolved> {
    resolve_named(connection, "brands", name)
}

pub fn resolve_vehicle(connection: &Connection, name: &str) -> Result<Resolved> {
    resolve_named(connection, "vehicles", name)
}

fn resolve_named(connection: &Connection, table: &str, name: &str) -> Result<Resolved> {
    let key = fold_key(name);
    let select_sql = format!("SELECT id FROM {table} WHERE name_key = ?1");
    if let Some(id) = connection
        .query_row(&select_sql, [&key], |row| row.get::<_, i64>(0))
        .optional()?
    {
        return Ok(Resolved { id, created: false });
    }

    let display = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let insert_sql = format!("INSERT INTO {table}(name, name_key) VALUES(?1, ?2)");
    connection.execute(&insert_sql, params![display, key])?;
    Ok(Resolved {
        id: connection.last_insert_rowid(),
        created: true,
    })
}

/// Inserts or updates the product keyed by `code`. Returns its id and
/// whether a row was written. An existing row keeps its id.
pub fn upsert_product(connection: &Connection, row: &ProductRow) -> Result<(i64, bool)> {
    let existing = connection
        .query_row(
            "SELECT id, description, brand_id, pgroup, application, details, oem, similar
             FROM products WHERE code = ?1",
            [&row.code],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    StoredProduct {
                        description: r.get(1)?,
                        brand_id: r.get(2)?,
                        pgroup: r.get(3)?,
                        application: r.get(4)?,
                        details: r.get(5)?,
                        oem: r.get(6)?,
                        similar: r.get(7)?,
                    },
                ))
            },
        )
        .optional()?;

    let Some((id, stored)) = existing else {
        connection.execute(
            "INSERT INTO products(code, description, brand_id, pgroup, application, details, oem, similar)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.code,
                row.description,
                row.brand_id.flatten(),
                row.pgroup.clone().flatten(),
                row.application.clone().flatten(),
                row.details.clone().flatten(),
                row.oem.clone().flatten(),
                row.similar.clone().flatten(),
            ],
        )?;
        return Ok((connection.last_insert_rowid(), true));
    };

    let merged = StoredProduct {
        description: row.description.clone(),
        brand_id: row.brand_id.unwrap_or(stored.brand_id),
        pgroup: pick(&row.pgroup, &stored.pgroup),
        application: pick(&row.application, &stored.application),
        details: pick(&row.details, &stored.details),
        oem: pick(&row.oem, &stored.oem),
        similar: pick(&row.similar, &stored.similar),
    };
    if merged == stored {
        return Ok((id, false));
    }

    connection.execute(
        "UPDATE products
         SET description = ?1, brand_id = ?2, pgroup = ?3, application = ?4,
             details = ?5, oem = ?6, similar = ?7
         WHERE id = ?8",
        params![
            merged.description,
            merged.brand_id,
            merged.pgroup,
            merged.application,
            merged.details,
            merged.oem,
            merged.similar,
            id,
        ],
    )?;
    Ok((id, true))
}

fn pick(incoming: &Option<Option<String>>, stored: &Option<String>) -> Option<String> {
    match incoming {
        Some(value) => value.clone(),
        None => stored.clone(),
    }
}

/// Makes the product's vehicle links exactly `vehicle_ids`.
pub fn replace_vehicle_links(
    connection: &Connection,
    product_id: i64,
    vehicle_ids: &BTreeSet<i64>,
) -> Result<LinkChange> {
    let current = {
        let mut statement =
            connection.prepare("SELECT vehicle_id FROM product_vehicles WHERE product_id = ?1")?;
        let rows = statement.query_map([product_id], |row| row.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<BTreeSet<i64>>>()?
    };

    let mut change = LinkChange {
        total: vehicle_ids.len(),
        ..LinkChange::default()
    };

    for stale in current.difference(vehicle_ids) {
        connection.execute(
            "DELETE FROM product_vehicles WHERE product_id = ?1 AND vehicle_id = ?2",
            params![product_id, stale],
        )?;
        change.removed += 1;
    }
    for fresh in vehicle_ids.difference(&current) {
        connection.execute(
            "INSERT INTO product_vehicles(product_id, vehicle_id) VALUES(?1, ?2)",
            params![product_id, fresh],
        )?;
        change.added += 1;
    }

    Ok(change)
}
