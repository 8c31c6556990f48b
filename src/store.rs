//! Embedded catalog store: connection setup, schema, the `meta` counters and
//! the writer lock shared by every mutating operation.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{CatalogError, Result};
use crate::util::{ensure_directory, fold_key, now_utc_string};

pub const DB_FILE_NAME: &str = "catalog.db";
pub const IMAGES_DIR_NAME: &str = "images";
pub const META_DB_VERSION_KEY: &str = "db_version";
pub const META_SCHEMA_VERSION_KEY: &str = "db_schema_version";
pub const META_UPDATED_AT_KEY: &str = "updated_at";

const DB_SCHEMA_VERSION: &str = "1.0.0";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens (creating if needed) the store at `path` and brings its schema up to date.
pub fn open_store(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection.pragma_update(None, "journal_mode", "WAL")?;
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT
        );

        CREATE TABLE IF NOT EXISTS brands (
          id INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          name_key TEXT
        );

        CREATE TABLE IF NOT EXISTS vehicles (
          id INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          name_key TEXT
        );

        CREATE TABLE IF NOT EXISTS products (
          id INTEGER PRIMARY KEY,
          code TEXT NOT NULL UNIQUE,
          description TEXT NOT NULL DEFAULT '',
          brand_id INTEGER REFERENCES brands(id),
          pgroup TEXT,
          application TEXT,
          details TEXT,
          oem TEXT,
          similar TEXT
        );

        CREATE TABLE IF NOT EXISTS product_vehicles (
          product_id INTEGER NOT NULL REFERENCES products(id),
          vehicle_id INTEGER NOT NULL REFERENCES vehicles(id),
          PRIMARY KEY (product_id, vehicle_id)
        );

        CREATE TABLE IF NOT EXISTS images (
          id INTEGER PRIMARY KEY,
          product_id INTEGER NOT NULL REFERENCES products(id),
          file TEXT NOT NULL,
          UNIQUE(product_id, file)
        );
        ",
    )?;

    // Stores published by older builds lack these columns.
    rename_column_if_present(connection, "images", "filename", "file")?;
    ensure_column_exists(connection, "brands", "name_key TEXT")?;
    ensure_column_exists(connection, "vehicles", "name_key TEXT")?;
    ensure_column_exists(connection, "products", "pgroup TEXT")?;
    ensure_column_exists(connection, "products", "details TEXT")?;
    ensure_column_exists(connection, "products", "oem TEXT")?;
    ensure_column_exists(connection, "products", "similar TEXT")?;
    relax_product_brand(connection)?;
    backfill_name_keys(connection, "brands")?;
    backfill_name_keys(connection, "vehicles")?;
    merge_duplicate_names(connection, "brands", BRAND_REFERENCES)?;
    merge_duplicate_names(connection, "vehicles", VEHICLE_REFERENCES)?;

    connection.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_brands_name_key ON brands(name_key);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_vehicles_name_key ON vehicles(name_key);
        CREATE INDEX IF NOT EXISTS idx_products_code_upper ON products(UPPER(code));
        CREATE INDEX IF NOT EXISTS idx_product_vehicles_vehicle ON product_vehicles(vehicle_id);
        CREATE INDEX IF NOT EXISTS idx_images_file ON images(file);
        ",
    )?;

    connection.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES(?1, '0')",
        [META_DB_VERSION_KEY],
    )?;
    connection.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value
         WHERE meta.value IS NOT excluded.value",
        params![META_SCHEMA_VERSION_KEY, DB_SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Statements moving references from a duplicate (`?2`) to the kept row (`?1`).
const BRAND_REFERENCES: &[&str] = &["UPDATE products SET brand_id = ?1 WHERE brand_id = ?2"];
const VEHICLE_REFERENCES: &[&str] = &[
    "UPDATE OR IGNORE product_vehicles SET vehicle_id = ?1 WHERE vehicle_id = ?2",
    "DELETE FROM product_vehicles WHERE vehicle_id = ?2",
];

struct ColumnInfo {
    name: String,
    not_null: bool,
}

fn table_columns(connection: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let pragma_sql = format!("PRAGMA table_info({table_name})");
    let mut statement = connection.prepare(&pragma_sql)?;
    let columns = statement
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                not_null: row.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn ensure_column_exists(
    connection: &Connection,
    table_name: &str,
    column_definition: &str,
) -> Result<()> {
    let Some(column_name) = column_definition.split_whitespace().next() else {
        return Err(CatalogError::Store(rusqlite::Error::InvalidColumnName(
            column_definition.to_string(),
        )));
    };

    let columns = table_columns(connection, table_name)?;
    if columns.iter().any(|column| column.name == column_name) {
        return Ok(());
    }

    debug!(table = table_name, column = column_name, "adding missing column");
    let alter_sql = format!("ALTER TABLE {table_name} ADD COLUMN {column_definition}");
    connection.execute(&alter_sql, [])?;

    Ok(())
}

fn rename_column_if_present(
    connection: &Connection,
    table_name: &str,
    old_name: &str,
    new_name: &str,
) -> Result<()> {
    let columns = table_columns(connection, table_name)?;
    let has = |name: &str| columns.iter().any(|column| column.name == name);
    if !has(old_name) || has(new_name) {
        return Ok(());
    }

    debug!(table = table_name, from = old_name, to = new_name, "renaming column");
    let alter_sql = format!("ALTER TABLE {table_name} RENAME COLUMN {old_name} TO {new_name}");
    connection.execute(&alter_sql, [])?;
    Ok(())
}

/// Older stores declare `products.brand_id NOT NULL`; a blank brand must be storable.
fn relax_product_brand(connection: &Connection) -> Result<()> {
    let columns = table_columns(connection, "products")?;
    let brand_required = columns
        .iter()
        .any(|column| column.name == "brand_id" && column.not_null);
    if !brand_required {
        return Ok(());
    }

    // Table rebuilds must not trip foreign keys half way; the setting cannot
    // change inside a transaction, so it is toggled around it.
    let foreign_keys: i64 = connection.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    connection.pragma_update(None, "foreign_keys", "OFF")?;
    let rebuilt = connection.execute_batch(
        "
        BEGIN;
        CREATE TABLE products_rebuilt (
          id INTEGER PRIMARY KEY,
          code TEXT NOT NULL UNIQUE,
          description TEXT NOT NULL DEFAULT '',
          brand_id INTEGER REFERENCES brands(id),
          pgroup TEXT,
          application TEXT,
          details TEXT,
          oem TEXT,
          similar TEXT
        );
        INSERT INTO products_rebuilt(
          id, code, description, brand_id, pgroup, application, details, oem, similar
        )
        SELECT id, code, description, brand_id, pgroup, application, details, oem, similar
        FROM products;
        DROP TABLE products;
        ALTER TABLE products_rebuilt RENAME TO products;
        COMMIT;
        ",
    );
    if rebuilt.is_err() && !connection.is_autocommit() {
        connection.execute_batch("ROLLBACK")?;
    }
    connection.pragma_update(None, "foreign_keys", foreign_keys)?;
    rebuilt?;

    debug!("products.brand_id made nullable");
    Ok(())
}

/// Folds rows whose names only differ by case or accents into the lowest id,
/// so the unique `name_key` index can be built.
fn merge_duplicate_names(
    connection: &Connection,
    table_name: &str,
    references: &[&str],
) -> Result<()> {
    let groups_sql = format!(
        "SELECT name_key, MIN(id) FROM {table_name}
         WHERE name_key IS NOT NULL
         GROUP BY name_key HAVING COUNT(*) > 1"
    );
    let groups = {
        let mut statement = connection.prepare(&groups_sql)?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    if groups.is_empty() {
        return Ok(());
    }

    let tx = connection.unchecked_transaction()?;
    let mut merged = 0usize;
    {
        let duplicates_sql =
            format!("SELECT id FROM {table_name} WHERE name_key = ?1 AND id <> ?2");
        let delete_sql = format!("DELETE FROM {table_name} WHERE id = ?1");
        let mut duplicates = tx.prepare(&duplicates_sql)?;
        let mut delete = tx.prepare(&delete_sql)?;

        for (name_key, keep_id) in &groups {
            let ids = duplicates
                .query_map(params![name_key, keep_id], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for duplicate_id in ids {
                for sql in references {
                    tx.execute(sql, params![keep_id, duplicate_id])?;
                }
                delete.execute(params![duplicate_id])?;
                merged += 1;
            }
        }
    }
    tx.commit()?;
    debug!(table = table_name, rows = merged, "merged duplicate names");

    Ok(())
}

fn backfill_name_keys(connection: &Connection, table_name: &str) -> Result<()> {
    let select_sql = format!("SELECT id, name FROM {table_name} WHERE name_key IS NULL");
    let pending = {
        let mut statement = connection.prepare(&select_sql)?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    if pending.is_empty() {
        return Ok(());
    }

    let update_sql = format!("UPDATE {table_name} SET name_key = ?1 WHERE id = ?2");
    let mut statement = connection.prepare(&update_sql)?;
    for (id, name) in &pending {
        statement.execute(params![fold_key(name), id])?;
    }
    debug!(table = table_name, rows = pending.len(), "backfilled name keys");

    Ok(())
}

pub fn read_meta(connection: &Connection, key: &str) -> Result<Option<String>> {
    let value = connection
        .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()?;
    Ok(value.flatten())
}

pub fn write_meta(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Local dataset generation counter; 0 when never set.
pub fn read_db_version(connection: &Connection) -> Result<i64> {
    let version = connection
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM meta WHERE key = ?1",
            [META_DB_VERSION_KEY],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?;
    Ok(version.flatten().unwrap_or(0))
}

pub fn write_db_version(connection: &Connection, version: i64) -> Result<()> {
    write_meta(connection, META_DB_VERSION_KEY, &version.to_string())?;
    write_meta(connection, META_UPDATED_AT_KEY, &now_utc_string())
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

/// `catalog.db` + `-wal` gives `catalog.db-wal`.
pub fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Advisory exclusive lock on `<store>.lock`, held for a write phase.
///
/// Released when dropped.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Blocks until the lock is free.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let (file, path) = open_lock_file(db_path)?;
        FileExt::lock_exclusive(&file)?;
        debug!(path = %path.display(), "store lock acquired");
        Ok(Self { file, path })
    }

    pub fn try_acquire(db_path: &Path) -> Result<Self> {
        let (file, path) = open_lock_file(db_path)?;
        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(CatalogError::StoreLocked(path.display().to_string()));
        }
        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if FileExt::unlock(&self.file).is_ok() {
            debug!(path = %self.path.display(), "store lock released");
        }
    }
}

fn open_lock_file(db_path: &Path) -> Result<(File, PathBuf)> {
    if let Some(parent) = db_path.parent() {
        ensure_directory(parent)?;
    }
    let path = sidecar_path(db_path, ".lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    Ok((file, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_starts_at_version_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_store(&dir.path().join("catalog.db")).expect("open store");

        assert_eq!(read_db_version(&conn).expect("version"), 0);
        assert_eq!(
            read_meta(&conn, META_SCHEMA_VERSION_KEY).expect("meta"),
            Some(DB_SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn write_db_version_round_trips_and_stamps_update_time() {
        let conn = Connection::open_in_memory().expect("memory db");
        ensure_schema(&conn).expect("schema");

        write_db_version(&conn, 25012518).expect("write version");

        assert_eq!(read_db_version(&conn).expect("version"), 25012518);
        assert!(read_meta(&conn, META_UPDATED_AT_KEY).expect("meta").is_some());
    }

    #[test]
    fn ensure_schema_upgrades_older_layout_and_backfills_keys() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "
            CREATE TABLE brands (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
            CREATE TABLE products (
              id INTEGER PRIMARY KEY, brand_id INTEGER, code TEXT NOT NULL UNIQUE,
              description TEXT NOT NULL, application TEXT
            );
            INSERT INTO brands(id, name) VALUES (1, 'Genérico');
            ",
        )
        .expect("legacy schema");

        ensure_schema(&conn).expect("upgrade");

        let key: String = conn
            .query_row("SELECT name_key FROM brands WHERE id = 1", [], |row| {
                row.get(0)
            })
            .expect("name key");
        assert_eq!(key, "GENERICO");
        conn.execute(
            "UPDATE products SET oem = 'x', similar = 'y', details = 'z', pgroup = 'g'",
            [],
        )
        .expect("new product columns exist");
    }

    const FIRST_RELEASE_SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT);
        CREATE TABLE IF NOT EXISTS brands (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
        CREATE TABLE IF NOT EXISTS vehicles (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
        CREATE TABLE IF NOT EXISTS products (
          id INTEGER PRIMARY KEY, brand_id INTEGER NOT NULL, code TEXT NOT NULL UNIQUE,
          description TEXT NOT NULL, application TEXT, details TEXT, oem TEXT, similar TEXT, pgroup TEXT,
          FOREIGN KEY(brand_id) REFERENCES brands(id)
        );
        CREATE TABLE IF NOT EXISTS product_vehicles (
          product_id INTEGER NOT NULL, vehicle_id INTEGER NOT NULL,
          PRIMARY KEY (product_id, vehicle_id)
        );
        CREATE TABLE IF NOT EXISTS images (
          id INTEGER PRIMARY KEY, product_id INTEGER NOT NULL, filename TEXT NOT NULL,
          UNIQUE(product_id, filename)
        );
    ";

    #[test]
    fn first_release_store_opens_and_is_migrated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("catalog.db");
        {
            let conn = Connection::open(&db_path).expect("legacy store");
            conn.execute_batch(FIRST_RELEASE_SCHEMA).expect("legacy schema");
            conn.execute_batch(
                "
                INSERT INTO meta(key, value) VALUES ('db_version', '12');
                INSERT INTO brands(id, name) VALUES (1, 'Acme'), (2, 'ACME'), (3, 'Bosch');
                INSERT INTO vehicles(id, name) VALUES (1, 'Gol'), (2, 'GOL'), (3, 'Uno');
                INSERT INTO products(id, brand_id, code, description)
                  VALUES (10, 2, 'ABC123', 'Pastilha'), (11, 3, 'XYZ9', 'Disco');
                INSERT INTO product_vehicles(product_id, vehicle_id)
                  VALUES (10, 1), (10, 2), (11, 2), (11, 3);
                INSERT INTO images(product_id, filename) VALUES (10, 'ABC123.png');
                ",
            )
            .expect("legacy rows");
        }

        let conn = open_store(&db_path).expect("open legacy store");

        assert_eq!(read_db_version(&conn).expect("version"), 12);
        assert_eq!(count_rows(&conn, "SELECT COUNT(*) FROM brands").expect("brands"), 2);
        assert_eq!(count_rows(&conn, "SELECT COUNT(*) FROM vehicles").expect("vehicles"), 2);
        let brand: i64 = conn
            .query_row("SELECT brand_id FROM products WHERE id = 10", [], |row| {
                row.get(0)
            })
            .expect("brand");
        assert_eq!(brand, 1);

        let links: Vec<(i64, i64)> = {
            let mut statement = conn
                .prepare("SELECT product_id, vehicle_id FROM product_vehicles ORDER BY 1, 2")
                .expect("prepare");
            statement
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .expect("links")
                .collect::<rusqlite::Result<Vec<_>>>()
                .expect("collect")
        };
        assert_eq!(links, vec![(10, 1), (11, 1), (11, 3)]);

        let file: String = conn
            .query_row("SELECT file FROM images WHERE product_id = 10", [], |row| {
                row.get(0)
            })
            .expect("renamed image column");
        assert_eq!(file, "ABC123.png");

        conn.execute(
            "INSERT INTO products(code, description, brand_id) VALUES ('NOBRAND', '', NULL)",
            [],
        )
        .expect("blank brand accepted");
        assert_eq!(
            count_rows(&conn, "SELECT COUNT(*) FROM products WHERE id = 10").expect("kept id"),
            1
        );
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("memory db");
        ensure_schema(&conn).expect("first");
        write_db_version(&conn, 7).expect("version");
        ensure_schema(&conn).expect("second");

        assert_eq!(read_db_version(&conn).expect("version"), 7);
    }

    #[test]
    fn store_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("catalog.db");

        let held = StoreLock::acquire(&db_path).expect("first lock");
        assert!(matches!(
            StoreLock::try_acquire(&db_path),
            Err(CatalogError::StoreLocked(_))
        ));

        drop(held);
        StoreLock::try_acquire(&db_path).expect("lock after release");
    }

    #[test]
    fn sidecar_path_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/data/catalog.db"), "-wal"),
            PathBuf::from("/data/catalog.db-wal")
        );
    }
}
