use super::db::not_found;
use crate::models::{now_ts, Image};
use crate::{ControlError, Result};
use rusqlite::{params, Connection, Row};

const COLUMNS: &str = "id, name, os_type, os_version, architecture, provider_type, \
     instance_type, url, status, description, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        name: row.get(1)?,
        os_type: row.get(2)?,
        os_version: row.get(3)?,
        architecture: row.get(4)?,
        provider_type: row.get(5)?,
        instance_type: row.get(6)?,
        url: row.get(7)?,
        status: row.get(8)?,
        description: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn insert(conn: &Connection, image: &Image) -> Result<i64> {
    conn.execute(
        "INSERT INTO system_images (name, os_type, os_version, architecture, provider_type,
            instance_type, url, status, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            image.name,
            image.os_type,
            image.os_version,
            image.architecture,
            image.provider_type,
            image.instance_type,
            image.url,
            image.status,
            image.description,
            now_ts()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Image> {
    let sql = format!("SELECT {COLUMNS} FROM system_images WHERE id = ?1");
    not_found(conn.query_row(&sql, [id], from_row), || {
        ControlError::ImageNotFound(id.to_string())
    })
}

pub fn list(conn: &Connection) -> Result<Vec<Image>> {
    let sql = format!("SELECT {COLUMNS} FROM system_images ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

