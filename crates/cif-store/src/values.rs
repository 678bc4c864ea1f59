//! Value-tree persistence.
//!
//! A value is one row; list and table elements are child rows linked through
//! `parent_id` and ordered by `seq`. Children are exclusively owned by their
//! parent, so deleting the root row cascades the whole tree.

use cif_model::{CharValue, CifError, NormName, NumberValue, Result, Table, TableEntry, Value};
use rusqlite::{Connection, OptionalExtension, params};

fn kind_code(v: &Value) -> i64 {
    match v {
        Value::Unknown => 0,
        Value::NotApplicable => 1,
        Value::Char(_) => 2,
        Value::Number(_) => 3,
        Value::List(_) => 4,
        Value::Table(_) => 5,
    }
}

fn db_err(e: rusqlite::Error) -> CifError {
    CifError::Storage(e.to_string())
}

/// Write `value` as a top-level row bound to (`packet_id`, `name`).
pub(crate) fn write(conn: &Connection, packet_id: i64, name: &str, value: &Value) -> Result<()> {
    write_row(conn, Some(packet_id), Some(name), None, None, None, value).map(|_| ())
}

fn write_row(
    conn: &Connection,
    packet_id: Option<i64>,
    name: Option<&str>,
    parent_id: Option<i64>,
    seq: Option<i64>,
    tkey: Option<(&str, &str)>,
    value: &Value,
) -> Result<i64> {
    let (text, quoted, num_value, num_su): (Option<&str>, Option<bool>, Option<f64>, Option<&str>) =
        match value {
            Value::Char(CharValue { text, quoted }) => (Some(text), Some(*quoted), None, None),
            Value::Number(NumberValue {
                text,
                value,
                su_digits,
            }) => (Some(text), None, Some(*value), su_digits.as_deref()),
            _ => (None, None, None, None),
        };
    let (tkey_norm, tkey_orig) = match tkey {
        Some((n, o)) => (Some(n), Some(o)),
        None => (None, None),
    };

    conn.prepare_cached(crate::sql::INSERT_VALUE)
        .map_err(db_err)?
        .execute(params![
            packet_id,
            name,
            parent_id,
            seq,
            kind_code(value),
            text,
            quoted,
            num_value,
            num_su,
            tkey_norm,
            tkey_orig,
        ])
        .map_err(db_err)?;
    let id = conn.last_insert_rowid();

    match value {
        Value::List(elements) => {
            for (i, element) in elements.iter().enumerate() {
                write_row(conn, None, None, Some(id), Some(i as i64), None, element)?;
            }
        }
        Value::Table(entries) => {
            for (i, (key, entry)) in entries.iter().enumerate() {
                write_row(
                    conn,
                    None,
                    None,
                    Some(id),
                    Some(i as i64),
                    Some((key.as_str(), &entry.key_orig)),
                    &entry.value,
                )?;
            }
        }
        _ => {}
    }

    Ok(id)
}

/// Load the value bound to (`packet_id`, `name`), if any. The returned value
/// is an owned copy.
pub(crate) fn read(conn: &Connection, packet_id: i64, name: &str) -> Result<Option<Value>> {
    let row = conn
        .prepare_cached(crate::sql::GET_VALUE)
        .map_err(db_err)?
        .query_row(params![packet_id, name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<bool>>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .optional()
        .map_err(db_err)?;

    match row {
        None => Ok(None),
        Some((id, kind, text, quoted, num_value, num_su)) => {
            Ok(Some(load(conn, id, kind, text, quoted, num_value, num_su)?))
        }
    }
}

/// Delete the value bound to (`packet_id`, `name`); child rows cascade.
pub(crate) fn delete(conn: &Connection, packet_id: i64, name: &str) -> Result<()> {
    conn.prepare_cached(crate::sql::DELETE_VALUE)
        .map_err(db_err)?
        .execute(params![packet_id, name])
        .map_err(db_err)?;
    Ok(())
}

fn load(
    conn: &Connection,
    id: i64,
    kind: i64,
    text: Option<String>,
    quoted: Option<bool>,
    num_value: Option<f64>,
    num_su: Option<String>,
) -> Result<Value> {
    let corrupt = || CifError::Internal(format!("malformed value row {id}"));
    match kind {
        0 => Ok(Value::Unknown),
        1 => Ok(Value::NotApplicable),
        2 => Ok(Value::Char(CharValue {
            text: text.ok_or_else(corrupt)?,
            quoted: quoted.unwrap_or(true),
        })),
        3 => Ok(Value::Number(NumberValue {
            text: text.ok_or_else(corrupt)?,
            value: num_value.ok_or_else(corrupt)?,
            su_digits: num_su,
        })),
        4 => {
            let mut elements = Vec::new();
            for child in children(conn, id)? {
                elements.push(load(
                    conn, child.id, child.kind, child.text, child.quoted, child.num_value,
                    child.num_su,
                )?);
            }
            Ok(Value::List(elements))
        }
        5 => {
            let mut entries = Table::default();
            for child in children(conn, id)? {
                let key = child.tkey.clone().ok_or_else(corrupt)?;
                let key_orig = child.tkey_orig.clone().ok_or_else(corrupt)?;
                let value = load(
                    conn, child.id, child.kind, child.text, child.quoted, child.num_value,
                    child.num_su,
                )?;
                entries.insert(NormName::from(key), TableEntry { key_orig, value });
            }
            Ok(Value::Table(entries))
        }
        other => Err(CifError::Internal(format!("unknown value kind {other}"))),
    }
}

struct ChildRow {
    id: i64,
    kind: i64,
    text: Option<String>,
    quoted: Option<bool>,
    num_value: Option<f64>,
    num_su: Option<String>,
    tkey: Option<String>,
    tkey_orig: Option<String>,
}

fn children(conn: &Connection, parent: i64) -> Result<Vec<ChildRow>> {
    let mut stmt = conn
        .prepare_cached(crate::sql::GET_CHILD_VALUES)
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![parent], |row| {
            Ok(ChildRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                text: row.get(2)?,
                quoted: row.get(3)?,
                num_value: row.get(4)?,
                num_su: row.get(5)?,
                tkey: row.get(6)?,
                tkey_orig: row.get(7)?,
            })
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}
