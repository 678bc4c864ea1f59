//! Transactional container store for the CIF data model.
//!
//! One [`Cif`] owns one in-memory SQLite database holding data blocks, save
//! frames, loops, packets, and value trees. Every mutating operation runs in
//! a transaction that rolls back on any failed step, so partial writes are
//! never observable. Foreign keys are verified enabled at creation; cascades
//! implement the ownership rules (destroying a container takes its frames,
//! loops, packets, and values with it).
//!
//! Callers hold plain-data handles ([`Container`], [`Loop`]) carrying an
//! `(id, generation)` pair. A handle whose target was destroyed, or that was
//! minted by a different store, fails with `InvalidHandle` rather than
//! touching unrelated rows.

use std::cell::Cell;

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::debug;

use cif_model::{CifError, ItemName, NormName, Packet, Result, Value};

mod sql;
mod values;

/// The scope key used for blocks in the per-scope uniqueness index (frames
/// use the parent container id).
const ROOT_SCOPE: i64 = -1;

fn db_err(e: rusqlite::Error) -> CifError {
    CifError::Storage(e.to_string())
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

/// Handle to a data block or save frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    id: i64,
    r#gen: i64,
    parent: Option<i64>,
    pub code: NormName,
    pub code_orig: String,
}

impl Container {
    pub fn is_frame(&self) -> bool {
        self.parent.is_some()
    }
}

/// Handle to a loop. The distinguished scalar loop of a container has the
/// empty category and carries that container's single-packet items.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    id: i64,
    r#gen: i64,
    container_id: i64,
    pub category: Option<String>,
}

impl Loop {
    pub fn is_scalar(&self) -> bool {
        self.category.as_deref() == Some("")
    }
}

pub struct Cif {
    conn: Connection,
    next_gen: Cell<i64>,
}

impl Cif {
    /// Open a fresh store: temporary in-memory database, foreign keys
    /// verified enabled, schema created in one transaction.
    pub fn create() -> Result<Cif> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CifError::Environment(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| CifError::Environment(e.to_string()))?;
        let fks: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(|e| CifError::Environment(e.to_string()))?;
        if fks != 1 {
            return Err(CifError::Environment(
                "foreign key enforcement is unavailable".to_string(),
            ));
        }

        {
            let tx = conn.unchecked_transaction().map_err(db_err)?;
            tx.execute_batch(sql::SCHEMA)
                .map_err(|e| CifError::Environment(e.to_string()))?;
            tx.commit().map_err(db_err)?;
        }

        debug!(target: "store", "created in-memory cif store");
        Ok(Cif {
            conn,
            next_gen: Cell::new(1),
        })
    }

    fn fresh_gen(&self) -> i64 {
        let g = self.next_gen.get();
        self.next_gen.set(g + 1);
        g
    }

    // --- containers -----------------------------------------------------

    pub fn create_block(&self, code: &str) -> Result<Container> {
        let norm = NormName::block_code(code)?;
        self.insert_container(None, norm, code)
    }

    pub fn create_frame(&self, block: &Container, code: &str) -> Result<Container> {
        if block.is_frame() {
            return Err(CifError::Argument(
                "save frames cannot contain save frames".to_string(),
            ));
        }
        self.check_container(block)?;
        let norm = NormName::frame_code(code)?;
        self.insert_container(Some(block.id), norm, code)
    }

    fn insert_container(
        &self,
        parent: Option<i64>,
        norm: NormName,
        orig: &str,
    ) -> Result<Container> {
        let r#gen = self.fresh_gen();
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        let outcome = tx
            .prepare_cached(sql::INSERT_CONTAINER)
            .map_err(db_err)?
            .execute(params![r#gen, parent, norm.as_str(), orig]);
        match outcome {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit().map_err(db_err)?;
                Ok(Container {
                    id,
                    r#gen,
                    parent,
                    code: norm,
                    code_orig: orig.to_string(),
                })
            }
            Err(e) if is_constraint(&e) => Err(CifError::DuplicateCode(orig.to_string())),
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn block(&self, code: &str) -> Result<Container> {
        self.find_container(ROOT_SCOPE, None, code)
            .and_then(|c| c.ok_or_else(|| CifError::NoSuchBlock(code.to_string())))
    }

    pub fn frame(&self, block: &Container, code: &str) -> Result<Container> {
        self.check_container(block)?;
        self.find_container(block.id, Some(block.id), code)
            .and_then(|c| c.ok_or_else(|| CifError::NoSuchFrame(code.to_string())))
    }

    fn find_container(
        &self,
        scope: i64,
        parent: Option<i64>,
        code: &str,
    ) -> Result<Option<Container>> {
        let norm = NormName::of(code);
        let row = self
            .conn
            .prepare_cached(sql::GET_CONTAINER)
            .map_err(db_err)?
            .query_row(params![scope, norm.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })
            .optional()
            .map_err(db_err)?;
        Ok(row.map(|(id, r#gen, code_orig)| Container {
            id,
            r#gen,
            parent,
            code: norm,
            code_orig,
        }))
    }

    /// All data blocks, in creation order.
    pub fn blocks(&self) -> Result<Vec<Container>> {
        self.list_containers(ROOT_SCOPE, None)
    }

    /// All save frames of `block`, in creation order.
    pub fn frames(&self, block: &Container) -> Result<Vec<Container>> {
        self.check_container(block)?;
        self.list_containers(block.id, Some(block.id))
    }

    fn list_containers(&self, scope: i64, parent: Option<i64>) -> Result<Vec<Container>> {
        let mut stmt = self
            .conn
            .prepare_cached(sql::GET_ALL_CONTAINERS)
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![scope], |row| {
                Ok(Container {
                    id: row.get(0)?,
                    r#gen: row.get(1)?,
                    parent,
                    code: NormName::from(row.get::<_, String>(2)?),
                    code_orig: row.get(3)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn check_container(&self, c: &Container) -> Result<()> {
        let found: Option<i64> = self
            .conn
            .prepare_cached(sql::CHECK_CONTAINER)
            .map_err(db_err)?
            .query_row(params![c.id, c.r#gen], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        match found {
            Some(_) => Ok(()),
            None => Err(CifError::InvalidHandle),
        }
    }

    /// Destroy a container and, by cascade, all its frames, loops, packets,
    /// and values.
    pub fn destroy(&self, container: Container) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        let n = tx
            .prepare_cached(sql::DELETE_CONTAINER)
            .map_err(db_err)?
            .execute(params![container.id, container.r#gen])
            .map_err(db_err)?;
        if n == 0 {
            return Err(CifError::InvalidHandle);
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    // --- loops ----------------------------------------------------------

    /// Create a loop over `names` (all of which must be absent from the
    /// container). The loop starts with no packets.
    pub fn create_loop(
        &self,
        container: &Container,
        category: Option<&str>,
        names: &[&str],
    ) -> Result<Loop> {
        if names.is_empty() && category != Some("") {
            return Err(CifError::Argument(
                "a loop requires at least one data name".to_string(),
            ));
        }
        let mut checked = Vec::with_capacity(names.len());
        for name in names {
            checked.push(ItemName::checked(name)?);
        }
        self.check_container(container)?;

        let r#gen = self.fresh_gen();
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        tx.prepare_cached(sql::INSERT_LOOP)
            .map_err(db_err)?
            .execute(params![r#gen, container.id, category])
            .map_err(db_err)?;
        let loop_id = tx.last_insert_rowid();
        for (seq, name) in checked.iter().enumerate() {
            let outcome = tx
                .prepare_cached(sql::INSERT_LOOP_ITEM)
                .map_err(db_err)?
                .execute(params![
                    loop_id,
                    container.id,
                    name.norm.as_str(),
                    name.orig,
                    seq as i64
                ]);
            match outcome {
                Ok(_) => {}
                Err(e) if is_constraint(&e) => {
                    return Err(CifError::DuplicateCode(name.orig.clone()));
                }
                Err(e) => return Err(db_err(e)),
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(Loop {
            id: loop_id,
            r#gen,
            container_id: container.id,
            category: category.map(str::to_string),
        })
    }

    /// Assign a category tag. The scalar loop's empty category is fixed.
    pub fn set_category(&self, lp: &mut Loop, category: &str) -> Result<()> {
        if lp.is_scalar() || category.is_empty() {
            return Err(CifError::Argument(
                "the scalar loop category is reserved".to_string(),
            ));
        }
        let n = self
            .conn
            .prepare_cached(sql::SET_LOOP_CATEGORY)
            .map_err(db_err)?
            .execute(params![lp.id, lp.r#gen, category])
            .map_err(db_err)?;
        if n == 0 {
            return Err(CifError::InvalidHandle);
        }
        lp.category = Some(category.to_string());
        Ok(())
    }

    /// Add a data name to an existing loop, binding `default` in every packet
    /// the loop already has.
    pub fn add_loop_item(&self, lp: &Loop, name: &str, default: &Value) -> Result<()> {
        let item = ItemName::checked(name)?;
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        let container_id: i64 = tx
            .prepare_cached(sql::CHECK_LOOP)
            .map_err(db_err)?
            .query_row(params![lp.id, lp.r#gen], |row| row.get(0))
            .optional()
            .map_err(db_err)?
            .ok_or(CifError::InvalidHandle)?;
        let seq: i64 = tx
            .prepare_cached(sql::NEXT_ITEM_SEQ)
            .map_err(db_err)?
            .query_row(params![lp.id], |row| row.get(0))
            .map_err(db_err)?;
        let outcome = tx
            .prepare_cached(sql::INSERT_LOOP_ITEM)
            .map_err(db_err)?
            .execute(params![lp.id, container_id, item.norm.as_str(), item.orig, seq]);
        match outcome {
            Ok(_) => {}
            Err(e) if is_constraint(&e) => {
                return Err(CifError::DuplicateCode(item.orig));
            }
            Err(e) => return Err(db_err(e)),
        }
        for packet_id in packet_ids(&tx, lp.id)? {
            values::write(&tx, packet_id, item.norm.as_str(), default)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// All loops of a container, in creation order.
    pub fn loops(&self, container: &Container) -> Result<Vec<Loop>> {
        self.check_container(container)?;
        let mut stmt = self.conn.prepare_cached(sql::GET_ALL_LOOPS).map_err(db_err)?;
        let rows = stmt
            .query_map(params![container.id], |row| {
                Ok(Loop {
                    id: row.get(0)?,
                    r#gen: row.get(1)?,
                    container_id: container.id,
                    category: row.get(2)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// The first loop carrying `category`.
    pub fn loop_for_category(&self, container: &Container, category: &str) -> Result<Loop> {
        self.check_container(container)?;
        self.conn
            .prepare_cached(sql::GET_CAT_LOOP)
            .map_err(db_err)?
            .query_row(params![container.id, category], |row| {
                Ok(Loop {
                    id: row.get(0)?,
                    r#gen: row.get(1)?,
                    container_id: container.id,
                    category: row.get(2)?,
                })
            })
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| CifError::NoSuchLoop(category.to_string()))
    }

    /// The loop containing the data name (each name belongs to at most one).
    pub fn loop_for_item(&self, container: &Container, name: &str) -> Result<Loop> {
        self.check_container(container)?;
        let norm = NormName::of(name);
        self.conn
            .prepare_cached(sql::GET_ITEM_LOOP)
            .map_err(db_err)?
            .query_row(params![container.id, norm.as_str()], |row| {
                Ok(Loop {
                    id: row.get(0)?,
                    r#gen: row.get(1)?,
                    container_id: container.id,
                    category: row.get(2)?,
                })
            })
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| CifError::NoSuchItem(name.to_string()))
    }

    /// The loop's data names, in declaration order.
    pub fn loop_names(&self, lp: &Loop) -> Result<Vec<ItemName>> {
        self.check_loop(lp)?;
        let mut stmt = self.conn.prepare_cached(sql::GET_LOOP_NAMES).map_err(db_err)?;
        let rows = stmt
            .query_map(params![lp.id], |row| {
                Ok(ItemName {
                    norm: NormName::from(row.get::<_, String>(0)?),
                    orig: row.get(1)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn destroy_loop(&self, lp: Loop) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        let n = tx
            .prepare_cached(sql::DELETE_LOOP)
            .map_err(db_err)?
            .execute(params![lp.id, lp.r#gen])
            .map_err(db_err)?;
        if n == 0 {
            return Err(CifError::InvalidHandle);
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn check_loop(&self, lp: &Loop) -> Result<()> {
        let found: Option<i64> = self
            .conn
            .prepare_cached(sql::CHECK_LOOP)
            .map_err(db_err)?
            .query_row(params![lp.id, lp.r#gen], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        match found {
            Some(_) => Ok(()),
            None => Err(CifError::InvalidHandle),
        }
    }

    // --- packets --------------------------------------------------------

    /// Append one packet. Its key set must equal the loop's name set.
    pub fn add_packet(&self, lp: &Loop, packet: &Packet) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        tx.prepare_cached(sql::CHECK_LOOP)
            .map_err(db_err)?
            .query_row(params![lp.id, lp.r#gen], |row| row.get::<_, i64>(0))
            .optional()
            .map_err(db_err)?
            .ok_or(CifError::InvalidHandle)?;

        let names = loop_names_in(&tx, lp.id)?;
        if packet.len() != names.len()
            || names.iter().any(|n| packet.get(n.norm.as_str()).is_none())
        {
            return Err(CifError::Argument(
                "packet names do not match the loop's data names".to_string(),
            ));
        }

        let row_num: i64 = tx
            .prepare_cached(sql::NEXT_ROW_NUM)
            .map_err(db_err)?
            .query_row(params![lp.id], |row| row.get(0))
            .map_err(db_err)?;
        tx.prepare_cached(sql::INSERT_PACKET)
            .map_err(db_err)?
            .execute(params![lp.id, row_num])
            .map_err(db_err)?;
        let packet_id = tx.last_insert_rowid();
        for name in &names {
            let value = packet
                .get(name.norm.as_str())
                .ok_or_else(|| CifError::Internal("packet shape changed mid-write".to_string()))?;
            values::write(&tx, packet_id, name.norm.as_str(), value)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn packet_count(&self, lp: &Loop) -> Result<u64> {
        self.check_loop(lp)?;
        let n: i64 = self
            .conn
            .prepare_cached(sql::COUNT_PACKETS)
            .map_err(db_err)?
            .query_row(params![lp.id], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }

    /// Iterate the loop's packets in row order. The cursor is re-opened for
    /// each yield, so mutation between `next` calls is tolerated; a packet
    /// inserted behind the cursor is simply not revisited.
    pub fn packets<'a>(&'a self, lp: &Loop) -> PacketCursor<'a> {
        PacketCursor {
            cif: self,
            loop_id: lp.id,
            loop_gen: lp.r#gen,
            last_row: -1,
            done: false,
        }
    }

    // --- values ---------------------------------------------------------

    /// Owned copy of the value bound to `name` (first packet of its loop).
    pub fn value(&self, container: &Container, name: &str) -> Result<Value> {
        let lp = self.loop_for_item(container, name)?;
        let norm = NormName::of(name);
        let ids = packet_ids(&self.conn, lp.id)?;
        let first = ids
            .first()
            .ok_or_else(|| CifError::NoSuchItem(name.to_string()))?;
        values::read(&self.conn, *first, norm.as_str())?
            .ok_or_else(|| CifError::Internal(format!("loop item `{name}` lacks a value row")))
    }

    /// Bind `name` to `value`. An existing looped item is updated in every
    /// packet of its loop; a new name is added to the scalar loop, creating
    /// that loop and its single packet on demand.
    pub fn set_value(&self, container: &Container, name: &str, value: &Value) -> Result<()> {
        let item = ItemName::checked(name)?;
        self.check_container(container)?;
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;

        let existing: Option<i64> = tx
            .prepare_cached(sql::GET_ITEM_LOOP)
            .map_err(db_err)?
            .query_row(params![container.id, item.norm.as_str()], |row| row.get(0))
            .optional()
            .map_err(db_err)?;

        match existing {
            Some(loop_id) => {
                for packet_id in packet_ids(&tx, loop_id)? {
                    values::delete(&tx, packet_id, item.norm.as_str())?;
                    values::write(&tx, packet_id, item.norm.as_str(), value)?;
                }
            }
            None => {
                let (loop_id, packet_id) = scalar_loop(&tx, container.id, || self.fresh_gen())?;
                let seq: i64 = tx
                    .prepare_cached(sql::NEXT_ITEM_SEQ)
                    .map_err(db_err)?
                    .query_row(params![loop_id], |row| row.get(0))
                    .map_err(db_err)?;
                tx.prepare_cached(sql::INSERT_LOOP_ITEM)
                    .map_err(db_err)?
                    .execute(params![loop_id, container.id, item.norm.as_str(), item.orig, seq])
                    .map_err(db_err)?;
                values::write(&tx, packet_id, item.norm.as_str(), value)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Remove `name` from the container. Removing the last item of a
    /// non-scalar loop destroys that loop.
    pub fn remove_value(&self, container: &Container, name: &str) -> Result<()> {
        self.check_container(container)?;
        let norm = NormName::of(name);
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;

        let found: Option<(i64, Option<String>)> = tx
            .prepare_cached(sql::GET_ITEM_LOOP)
            .map_err(db_err)?
            .query_row(params![container.id, norm.as_str()], |row| {
                Ok((row.get(0)?, row.get(2)?))
            })
            .optional()
            .map_err(db_err)?;
        let (loop_id, category) =
            found.ok_or_else(|| CifError::NoSuchItem(name.to_string()))?;

        for packet_id in packet_ids(&tx, loop_id)? {
            values::delete(&tx, packet_id, norm.as_str())?;
        }
        tx.prepare_cached(sql::DELETE_LOOP_ITEM)
            .map_err(db_err)?
            .execute(params![loop_id, norm.as_str()])
            .map_err(db_err)?;

        let remaining: i64 = tx
            .prepare_cached(sql::COUNT_LOOP_ITEMS)
            .map_err(db_err)?
            .query_row(params![loop_id], |row| row.get(0))
            .map_err(db_err)?;
        if remaining == 0 && category.as_deref() != Some("") {
            tx.prepare_cached(sql::DELETE_LOOP_BY_ID)
                .map_err(db_err)?
                .execute(params![loop_id])
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    /// Remove loops with no packets or no items, then containers left with
    /// neither loops nor frames, repeating until a fixed point.
    pub fn prune(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction().map_err(db_err)?;
        loop {
            let n1 = tx
                .prepare_cached(sql::PRUNE_LOOPS)
                .map_err(db_err)?
                .execute([])
                .map_err(db_err)?;
            let n2 = tx
                .prepare_cached(sql::PRUNE_CONTAINERS)
                .map_err(db_err)?
                .execute([])
                .map_err(db_err)?;
            if n1 + n2 == 0 {
                break;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }
}

/// Find (or create) the container's scalar loop and its single packet.
fn scalar_loop<F: FnMut() -> i64>(
    conn: &Connection,
    container_id: i64,
    mut fresh_gen: F,
) -> Result<(i64, i64)> {
    let existing: Option<i64> = conn
        .prepare_cached(sql::GET_SCALAR_LOOP)
        .map_err(db_err)?
        .query_row(params![container_id], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    let loop_id = match existing {
        Some(id) => id,
        None => {
            conn.prepare_cached(sql::INSERT_LOOP)
                .map_err(db_err)?
                .execute(params![fresh_gen(), container_id, ""])
                .map_err(db_err)?;
            let id = conn.last_insert_rowid();
            conn.prepare_cached(sql::INSERT_PACKET)
                .map_err(db_err)?
                .execute(params![id, 0i64])
                .map_err(db_err)?;
            return Ok((id, conn.last_insert_rowid()));
        }
    };
    let packet_id: i64 = conn
        .prepare_cached(sql::LOOP_PACKET_IDS)
        .map_err(db_err)?
        .query_row(params![loop_id], |row| row.get(0))
        .map_err(db_err)?;
    Ok((loop_id, packet_id))
}

fn packet_ids(conn: &Connection, loop_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(sql::LOOP_PACKET_IDS).map_err(db_err)?;
    let ids = stmt
        .query_map(params![loop_id], |row| row.get(0))
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<i64>, _>>()
        .map_err(db_err)?;
    Ok(ids)
}

fn loop_names_in(conn: &Connection, loop_id: i64) -> Result<Vec<ItemName>> {
    let mut stmt = conn.prepare_cached(sql::GET_LOOP_NAMES).map_err(db_err)?;
    let rows = stmt
        .query_map(params![loop_id], |row| {
            Ok(ItemName {
                norm: NormName::from(row.get::<_, String>(0)?),
                orig: row.get(1)?,
            })
        })
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Loop packet cursor. Resilient to mutation between yields: every `next`
/// re-queries for the smallest row number beyond the last one seen.
pub struct PacketCursor<'a> {
    cif: &'a Cif,
    loop_id: i64,
    loop_gen: i64,
    last_row: i64,
    done: bool,
}

impl Iterator for PacketCursor<'_> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.fetch();
        match step {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl PacketCursor<'_> {
    fn fetch(&mut self) -> Result<Option<Packet>> {
        let conn = &self.cif.conn;
        // The loop may have been destroyed since the last yield.
        conn.prepare_cached(sql::CHECK_LOOP)
            .map_err(db_err)?
            .query_row(params![self.loop_id, self.loop_gen], |row| row.get::<_, i64>(0))
            .optional()
            .map_err(db_err)?
            .ok_or(CifError::InvalidHandle)?;

        let next: Option<(i64, i64)> = conn
            .prepare_cached(sql::NEXT_PACKET)
            .map_err(db_err)?
            .query_row(params![self.loop_id, self.last_row], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(db_err)?;
        let Some((packet_id, row_num)) = next else {
            return Ok(None);
        };
        self.last_row = row_num;

        let mut packet = Packet::new();
        for name in loop_names_in(conn, self.loop_id)? {
            let value = values::read(conn, packet_id, name.norm.as_str())?.ok_or_else(|| {
                CifError::Internal(format!("packet {packet_id} lacks `{}`", name.orig))
            })?;
            packet.insert(&name.orig, value);
        }
        Ok(Some(packet))
    }
}
