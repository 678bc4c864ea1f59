//! Schema and statement text.
//!
//! The statement strings are grouped here so the operations in `lib.rs` read
//! as logic rather than SQL. Statements are prepared through the connection's
//! statement cache, so repeating a tag re-uses the compiled statement.

/// Foreign keys must be on (and verified on) for the cascade and uniqueness
/// rules below to mean anything.
pub(crate) const SCHEMA: &str = "
CREATE TABLE container (
    id        INTEGER PRIMARY KEY,
    gen       INTEGER NOT NULL,
    parent_id INTEGER REFERENCES container(id) ON DELETE CASCADE,
    code      TEXT NOT NULL,
    code_orig TEXT NOT NULL
);
CREATE UNIQUE INDEX container_scope_code ON container(IFNULL(parent_id, -1), code);

CREATE TABLE cif_loop (
    id           INTEGER PRIMARY KEY,
    gen          INTEGER NOT NULL,
    container_id INTEGER NOT NULL REFERENCES container(id) ON DELETE CASCADE,
    category     TEXT
);
CREATE UNIQUE INDEX loop_scalar ON cif_loop(container_id) WHERE category = '';

CREATE TABLE loop_item (
    loop_id      INTEGER NOT NULL REFERENCES cif_loop(id) ON DELETE CASCADE,
    container_id INTEGER NOT NULL REFERENCES container(id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    name_orig    TEXT NOT NULL,
    seq          INTEGER NOT NULL,
    PRIMARY KEY (loop_id, name),
    UNIQUE (container_id, name)
);

CREATE TABLE packet (
    id      INTEGER PRIMARY KEY,
    loop_id INTEGER NOT NULL REFERENCES cif_loop(id) ON DELETE CASCADE,
    row_num INTEGER NOT NULL,
    UNIQUE (loop_id, row_num)
);

CREATE TABLE item_value (
    id        INTEGER PRIMARY KEY,
    packet_id INTEGER REFERENCES packet(id) ON DELETE CASCADE,
    name      TEXT,
    parent_id INTEGER REFERENCES item_value(id) ON DELETE CASCADE,
    seq       INTEGER,
    kind      INTEGER NOT NULL,
    text      TEXT,
    quoted    INTEGER,
    num_value REAL,
    num_su    TEXT,
    tkey      TEXT,
    tkey_orig TEXT
);
CREATE INDEX item_value_packet ON item_value(packet_id, name);
CREATE INDEX item_value_parent ON item_value(parent_id, seq);
";

pub(crate) const INSERT_CONTAINER: &str =
    "INSERT INTO container (gen, parent_id, code, code_orig) VALUES (?1, ?2, ?3, ?4)";
pub(crate) const GET_CONTAINER: &str = "SELECT id, gen, code_orig FROM container
     WHERE IFNULL(parent_id, -1) = ?1 AND code = ?2";
pub(crate) const GET_ALL_CONTAINERS: &str = "SELECT id, gen, code, code_orig FROM container
     WHERE IFNULL(parent_id, -1) = ?1 ORDER BY id";
pub(crate) const CHECK_CONTAINER: &str = "SELECT 1 FROM container WHERE id = ?1 AND gen = ?2";
pub(crate) const DELETE_CONTAINER: &str = "DELETE FROM container WHERE id = ?1 AND gen = ?2";

pub(crate) const INSERT_LOOP: &str =
    "INSERT INTO cif_loop (gen, container_id, category) VALUES (?1, ?2, ?3)";
pub(crate) const CHECK_LOOP: &str =
    "SELECT container_id FROM cif_loop WHERE id = ?1 AND gen = ?2";
pub(crate) const GET_ALL_LOOPS: &str = "SELECT id, gen, category FROM cif_loop
     WHERE container_id = ?1 ORDER BY id";
pub(crate) const GET_CAT_LOOP: &str = "SELECT id, gen, category FROM cif_loop
     WHERE container_id = ?1 AND category = ?2 ORDER BY id";
pub(crate) const GET_ITEM_LOOP: &str = "SELECT l.id, l.gen, l.category
     FROM cif_loop l JOIN loop_item i ON i.loop_id = l.id
     WHERE l.container_id = ?1 AND i.name = ?2";
pub(crate) const GET_SCALAR_LOOP: &str = "SELECT id, gen FROM cif_loop
     WHERE container_id = ?1 AND category = ''";
pub(crate) const SET_LOOP_CATEGORY: &str =
    "UPDATE cif_loop SET category = ?3 WHERE id = ?1 AND gen = ?2";
pub(crate) const DELETE_LOOP: &str = "DELETE FROM cif_loop WHERE id = ?1 AND gen = ?2";
pub(crate) const DELETE_LOOP_BY_ID: &str = "DELETE FROM cif_loop WHERE id = ?1";

pub(crate) const INSERT_LOOP_ITEM: &str = "INSERT INTO loop_item
     (loop_id, container_id, name, name_orig, seq) VALUES (?1, ?2, ?3, ?4, ?5)";
pub(crate) const GET_LOOP_NAMES: &str =
    "SELECT name, name_orig FROM loop_item WHERE loop_id = ?1 ORDER BY seq";
pub(crate) const NEXT_ITEM_SEQ: &str =
    "SELECT IFNULL(MAX(seq), -1) + 1 FROM loop_item WHERE loop_id = ?1";
pub(crate) const DELETE_LOOP_ITEM: &str =
    "DELETE FROM loop_item WHERE loop_id = ?1 AND name = ?2";
pub(crate) const COUNT_LOOP_ITEMS: &str =
    "SELECT COUNT(*) FROM loop_item WHERE loop_id = ?1";

pub(crate) const INSERT_PACKET: &str =
    "INSERT INTO packet (loop_id, row_num) VALUES (?1, ?2)";
pub(crate) const NEXT_ROW_NUM: &str =
    "SELECT IFNULL(MAX(row_num), -1) + 1 FROM packet WHERE loop_id = ?1";
pub(crate) const NEXT_PACKET: &str = "SELECT id, row_num FROM packet
     WHERE loop_id = ?1 AND row_num > ?2 ORDER BY row_num LIMIT 1";
pub(crate) const LOOP_PACKET_IDS: &str =
    "SELECT id FROM packet WHERE loop_id = ?1 ORDER BY row_num";
pub(crate) const COUNT_PACKETS: &str =
    "SELECT COUNT(*) FROM packet WHERE loop_id = ?1";

pub(crate) const INSERT_VALUE: &str = "INSERT INTO item_value
     (packet_id, name, parent_id, seq, kind, text, quoted, num_value, num_su, tkey, tkey_orig)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";
pub(crate) const GET_VALUE: &str = "SELECT id, kind, text, quoted, num_value, num_su
     FROM item_value WHERE packet_id = ?1 AND name = ?2";
pub(crate) const GET_CHILD_VALUES: &str =
    "SELECT id, kind, text, quoted, num_value, num_su, tkey, tkey_orig
     FROM item_value WHERE parent_id = ?1 ORDER BY seq";
pub(crate) const DELETE_VALUE: &str =
    "DELETE FROM item_value WHERE packet_id = ?1 AND name = ?2";

pub(crate) const PRUNE_LOOPS: &str = "DELETE FROM cif_loop
     WHERE id NOT IN (SELECT loop_id FROM packet)
        OR id NOT IN (SELECT loop_id FROM loop_item)";
pub(crate) const PRUNE_CONTAINERS: &str = "DELETE FROM container
     WHERE id NOT IN (SELECT container_id FROM cif_loop)
       AND id NOT IN (SELECT parent_id FROM container WHERE parent_id IS NOT NULL)";
