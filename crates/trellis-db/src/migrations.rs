//! Schema and seed data for the application stores, keyed by version.

use crate::migrate::{Migration, MigrationError, MigrationRegistry, Version};

pub const CREATE_USER_TABLE: Version = 20240226153000;
pub const INIT_GIFT_COUNTER: Version = 20241219153001;
pub const CREATE_PLAYER_TABLE: Version = 20241220153000;
pub const CREATE_CUSTOMERS_TABLE: Version = 20241221090000;

pub const GIFT_COUNTER_KEY: &str = "gift_counter";
pub const GIFT_COUNTER_START: i64 = 100_000;

const CREATE_USER_TABLE_SQL: &str = r#"CREATE TABLE IF NOT EXISTS "user" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    age INTEGER NOT NULL
);"#;

// Player ids start at 100000: seed a row, bump the sequence, drop the seed.
const CREATE_PLAYER_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS t_player (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    create_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
    update_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TRIGGER IF NOT EXISTS update_player
AFTER UPDATE ON t_player
FOR EACH ROW
BEGIN
    UPDATE t_player SET update_at = CURRENT_TIMESTAMP WHERE id = OLD.id;
END;

INSERT INTO t_player(name) VALUES ('initial_record');
UPDATE sqlite_sequence SET seq = 99999 WHERE name = 't_player';
DELETE FROM t_player WHERE name = 'initial_record';";

const CREATE_CUSTOMERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS customers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

fn init_gift_counter() -> Migration {
    Migration::new("init_gift_counter", |ds| {
        ds.kv
            .set(GIFT_COUNTER_KEY, &GIFT_COUNTER_START.to_string(), None)
    })
}

/// Every application migration.
pub fn all() -> Result<MigrationRegistry, MigrationError> {
    MigrationRegistry::from_entries([
        (
            CREATE_USER_TABLE,
            Migration::sql("create_user_table", CREATE_USER_TABLE_SQL),
        ),
        (INIT_GIFT_COUNTER, init_gift_counter()),
        (
            CREATE_PLAYER_TABLE,
            Migration::sql("create_player_table", CREATE_PLAYER_TABLE_SQL),
        ),
        (
            CREATE_CUSTOMERS_TABLE,
            Migration::sql("create_customers_table", CREATE_CUSTOMERS_TABLE_SQL),
        ),
    ])
}
