//! Database dialects.
//!
//! The Schema Mapper speaks one canonical (MySQL-style) type vocabulary;
//! each dialect renders it, quotes identifiers and supplies the handful of
//! engine-specific statements the rest of the workspace needs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Value};

/// Name of the migration bookkeeping table.
pub const MIGRATIONS_TABLE: &str = "stashdb_sql_migrations";

/// Name of the Postgres sequence backing ticket generation.
pub const TICKETS_SEQUENCE: &str = "stashdb_tickets_seq";

/// Ids reserved per ticket refill.
pub const TICKET_BLOCK_SIZE: i64 = 300;

const POSTGRES_MIGRATIONS_TABLE_SQL: &str = include_str!("../sql/migrations-table.postgres.sql");
const MYSQL_MIGRATIONS_TABLE_SQL: &str = include_str!("../sql/migrations-table.mysql.sql");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    MySql,
}

impl Dialect {
    /// Dialect name as used in migration file names (`00010-x.postgres.sql`).
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
        }
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::MySql => "?".to_string(),
        }
    }

    /// Comma-joined placeholders `start..start+count`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn current_timestamp_query(&self) -> &'static str {
        match self {
            Dialect::Postgres => "SELECT CURRENT_TIMESTAMP AS now",
            Dialect::MySql => "SELECT UTC_TIMESTAMP() AS now",
        }
    }

    /// Query returning a row when the table (bound as parameter 1) exists.
    pub fn table_exists_query(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Dialect::MySql => {
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?"
            }
        }
    }

    /// Query returning a row when table (parameter 1) has column (parameter 2).
    pub fn column_exists_query(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT 1 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2"
            }
            Dialect::MySql => {
                "SELECT 1 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?"
            }
        }
    }

    /// Render a canonical column type for this dialect.
    pub fn render_type(&self, canonical: &str) -> String {
        match self {
            Dialect::MySql => canonical.to_string(),
            Dialect::Postgres => postgres_type(canonical),
        }
    }

    /// Render a default literal. Booleans become `1`/`0` on MySQL.
    pub fn render_default(&self, value: &Value) -> Option<String> {
        let rendered = match value {
            Value::Null => return None,
            Value::Bool(b) => match (self, b) {
                (Dialect::Postgres, true) => "TRUE".to_string(),
                (Dialect::Postgres, false) => "FALSE".to_string(),
                (Dialect::MySql, true) => "1".to_string(),
                (Dialect::MySql, false) => "0".to_string(),
            },
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Double(f) => f.to_string(),
            other => quote_literal(&other.cache_key_part()),
        };
        Some(rendered)
    }

    /// DDL creating the migration bookkeeping table if it is absent.
    pub fn migrations_table_ddl(&self) -> &'static str {
        match self {
            Dialect::Postgres => POSTGRES_MIGRATIONS_TABLE_SQL,
            Dialect::MySql => MYSQL_MIGRATIONS_TABLE_SQL,
        }
    }

    /// Highest recorded version for an application (parameter 1).
    pub fn current_version_query(&self) -> String {
        format!(
            "SELECT MAX(version_number) FROM {} WHERE app_name = {}",
            MIGRATIONS_TABLE,
            self.placeholder(1)
        )
    }

    /// Bookkeeping insert: version, app name, file name, executed at.
    pub fn record_migration_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version_number, app_name, file_name, executed_at) VALUES({})",
            MIGRATIONS_TABLE,
            self.placeholders(1, 4)
        )
    }

    /// Statement that prepares the ticket source.
    pub fn ticket_setup_sql(&self) -> String {
        match self {
            Dialect::Postgres => format!(
                "CREATE SEQUENCE IF NOT EXISTS {} INCREMENT BY {} MINVALUE 100000",
                TICKETS_SEQUENCE, TICKET_BLOCK_SIZE
            ),
            Dialect::MySql => "CREATE TABLE IF NOT EXISTS `stashdb_tickets` (\n  \
                 `id` bigint(20) unsigned NOT NULL AUTO_INCREMENT,\n  \
                 `ticket_name` varchar(10) DEFAULT NULL,\n  \
                 PRIMARY KEY (`id`),\n  \
                 UNIQUE KEY `ticket_name_unique` (`ticket_name`)\n\
                 ) ENGINE=InnoDB AUTO_INCREMENT=100000"
                .to_string(),
        }
    }

    /// Statement returning the first id of a fresh ticket block.
    pub fn next_ticket_block_sql(&self) -> String {
        match self {
            Dialect::Postgres => format!("SELECT nextval('{}')", TICKETS_SEQUENCE),
            Dialect::MySql => "REPLACE INTO stashdb_tickets (ticket_name) VALUES('a')".to_string(),
        }
    }

    /// Trigger keeping `row_updated_at` current on Postgres. `None` on MySQL,
    /// where the column definition handles it.
    pub fn row_updated_at_trigger(&self, table: &str) -> Option<String> {
        match self {
            Dialect::MySql => None,
            Dialect::Postgres => Some(format!(
                "CREATE TRIGGER {trigger} BEFORE UPDATE ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION stashdb_touch_row_updated_at();",
                trigger = self.quote(&format!("{}_touch_row_updated_at", table)),
                table = self.quote(table),
            )),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            other => Err(ConfigError::InvalidValue {
                field: "dialect".to_string(),
                value: other.to_string(),
                reason: "expected postgres or mysql".to_string(),
            }),
        }
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn postgres_type(canonical: &str) -> String {
    let lowered = canonical.trim().to_lowercase();
    let without_unsigned = lowered.replace("unsigned", "");
    let trimmed = without_unsigned.trim();
    let (base, args) = match trimmed.find('(') {
        Some(idx) => (trimmed[..idx].trim(), &trimmed[idx..]),
        None => (trimmed, ""),
    };
    match base {
        "int" | "integer" | "mediumint" => "integer".to_string(),
        "smallint" => "smallint".to_string(),
        "bigint" => "bigint".to_string(),
        "tinyint" if args == "(1)" => "boolean".to_string(),
        "tinyint" => "smallint".to_string(),
        "bit" if args.is_empty() || args == "(1)" => "boolean".to_string(),
        "float" => "real".to_string(),
        "double" => "double precision".to_string(),
        "datetime" => "timestamp".to_string(),
        "longtext" | "mediumtext" | "tinytext" | "text" => "text".to_string(),
        "varchar" | "char" | "decimal" | "numeric" => format!("{}{}", base, args),
        _ => canonical.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_type_translation() {
        let pg = Dialect::Postgres;
        assert_eq!(pg.render_type("int"), "integer");
        assert_eq!(pg.render_type("bigint(20) unsigned"), "bigint");
        assert_eq!(pg.render_type("bit(1)"), "boolean");
        assert_eq!(pg.render_type("varchar(250)"), "varchar(250)");
        assert_eq!(pg.render_type("longtext"), "text");
        assert_eq!(pg.render_type("datetime"), "timestamp");
        assert_eq!(pg.render_type("double"), "double precision");
        assert_eq!(pg.render_type("jsonb"), "jsonb");
        assert_eq!(Dialect::MySql.render_type("bit(1)"), "bit(1)");
    }

    #[test]
    fn test_placeholders_and_quoting() {
        assert_eq!(Dialect::Postgres.placeholders(2, 3), "$2, $3, $4");
        assert_eq!(Dialect::MySql.placeholders(1, 2), "?, ?");
        assert_eq!(Dialect::Postgres.quote("count"), "\"count\"");
        assert_eq!(Dialect::MySql.quote("count"), "`count`");
    }

    #[test]
    fn test_render_default() {
        assert_eq!(
            Dialect::MySql.render_default(&Value::Bool(true)),
            Some("1".to_string())
        );
        assert_eq!(
            Dialect::Postgres.render_default(&Value::Bool(false)),
            Some("FALSE".to_string())
        );
        assert_eq!(
            Dialect::Postgres.render_default(&Value::Text("it's".into())),
            Some("'it''s'".to_string())
        );
        assert_eq!(Dialect::MySql.render_default(&Value::Int(0)), Some("0".to_string()));
        assert_eq!(Dialect::MySql.render_default(&Value::Null), None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("PostgreSQL".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("mysql".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_bookkeeping_sql() {
        assert_eq!(
            Dialect::Postgres.current_version_query(),
            "SELECT MAX(version_number) FROM stashdb_sql_migrations WHERE app_name = $1"
        );
        assert!(Dialect::Postgres
            .migrations_table_ddl()
            .contains("stashdb_touch_row_updated_at"));
        assert!(Dialect::Postgres.ticket_setup_sql().contains("INCREMENT BY 300"));
    }
}
