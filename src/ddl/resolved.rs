//! 해석된 스키마 변경. 델타 체인에 JSON으로 저장되고, 복원 시 그대로 재적용된다.

use crate::error::{CdcError, Result};
use crate::schema::{Database, Schema, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedSchemaChange {
    DatabaseCreate {
        database: String,
        charset: String,
    },
    DatabaseAlter {
        database: String,
        charset: String,
    },
    DatabaseDrop {
        database: String,
    },
    TableCreate {
        definition: Table,
    },
    /// 이름 변경/이동을 포함한 테이블 변경. definition은 변경 후 전체 정의
    TableAlter {
        database: String,
        table: String,
        definition: Table,
    },
    TableDrop {
        database: String,
        table: String,
    },
}

impl ResolvedSchemaChange {
    pub fn database(&self) -> &str {
        match self {
            ResolvedSchemaChange::DatabaseCreate { database, .. }
            | ResolvedSchemaChange::DatabaseAlter { database, .. }
            | ResolvedSchemaChange::DatabaseDrop { database }
            | ResolvedSchemaChange::TableAlter { database, .. }
            | ResolvedSchemaChange::TableDrop { database, .. } => database,
            ResolvedSchemaChange::TableCreate { definition } => &definition.database,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            ResolvedSchemaChange::TableAlter { table, .. }
            | ResolvedSchemaChange::TableDrop { table, .. } => Some(table),
            ResolvedSchemaChange::TableCreate { definition } => Some(&definition.name),
            _ => None,
        }
    }

    /// 순수 변환: 새 스키마를 돌려준다. 건드린 데이터베이스만 복사되고 나머지는 공유된다.
    pub fn apply(&self, schema: &Schema) -> Result<Schema> {
        let mut next = schema.clone();
        let sensitivity = schema.sensitivity;

        match self {
            ResolvedSchemaChange::DatabaseCreate { database, charset } => {
                if next.has_database(database) {
                    return Err(CdcError::InvalidSchema(format!(
                        "Unexpectedly asked to create existing database {}",
                        database
                    )));
                }
                next.add_database(Database::new(database.clone(), charset.clone()));
            }
            ResolvedSchemaChange::DatabaseAlter { database, charset } => {
                let db = next
                    .find_database_mut(database)
                    .ok_or_else(|| missing_database(database))?;
                db.charset = charset.clone();
            }
            ResolvedSchemaChange::DatabaseDrop { database } => {
                next.remove_database(database)
                    .ok_or_else(|| missing_database(database))?;
            }
            ResolvedSchemaChange::TableCreate { definition } => {
                let db = next
                    .find_database_mut(&definition.database)
                    .ok_or_else(|| missing_database(&definition.database))?;
                if let Some(existing) = db.find_table(&definition.name, sensitivity) {
                    if existing.structurally_equals(definition) {
                        return Ok(schema.clone());
                    }
                    return Err(CdcError::InvalidSchema(format!(
                        "Unexpectedly asked to create existing table {}",
                        definition.full_name()
                    )));
                }
                db.add_table(definition.clone());
            }
            ResolvedSchemaChange::TableAlter {
                database,
                table,
                definition,
            } => {
                let same_database = sensitivity.matches(database, &definition.database);
                let db = next
                    .find_database_mut(database)
                    .ok_or_else(|| missing_database(database))?;
                let index = db
                    .find_table_index(table, sensitivity)
                    .ok_or_else(|| missing_table(database, table))?;

                if same_database {
                    db.tables[index] = Arc::new(definition.clone());
                } else {
                    db.tables.remove(index);
                    let target = next
                        .find_database_mut(&definition.database)
                        .ok_or_else(|| missing_database(&definition.database))?;
                    target.add_table(definition.clone());
                }
            }
            ResolvedSchemaChange::TableDrop { database, table } => {
                let db = next
                    .find_database_mut(database)
                    .ok_or_else(|| missing_database(database))?;
                db.remove_table(table, sensitivity)
                    .ok_or_else(|| missing_table(database, table))?;
            }
        }

        Ok(next)
    }
}

fn missing_database(name: &str) -> CdcError {
    CdcError::InvalidSchema(format!("Couldn't find database {}", name))
}

fn missing_table(database: &str, table: &str) -> CdcError {
    CdcError::InvalidSchema(format!("Couldn't find table {}.{}", database, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CaseSensitivity, ColumnDef};

    fn schema() -> Schema {
        let mut schema = Schema::new("utf8", CaseSensitivity::CaseSensitive);
        let mut a = Database::new("a", "utf8");
        a.add_table(Table::new(
            "a",
            "t",
            Some("utf8".into()),
            vec![ColumnDef::build("id", "int", 0, None, true, None, None).unwrap()],
            vec!["id".into()],
        ));
        schema.add_database(a);
        schema.add_database(Database::new("b", "utf8"));
        schema
    }

    #[test]
    fn test_apply_shares_untouched_databases() {
        let before = schema();
        let change = ResolvedSchemaChange::DatabaseAlter {
            database: "a".into(),
            charset: "latin1".into(),
        };
        let after = change.apply(&before).unwrap();
        assert_eq!(after.find_database("a").unwrap().charset, "latin1");
        assert_eq!(before.find_database("a").unwrap().charset, "utf8");
        assert!(Arc::ptr_eq(&before.databases[1], &after.databases[1]));
    }

    #[test]
    fn test_apply_moves_table_between_databases() {
        let before = schema();
        let mut moved = before.find_table("a", "t").unwrap().as_ref().clone();
        moved.database = "b".into();
        moved.name = "t2".into();
        let change = ResolvedSchemaChange::TableAlter {
            database: "a".into(),
            table: "t".into(),
            definition: moved,
        };
        let after = change.apply(&before).unwrap();
        assert!(!after.has_table("a", "t"));
        assert!(after.has_table("b", "t2"));
    }

    #[test]
    fn test_serialized_form() {
        let change = ResolvedSchemaChange::TableDrop {
            database: "a".into(),
            table: "t".into(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["type"], "table_drop");
        let back: ResolvedSchemaChange = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_drop_missing_database_fails() {
        let change = ResolvedSchemaChange::DatabaseDrop { database: "zz".into() };
        assert!(change.apply(&schema()).is_err());
    }
}
