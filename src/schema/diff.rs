//! 스키마 비교
//!
//! 두 스키마의 차이를 사람이 읽을 수 있는 문자열 목록으로 돌려준다.
//! 빈 목록이면 두 스키마는 동등하다.

use super::{ColumnDef, Database, Schema, Table};

impl Schema {
    pub fn diff(&self, other: &Schema, name: &str, other_name: &str) -> Vec<String> {
        let mut diffs = Vec::new();

        for db in &self.databases {
            match other.find_database(&db.name) {
                Some(other_db) => db.diff(other_db, name, other_name, &mut diffs),
                None => diffs.push(format!(
                    "database {} did not exist in {}",
                    db.name, other_name
                )),
            }
        }

        for other_db in &other.databases {
            if !self.has_database(&other_db.name) {
                diffs.push(format!(
                    "database {} did not exist in {}",
                    other_db.name, name
                ));
            }
        }

        diffs
    }

    pub fn equals(&self, other: &Schema) -> bool {
        self.diff(other, "a", "b").is_empty()
    }

    /// 양쪽에 모두 있는 컬럼 쌍 (database, table, self 컬럼, other 컬럼)
    pub fn matching_columns<'a>(
        &'a self,
        other: &'a Schema,
    ) -> Vec<(&'a str, &'a str, &'a ColumnDef, &'a ColumnDef)> {
        let mut pairs = Vec::new();
        for db in &self.databases {
            let Some(other_db) = other.find_database(&db.name) else {
                continue;
            };
            for table in &db.tables {
                let Some(other_table) = other_db.find_table(&table.name, self.sensitivity) else {
                    continue;
                };
                for column in &table.columns {
                    if let Some(other_column) = other_table.find_column(&column.name) {
                        pairs.push((db.name.as_str(), table.name.as_str(), column, other_column));
                    }
                }
            }
        }
        pairs
    }
}

impl Database {
    fn diff(&self, other: &Database, name: &str, other_name: &str, diffs: &mut Vec<String>) {
        if self.charset != other.charset {
            diffs.push(format!(
                "database {} has charset {} in {} but {} in {}",
                self.name, self.charset, name, other.charset, other_name
            ));
        }

        // 테이블 이름 비교는 스키마 쪽 모드와 무관하게 정확히 비교한다
        for table in &self.tables {
            match other.tables.iter().find(|t| t.name == table.name) {
                Some(other_table) => table.diff(other_table, name, other_name, diffs),
                None => diffs.push(format!(
                    "table {}.{} did not exist in {}",
                    self.name, table.name, other_name
                )),
            }
        }

        for other_table in &other.tables {
            if !self.tables.iter().any(|t| t.name == other_table.name) {
                diffs.push(format!(
                    "table {}.{} did not exist in {}",
                    self.name, other_table.name, name
                ));
            }
        }
    }
}

impl Table {
    pub fn diff(&self, other: &Table, name: &str, other_name: &str, diffs: &mut Vec<String>) {
        let full = self.full_name();

        if self.charset != other.charset {
            diffs.push(format!(
                "{} has charset {:?} in {} but {:?} in {}",
                full, self.charset, name, other.charset, other_name
            ));
        }

        let pk: Vec<String> = self.pk.iter().map(|p| p.to_lowercase()).collect();
        let other_pk: Vec<String> = other.pk.iter().map(|p| p.to_lowercase()).collect();
        if pk != other_pk {
            diffs.push(format!(
                "{} has primary key {:?} in {} but {:?} in {}",
                full, self.pk, name, other.pk, other_name
            ));
        }

        for column in &self.columns {
            match other.find_column(&column.name) {
                Some(other_column) => {
                    column_diff(&full, column, other_column, name, other_name, diffs)
                }
                None => diffs.push(format!(
                    "{}.{} did not exist in {}",
                    full, column.name, other_name
                )),
            }
        }

        for other_column in &other.columns {
            if !self.has_column(&other_column.name) {
                diffs.push(format!(
                    "{}.{} did not exist in {}",
                    full, other_column.name, name
                ));
            }
        }
    }

    /// 구조가 같은 테이블인지 (이름 제외)
    pub fn structurally_equals(&self, other: &Table) -> bool {
        let mut diffs = Vec::new();
        self.diff(other, "a", "b", &mut diffs);
        diffs.is_empty()
    }
}

fn column_diff(
    table: &str,
    column: &ColumnDef,
    other: &ColumnDef,
    name: &str,
    other_name: &str,
    diffs: &mut Vec<String>,
) {
    let prefix = format!("{}.{}", table, column.name);

    if column.col_type != other.col_type {
        diffs.push(format!(
            "{} has type {} in {} but {} in {}",
            prefix, column.col_type, name, other.col_type, other_name
        ));
    } else if column.kind != other.kind {
        diffs.push(format!(
            "{} has definition {:?} in {} but {:?} in {}",
            prefix, column.kind, name, other.kind, other_name
        ));
    }

    if column.pos != other.pos {
        diffs.push(format!(
            "{} has position {} in {} but {} in {}",
            prefix, column.pos, name, other.pos, other_name
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CaseSensitivity;

    fn col(name: &str, col_type: &str) -> ColumnDef {
        ColumnDef::build(name, col_type, 0, Some("utf8".into()), true, None, None).unwrap()
    }

    fn schema_with(columns: Vec<ColumnDef>) -> Schema {
        let mut schema = Schema::new("utf8", CaseSensitivity::CaseSensitive);
        let mut db = Database::new("d", "utf8");
        db.add_table(Table::new("d", "t", Some("utf8".into()), columns, vec!["id".into()]));
        schema.add_database(db);
        schema
    }

    #[test]
    fn test_identical_schemas_have_no_diff() {
        let a = schema_with(vec![col("id", "int"), col("name", "varchar")]);
        assert!(a.equals(&a.clone()));
    }

    #[test]
    fn test_diff_reports_type_and_position() {
        let a = schema_with(vec![col("id", "int"), col("name", "varchar")]);
        let b = schema_with(vec![col("name", "text"), col("id", "int")]);
        let diffs = a.diff(&b, "old", "new");
        assert!(diffs.iter().any(|d| d.contains("has type varchar in old but text in new")));
        assert!(diffs.iter().any(|d| d.contains("has position")));
    }

    #[test]
    fn test_diff_reports_missing_database() {
        let a = schema_with(vec![col("id", "int")]);
        let mut b = a.clone();
        b.add_database(Database::new("extra", "utf8"));
        let diffs = a.diff(&b, "old", "new");
        assert_eq!(diffs, vec!["database extra did not exist in old".to_string()]);
    }

    #[test]
    fn test_matching_columns_ignores_column_case() {
        let a = schema_with(vec![col("id", "int"), col("Name", "varchar")]);
        let b = schema_with(vec![col("id", "int"), col("name", "varchar")]);
        let pairs = a.matching_columns(&b);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].2.name, "Name");
        assert_eq!(pairs[1].3.name, "name");
    }
}
