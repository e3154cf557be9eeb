//! 인메모리 스키마 모델 (Database → Table → Column)
//!
//! 스키마는 값 타입처럼 다룬다. `Schema`를 복제하면 데이터베이스/테이블은
//! `Arc`로 공유되고, 변경할 때 `Arc::make_mut`로 건드린 노드만 복사된다.

pub mod capture;
pub mod column;
pub mod diff;

pub use capture::{SchemaCapture, SchemaCapturer};
pub use column::{ColumnDef, ColumnKind};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `lower_case_table_names` 설정에 따른 이름 비교 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CaseSensitivity {
    /// lower_case_table_names = 0
    #[default]
    CaseSensitive,
    /// lower_case_table_names = 1: 저장 시 소문자로 변환
    ConvertToLower,
    /// lower_case_table_names = 2: 저장은 그대로, 비교만 대소문자 무시
    ConvertOnCompare,
}

impl CaseSensitivity {
    pub fn from_lower_case_table_names(value: u32) -> Self {
        match value {
            1 => CaseSensitivity::ConvertToLower,
            2 => CaseSensitivity::ConvertOnCompare,
            _ => CaseSensitivity::CaseSensitive,
        }
    }

    pub fn matches(&self, a: &str, b: &str) -> bool {
        match self {
            CaseSensitivity::CaseSensitive => a == b,
            _ => a.eq_ignore_ascii_case(b),
        }
    }

    /// 새로 저장되는 database/table 이름
    pub fn normalize(&self, name: &str) -> String {
        match self {
            CaseSensitivity::ConvertToLower => name.to_lowercase(),
            _ => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub database: String,
    pub name: String,
    pub charset: Option<String>,
    pub columns: Vec<ColumnDef>,
    #[serde(rename = "primary_key")]
    pub pk: Vec<String>,
}

impl Table {
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        charset: Option<String>,
        columns: Vec<ColumnDef>,
        pk: Vec<String>,
    ) -> Self {
        let mut table = Table {
            database: database.into(),
            name: name.into(),
            charset,
            columns,
            pk,
        };
        table.renumber_columns();
        table
    }

    /// 컬럼 이름은 MySQL처럼 항상 대소문자를 무시하고 비교한다
    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.find_column_index(name).map(|i| &self.columns[i])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.find_column_index(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn add_column(&mut self, index: usize, column: ColumnDef) {
        let index = index.min(self.columns.len());
        self.columns.insert(index, column);
        self.renumber_columns();
    }

    /// 컬럼 제거. 기본 키에 포함된 컬럼이면 기본 키에서도 빠진다.
    pub fn remove_column(&mut self, index: usize) -> ColumnDef {
        let removed = self.columns.remove(index);
        self.pk.retain(|p| !p.eq_ignore_ascii_case(&removed.name));
        self.renumber_columns();
        removed
    }

    /// 컬럼 이름 변경을 기본 키 목록에도 반영한다
    pub fn rename_pk_column(&mut self, old_name: &str, new_name: &str) {
        for p in self.pk.iter_mut() {
            if p.eq_ignore_ascii_case(old_name) {
                *p = new_name.to_string();
            }
        }
    }

    pub fn set_default_column_charsets(&mut self) {
        if let Some(charset) = self.charset.clone() {
            for column in self.columns.iter_mut() {
                column.set_default_charset(&charset);
            }
        }
    }

    pub fn pk_columns(&self) -> Vec<&ColumnDef> {
        self.pk.iter().filter_map(|p| self.find_column(p)).collect()
    }

    fn renumber_columns(&mut self) {
        for (i, column) in self.columns.iter_mut().enumerate() {
            column.pos = i;
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub charset: String,
    pub tables: Vec<Arc<Table>>,
}

impl Database {
    pub fn new(name: impl Into<String>, charset: impl Into<String>) -> Self {
        Database {
            name: name.into(),
            charset: charset.into(),
            tables: Vec::new(),
        }
    }

    pub fn find_table_index(&self, name: &str, sensitivity: CaseSensitivity) -> Option<usize> {
        self.tables
            .iter()
            .position(|t| sensitivity.matches(&t.name, name))
    }

    pub fn find_table(&self, name: &str, sensitivity: CaseSensitivity) -> Option<&Arc<Table>> {
        self.find_table_index(name, sensitivity)
            .map(|i| &self.tables[i])
    }

    pub fn has_table(&self, name: &str, sensitivity: CaseSensitivity) -> bool {
        self.find_table_index(name, sensitivity).is_some()
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.push(Arc::new(table));
    }

    pub fn remove_table(&mut self, name: &str, sensitivity: CaseSensitivity) -> Option<Arc<Table>> {
        self.find_table_index(name, sensitivity)
            .map(|i| self.tables.remove(i))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub databases: Vec<Arc<Database>>,
    /// 서버 기본 charset (`@@character_set_server`)
    pub charset: String,
    pub sensitivity: CaseSensitivity,
}

impl Schema {
    pub fn new(charset: impl Into<String>, sensitivity: CaseSensitivity) -> Self {
        Schema {
            databases: Vec::new(),
            charset: charset.into(),
            sensitivity,
        }
    }

    fn find_database_index(&self, name: &str) -> Option<usize> {
        self.databases
            .iter()
            .position(|d| self.sensitivity.matches(&d.name, name))
    }

    pub fn find_database(&self, name: &str) -> Option<&Arc<Database>> {
        self.find_database_index(name).map(|i| &self.databases[i])
    }

    /// 수정할 데이터베이스만 복사한다 (다른 데이터베이스는 계속 공유)
    pub fn find_database_mut(&mut self, name: &str) -> Option<&mut Database> {
        let index = self.find_database_index(name)?;
        Some(Arc::make_mut(&mut self.databases[index]))
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.find_database_index(name).is_some()
    }

    pub fn add_database(&mut self, database: Database) {
        self.databases.push(Arc::new(database));
    }

    pub fn remove_database(&mut self, name: &str) -> Option<Arc<Database>> {
        self.find_database_index(name)
            .map(|i| self.databases.remove(i))
    }

    pub fn find_table(&self, database: &str, table: &str) -> Option<&Arc<Table>> {
        self.find_database(database)
            .and_then(|d| d.find_table(table, self.sensitivity))
    }

    pub fn has_table(&self, database: &str, table: &str) -> bool {
        self.find_table(database, table).is_some()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.name.clone()).collect()
    }

    pub fn table_count(&self) -> usize {
        self.databases.iter().map(|d| d.tables.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_col(name: &str) -> ColumnDef {
        ColumnDef::build(name, "int", 0, None, true, None, None).unwrap()
    }

    fn sample_schema() -> Schema {
        let mut schema = Schema::new("utf8mb4", CaseSensitivity::CaseSensitive);
        let mut db = Database::new("shop", "utf8mb4");
        db.add_table(Table::new("shop", "orders", None, vec![int_col("id")], vec!["id".into()]));
        db.add_table(Table::new("shop", "items", None, vec![int_col("id")], vec![]));
        schema.add_database(db);
        schema.add_database(Database::new("other", "latin1"));
        schema
    }

    #[test]
    fn test_columns_are_renumbered() {
        let mut table = Table::new("d", "t", None, vec![int_col("a"), int_col("b")], vec![]);
        table.add_column(0, int_col("x"));
        assert_eq!(table.column_names(), vec!["x", "a", "b"]);
        assert_eq!(table.columns.iter().map(|c| c.pos).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_remove_column_drops_pk_entry() {
        let mut table = Table::new("d", "t", None, vec![int_col("id"), int_col("b")], vec!["ID".into()]);
        table.remove_column(0);
        assert!(table.pk.is_empty());
        assert_eq!(table.columns[0].pos, 0);
    }

    #[test]
    fn test_clone_shares_untouched_nodes() {
        let schema = sample_schema();
        let mut copy = schema.clone();
        copy.find_database_mut("shop").unwrap().remove_table("items", CaseSensitivity::CaseSensitive);

        assert!(schema.has_table("shop", "items"));
        assert!(!copy.has_table("shop", "items"));
        assert!(Arc::ptr_eq(&schema.databases[1], &copy.databases[1]));
        assert!(Arc::ptr_eq(
            schema.find_table("shop", "orders").unwrap(),
            copy.find_table("shop", "orders").unwrap()
        ));
    }

    #[test]
    fn test_case_sensitivity() {
        let mut schema = sample_schema();
        assert!(!schema.has_database("SHOP"));
        schema.sensitivity = CaseSensitivity::ConvertOnCompare;
        assert!(schema.has_table("SHOP", "Orders"));
        assert_eq!(CaseSensitivity::ConvertToLower.normalize("MyTable"), "mytable");
        assert_eq!(CaseSensitivity::from_lower_case_table_names(2), CaseSensitivity::ConvertOnCompare);
    }
}
