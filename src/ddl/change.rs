//! 파싱된 스키마 변경과 현재 스키마에 대한 해석(resolve)
//!
//! 해석 결과(`ResolvedSchemaChange`)는 완전한 테이블 정의를 담고 있어
//! 현재 스키마 없이도 적용/직렬화할 수 있다.

use super::resolved::ResolvedSchemaChange;
use crate::error::{CdcError, Result};
use crate::schema::{ColumnDef, Schema, Table};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnPosition {
    /// 지정 없음: ADD는 끝, CHANGE/MODIFY는 원래 자리
    Default,
    First,
    After(String),
}

impl ColumnPosition {
    /// 삽입할 인덱스. AFTER 대상 컬럼이 아직 없으면 None
    fn index(&self, table: &Table, default_index: usize) -> Option<usize> {
        match self {
            ColumnPosition::Default => Some(default_index),
            ColumnPosition::First => Some(0),
            ColumnPosition::After(name) => table.find_column_index(name).map(|i| i + 1),
        }
    }
}

impl std::fmt::Display for ColumnPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnPosition::Default => write!(f, "DEFAULT"),
            ColumnPosition::First => write!(f, "FIRST"),
            ColumnPosition::After(name) => write!(f, "AFTER {}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnMod {
    Add {
        definition: ColumnDef,
        position: ColumnPosition,
    },
    /// CHANGE / MODIFY: 이름 변경 + 타입 변경 + 위치 이동
    Change {
        name: String,
        definition: ColumnDef,
        position: ColumnPosition,
    },
    Remove {
        name: String,
        if_exists: bool,
    },
    Rename {
        old_name: String,
        new_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCreate {
    pub database: String,
    pub if_not_exists: bool,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseAlter {
    pub database: String,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDrop {
    pub database: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCreate {
    pub database: String,
    pub table: String,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnDef>,
    pub pks: Vec<String>,
    pub charset: Option<String>,
    /// CREATE TABLE ... LIKE 원본 (database, table)
    pub like: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableAlter {
    pub database: String,
    pub table: String,
    pub new_database: Option<String>,
    pub new_table: Option<String>,
    pub column_mods: Vec<ColumnMod>,
    pub convert_charset: Option<String>,
    pub default_charset: Option<String>,
    /// 기본 키 전체 교체 (빈 목록은 DROP PRIMARY KEY)
    pub pks: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDrop {
    pub database: String,
    pub table: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    DatabaseCreate(DatabaseCreate),
    DatabaseAlter(DatabaseAlter),
    DatabaseDrop(DatabaseDrop),
    TableCreate(TableCreate),
    TableAlter(TableAlter),
    TableDrop(TableDrop),
}

impl SchemaChange {
    /// 이 변경이 건드리는 (database, table). 데이터베이스 단위 변경은 table이 None
    pub fn targets(&self) -> Vec<(String, Option<String>)> {
        match self {
            SchemaChange::DatabaseCreate(c) => vec![(c.database.clone(), None)],
            SchemaChange::DatabaseAlter(c) => vec![(c.database.clone(), None)],
            SchemaChange::DatabaseDrop(c) => vec![(c.database.clone(), None)],
            SchemaChange::TableCreate(c) => vec![(c.database.clone(), Some(c.table.clone()))],
            SchemaChange::TableDrop(c) => vec![(c.database.clone(), Some(c.table.clone()))],
            SchemaChange::TableAlter(c) => {
                let mut targets = vec![(c.database.clone(), Some(c.table.clone()))];
                if c.new_database.is_some() || c.new_table.is_some() {
                    targets.push((
                        c.new_database.clone().unwrap_or_else(|| c.database.clone()),
                        Some(c.new_table.clone().unwrap_or_else(|| c.table.clone())),
                    ));
                }
                targets
            }
        }
    }

    /// 현재 스키마를 기준으로 변경을 해석한다. 아무 효과가 없으면 None
    pub fn resolve(&self, schema: &Schema) -> Result<Option<ResolvedSchemaChange>> {
        match self {
            SchemaChange::DatabaseCreate(c) => resolve_database_create(c, schema),
            SchemaChange::DatabaseAlter(c) => resolve_database_alter(c, schema),
            SchemaChange::DatabaseDrop(c) => resolve_database_drop(c, schema),
            SchemaChange::TableCreate(c) => resolve_table_create(c, schema),
            SchemaChange::TableAlter(c) => resolve_table_alter(c, schema).map(Some),
            SchemaChange::TableDrop(c) => resolve_table_drop(c, schema),
        }
    }
}

fn missing_database(name: &str) -> CdcError {
    CdcError::InvalidSchema(format!("Couldn't find database '{}'", name))
}

fn missing_table(database: &str, table: &str) -> CdcError {
    CdcError::InvalidSchema(format!("Couldn't find table '{}.{}'", database, table))
}

/// 콜레이션 이름에서 charset 추출 (utf8mb4_general_ci → utf8mb4)
pub fn charset_for_collation(collation: &str) -> String {
    collation
        .split('_')
        .next()
        .unwrap_or(collation)
        .to_lowercase()
}

fn resolve_database_create(c: &DatabaseCreate, schema: &Schema) -> Result<Option<ResolvedSchemaChange>> {
    if schema.has_database(&c.database) {
        if c.if_not_exists {
            return Ok(None);
        }
        return Err(CdcError::InvalidSchema(format!(
            "Unexpectedly asked to create existing database '{}'",
            c.database
        )));
    }

    Ok(Some(ResolvedSchemaChange::DatabaseCreate {
        database: schema.sensitivity.normalize(&c.database),
        charset: c.charset.clone().unwrap_or_else(|| schema.charset.clone()),
    }))
}

fn resolve_database_alter(c: &DatabaseAlter, schema: &Schema) -> Result<Option<ResolvedSchemaChange>> {
    let db = schema
        .find_database(&c.database)
        .ok_or_else(|| missing_database(&c.database))?;

    match &c.charset {
        Some(charset) if !charset.eq_ignore_ascii_case(&db.charset) => {
            Ok(Some(ResolvedSchemaChange::DatabaseAlter {
                database: db.name.clone(),
                charset: charset.clone(),
            }))
        }
        _ => Ok(None),
    }
}

fn resolve_database_drop(c: &DatabaseDrop, schema: &Schema) -> Result<Option<ResolvedSchemaChange>> {
    match schema.find_database(&c.database) {
        Some(db) => Ok(Some(ResolvedSchemaChange::DatabaseDrop {
            database: db.name.clone(),
        })),
        None if c.if_exists => Ok(None),
        None => Err(missing_database(&c.database)),
    }
}

fn resolve_table_create(c: &TableCreate, schema: &Schema) -> Result<Option<ResolvedSchemaChange>> {
    let db = schema
        .find_database(&c.database)
        .ok_or_else(|| missing_database(&c.database))?;
    let sensitivity = schema.sensitivity;

    let definition = match &c.like {
        Some((like_db, like_table)) => {
            let source = schema
                .find_table(like_db, like_table)
                .ok_or_else(|| missing_table(like_db, like_table))?;
            let mut copy = (**source).clone();
            copy.database = db.name.clone();
            copy.name = sensitivity.normalize(&c.table);
            copy
        }
        None => {
            let mut table = Table::new(
                db.name.clone(),
                sensitivity.normalize(&c.table),
                Some(c.charset.clone().unwrap_or_else(|| db.charset.clone())),
                c.columns.clone(),
                c.pks.clone(),
            );
            check_unique_columns(&table)?;
            table.set_default_column_charsets();
            table
        }
    };

    if let Some(existing) = db.find_table(&c.table, sensitivity) {
        if c.if_not_exists {
            return Ok(None);
        }
        if existing.structurally_equals(&definition) {
            warn!(
                "Ignoring CREATE TABLE for existing table {} with identical definition",
                existing.full_name()
            );
            return Ok(None);
        }
        return Err(CdcError::InvalidSchema(format!(
            "Unexpectedly asked to create existing table {}",
            existing.full_name()
        )));
    }

    Ok(Some(ResolvedSchemaChange::TableCreate { definition }))
}

fn resolve_table_drop(c: &TableDrop, schema: &Schema) -> Result<Option<ResolvedSchemaChange>> {
    match schema.find_table(&c.database, &c.table) {
        Some(table) => Ok(Some(ResolvedSchemaChange::TableDrop {
            database: table.database.clone(),
            table: table.name.clone(),
        })),
        None if c.if_exists => Ok(None),
        None if !schema.has_database(&c.database) => Err(missing_database(&c.database)),
        None => Err(missing_table(&c.database, &c.table)),
    }
}

fn resolve_table_alter(c: &TableAlter, schema: &Schema) -> Result<ResolvedSchemaChange> {
    if !schema.has_database(&c.database) {
        return Err(missing_database(&c.database));
    }
    let original = schema
        .find_table(&c.database, &c.table)
        .ok_or_else(|| missing_table(&c.database, &c.table))?;
    let mut table = (**original).clone();

    if c.new_database.is_some() || c.new_table.is_some() {
        let new_db_name = c.new_database.as_deref().unwrap_or(&c.database);
        let new_db = schema
            .find_database(new_db_name)
            .ok_or_else(|| missing_database(new_db_name))?;
        let new_name = c.new_table.as_deref().unwrap_or(&c.table);

        let same_table = schema.sensitivity.matches(&new_db.name, &table.database)
            && schema.sensitivity.matches(new_name, &table.name);
        if !same_table && new_db.has_table(new_name, schema.sensitivity) {
            return Err(CdcError::InvalidSchema(format!(
                "Can't rename {} to existing table {}.{}",
                table.full_name(),
                new_db.name,
                new_name
            )));
        }
        table.database = new_db.name.clone();
        table.name = schema.sensitivity.normalize(new_name);
    }

    if let Some(charset) = &c.default_charset {
        table.charset = Some(charset.clone());
    }

    apply_column_mods(&mut table, &c.column_mods)?;

    if let Some(charset) = &c.convert_charset {
        table.charset = Some(charset.clone());
        for column in table.columns.iter_mut() {
            column.set_charset(charset);
        }
    }

    if let Some(pks) = &c.pks {
        table.pk = pks.clone();
    }

    table.set_default_column_charsets();

    Ok(ResolvedSchemaChange::TableAlter {
        database: original.database.clone(),
        table: original.name.clone(),
        definition: table,
    })
}

/// 한 문장 안의 컬럼 변경을 순서대로 적용한다.
///
/// AFTER 대상이 같은 문장에서 나중에 추가되는 컬럼이면 그 컬럼이 생길 때까지 미룬다.
fn apply_column_mods(table: &mut Table, mods: &[ColumnMod]) -> Result<()> {
    let mut deferred: Vec<&ColumnMod> = Vec::new();

    for m in mods {
        if !apply_column_mod(table, m)? {
            deferred.push(m);
            continue;
        }

        // 방금 생긴 컬럼을 기다리던 변경들을 다시 시도
        loop {
            let mut progressed = false;
            let mut still_waiting = Vec::new();
            for waiting in deferred.drain(..) {
                if apply_column_mod(table, waiting)? {
                    progressed = true;
                } else {
                    still_waiting.push(waiting);
                }
            }
            deferred = still_waiting;
            if !progressed || deferred.is_empty() {
                break;
            }
        }
    }

    if let Some(m) = deferred.first() {
        let target = match m {
            ColumnMod::Add { position, .. } | ColumnMod::Change { position, .. } => position.to_string(),
            _ => String::new(),
        };
        return Err(CdcError::InvalidSchema(format!(
            "Couldn't find column for {} in {}",
            target,
            table.full_name()
        )));
    }

    check_unique_columns(table)
}

/// 적용했으면 true, AFTER 대상이 없어 미뤄야 하면 false
fn apply_column_mod(table: &mut Table, m: &ColumnMod) -> Result<bool> {
    match m {
        ColumnMod::Add { definition, position } => {
            if table.has_column(&definition.name) {
                return Err(CdcError::InvalidSchema(format!(
                    "Column {} already exists in {}",
                    definition.name,
                    table.full_name()
                )));
            }
            let Some(index) = position.index(table, table.columns.len()) else {
                return Ok(false);
            };
            table.add_column(index, definition.clone());
        }
        ColumnMod::Change { name, definition, position } => {
            let old_index = table.find_column_index(name).ok_or_else(|| {
                CdcError::InvalidSchema(format!(
                    "Couldn't find column {} in {}",
                    name,
                    table.full_name()
                ))
            })?;

            // AFTER 대상 확인은 기존 컬럼을 뺀 상태에서 한다
            let mut probe = table.clone();
            probe.columns.remove(old_index);
            let Some(index) = position.index(&probe, old_index) else {
                return Ok(false);
            };

            let pk = table.pk.clone();
            table.remove_column(old_index);
            table.pk = pk;
            table.rename_pk_column(name, &definition.name);
            table.add_column(index, definition.clone());
        }
        ColumnMod::Remove { name, if_exists } => match table.find_column_index(name) {
            Some(index) => {
                table.remove_column(index);
            }
            None if *if_exists => {}
            None => {
                return Err(CdcError::InvalidSchema(format!(
                    "Couldn't find column {} to drop in {}",
                    name,
                    table.full_name()
                )))
            }
        },
        ColumnMod::Rename { old_name, new_name } => {
            let index = table.find_column_index(old_name).ok_or_else(|| {
                CdcError::InvalidSchema(format!(
                    "Couldn't find column {} to rename in {}",
                    old_name,
                    table.full_name()
                ))
            })?;
            table.columns[index].name = new_name.clone();
            table.rename_pk_column(old_name, new_name);
        }
    }
    Ok(true)
}

fn check_unique_columns(table: &Table) -> Result<()> {
    for (i, column) in table.columns.iter().enumerate() {
        if table.columns[..i]
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(&column.name))
        {
            return Err(CdcError::InvalidSchema(format!(
                "Duplicate column {} in {}",
                column.name,
                table.full_name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CaseSensitivity, Database};

    fn col(name: &str) -> ColumnDef {
        ColumnDef::build(name, "int", 0, None, true, None, None).unwrap()
    }

    fn schema() -> Schema {
        let mut schema = Schema::new("utf8", CaseSensitivity::CaseSensitive);
        let mut db = Database::new("d", "latin1");
        db.add_table(Table::new(
            "d",
            "t",
            Some("latin1".into()),
            vec![col("a"), col("b"), col("c")],
            vec!["a".into()],
        ));
        schema.add_database(db);
        schema
    }

    fn alter(mods: Vec<ColumnMod>) -> SchemaChange {
        SchemaChange::TableAlter(TableAlter {
            database: "d".into(),
            table: "t".into(),
            column_mods: mods,
            ..Default::default()
        })
    }

    fn resolved_columns(change: SchemaChange) -> Vec<String> {
        match change.resolve(&schema()).unwrap() {
            Some(ResolvedSchemaChange::TableAlter { definition, .. }) => definition.column_names(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_add_column_positions() {
        let add = |position| alter(vec![ColumnMod::Add { definition: col("x"), position }]);
        assert_eq!(resolved_columns(add(ColumnPosition::After("b".into()))), vec!["a", "b", "x", "c"]);
        assert_eq!(resolved_columns(add(ColumnPosition::First)), vec!["x", "a", "b", "c"]);
        assert_eq!(resolved_columns(add(ColumnPosition::Default)), vec!["a", "b", "c", "x"]);
    }

    #[test]
    fn test_deferred_after_within_statement() {
        let change = alter(vec![
            ColumnMod::Add { definition: col("y"), position: ColumnPosition::After("x".into()) },
            ColumnMod::Add { definition: col("x"), position: ColumnPosition::First },
        ]);
        assert_eq!(resolved_columns(change), vec!["x", "y", "a", "b", "c"]);
    }

    #[test]
    fn test_after_missing_column_fails() {
        let change = alter(vec![ColumnMod::Add {
            definition: col("y"),
            position: ColumnPosition::After("nope".into()),
        }]);
        assert!(matches!(change.resolve(&schema()), Err(CdcError::InvalidSchema(_))));
    }

    #[test]
    fn test_change_column_renames_pk() {
        let change = alter(vec![ColumnMod::Change {
            name: "a".into(),
            definition: col("id"),
            position: ColumnPosition::After("c".into()),
        }]);
        match change.resolve(&schema()).unwrap() {
            Some(ResolvedSchemaChange::TableAlter { definition, .. }) => {
                assert_eq!(definition.column_names(), vec!["b", "c", "id"]);
                assert_eq!(definition.pk, vec!["id"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_table_is_invalid_schema() {
        let change = SchemaChange::TableDrop(TableDrop {
            database: "d".into(),
            table: "nope".into(),
            if_exists: false,
        });
        assert!(matches!(change.resolve(&schema()), Err(CdcError::InvalidSchema(_))));

        let tolerant = SchemaChange::TableDrop(TableDrop {
            database: "d".into(),
            table: "nope".into(),
            if_exists: true,
        });
        assert_eq!(tolerant.resolve(&schema()).unwrap(), None);
    }

    #[test]
    fn test_charset_inheritance() {
        let change = SchemaChange::TableCreate(TableCreate {
            database: "d".into(),
            table: "n".into(),
            if_not_exists: false,
            columns: vec![
                ColumnDef::build("s", "varchar", 0, None, false, None, None).unwrap(),
                ColumnDef::build("u", "varchar", 1, Some("utf8mb4".into()), false, None, None).unwrap(),
            ],
            pks: vec![],
            charset: None,
            like: None,
        });
        match change.resolve(&schema()).unwrap() {
            Some(ResolvedSchemaChange::TableCreate { definition }) => {
                assert_eq!(definition.charset.as_deref(), Some("latin1"));
                assert_eq!(definition.columns[0].charset(), Some("latin1"));
                assert_eq!(definition.columns[1].charset(), Some("utf8mb4"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_identical_create_is_skipped() {
        let existing = schema().find_table("d", "t").unwrap().as_ref().clone();
        let change = SchemaChange::TableCreate(TableCreate {
            database: "d".into(),
            table: "t".into(),
            if_not_exists: false,
            columns: existing.columns.clone(),
            pks: existing.pk.clone(),
            charset: existing.charset.clone(),
            like: None,
        });
        assert_eq!(change.resolve(&schema()).unwrap(), None);

        let different = SchemaChange::TableCreate(TableCreate {
            database: "d".into(),
            table: "t".into(),
            if_not_exists: false,
            columns: vec![col("z")],
            pks: vec![],
            charset: None,
            like: None,
        });
        assert!(different.resolve(&schema()).is_err());
    }
}
