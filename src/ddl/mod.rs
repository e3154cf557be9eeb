//! DDL 파싱과 스키마 적용
//!
//! binlog에서 읽은 쿼리 문자열을 `SchemaChange` 목록으로 파싱하고,
//! 현재 스키마에 대해 해석한 `ResolvedSchemaChange`를 순서대로 적용한다.
//!
//! # 사용 예
//!
//! ```ignore
//! let (next, resolved) = ddl::resolve_and_apply(sql, Some("shop"), &schema)?;
//! for change in &resolved {
//!     info!("applied {:?}", change);
//! }
//! ```

pub mod change;
pub mod lexer;
pub mod parser;
pub mod resolved;

pub use change::{ColumnMod, ColumnPosition, SchemaChange};
pub use resolved::ResolvedSchemaChange;

use crate::error::Result;
use crate::schema::Schema;
use parser::Parser;
use regex::RegexSet;
use std::sync::OnceLock;
use tracing::debug;

/// 스키마를 바꾸지 않는 문장들. 파서에 넘기기 전에 걸러낸다.
const IGNORED_STATEMENTS: &[&str] = &[
    r"(?is)^\s*BEGIN\b",
    r"(?is)^\s*COMMIT\b",
    r"(?is)^\s*ROLLBACK\b",
    r"(?is)^\s*SAVEPOINT\b",
    r"(?is)^\s*(XA)\b",
    r"(?is)^\s*FLUSH\b",
    r"(?is)^\s*GRANT\b",
    r"(?is)^\s*REVOKE\b",
    r"(?is)^\s*SET\s+PASSWORD\b",
    r"(?is)^\s*(ANALYZE|OPTIMIZE|REPAIR|CHECK|TRUNCATE)\s+(NO_WRITE_TO_BINLOG\s+|LOCAL\s+)?TABLE\b",
    r"(?is)^\s*(CREATE|ALTER|DROP)\s+((DEFINER\s*=\s*\S+\s+)|(SQL\s+SECURITY\s+\w+\s+)|(ALGORITHM\s*=\s*\w+\s+)|(AGGREGATE\s+)|(OR\s+REPLACE\s+))*(FUNCTION|PROCEDURE|TRIGGER|EVENT|VIEW)\b",
    r"(?is)^\s*(CREATE|ALTER|DROP|RENAME)\s+USER\b",
    r"(?is)^\s*(CREATE|DROP)\s+ROLE\b",
    r"(?is)^\s*(CREATE|DROP)\s+((ONLINE|OFFLINE|UNIQUE|FULLTEXT|SPATIAL)\s+)*INDEX\b",
    r"(?is)^\s*ALTER\s+TABLE\s+\S+\s+(ANALYZE|CHECK|OPTIMIZE|REBUILD|REPAIR|REORGANIZE|COALESCE|TRUNCATE|EXCHANGE|DISCARD|IMPORT|REMOVE)\s+PARTITION",
    r"(?is)^\s*ALTER\s+TABLE\s+\S+\s+(ADD|DROP)\s+PARTITION",
    r"(?is)^\s*CREATE\s+TEMPORARY\s+TABLE\b",
    r"(?is)^\s*(CREATE|ALTER|DROP)\s+(LOGFILE\s+GROUP|TABLESPACE|SERVER)\b",
];

fn ignored_statements() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(IGNORED_STATEMENTS).unwrap_or_else(|_| RegexSet::empty()))
}

/// 스키마와 무관한 문장이면 true
pub fn is_ignored(sql: &str) -> bool {
    let stripped = strip_leading_comments(sql);
    ignored_statements().is_match(stripped)
}

/// 맨 앞의 `/* ... */` 주석 제거 (버전 주석 `/*!`은 남긴다)
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    while rest.starts_with("/*") && !rest.starts_with("/*!") {
        match rest.find("*/") {
            Some(end) => rest = rest[end + 2..].trim_start(),
            None => break,
        }
    }
    rest
}

/// 한 문장을 파싱한다. 스키마를 바꾸지 않는 문장은 빈 목록을 돌려준다.
pub fn parse(sql: &str, current_database: Option<&str>) -> Result<Vec<SchemaChange>> {
    if is_ignored(sql) {
        debug!("Ignoring non-schema statement: {}", sql);
        return Ok(Vec::new());
    }
    Parser::new(sql, current_database)?.parse()
}

/// 파싱, 해석, 적용을 한 번에 한다.
///
/// 같은 문장 안의 변경은 앞 변경이 적용된 스키마를 기준으로 해석된다
/// (`RENAME TABLE a TO b, b TO c`).
pub fn resolve_and_apply(
    sql: &str,
    current_database: Option<&str>,
    schema: &Schema,
) -> Result<(Schema, Vec<ResolvedSchemaChange>)> {
    let changes = parse(sql, current_database)?;
    let mut current = schema.clone();
    let mut resolved = Vec::new();

    for change in changes {
        if let Some(r) = change.resolve(&current)? {
            current = r.apply(&current)?;
            resolved.push(r);
        }
    }

    Ok((current, resolved))
}

/// 이미 해석된 변경들을 순서대로 적용 (델타 체인 재생용)
pub fn apply_all(schema: &Schema, changes: &[ResolvedSchemaChange]) -> Result<Schema> {
    changes.iter().try_fold(schema.clone(), |current, change| change.apply(&current))
}
