//! 컬럼 정의와 타입별 값 렌더링
//!
//! MySQL 컬럼 타입은 `ColumnKind` 태그로 분류하고,
//! JSON/SQL 리터럴 변환은 태그에 따라 분기한다.

use crate::error::{CdcError, Result};
use mysql_async::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const BINARY_CHARSET: &str = "binary";

/// 컬럼 종류별 고유 속성
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKind {
    /// tinyint / smallint / mediumint / int
    Int { signed: bool },
    BigInt { signed: bool },
    /// 문자열/바이너리 계열. 바이너리 타입은 charset이 "binary"
    String { charset: Option<String> },
    Enum { values: Vec<String> },
    Set { values: Vec<String> },
    Float,
    Decimal,
    Date,
    /// datetime / timestamp. length는 소수점 이하 초 정밀도 (미지정은 0)
    DateTime { length: Option<u64> },
    Time { length: Option<u64> },
    Year,
    Bit,
    Json,
    Geometry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// 정규화된 MySQL 타입명 (e.g. "varchar", "tinyint")
    #[serde(rename = "type")]
    pub col_type: String,
    pub pos: usize,
    #[serde(flatten)]
    pub kind: ColumnKind,
}

impl ColumnDef {
    /// 타입명으로부터 컬럼 정의를 만든다. 타입명은 `unalias_type`을 거친 값이어야 한다.
    pub fn build(
        name: impl Into<String>,
        col_type: &str,
        pos: usize,
        charset: Option<String>,
        signed: bool,
        enum_values: Option<Vec<String>>,
        length: Option<u64>,
    ) -> Result<ColumnDef> {
        let name: String = name.into();
        let col_type = col_type.to_lowercase();
        let kind = match col_type.as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" => ColumnKind::Int { signed },
            "bigint" => ColumnKind::BigInt { signed },
            "tinytext" | "text" | "mediumtext" | "longtext" | "varchar" | "char" => {
                ColumnKind::String { charset }
            }
            "tinyblob" | "blob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
                ColumnKind::String {
                    charset: Some(BINARY_CHARSET.to_string()),
                }
            }
            "geometry" | "geometrycollection" | "linestring" | "multilinestring"
            | "multipoint" | "multipolygon" | "polygon" | "point" => ColumnKind::Geometry,
            "float" | "double" => ColumnKind::Float,
            "decimal" => ColumnKind::Decimal,
            "date" => ColumnKind::Date,
            "datetime" | "timestamp" => ColumnKind::DateTime {
                length: Some(length.unwrap_or(0)),
            },
            "time" => ColumnKind::Time {
                length: Some(length.unwrap_or(0)),
            },
            "year" => ColumnKind::Year,
            "enum" => ColumnKind::Enum {
                values: enum_values.unwrap_or_default(),
            },
            "set" => ColumnKind::Set {
                values: enum_values.unwrap_or_default(),
            },
            "bit" => ColumnKind::Bit,
            "json" => ColumnKind::Json,
            other => {
                return Err(CdcError::InvalidSchema(format!(
                    "unsupported column type '{}' for column {}",
                    other, name
                )))
            }
        };

        Ok(ColumnDef {
            name,
            col_type,
            pos,
            kind,
        })
    }

    pub fn charset(&self) -> Option<&str> {
        match &self.kind {
            ColumnKind::String { charset } => charset.as_deref(),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind, ColumnKind::String { .. })
    }

    pub fn is_binary(&self) -> bool {
        self.charset() == Some(BINARY_CHARSET)
    }

    /// 문자열 컬럼의 charset을 바꾼다. 바이너리 컬럼과 비문자열 컬럼은 그대로 둔다.
    pub fn set_charset(&mut self, new_charset: &str) {
        if let ColumnKind::String { charset } = &mut self.kind {
            if charset.as_deref() != Some(BINARY_CHARSET) {
                *charset = Some(new_charset.to_string());
            }
        }
    }

    /// charset이 지정되지 않은 문자열 컬럼에만 기본 charset을 채운다
    pub fn set_default_charset(&mut self, default: &str) {
        if let ColumnKind::String { charset } = &mut self.kind {
            if charset.is_none() {
                *charset = Some(default.to_string());
            }
        }
    }

    pub fn is_signed(&self) -> bool {
        match self.kind {
            ColumnKind::Int { signed } | ColumnKind::BigInt { signed } => signed,
            _ => false,
        }
    }

    pub fn set_signed(&mut self, value: bool) {
        if let ColumnKind::Int { signed } | ColumnKind::BigInt { signed } = &mut self.kind {
            *signed = value;
        }
    }

    pub fn enum_values(&self) -> Option<&[String]> {
        match &self.kind {
            ColumnKind::Enum { values } | ColumnKind::Set { values } => Some(values),
            _ => None,
        }
    }

    pub fn length(&self) -> Option<u64> {
        match self.kind {
            ColumnKind::DateTime { length } | ColumnKind::Time { length } => length,
            _ => None,
        }
    }

    pub fn set_length(&mut self, value: Option<u64>) {
        if let ColumnKind::DateTime { length } | ColumnKind::Time { length } = &mut self.kind {
            *length = value;
        }
    }

    fn int_bits(&self) -> u32 {
        match self.col_type.as_str() {
            "tinyint" => 8,
            "smallint" => 16,
            "mediumint" => 24,
            "int" => 32,
            _ => 64,
        }
    }

    /// 복제/스캔으로 받은 값을 JSON으로 변환
    pub fn as_json(&self, value: &Value) -> JsonValue {
        if let Value::NULL = value {
            return JsonValue::Null;
        }

        match &self.kind {
            ColumnKind::Int { signed } | ColumnKind::BigInt { signed } => {
                int_as_json(value, *signed, self.int_bits())
            }
            ColumnKind::Float => match value {
                Value::Float(f) => JsonValue::from(*f as f64),
                Value::Double(d) => JsonValue::from(*d),
                other => text_of(other)
                    .parse::<f64>()
                    .map(JsonValue::from)
                    .unwrap_or(JsonValue::Null),
            },
            ColumnKind::Decimal => JsonValue::String(text_of(value)),
            ColumnKind::String { .. } | ColumnKind::Enum { .. } => {
                JsonValue::String(text_of(value))
            }
            ColumnKind::Set { .. } => {
                let text = text_of(value);
                if text.is_empty() {
                    return JsonValue::Array(Vec::new());
                }
                JsonValue::Array(
                    text.split(',')
                        .map(|s| JsonValue::String(s.to_string()))
                        .collect(),
                )
            }
            ColumnKind::Date => match value {
                Value::Date(y, m, d, ..) => {
                    JsonValue::String(format!("{:04}-{:02}-{:02}", y, m, d))
                }
                other => JsonValue::String(text_of(other)),
            },
            ColumnKind::DateTime { length } => match value {
                Value::Date(y, mo, d, h, mi, s, us) => JsonValue::String(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
                    y,
                    mo,
                    d,
                    h,
                    mi,
                    s,
                    fraction(*us, *length)
                )),
                other => JsonValue::String(text_of(other)),
            },
            ColumnKind::Time { length } => match value {
                Value::Time(neg, days, h, m, s, us) => {
                    let hours = *days as u64 * 24 + *h as u64;
                    JsonValue::String(format!(
                        "{}{:02}:{:02}:{:02}{}",
                        if *neg { "-" } else { "" },
                        hours,
                        m,
                        s,
                        fraction(*us, *length)
                    ))
                }
                other => JsonValue::String(text_of(other)),
            },
            ColumnKind::Year => match value {
                Value::Int(i) => JsonValue::from(*i),
                Value::UInt(u) => JsonValue::from(*u),
                other => text_of(other)
                    .parse::<i64>()
                    .map(JsonValue::from)
                    .unwrap_or(JsonValue::Null),
            },
            ColumnKind::Bit => match value {
                Value::Bytes(bytes) => {
                    JsonValue::from(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
                }
                Value::Int(i) => JsonValue::from(*i),
                Value::UInt(u) => JsonValue::from(*u),
                _ => JsonValue::Null,
            },
            ColumnKind::Json => {
                let text = text_of(value);
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            }
            ColumnKind::Geometry => match value {
                Value::Bytes(bytes) => JsonValue::String(
                    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>(),
                ),
                other => JsonValue::String(text_of(other)),
            },
        }
    }

    /// SQL 리터럴로 변환 (WHERE 절 비교/로그용)
    pub fn to_sql(&self, value: &Value) -> String {
        if let Value::NULL = value {
            return "NULL".to_string();
        }

        match &self.kind {
            ColumnKind::Int { .. }
            | ColumnKind::BigInt { .. }
            | ColumnKind::Year
            | ColumnKind::Bit
            | ColumnKind::Float => match self.as_json(value) {
                JsonValue::Null => "NULL".to_string(),
                other => other.to_string(),
            },
            ColumnKind::Decimal => text_of(value),
            ColumnKind::Set { .. } => quote_sql(&text_of(value)),
            _ => match self.as_json(value) {
                JsonValue::String(s) => quote_sql(&s),
                JsonValue::Null => "NULL".to_string(),
                other => quote_sql(&other.to_string()),
            },
        }
    }
}

fn int_as_json(value: &Value, signed: bool, bits: u32) -> JsonValue {
    let raw = match value {
        Value::Int(i) => *i,
        Value::UInt(u) => return JsonValue::from(*u),
        other => {
            let text = text_of(other);
            if let Ok(i) = text.parse::<i64>() {
                i
            } else {
                return text
                    .parse::<u64>()
                    .map(JsonValue::from)
                    .unwrap_or(JsonValue::Null);
            }
        }
    };

    // binlog은 unsigned 값을 부호 있는 정수로 전달한다
    if !signed && raw < 0 {
        if bits >= 64 {
            return JsonValue::from(raw as u64);
        }
        return JsonValue::from(raw + (1i64 << bits));
    }
    JsonValue::from(raw)
}

fn fraction(micros: u32, length: Option<u64>) -> String {
    match length {
        Some(len) if len > 0 => {
            let digits = format!("{:06}", micros);
            format!(".{}", &digits[..(len.min(6) as usize)])
        }
        _ => String::new(),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::NULL => String::new(),
        other => other.as_sql(true),
    }
}

pub fn quote_sql(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

/// 타입 별칭을 MySQL이 실제로 저장하는 타입명으로 바꾼다.
///
/// `long_string`은 `LONG VARCHAR`/`LONG VARBINARY` 형식, `byte_flag`는 `BYTE` 속성을 뜻한다.
pub fn unalias_type(col_type: &str, long_string: bool, length: Option<u64>, byte_flag: bool) -> String {
    let col_type = col_type.to_lowercase();

    if byte_flag {
        match col_type.as_str() {
            "char" | "character" => return "binary".to_string(),
            "varchar" | "varying" => return "varbinary".to_string(),
            "tinytext" => return "tinyblob".to_string(),
            "text" => return "blob".to_string(),
            "mediumtext" => return "mediumblob".to_string(),
            "longtext" => return "longblob".to_string(),
            _ => {}
        }
    }

    if long_string {
        match col_type.as_str() {
            "varchar" => return "mediumtext".to_string(),
            "varbinary" => return "mediumblob".to_string(),
            _ => {}
        }
    }

    match col_type.as_str() {
        "character" | "nchar" => "char".to_string(),
        "varying" | "nvarchar" => "varchar".to_string(),
        "bool" | "boolean" | "int1" => "tinyint".to_string(),
        "int2" => "smallint".to_string(),
        "int3" | "middleint" => "mediumint".to_string(),
        "int4" | "integer" => "int".to_string(),
        "int8" | "serial" => "bigint".to_string(),
        "float4" => "float".to_string(),
        "real" | "float8" => "double".to_string(),
        "numeric" | "fixed" => "decimal".to_string(),
        "long" => "mediumtext".to_string(),
        "text" | "blob" => match length {
            None => col_type,
            Some(len) if len < (1 << 8) => format!("tiny{}", col_type),
            Some(len) if len < (1 << 16) => col_type,
            Some(len) if len < (1 << 24) => format!("medium{}", col_type),
            Some(_) => format!("long{}", col_type),
        },
        _ => col_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(col_type: &str, signed: bool) -> ColumnDef {
        ColumnDef::build("c", col_type, 0, None, signed, None, None).unwrap()
    }

    #[test]
    fn test_build_kinds() {
        assert_eq!(col("int", true).kind, ColumnKind::Int { signed: true });
        assert!(col("varbinary", true).is_binary());
        assert_eq!(col("timestamp", true).kind, ColumnKind::DateTime { length: Some(0) });
        assert!(ColumnDef::build("c", "frobnicator", 0, None, true, None, None).is_err());
    }

    #[test]
    fn test_unsigned_int_reinterpretation() {
        assert_eq!(col("tinyint", false).as_json(&Value::Int(-1)), JsonValue::from(255));
        assert_eq!(col("int", false).as_json(&Value::Int(-1)), JsonValue::from(4294967295i64));
        assert_eq!(col("bigint", false).as_json(&Value::Int(-1)), JsonValue::from(u64::MAX));
        assert_eq!(col("int", true).as_json(&Value::Int(-1)), JsonValue::from(-1));
        assert_eq!(col("int", true).as_json(&Value::Bytes(b"42".to_vec())), JsonValue::from(42));
    }

    #[test]
    fn test_datetime_fraction() {
        let mut c = col("datetime", true);
        c.set_length(Some(3));
        let v = Value::Date(2020, 1, 2, 3, 4, 5, 123456);
        assert_eq!(c.as_json(&v), JsonValue::from("2020-01-02 03:04:05.123"));
    }

    #[test]
    fn test_set_and_json() {
        let set = ColumnDef::build("s", "set", 0, None, false, Some(vec!["a".into(), "b".into()]), None).unwrap();
        assert_eq!(set.as_json(&Value::Bytes(b"a,b".to_vec())), serde_json::json!(["a", "b"]));
        assert_eq!(col("json", false).as_json(&Value::Bytes(b"{\"k\":1}".to_vec())), serde_json::json!({"k": 1}));
    }

    #[test]
    fn test_to_sql_quotes() {
        assert_eq!(col("varchar", false).to_sql(&Value::Bytes(b"it's".to_vec())), "'it''s'");
        assert_eq!(col("int", true).to_sql(&Value::Int(7)), "7");
        assert_eq!(col("int", true).to_sql(&Value::NULL), "NULL");
    }

    #[test]
    fn test_unalias_type() {
        assert_eq!(unalias_type("boolean", false, None, false), "tinyint");
        assert_eq!(unalias_type("serial", false, None, false), "bigint");
        assert_eq!(unalias_type("real", false, None, false), "double");
        assert_eq!(unalias_type("text", false, Some(1000), false), "text");
        assert_eq!(unalias_type("text", false, Some(100_000), false), "mediumtext");
        assert_eq!(unalias_type("varchar", true, None, false), "mediumtext");
        assert_eq!(unalias_type("char", false, None, true), "binary");
    }

    #[test]
    fn test_serde_flattens_kind() {
        let c = ColumnDef::build("name", "varchar", 1, Some("utf8".into()), false, None, None).unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["kind"], "string");
        assert_eq!(json["charset"], "utf8");
        let back: ColumnDef = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
