//! MySQL가 binlog에 남기는 DDL 부분집합을 위한 재귀 하강 파서

use super::change::{
    charset_for_collation, ColumnMod, ColumnPosition, DatabaseAlter, DatabaseCreate,
    DatabaseDrop, SchemaChange, TableAlter, TableCreate, TableDrop,
};
use super::lexer::{tokenize, Token};
use crate::error::{CdcError, Result};
use crate::schema::column::{unalias_type, ColumnDef};

/// 컬럼 정의 파싱 결과. PRIMARY KEY 컬럼 옵션은 테이블 기본 키로 올라간다.
struct ParsedColumn {
    definition: ColumnDef,
    primary_key: bool,
}

pub struct Parser<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    default_database: Option<&'a str>,
}

impl<'a> Parser<'a> {
    pub fn new(sql: &'a str, default_database: Option<&'a str>) -> Result<Self> {
        Ok(Parser {
            sql,
            tokens: tokenize(sql)?,
            pos: 0,
            default_database,
        })
    }

    /// 한 문장을 파싱한다. 스키마와 무관한 문장은 빈 목록.
    pub fn parse(mut self) -> Result<Vec<SchemaChange>> {
        let changes = if self.accept_word("CREATE") {
            self.parse_create()?
        } else if self.accept_word("ALTER") {
            self.parse_alter()?
        } else if self.accept_word("DROP") {
            self.parse_drop()?
        } else if self.accept_word("RENAME") {
            if self.accept_word("TABLE") || self.accept_word("TABLES") {
                self.parse_rename_table()?
            } else {
                return Ok(Vec::new());
            }
        } else {
            return Ok(Vec::new());
        };

        Ok(changes)
    }

    // ---- 토큰 헬퍼 ----

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        match self.peek() {
            None => true,
            Some(t) => t.is_symbol(';') && self.pos + 1 == self.tokens.len(),
        }
    }

    fn error(&self, message: impl Into<String>) -> CdcError {
        let near = self
            .peek()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "end of statement".to_string());
        CdcError::parse(self.sql, format!("{} near '{}'", message.into(), near))
    }

    fn peek_word(&self, keyword: &str) -> bool {
        self.peek().map_or(false, |t| t.is_word(keyword))
    }

    fn peek_symbol(&self, c: char) -> bool {
        self.peek().map_or(false, |t| t.is_symbol(c))
    }

    fn accept_word(&mut self, keyword: &str) -> bool {
        if self.peek_word(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// 여러 단어가 연속으로 모두 있을 때만 소비한다
    fn accept_words(&mut self, keywords: &[&str]) -> bool {
        let matched = keywords
            .iter()
            .enumerate()
            .all(|(i, k)| self.peek_at(i).map_or(false, |t| t.is_word(k)));
        if matched {
            self.pos += keywords.len();
        }
        matched
    }

    fn expect_word(&mut self, keyword: &str) -> Result<()> {
        if self.accept_word(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", keyword)))
        }
    }

    fn accept_symbol(&mut self, c: char) -> bool {
        if self.peek_symbol(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, c: char) -> Result<()> {
        if self.accept_symbol(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn name(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Symbol(_)) | None => Err(self.error("expected identifier")),
            Some(t) => {
                let name = t.as_name().unwrap_or_default().to_string();
                self.pos += 1;
                Ok(name)
            }
        }
    }

    /// `[db.]table`
    fn table_ref(&mut self) -> Result<(String, String)> {
        let first = self.name()?;
        if self.accept_symbol('.') {
            let table = self.name()?;
            return Ok((first, table));
        }
        let database = self
            .default_database
            .map(str::to_string)
            .ok_or_else(|| self.error(format!("no database selected for table {}", first)))?;
        Ok((database, first))
    }

    /// `[db.][table.]column`: 마지막 조각만 쓴다
    fn column_name(&mut self) -> Result<String> {
        let mut name = self.name()?;
        while self.accept_symbol('.') {
            name = self.name()?;
        }
        Ok(name)
    }

    fn if_not_exists(&mut self) -> bool {
        self.accept_words(&["IF", "NOT", "EXISTS"])
    }

    fn if_exists(&mut self) -> bool {
        self.accept_words(&["IF", "EXISTS"])
    }

    /// 여는 괄호부터 짝이 맞는 닫는 괄호까지 소비
    fn skip_parens(&mut self) -> Result<()> {
        self.expect_symbol('(')?;
        let mut depth = 1;
        while depth > 0 {
            match self.next() {
                Some(Token::Symbol('(')) => depth += 1,
                Some(Token::Symbol(')')) => depth -= 1,
                Some(_) => {}
                None => return Err(self.error("unbalanced parentheses")),
            }
        }
        Ok(())
    }

    /// 괄호 깊이 0에서 ',' 또는 ')' 직전까지 소비
    fn skip_element(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                None => return Ok(()),
                Some(t) if t.is_symbol(',') || t.is_symbol(')') => return Ok(()),
                Some(t) if t.is_symbol('(') => self.skip_parens()?,
                Some(_) => self.pos += 1,
            }
        }
    }

    /// 옵션 값: `[=] value`
    fn option_value(&mut self) -> Result<String> {
        self.accept_symbol('=');
        self.name()
    }

    /// `CHARACTER SET x` / `CHARSET x` / `COLLATE x`를 읽는다. 해당 없으면 None
    fn charset_clause(&mut self) -> Result<Option<CharsetSpec>> {
        if self.accept_words(&["CHARACTER", "SET"]) || self.accept_word("CHARSET") {
            return Ok(Some(CharsetSpec::Charset(self.option_value()?.to_lowercase())));
        }
        if self.accept_word("COLLATE") {
            return Ok(Some(CharsetSpec::Collate(self.option_value()?.to_lowercase())));
        }
        Ok(None)
    }

    // ---- CREATE ----

    fn parse_create(&mut self) -> Result<Vec<SchemaChange>> {
        if self.accept_word("DATABASE") || self.accept_word("SCHEMA") {
            let if_not_exists = self.if_not_exists();
            let database = self.name()?;
            let charset = self.database_options()?;
            return Ok(vec![SchemaChange::DatabaseCreate(DatabaseCreate {
                database,
                if_not_exists,
                charset,
            })]);
        }

        if self.accept_word("TABLE") {
            return self.parse_create_table().map(|c| vec![c]);
        }

        // VIEW, INDEX, USER, TRIGGER ... 스키마 모델과 무관
        Ok(Vec::new())
    }

    fn database_options(&mut self) -> Result<Option<String>> {
        let mut charset = None;
        let mut collation_charset = None;
        while !self.at_end() {
            self.accept_word("DEFAULT");
            match self.charset_clause()? {
                Some(CharsetSpec::Charset(c)) => charset = Some(c),
                Some(CharsetSpec::Collate(c)) => collation_charset = Some(charset_for_collation(&c)),
                None => {
                    if self.accept_word("ENCRYPTION") {
                        self.option_value()?;
                    } else if self.accept_words(&["READ", "ONLY"]) {
                        self.option_value()?;
                    } else {
                        return Err(self.error("unexpected database option"));
                    }
                }
            }
        }
        Ok(charset.or(collation_charset))
    }

    fn parse_create_table(&mut self) -> Result<SchemaChange> {
        let if_not_exists = self.if_not_exists();
        let (database, table) = self.table_ref()?;

        let mut create = TableCreate {
            database,
            table,
            if_not_exists,
            columns: Vec::new(),
            pks: Vec::new(),
            charset: None,
            like: None,
        };

        if self.accept_word("LIKE") {
            create.like = Some(self.table_ref()?);
            return Ok(SchemaChange::TableCreate(create));
        }

        if self.peek_symbol('(') && self.peek_at(1).map_or(false, |t| t.is_word("LIKE")) {
            self.pos += 2;
            create.like = Some(self.table_ref()?);
            self.expect_symbol(')')?;
            return Ok(SchemaChange::TableCreate(create));
        }

        if !self.peek_symbol('(') {
            return Err(self.error("CREATE TABLE without column definitions is not supported"));
        }
        self.expect_symbol('(')?;

        let mut column_pk: Option<String> = None;
        loop {
            if let Some(pks) = self.table_element(&mut create.columns, &mut column_pk)? {
                create.pks = pks;
            }
            if self.accept_symbol(',') {
                continue;
            }
            self.expect_symbol(')')?;
            break;
        }

        if create.pks.is_empty() {
            if let Some(pk) = column_pk {
                create.pks = vec![pk];
            }
        }

        create.charset = self.table_options()?;
        Ok(SchemaChange::TableCreate(create))
    }

    /// CREATE TABLE 괄호 안의 요소 하나. 테이블 수준 PRIMARY KEY면 그 컬럼 목록을 돌려준다.
    fn table_element(
        &mut self,
        columns: &mut Vec<ColumnDef>,
        column_pk: &mut Option<String>,
    ) -> Result<Option<Vec<String>>> {
        if self.accept_word("CONSTRAINT") {
            let keyword_follows = ["PRIMARY", "UNIQUE", "FOREIGN", "CHECK"]
                .iter()
                .any(|k| self.peek_word(k));
            if !keyword_follows {
                self.name()?;
            }
        }

        if self.accept_words(&["PRIMARY", "KEY"]) {
            return self.primary_key_columns().map(Some);
        }

        let is_index = ["INDEX", "KEY", "UNIQUE", "FULLTEXT", "SPATIAL", "FOREIGN", "CHECK"]
            .iter()
            .any(|k| self.peek_word(k));
        if is_index {
            self.skip_element()?;
            return Ok(None);
        }

        let parsed = self.column_definition(columns.len())?;
        if parsed.primary_key {
            *column_pk = Some(parsed.definition.name.clone());
        }
        columns.push(parsed.definition);
        Ok(None)
    }

    /// `[USING x] (col[(len)] [ASC|DESC], ...) [index options]`
    fn primary_key_columns(&mut self) -> Result<Vec<String>> {
        if self.accept_word("USING") {
            self.name()?;
        }
        self.expect_symbol('(')?;
        let mut pks = Vec::new();
        loop {
            if self.peek_symbol('(') {
                // 함수형 키 파트는 컬럼이 아니다
                self.skip_parens()?;
            } else {
                pks.push(self.column_name()?);
                if self.peek_symbol('(') {
                    self.skip_parens()?;
                }
                let _ = self.accept_word("ASC") || self.accept_word("DESC");
            }
            if self.accept_symbol(',') {
                continue;
            }
            self.expect_symbol(')')?;
            break;
        }
        // USING BTREE, COMMENT '...', KEY_BLOCK_SIZE 등 인덱스 옵션
        self.skip_element()?;
        Ok(pks)
    }

    /// 테이블 옵션. 지정된 기본 charset을 돌려준다.
    fn table_options(&mut self) -> Result<Option<String>> {
        let mut charset = None;
        let mut collation_charset = None;

        while !self.at_end() {
            if self.accept_symbol(',') {
                continue;
            }
            // 파티션 정의와 CREATE ... SELECT 본문은 스키마에 영향이 없다
            if ["PARTITION", "SELECT", "AS", "IGNORE", "REPLACE"]
                .iter()
                .any(|k| self.peek_word(k))
            {
                break;
            }

            self.accept_word("DEFAULT");
            match self.charset_clause()? {
                Some(CharsetSpec::Charset(c)) => charset = Some(c),
                Some(CharsetSpec::Collate(c)) => collation_charset = Some(charset_for_collation(&c)),
                None => self.generic_table_option()?,
            }
        }

        Ok(charset.or(collation_charset))
    }

    /// ENGINE=InnoDB, AUTO_INCREMENT=5, COMMENT='x', DATA DIRECTORY='..', UNION=(a,b) ...
    fn generic_table_option(&mut self) -> Result<()> {
        match self.peek() {
            Some(Token::Word(_)) => self.pos += 1,
            _ => return Err(self.error("unexpected table option")),
        }
        // DATA DIRECTORY / INDEX DIRECTORY
        self.accept_word("DIRECTORY");
        self.accept_symbol('=');
        if self.peek_symbol('(') {
            self.skip_parens()
        } else {
            self.name().map(|_| ())
        }
    }

    // ---- 컬럼 정의 ----

    fn column_definition(&mut self, pos: usize) -> Result<ParsedColumn> {
        let name = self.column_name()?;
        let data_type = self.data_type()?;
        let mut charset = data_type.charset.clone();
        let mut collation_charset: Option<String> = None;
        let mut primary_key = false;

        loop {
            if self.at_end()
                || self.peek_symbol(',')
                || self.peek_symbol(')')
                || self.peek_word("FIRST")
                || self.peek_word("AFTER")
            {
                break;
            }

            if let Some(spec) = self.charset_clause()? {
                match spec {
                    CharsetSpec::Charset(c) => charset = Some(c),
                    CharsetSpec::Collate(c) => collation_charset = Some(charset_for_collation(&c)),
                }
                continue;
            }

            if self.accept_words(&["NOT", "NULL"]) || self.accept_word("NULL") {
                continue;
            }
            if self.accept_word("DEFAULT") {
                self.default_expression()?;
                continue;
            }
            if self.accept_words(&["ON", "UPDATE"]) {
                self.default_expression()?;
                continue;
            }
            if self.accept_words(&["PRIMARY", "KEY"]) || self.accept_word("KEY") {
                primary_key = true;
                continue;
            }
            if self.accept_word("UNIQUE") {
                self.accept_word("KEY");
                continue;
            }
            if ["COMMENT", "COLUMN_FORMAT", "STORAGE", "SRID"]
                .iter()
                .any(|k| self.accept_word(k))
            {
                self.name()?;
                continue;
            }
            if self.accept_words(&["GENERATED", "ALWAYS"]) {
                self.expect_word("AS")?;
                self.skip_parens()?;
                continue;
            }
            if self.accept_word("AS") {
                self.skip_parens()?;
                continue;
            }
            if self.accept_word("CONSTRAINT") {
                if !self.peek_word("CHECK") {
                    self.name()?;
                }
                continue;
            }
            if self.accept_word("CHECK") {
                self.skip_parens()?;
                continue;
            }
            if self.accept_word("REFERENCES") {
                self.references_clause()?;
                continue;
            }
            if self.accept_words(&["NOT", "ENFORCED"]) || self.accept_words(&["SERIAL", "DEFAULT", "VALUE"]) {
                continue;
            }
            if ["AUTO_INCREMENT", "VIRTUAL", "STORED", "PERSISTENT", "VISIBLE", "INVISIBLE", "ENFORCED", "BINARY"]
                .iter()
                .any(|k| self.accept_word(k))
            {
                continue;
            }

            return Err(self.error(format!("unexpected column option for {}", name)));
        }

        let col_type = unalias_type(
            &data_type.name,
            data_type.long_string,
            data_type.length,
            data_type.byte_flag,
        );
        let length = match col_type.as_str() {
            "datetime" | "timestamp" | "time" => data_type.length,
            _ => None,
        };

        let definition = ColumnDef::build(
            name,
            &col_type,
            pos,
            charset.or(collation_charset),
            data_type.signed,
            data_type.enum_values,
            length,
        )?;

        Ok(ParsedColumn {
            definition,
            primary_key,
        })
    }

    fn data_type(&mut self) -> Result<DataType> {
        let first = match self.peek() {
            Some(Token::Word(w)) => w.to_lowercase(),
            _ => return Err(self.error("expected column type")),
        };
        self.pos += 1;

        let mut data_type = DataType {
            name: first.clone(),
            signed: true,
            ..Default::default()
        };

        // 여러 단어로 된 타입
        match first.as_str() {
            "national" => {
                let next = self.name()?.to_lowercase();
                data_type.name = match next.as_str() {
                    "varchar" => "varchar".to_string(),
                    _ => {
                        if self.accept_word("VARYING") {
                            "varchar".to_string()
                        } else {
                            "char".to_string()
                        }
                    }
                };
            }
            "char" | "character" | "nchar" => {
                if self.accept_word("VARYING") {
                    data_type.name = "varchar".to_string();
                }
            }
            "double" => {
                self.accept_word("PRECISION");
            }
            "long" => {
                if self.accept_word("VARCHAR") {
                    data_type.name = "varchar".to_string();
                    data_type.long_string = true;
                } else if self.accept_word("VARBINARY") {
                    data_type.name = "varbinary".to_string();
                    data_type.long_string = true;
                }
            }
            // BIGINT UNSIGNED NOT NULL AUTO_INCREMENT UNIQUE
            "serial" => data_type.signed = false,
            _ => {}
        }

        if self.peek_symbol('(') {
            if data_type.name == "enum" || data_type.name == "set" {
                data_type.enum_values = Some(self.enum_values()?);
            } else {
                self.expect_symbol('(')?;
                if let Some(Token::Number(n)) = self.peek() {
                    data_type.length = n.parse::<u64>().ok();
                }
                while !self.peek_symbol(')') {
                    if self.next().is_none() {
                        return Err(self.error("unterminated type length"));
                    }
                }
                self.expect_symbol(')')?;
            }
        }

        loop {
            if self.accept_word("UNSIGNED") || self.accept_word("ZEROFILL") {
                data_type.signed = false;
            } else if self.accept_word("SIGNED") {
                data_type.signed = true;
            } else if self.accept_word("BYTE") {
                data_type.byte_flag = true;
            } else if self.accept_word("ASCII") {
                data_type.charset = Some("latin1".to_string());
            } else if self.accept_word("UNICODE") {
                data_type.charset = Some("ucs2".to_string());
            } else {
                break;
            }
        }

        Ok(data_type)
    }

    fn enum_values(&mut self) -> Result<Vec<String>> {
        self.expect_symbol('(')?;
        let mut values = Vec::new();
        loop {
            match self.next() {
                Some(Token::Str(s)) => values.push(s),
                _ => return Err(self.error("expected enum value")),
            }
            if self.accept_symbol(',') {
                continue;
            }
            self.expect_symbol(')')?;
            return Ok(values);
        }
    }

    /// DEFAULT/ON UPDATE 값: 리터럴, 부호 있는 숫자, 함수 호출, 괄호 식
    fn default_expression(&mut self) -> Result<()> {
        if self.peek_symbol('(') {
            return self.skip_parens();
        }
        let _ = self.accept_symbol('-') || self.accept_symbol('+');
        self.name()?;
        if self.peek_symbol('(') {
            self.skip_parens()?;
        }
        Ok(())
    }

    fn references_clause(&mut self) -> Result<()> {
        self.table_ref()?;
        if self.peek_symbol('(') {
            self.skip_parens()?;
        }
        if self.accept_word("MATCH") {
            self.name()?;
        }
        while self.accept_word("ON") {
            if !(self.accept_word("DELETE") || self.accept_word("UPDATE")) {
                return Err(self.error("expected DELETE or UPDATE"));
            }
            if self.accept_words(&["SET", "NULL"])
                || self.accept_words(&["SET", "DEFAULT"])
                || self.accept_words(&["NO", "ACTION"])
                || self.accept_word("RESTRICT")
                || self.accept_word("CASCADE")
            {
                continue;
            }
            return Err(self.error("expected referential action"));
        }
        Ok(())
    }

    fn column_position(&mut self) -> Result<ColumnPosition> {
        if self.accept_word("FIRST") {
            return Ok(ColumnPosition::First);
        }
        if self.accept_word("AFTER") {
            return Ok(ColumnPosition::After(self.column_name()?));
        }
        Ok(ColumnPosition::Default)
    }

    // ---- ALTER ----

    fn parse_alter(&mut self) -> Result<Vec<SchemaChange>> {
        let _ = self.accept_word("ONLINE") || self.accept_word("OFFLINE");
        self.accept_word("IGNORE");

        if self.accept_word("TABLE") {
            return self.parse_alter_table().map(|c| vec![c]);
        }

        if self.accept_word("DATABASE") || self.accept_word("SCHEMA") {
            let is_option_start = ["DEFAULT", "CHARACTER", "CHARSET", "COLLATE", "ENCRYPTION", "READ"]
                .iter()
                .any(|k| self.peek_word(k));
            let database = if is_option_start || self.at_end() {
                self.default_database
                    .map(str::to_string)
                    .ok_or_else(|| self.error("no database selected"))?
            } else {
                self.name()?
            };
            let charset = self.database_options()?;
            return Ok(vec![SchemaChange::DatabaseAlter(DatabaseAlter { database, charset })]);
        }

        Ok(Vec::new())
    }

    fn parse_alter_table(&mut self) -> Result<SchemaChange> {
        let (database, table) = self.table_ref()?;
        let mut alter = TableAlter {
            database,
            table,
            ..Default::default()
        };

        while !self.at_end() {
            self.alter_specification(&mut alter)?;
            if self.accept_symbol(',') {
                continue;
            }
            if !self.at_end() {
                // PARTITION BY 등 뒤따르는 절
                if self.peek_word("PARTITION") {
                    break;
                }
                return Err(self.error("expected ',' between alter specifications"));
            }
        }

        Ok(SchemaChange::TableAlter(alter))
    }

    fn alter_specification(&mut self, alter: &mut TableAlter) -> Result<()> {
        if self.accept_word("ADD") {
            return self.alter_add(alter);
        }

        if self.accept_word("CHANGE") {
            self.accept_word("COLUMN");
            let name = self.column_name()?;
            let parsed = self.column_definition(0)?;
            let position = self.column_position()?;
            if parsed.primary_key {
                alter.pks = Some(vec![parsed.definition.name.clone()]);
            }
            alter.column_mods.push(ColumnMod::Change {
                name,
                definition: parsed.definition,
                position,
            });
            return Ok(());
        }

        if self.accept_word("MODIFY") {
            self.accept_word("COLUMN");
            let parsed = self.column_definition(0)?;
            let position = self.column_position()?;
            if parsed.primary_key {
                alter.pks = Some(vec![parsed.definition.name.clone()]);
            }
            alter.column_mods.push(ColumnMod::Change {
                name: parsed.definition.name.clone(),
                definition: parsed.definition,
                position,
            });
            return Ok(());
        }

        if self.accept_word("DROP") {
            if self.accept_words(&["PRIMARY", "KEY"]) {
                alter.pks = Some(Vec::new());
                return Ok(());
            }
            if self.accept_words(&["FOREIGN", "KEY"])
                || ["INDEX", "KEY", "CHECK", "CONSTRAINT"].iter().any(|k| self.accept_word(k))
            {
                self.name()?;
                return Ok(());
            }
            self.accept_word("COLUMN");
            let if_exists = self.if_exists();
            let name = self.column_name()?;
            alter.column_mods.push(ColumnMod::Remove { name, if_exists });
            // DROP COLUMN x RESTRICT|CASCADE
            let _ = self.accept_word("RESTRICT") || self.accept_word("CASCADE");
            return Ok(());
        }

        if self.accept_word("RENAME") {
            if self.accept_word("COLUMN") {
                let old_name = self.column_name()?;
                self.expect_word("TO")?;
                let new_name = self.column_name()?;
                alter.column_mods.push(ColumnMod::Rename { old_name, new_name });
                return Ok(());
            }
            if self.accept_word("INDEX") || self.accept_word("KEY") {
                self.name()?;
                self.expect_word("TO")?;
                self.name()?;
                return Ok(());
            }
            let _ = self.accept_word("TO") || self.accept_word("AS");
            let (new_database, new_table) = self.table_ref()?;
            alter.new_database = Some(new_database);
            alter.new_table = Some(new_table);
            return Ok(());
        }

        if self.accept_word("CONVERT") {
            self.expect_word("TO")?;
            match self.charset_clause()? {
                Some(CharsetSpec::Charset(c)) => {
                    alter.convert_charset = Some(c);
                    self.charset_clause()?;
                }
                _ => return Err(self.error("expected CHARACTER SET")),
            }
            return Ok(());
        }

        if self.accept_word("ALTER") {
            if self.accept_word("INDEX") || self.accept_word("CHECK") || self.accept_word("CONSTRAINT") {
                self.name()?;
                return self.skip_element();
            }
            self.accept_word("COLUMN");
            self.column_name()?;
            if self.accept_words(&["SET", "DEFAULT"]) {
                return self.default_expression();
            }
            if self.accept_words(&["DROP", "DEFAULT"])
                || self.accept_words(&["SET", "VISIBLE"])
                || self.accept_words(&["SET", "INVISIBLE"])
            {
                return Ok(());
            }
            return Err(self.error("unexpected ALTER COLUMN action"));
        }

        if self.accept_word("ORDER") {
            self.expect_word("BY")?;
            return self.skip_element();
        }

        if self.accept_word("ENABLE") || self.accept_word("DISABLE") {
            return self.expect_word("KEYS");
        }

        if self.accept_word("DISCARD") || self.accept_word("IMPORT") {
            return self.expect_word("TABLESPACE");
        }

        if self.accept_word("FORCE")
            || self.accept_words(&["WITH", "VALIDATION"])
            || self.accept_words(&["WITHOUT", "VALIDATION"])
        {
            return Ok(());
        }

        self.accept_word("DEFAULT");
        match self.charset_clause()? {
            Some(CharsetSpec::Charset(c)) => {
                alter.default_charset = Some(c);
                // 뒤따르는 COLLATE는 charset을 바꾸지 않는다
                self.charset_clause()?;
                Ok(())
            }
            Some(CharsetSpec::Collate(c)) => {
                if alter.default_charset.is_none() {
                    alter.default_charset = Some(charset_for_collation(&c));
                }
                Ok(())
            }
            // ENGINE=..., ALGORITHM=..., LOCK=..., AUTO_INCREMENT=..., COMMENT=...
            None => self.generic_table_option(),
        }
    }

    fn alter_add(&mut self, alter: &mut TableAlter) -> Result<()> {
        let explicit_column = self.accept_word("COLUMN");

        if !explicit_column {
            if self.accept_word("CONSTRAINT") {
                if !["PRIMARY", "UNIQUE", "FOREIGN", "CHECK"].iter().any(|k| self.peek_word(k)) {
                    self.name()?;
                }
            }
            if self.accept_words(&["PRIMARY", "KEY"]) {
                alter.pks = Some(self.primary_key_columns()?);
                return Ok(());
            }
            if ["INDEX", "KEY", "UNIQUE", "FULLTEXT", "SPATIAL", "FOREIGN", "CHECK"]
                .iter()
                .any(|k| self.peek_word(k))
            {
                return self.skip_element();
            }
        }

        if self.accept_symbol('(') {
            loop {
                let parsed = self.column_definition(0)?;
                if parsed.primary_key {
                    alter.pks = Some(vec![parsed.definition.name.clone()]);
                }
                alter.column_mods.push(ColumnMod::Add {
                    definition: parsed.definition,
                    position: ColumnPosition::Default,
                });
                if self.accept_symbol(',') {
                    continue;
                }
                return self.expect_symbol(')');
            }
        }

        let parsed = self.column_definition(0)?;
        let position = self.column_position()?;
        if parsed.primary_key {
            alter.pks = Some(vec![parsed.definition.name.clone()]);
        }
        alter.column_mods.push(ColumnMod::Add {
            definition: parsed.definition,
            position,
        });
        Ok(())
    }

    // ---- DROP / RENAME ----

    fn parse_drop(&mut self) -> Result<Vec<SchemaChange>> {
        if self.accept_word("DATABASE") || self.accept_word("SCHEMA") {
            let if_exists = self.if_exists();
            let database = self.name()?;
            return Ok(vec![SchemaChange::DatabaseDrop(DatabaseDrop { database, if_exists })]);
        }

        // 임시 테이블은 스키마 모델에 없다
        if self.accept_word("TEMPORARY") {
            return Ok(Vec::new());
        }

        if !(self.accept_word("TABLE") || self.accept_word("TABLES")) {
            return Ok(Vec::new());
        }

        let if_exists = self.if_exists();
        let mut changes = Vec::new();
        loop {
            let (database, table) = self.table_ref()?;
            changes.push(SchemaChange::TableDrop(TableDrop {
                database,
                table,
                if_exists,
            }));
            if !self.accept_symbol(',') {
                break;
            }
        }
        let _ = self.accept_word("RESTRICT") || self.accept_word("CASCADE");
        self.expect_end()?;
        Ok(changes)
    }

    fn parse_rename_table(&mut self) -> Result<Vec<SchemaChange>> {
        let mut changes = Vec::new();
        loop {
            let (database, table) = self.table_ref()?;
            self.expect_word("TO")?;
            let (new_database, new_table) = self.table_ref()?;
            changes.push(SchemaChange::TableAlter(TableAlter {
                database,
                table,
                new_database: Some(new_database),
                new_table: Some(new_table),
                ..Default::default()
            }));
            if !self.accept_symbol(',') {
                break;
            }
        }
        self.expect_end()?;
        Ok(changes)
    }

    fn expect_end(&mut self) -> Result<()> {
        self.accept_symbol(';');
        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(())
    }
}

enum CharsetSpec {
    Charset(String),
    Collate(String),
}

#[derive(Default)]
struct DataType {
    name: String,
    signed: bool,
    length: Option<u64>,
    enum_values: Option<Vec<String>>,
    charset: Option<String>,
    long_string: bool,
    byte_flag: bool,
}
