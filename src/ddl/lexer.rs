//! DDL 토크나이저
//!
//! `/*!50100 ... */` 버전 주석은 내용을 살리고, 나머지 주석은 버린다.

use crate::error::{CdcError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// 따옴표 없는 단어 (키워드 또는 식별자)
    Word(String),
    /// `백틱` 식별자
    Quoted(String),
    /// 'string' 또는 "string"
    Str(String),
    Number(String),
    Symbol(char),
}

impl Token {
    pub fn is_word(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_symbol(&self, c: char) -> bool {
        matches!(self, Token::Symbol(s) if *s == c)
    }

    /// 식별자로 쓰일 수 있는 토큰의 이름
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Token::Word(s) | Token::Quoted(s) | Token::Str(s) | Token::Number(s) => Some(s),
            Token::Symbol(_) => None,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Word(s) | Token::Number(s) => write!(f, "{}", s),
            Token::Quoted(s) => write!(f, "`{}`", s),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Symbol(c) => write!(f, "{}", c),
        }
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // 주석
        if c == '#' || (c == '-' && chars.get(i + 1) == Some(&'-') && chars.get(i + 2).map_or(true, |n| n.is_whitespace())) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            if chars.get(i + 2) == Some(&'!') {
                // 버전 주석: "/*!" 와 버전 숫자만 건너뛰고 내용은 토큰화, 닫는 "*/"는 아래에서 버린다
                i += 3;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                continue;
            }
            let end = find_comment_end(&chars, i + 2)
                .ok_or_else(|| CdcError::parse(sql, "unterminated comment"))?;
            i = end;
            continue;
        }
        if c == '*' && chars.get(i + 1) == Some(&'/') {
            i += 2;
            continue;
        }

        match c {
            '`' => {
                let (value, next) = read_quoted(&chars, i, '`')
                    .ok_or_else(|| CdcError::parse(sql, "unterminated identifier"))?;
                tokens.push(Token::Quoted(value));
                i = next;
            }
            '\'' | '"' => {
                let (value, next) = read_quoted(&chars, i, c)
                    .ok_or_else(|| CdcError::parse(sql, "unterminated string"))?;
                tokens.push(Token::Str(value));
                i = next;
            }
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let mut word: String = chars[start..i].iter().collect();

                if word.chars().all(|ch| ch.is_ascii_digit()) {
                    // 소수점 숫자
                    if chars.get(i) == Some(&'.') && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) {
                        i += 1;
                        let frac_start = i;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                        word.push('.');
                        word.extend(&chars[frac_start..i]);
                    }
                    tokens.push(Token::Number(word));
                } else if chars.get(i) == Some(&'\'') && is_introducer(&word) {
                    // _utf8'abc', x'0f', b'01'
                    let (value, next) = read_quoted(&chars, i, '\'')
                        .ok_or_else(|| CdcError::parse(sql, "unterminated string"))?;
                    tokens.push(Token::Str(value));
                    i = next;
                } else {
                    tokens.push(Token::Word(word));
                }
            }
            other => {
                tokens.push(Token::Symbol(other));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

fn is_introducer(word: &str) -> bool {
    word.starts_with('_') || word.eq_ignore_ascii_case("x") || word.eq_ignore_ascii_case("b") || word.eq_ignore_ascii_case("n")
}

fn find_comment_end(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}

/// 따옴표로 감싼 값 읽기. 같은 따옴표 두 개는 이스케이프, 문자열에서는 백슬래시 이스케이프도 허용
fn read_quoted(chars: &[char], start: usize, quote: char) -> Option<(String, usize)> {
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && quote != '`' {
            let escaped = *chars.get(i + 1)?;
            value.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                value.push(quote);
                i += 2;
                continue;
            }
            return Some((value, i + 1));
        }
        value.push(c);
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        let tokens = tokenize("ALTER TABLE `my``tbl` ADD x int(11) DEFAULT 'a''b'").unwrap();
        assert_eq!(tokens[2], Token::Quoted("my`tbl".into()));
        assert!(tokens.contains(&Token::Number("11".into())));
        assert_eq!(tokens.last(), Some(&Token::Str("a'b".into())));
    }

    #[test]
    fn test_versioned_comment_is_unwrapped() {
        let tokens = tokenize("CREATE TABLE t (id int) /*!50100 DEFAULT CHARSET=utf8 */ /* gone */").unwrap();
        assert!(tokens.iter().any(|t| t.is_word("CHARSET")));
        assert!(!tokens.iter().any(|t| t.is_word("gone")));
    }

    #[test]
    fn test_numeric_leading_names_are_words() {
        let tokens = tokenize("shard_1.20151214_foo 1.5").unwrap();
        assert_eq!(tokens[0], Token::Word("shard_1".into()));
        assert_eq!(tokens[2], Token::Word("20151214_foo".into()));
        assert_eq!(tokens[3], Token::Number("1.5".into()));
    }

    #[test]
    fn test_line_comments() {
        let tokens = tokenize("DROP TABLE t -- trailing\n# hash\n").unwrap();
        assert_eq!(tokens.len(), 3);
    }
}
