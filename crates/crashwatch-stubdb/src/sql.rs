//! The SQL subset the stub server understands.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(x) => Some(*x),
            Self::Text(_) => None,
        }
    }

    /// Equality across numeric types.
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn between(&self, lo: &Value, hi: &Value) -> bool {
        match (self.as_f64(), lo.as_f64(), hi.as_f64()) {
            (Some(v), Some(lo), Some(hi)) => lo <= v && v <= hi,
            _ => false,
        }
    }

    pub fn add(&self, delta: &Value) -> Option<Value> {
        match (self, delta) {
            (Self::Int(a), Self::Int(b)) => Some(Self::Int(a + b)),
            _ => Some(Self::Float(self.as_f64()? + delta.as_f64()?)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Between(String, Value, Value),
}

impl Predicate {
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _) | Self::Between(c, _, _) => c,
        }
    }

    pub fn holds(&self, value: &Value) -> bool {
        match self {
            Self::Eq(_, v) => value.matches(v),
            Self::Between(_, lo, hi) => value.between(lo, hi),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Set(String, Value),
    /// `col = col + delta`
    Add(String, Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `SELECT <literal>;`
    Literal(Value),
    CreateTable {
        name: String,
        columns: Vec<String>,
    },
    CreateIndex {
        name: String,
        table: String,
        column: String,
    },
    Checkpoint,
    Insert {
        table: String,
        rows: Vec<Vec<Value>>,
    },
    Update {
        table: String,
        assignments: Vec<Assignment>,
        filter: Option<Predicate>,
    },
    Delete {
        table: String,
        filter: Option<Predicate>,
    },
    Select {
        table: String,
        projection: Projection,
        filter: Option<Predicate>,
    },
    ShowTables,
    ShowRecoveryPhase,
    ShowIoStatistics,
    Begin,
    Commit,
    Rollback,
    Crash,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(char),
}

fn tokenize(sql: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        text.push('\'');
                    }
                    Some('\'') => break,
                    Some(ch) => text.push(ch),
                    None => return Err("unterminated string literal".to_string()),
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_ascii_digit() {
            let mut number = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    number.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let token = if number.contains('.') {
                number.parse().map(Token::Float).map_err(|_| format!("bad number {number}"))?
            } else {
                number.parse().map(Token::Int).map_err(|_| format!("bad number {number}"))?
            };
            tokens.push(token);
        } else if c.is_alphanumeric() || c == '_' {
            let mut word = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    word.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else if "(),;=*+-".contains(c) {
            chars.next();
            tokens.push(Token::Sym(c));
        } else {
            return Err(format!("unexpected character `{c}`"));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.peek_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), String> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(format!("expected {keyword}"))
        }
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        let found = self.peek() == Some(&Token::Sym(sym));
        if found {
            self.pos += 1;
        }
        found
    }

    fn sym(&mut self, sym: char) -> Result<(), String> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected `{sym}`"))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w.to_ascii_lowercase()),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn literal(&mut self) -> Result<Value, String> {
        let negative = self.eat_sym('-');
        match self.next() {
            Some(Token::Int(n)) => Ok(Value::Int(if negative { -n } else { n })),
            Some(Token::Float(x)) => Ok(Value::Float(if negative { -x } else { x })),
            Some(Token::Str(s)) if !negative => Ok(Value::Text(s)),
            other => Err(format!("expected literal, found {other:?}")),
        }
    }

    fn starts_literal(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Int(_) | Token::Float(_) | Token::Str(_) | Token::Sym('-'))
        )
    }

    fn finish(&mut self) -> Result<(), String> {
        self.eat_sym(';');
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("unexpected trailing {token:?}")),
        }
    }

    fn filter(&mut self) -> Result<Option<Predicate>, String> {
        if !self.eat_keyword("WHERE") {
            return Ok(None);
        }
        let column = self.ident()?;
        if self.eat_keyword("BETWEEN") {
            let lo = self.literal()?;
            self.keyword("AND")?;
            let hi = self.literal()?;
            Ok(Some(Predicate::Between(column, lo, hi)))
        } else {
            self.sym('=')?;
            Ok(Some(Predicate::Eq(column, self.literal()?)))
        }
    }

    fn statement(&mut self) -> Result<Command, String> {
        let Some(Token::Word(first)) = self.next() else {
            return Err("expected a statement".to_string());
        };
        let command = match first.to_ascii_uppercase().as_str() {
            "CRASH" => Command::Crash,
            "BEGIN" => {
                self.eat_keyword("TRANSACTION");
                Command::Begin
            }
            "START" => {
                self.keyword("TRANSACTION")?;
                Command::Begin
            }
            "COMMIT" => Command::Commit,
            "ROLLBACK" | "ABORT" => Command::Rollback,
            "SHOW" => {
                if self.eat_keyword("TABLES") {
                    Command::ShowTables
                } else if self.eat_keyword("RECOVERY") {
                    self.keyword("PHASE")?;
                    Command::ShowRecoveryPhase
                } else {
                    self.keyword("IO")?;
                    self.keyword("STATISTICS")?;
                    Command::ShowIoStatistics
                }
            }
            "CREATE" => self.create()?,
            "INSERT" => self.insert()?,
            "UPDATE" => self.update()?,
            "DELETE" => {
                self.keyword("FROM")?;
                let table = self.ident()?;
                Command::Delete {
                    table,
                    filter: self.filter()?,
                }
            }
            "SELECT" => self.select()?,
            other => return Err(format!("unsupported statement {other}")),
        };
        self.finish()?;
        Ok(command)
    }

    fn create(&mut self) -> Result<Command, String> {
        if self.eat_keyword("STATIC_CHECKPOINT") {
            return Ok(Command::Checkpoint);
        }
        if self.eat_keyword("INDEX") {
            let name = self.ident()?;
            self.keyword("ON")?;
            let table = self.ident()?;
            self.sym('(')?;
            let column = self.ident()?;
            self.sym(')')?;
            return Ok(Command::CreateIndex {
                name,
                table,
                column,
            });
        }
        self.keyword("TABLE")?;
        let name = self.ident()?;
        self.sym('(')?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.ident()?);
            // Skip the type, including any `(n)` suffix.
            let mut depth = 0usize;
            loop {
                match self.next() {
                    Some(Token::Sym('(')) => depth += 1,
                    Some(Token::Sym(')')) if depth > 0 => depth -= 1,
                    Some(Token::Sym(')')) => return Ok(Command::CreateTable { name, columns }),
                    Some(Token::Sym(',')) if depth == 0 => break,
                    Some(_) => {}
                    None => return Err("unterminated column list".to_string()),
                }
            }
        }
    }

    fn insert(&mut self) -> Result<Command, String> {
        self.keyword("INTO")?;
        let table = self.ident()?;
        self.keyword("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.sym('(')?;
            let mut row = vec![self.literal()?];
            while self.eat_sym(',') {
                row.push(self.literal()?);
            }
            self.sym(')')?;
            rows.push(row);
            if !self.eat_sym(',') {
                break;
            }
        }
        Ok(Command::Insert { table, rows })
    }

    fn update(&mut self) -> Result<Command, String> {
        let table = self.ident()?;
        self.keyword("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.ident()?;
            self.sym('=')?;
            if self.starts_literal() {
                assignments.push(Assignment::Set(column, self.literal()?));
            } else {
                let source = self.ident()?;
                if source != column {
                    return Err(format!("unsupported expression over {source}"));
                }
                let negative = if self.eat_sym('+') {
                    false
                } else {
                    self.sym('-')?;
                    true
                };
                let delta = match self.literal()? {
                    Value::Int(n) if negative => Value::Int(-n),
                    Value::Float(x) if negative => Value::Float(-x),
                    Value::Text(_) => return Err("cannot add text".to_string()),
                    delta => delta,
                };
                assignments.push(Assignment::Add(column, delta));
            }
            if !self.eat_sym(',') {
                break;
            }
        }
        Ok(Command::Update {
            table,
            assignments,
            filter: self.filter()?,
        })
    }

    fn select(&mut self) -> Result<Command, String> {
        if self.starts_literal() {
            return Ok(Command::Literal(self.literal()?));
        }
        let projection = if self.eat_sym('*') {
            Projection::All
        } else if self.peek_keyword("COUNT") {
            self.pos += 1;
            self.sym('(')?;
            self.sym('*')?;
            self.sym(')')?;
            Projection::Count
        } else {
            let mut columns = vec![self.ident()?];
            while self.eat_sym(',') {
                columns.push(self.ident()?);
            }
            Projection::Columns(columns)
        };
        self.keyword("FROM")?;
        let table = self.ident()?;
        Ok(Command::Select {
            table,
            projection,
            filter: self.filter()?,
        })
    }
}

pub fn parse(sql: &str) -> Result<Command, String> {
    let tokens = tokenize(sql)?;
    Parser { tokens, pos: 0 }.statement()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_with_increment() {
        let command =
            parse("UPDATE district SET d_ytd = d_ytd + 25 WHERE d_id BETWEEN 3 AND 13;").unwrap();
        assert_eq!(
            command,
            Command::Update {
                table: "district".into(),
                assignments: vec![Assignment::Add("d_ytd".into(), Value::Int(25))],
                filter: Some(Predicate::Between(
                    "d_id".into(),
                    Value::Int(3),
                    Value::Int(13)
                )),
            }
        );
    }

    #[test]
    fn test_parse_schema_and_admin() {
        assert_eq!(
            parse("CREATE TABLE t (id INT, name CHAR(15), x FLOAT);").unwrap(),
            Command::CreateTable {
                name: "t".into(),
                columns: vec!["id".into(), "name".into(), "x".into()],
            }
        );
        assert_eq!(parse("CREATE STATIC_CHECKPOINT;").unwrap(), Command::Checkpoint);
        assert_eq!(parse("SHOW RECOVERY PHASE;").unwrap(), Command::ShowRecoveryPhase);
        assert_eq!(parse("crash").unwrap(), Command::Crash);
        assert_eq!(parse("SELECT 1;").unwrap(), Command::Literal(Value::Int(1)));
        assert!(parse("DROP TABLE t;").is_err());
    }

    #[test]
    fn test_parse_multi_row_insert() {
        let Command::Insert { rows, .. } =
            parse("INSERT INTO w VALUES (1, 'a''b', -0.5), (2, 'c', 3.0);").unwrap()
        else {
            panic!("not an insert");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::Text("a'b".into()));
        assert_eq!(rows[0][2], Value::Float(-0.5));
    }
}
