//! SQL statements with named placeholders.

use sagakit_common::database::Error;

use crate::database::DatabaseExecutor;
use crate::value::Value;

/// The Column type
pub type Column = Value;

/// Expected response type for a given SQL statement
#[derive(Debug, Clone, Copy, Default)]
pub enum ExpectedSqlResponse {
    /// A single row
    SingleRow,
    /// All the rows that match a query
    #[default]
    ManyRows,
    /// How many rows were affected by the query
    AffectedRows,
    /// Return the first column of the first row
    Pluck,
    /// Batch
    Batch,
}

/// SQL Part
#[derive(Debug, Clone)]
pub enum SqlPart {
    /// Raw SQL statement
    Raw(String),
    /// Placeholder
    Placeholder(String, Option<Value>),
}

/// SQL parser error
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SqlParseError {
    /// Invalid SQL
    #[error("Unterminated string literal")]
    UnterminatedStringLiteral,
    /// Invalid placeholder name
    #[error("Invalid placeholder name")]
    InvalidPlaceholder,
}

/// Rudimentary SQL parser.
///
/// This function does not validate the SQL statement, it only extracts the
/// `:name` placeholders so statements stay database agnostic.
pub fn split_sql_parts(input: &str) -> Result<Vec<SqlPart>, SqlParseError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '\'' | '"' => {
                // Start of string literal
                let quote = c;
                current.push(chars.next().expect("peeked"));

                let mut closed = false;
                while let Some(&next) = chars.peek() {
                    current.push(chars.next().expect("peeked"));

                    if next == quote {
                        if chars.peek() == Some(&quote) {
                            // Escaped quote (e.g. '' inside strings)
                            current.push(chars.next().expect("peeked"));
                        } else {
                            closed = true;
                            break;
                        }
                    }
                }

                if !closed {
                    return Err(SqlParseError::UnterminatedStringLiteral);
                }
            }

            ':' => {
                // Flush current raw SQL
                if !current.is_empty() {
                    parts.push(SqlPart::Raw(std::mem::take(&mut current)));
                }

                chars.next(); // consume ':'
                let mut name = String::new();

                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        name.push(chars.next().expect("peeked"));
                    } else {
                        break;
                    }
                }

                if name.is_empty() {
                    return Err(SqlParseError::InvalidPlaceholder);
                }

                parts.push(SqlPart::Placeholder(name, None));
            }

            _ => {
                current.push(chars.next().expect("peeked"));
            }
        }
    }

    if !current.is_empty() {
        parts.push(SqlPart::Raw(current));
    }

    Ok(parts)
}

/// Sql message
#[derive(Debug, Default)]
pub struct Statement {
    /// The SQL statement
    pub parts: Vec<SqlPart>,
    /// The expected response type
    pub expected_response: ExpectedSqlResponse,
}

impl Statement {
    fn new(sql: &str) -> Result<Self, SqlParseError> {
        Ok(Self {
            parts: split_sql_parts(sql)?,
            ..Default::default()
        })
    }

    /// Convert the statement into a SQL string and the ordered list of
    /// placeholder values.
    ///
    /// Placeholders are rewritten as `$1..$n`, which binds positionally in
    /// the order of appearance.
    pub fn to_sql(self) -> Result<(String, Vec<Value>), Error> {
        let mut placeholder_values = Vec::new();
        let sql = self
            .parts
            .into_iter()
            .map(|part| match part {
                SqlPart::Placeholder(name, value) => {
                    let value = value.ok_or(Error::MissingPlaceholder(name))?;
                    placeholder_values.push(value);
                    Ok::<_, Error>(format!("${}", placeholder_values.len()))
                }
                SqlPart::Raw(raw) => Ok(raw.trim().to_string()),
            })
            .collect::<Result<Vec<String>, _>>()?
            .join(" ");

        Ok((sql, placeholder_values))
    }

    /// Binds a given placeholder to a value.
    #[inline]
    pub fn bind<C, V>(mut self, name: C, value: V) -> Self
    where
        C: AsRef<str>,
        V: Into<Value>,
    {
        let name = name.as_ref();
        let value = value.into();

        for part in self.parts.iter_mut() {
            if let SqlPart::Placeholder(part_name, part_value) = part {
                if part_name == name {
                    *part_value = Some(value.clone());
                }
            }
        }

        self
    }

    /// Executes a query and returns the affected rows
    pub async fn execute<C>(self, conn: &C) -> Result<usize, Error>
    where
        C: DatabaseExecutor,
    {
        conn.execute(self).await
    }

    /// Runs the query and returns the first column of the first row or None
    pub async fn pluck<C>(self, conn: &C) -> Result<Option<Value>, Error>
    where
        C: DatabaseExecutor,
    {
        conn.pluck(self).await
    }

    /// Runs the query as a batch of statements
    pub async fn batch<C>(self, conn: &C) -> Result<(), Error>
    where
        C: DatabaseExecutor,
    {
        conn.batch(self).await
    }

    /// Runs the query and returns the first row or None
    pub async fn fetch_one<C>(self, conn: &C) -> Result<Option<Vec<Column>>, Error>
    where
        C: DatabaseExecutor,
    {
        conn.fetch_one(self).await
    }

    /// Runs the query and returns all matching rows
    pub async fn fetch_all<C>(self, conn: &C) -> Result<Vec<Vec<Column>>, Error>
    where
        C: DatabaseExecutor,
    {
        conn.fetch_all(self).await
    }
}

/// Creates a new query statement
#[inline(always)]
pub fn query(sql: &str) -> Result<Statement, Error> {
    Statement::new(sql).map_err(|e| Error::Database(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_parts_extracts_placeholders() {
        let parts = split_sql_parts("SELECT * FROM saga WHERE id = :id AND state = :state")
            .expect("valid sql");
        let placeholders: Vec<_> = parts
            .iter()
            .filter_map(|p| match p {
                SqlPart::Placeholder(name, _) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(placeholders, vec!["id", "state"]);
    }

    #[test]
    fn test_colon_inside_string_literal_is_raw() {
        let parts = split_sql_parts("SELECT ':not_a_param' FROM x WHERE a = :a").expect("valid");
        let placeholders = parts
            .iter()
            .filter(|p| matches!(p, SqlPart::Placeholder(..)))
            .count();
        assert_eq!(placeholders, 1);
    }

    #[test]
    fn test_to_sql_positional_rewrite() {
        let stmt = query("UPDATE t SET a = :a WHERE b = :b")
            .expect("valid")
            .bind("a", 1i64)
            .bind("b", "x");
        let (sql, values) = stmt.to_sql().expect("bound");
        assert_eq!(sql, "UPDATE t SET a = $1 WHERE b = $2");
        assert_eq!(values, vec![Value::Integer(1), Value::Text("x".into())]);
    }

    #[test]
    fn test_unbound_placeholder_errors() {
        let stmt = query("SELECT :missing").expect("valid");
        assert!(stmt.to_sql().is_err());
    }
}
