use crate::errors::InvalidTableName;
use std::fmt;

const MAX_IDENTIFIER_LEN: usize = 63;
const ERROR_LOG_SUFFIX: &str = "_error_log";

/// The pair of tables backing one queue: the mutable queue rows and the
/// append-only error log.
///
/// Names are validated once, here, because they are interpolated into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueTable {
    name: String,
    queue: String,
    error_log: String,
}

impl QueueTable {
    /// Create a queue table from `table` or `schema.table`.
    ///
    /// The error log lives next to it as `<table>_error_log`.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTableName> {
        let name = name.into();
        let (schema, table) = split_name(&name)?;
        let error_log_table = format!("{table}{ERROR_LOG_SUFFIX}");
        validate_segment(&name, &error_log_table)?;

        Ok(Self {
            queue: quote(schema, table),
            error_log: quote(schema, &error_log_table),
            name,
        })
    }

    /// Store failed attempts in `name` instead of the default error-log table.
    pub fn with_error_log(mut self, name: &str) -> Result<Self, InvalidTableName> {
        let (schema, table) = split_name(name)?;
        self.error_log = quote(schema, table);
        Ok(self)
    }

    /// The name this table was created with, unquoted.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted identifier of the queue table.
    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    /// Quoted identifier of the error-log table.
    pub(crate) fn error_log(&self) -> &str {
        &self.error_log
    }
}

impl fmt::Display for QueueTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn split_name(name: &str) -> Result<(Option<&str>, &str), InvalidTableName> {
    let mut segments = name.split('.');
    let (schema, table) = match (segments.next(), segments.next(), segments.next()) {
        (Some(table), None, None) => (None, table),
        (Some(schema), Some(table), None) => (Some(schema), table),
        _ => return Err(InvalidTableName::TooManySegments(name.to_owned())),
    };

    if let Some(schema) = schema {
        validate_segment(name, schema)?;
    }
    validate_segment(name, table)?;

    Ok((schema, table))
}

fn validate_segment(name: &str, segment: &str) -> Result<(), InvalidTableName> {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return Err(InvalidTableName::Empty(name.to_owned()));
    };
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(InvalidTableName::InvalidCharacter(name.to_owned()));
    }
    if segment.len() > MAX_IDENTIFIER_LEN {
        return Err(InvalidTableName::TooLong(name.to_owned()));
    }
    Ok(())
}

fn quote(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!(r#""{schema}"."{table}""#),
        None => format!(r#""{table}""#),
    }
}
