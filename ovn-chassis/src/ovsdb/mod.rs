use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use crate::exec::{CommandOutput, CommandRunner};
use crate::vec_of_strings;

pub mod vsctl;

/// Failures talking to an OVSDB backed database through its command line tool. Any of these means
/// the view of the database is incomplete, so they are never tolerated by callers.
#[derive(Error, Debug)]
pub enum OvsdbError {
    #[error("command `{command}` failed with exit code {exit_code}, command output: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("could not decode output of `{command}`")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not launch `{command}`")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shape of `<tool> -f json find <table>` output
#[derive(Deserialize, Debug)]
struct FindResponse {
    headings: Vec<String>,
    data: Vec<Vec<Value>>,
}

/// OVSDB json output wraps typed values as `[type, value]`, i.e. `["uuid", "..."]`,
/// `["map", [[k, v], ...]]` or `["set", [...]]`. Bare scalars are left as they are.
pub fn decode_value(value: Value) -> Value {
    match value {
        Value::Array(mut pair) if pair.len() == 2 && pair[0].is_string() => pair.swap_remove(1),
        other => other,
    }
}

/// One row of a table, column name to decoded value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    columns: BTreeMap<String, Value>,
}

impl Record {
    pub fn from_row(headings: &[String], row: Vec<Value>) -> Self {
        let columns = headings
            .iter()
            .cloned()
            .zip(row.into_iter().map(decode_value))
            .collect();
        Self { columns }
    }

    /// The row identifier, stable for the lifetime of the row.
    pub fn uuid(&self) -> Option<&str> {
        self.get_str("_uuid")
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.columns.get(column).and_then(Value::as_str)
    }

    /// Read a map valued column such as `external_ids`. Missing columns and malformed entries read
    /// as empty.
    pub fn get_map(&self, column: &str) -> BTreeMap<String, String> {
        let Some(Value::Array(entries)) = self.columns.get(column) else {
            return BTreeMap::new();
        };
        entries
            .iter()
            .filter_map(|entry| match entry.as_array().map(Vec::as_slice) {
                Some([Value::String(k), Value::String(v)]) => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Read a column holding references to other rows, i.e. the `ports` of a bridge. A set with a
    /// single member is encoded as the bare reference.
    pub fn get_uuids(&self, column: &str) -> Vec<String> {
        match self.columns.get(column) {
            Some(Value::String(uuid)) => vec![uuid.clone()],
            Some(Value::Array(members)) => members
                .iter()
                .filter_map(|member| match decode_value(member.clone()) {
                    Value::String(uuid) => Some(uuid),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Rows from one query, translated into `Record`s as they are consumed.
#[derive(Debug)]
pub struct Records {
    headings: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl Iterator for Records {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(|row| Record::from_row(&self.headings, row))
    }
}

/// Simple interface to an OVSDB database through its command line tool.
///
/// OVS and OVN keep their state in databases that all come with a similar command line tool
/// (`ovs-vsctl`, `ovn-nbctl`, `ovn-sbctl`), so one accessor configured with the tool and table
/// covers all of them. Nothing is cached, every call queries the database again.
pub struct SimpleOvsdb<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    tool: String,
    table: String,
}

impl<'a, R: CommandRunner + ?Sized> SimpleOvsdb<'a, R> {
    pub fn new(
        runner: &'a R,
        tool: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            tool: tool.into(),
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// All rows of the table.
    pub async fn list_all(&self) -> Result<Records, OvsdbError> {
        self.find_table(None).await
    }

    /// Rows matching `condition`, i.e. `external_ids:owner=managed`. The condition is evaluated by
    /// the database tool.
    pub async fn find(&self, condition: &str) -> Result<Records, OvsdbError> {
        self.find_table(Some(condition)).await
    }

    pub async fn set(&self, record: &str, column: &str, value: &str) -> Result<(), OvsdbError> {
        self.run(vec_of_strings![&self.tool, "set", &self.table, record, format!("{column}={value}")]).await?;
        Ok(())
    }

    /// Remove `key` from a map or set valued column.
    pub async fn remove(&self, record: &str, column: &str, key: &str) -> Result<(), OvsdbError> {
        self.run(vec_of_strings![&self.tool, "remove", &self.table, record, column, key]).await?;
        Ok(())
    }

    pub async fn clear(&self, record: &str, column: &str) -> Result<(), OvsdbError> {
        self.run(vec_of_strings![&self.tool, "clear", &self.table, record, column]).await?;
        Ok(())
    }

    async fn find_table(&self, condition: Option<&str>) -> Result<Records, OvsdbError> {
        let mut cmd = vec_of_strings![&self.tool, "-f", "json", "find", &self.table];
        if let Some(condition) = condition {
            cmd.push(condition.to_string());
        }
        let result = self.run(cmd).await?;
        let response: FindResponse = serde_json::from_str(&result.output)
            .map_err(|source| OvsdbError::Decode { command: result.command.clone(), source })?;
        Ok(Records {
            headings: response.headings,
            rows: response.data.into_iter(),
        })
    }

    async fn run(&self, cmd: Vec<String>) -> Result<CommandOutput, OvsdbError> {
        run_checked(self.runner, cmd).await
    }
}

/// Run a database command, any nonzero exit is an error.
pub(crate) async fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    cmd: Vec<String>,
) -> Result<CommandOutput, OvsdbError> {
    let result = runner
        .execute(&cmd)
        .await
        .map_err(|source| OvsdbError::Launch { command: cmd.join(" "), source })?;
    if !result.success() {
        return Err(OvsdbError::CommandFailed {
            command: result.command,
            exit_code: result.exit_code,
            output: result.output,
        });
    }
    Ok(result)
}
