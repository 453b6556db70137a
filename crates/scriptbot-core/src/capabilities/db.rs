//! The `db` module: SQLite connections whose statements complete through the
//! host queue.
//!
//! Only the `sqlite3` driver exists and every connection is a private
//! in-memory database. Statements run on the blocking pool when a tokio
//! runtime is available and inline otherwise; either way the script sees the
//! outcome in a later callback.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{
    params_from_iter,
    types::{Value as SqlValue, ValueRef},
    Connection,
};
use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::{dispatch::Outbox, plugin::ScriptContext};

pub const SQLITE: &str = "sqlite3";

/// One result row keyed by column name.
pub type Row = Map<String, Value>;

/// Connection parameters. Server fields are accepted for manifest
/// compatibility but only `sqlite3` can be opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbParams {
    pub driver: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl DbParams {
    pub fn sqlite() -> Self {
        Self {
            driver: Some(SQLITE.into()),
            ..Self::default()
        }
    }
}

pub struct DbNamespace {
    outbox: Outbox,
}

impl DbNamespace {
    pub(crate) fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }

    pub fn connect(&self, params: &DbParams) -> Result<DbConnection, OperationError> {
        let driver = params.driver.as_deref().unwrap_or(SQLITE);
        if driver != SQLITE {
            return Err(OperationError::new(
                OperationErrorKind::InvalidRequest,
                format!("database driver `{driver}` is not available"),
            ));
        }
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        tracing::debug!(script = %self.outbox.script(), driver, "database connected");
        Ok(DbConnection {
            conn: Arc::new(Mutex::new(conn)),
            outbox: self.outbox.clone(),
        })
    }
}

/// An open database. Clones share the same connection.
#[derive(Clone)]
pub struct DbConnection {
    conn: Arc<Mutex<Connection>>,
    outbox: Outbox,
}

impl DbConnection {
    /// Runs a statement that returns rows. `?` placeholders take `params` in
    /// order.
    pub fn query<F>(&self, sql: &str, params: Vec<Value>, callback: F)
    where
        F: FnOnce(&mut ScriptContext, Result<Vec<Row>, OperationError>) + Send + 'static,
    {
        let sql = sql.to_string();
        self.run(move |conn| query_rows(conn, &sql, &params), callback);
    }

    /// Runs a statement without a result set; the callback receives the number
    /// of changed rows.
    pub fn exec<F>(&self, sql: &str, params: Vec<Value>, callback: F)
    where
        F: FnOnce(&mut ScriptContext, Result<usize, OperationError>) + Send + 'static,
    {
        let sql = sql.to_string();
        self.run(
            move |conn| {
                conn.execute(&sql, params_from_iter(params.iter().map(to_sql)))
                    .map_err(sql_error)
            },
            callback,
        );
    }

    fn run<T, W, F>(&self, work: W, callback: F)
    where
        T: Send + 'static,
        W: FnOnce(&Connection) -> Result<T, OperationError> + Send + 'static,
        F: FnOnce(&mut ScriptContext, Result<T, OperationError>) + Send + 'static,
    {
        let ticket = self.outbox.ticket();
        let conn = self.conn.clone();
        let job = move || {
            let result = work(&*conn.lock());
            ticket.complete(move |cx| callback(cx, result));
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, OperationError> {
    let mut statement = conn.prepare(sql).map_err(sql_error)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let mut rows = statement
        .query(params_from_iter(params.iter().map(to_sql)))
        .map_err(sql_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(sql_error)? {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            let value = row.get_ref(index).map_err(sql_error)?;
            record.insert(column.clone(), from_sql(value));
        }
        out.push(record);
    }
    Ok(out)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().copied().map(Value::from).collect()),
    }
}

fn sql_error(err: rusqlite::Error) -> OperationError {
    OperationError::new(OperationErrorKind::InvalidRequest, err.to_string())
}

#[cfg(test)]
mod tests {
    use scriptbot_plugin_sdk::{Manifest, ScriptConfig};
    use serde_json::json;

    use super::*;
    use crate::{
        capabilities::Db,
        config::HostConfig,
        dispatch::EventHub,
        host::ScriptHost,
        plugin::ScriptId,
        registry::Capability,
    };

    type Outcomes = Arc<Mutex<Vec<Result<Value, OperationError>>>>;

    fn with_db<F>(outcomes: &Outcomes, body: F) -> ScriptHost
    where
        F: Fn(&DbConnection, Outcomes) + Send + 'static,
    {
        let mut host = ScriptHost::new(HostConfig::default()).unwrap();
        let sink = outcomes.clone();
        let main = move |cx: &mut ScriptContext, _: &ScriptConfig, _: &Manifest| -> anyhow::Result<()> {
            let db = cx.require::<Db>()?;
            let conn = db.connect(&DbParams::sqlite())?;
            body(&conn, sink.clone());
            Ok(())
        };
        let id = host
            .register_plugin(
                Manifest::new("sql", "tester", "db test", "1.0").with_modules([Db::NAME.as_str()]),
                main,
            )
            .unwrap();
        host.load(id).unwrap();
        host.start(id).unwrap();
        host
    }

    #[test]
    fn statements_complete_in_order_through_the_queue() {
        let outcomes: Outcomes = Arc::default();
        let mut host = with_db(&outcomes, |conn, sink| {
            conn.exec("CREATE TABLE quotes (id INTEGER PRIMARY KEY, text TEXT, score REAL)", vec![], {
                let sink = sink.clone();
                move |_, result| sink.lock().push(result.map(Value::from))
            });
            conn.exec(
                "INSERT INTO quotes (text, score) VALUES (?, ?), (?, ?)",
                vec![json!("hi"), json!(1.5), json!("'); DROP TABLE quotes; --"), json!(null)],
                {
                    let sink = sink.clone();
                    move |_, result| sink.lock().push(result.map(Value::from))
                },
            );
            conn.query("SELECT text, score FROM quotes ORDER BY id", vec![], move |_, result| {
                sink.lock()
                    .push(result.map(|rows| Value::Array(rows.into_iter().map(Value::Object).collect())))
            });
        });

        assert!(outcomes.lock().is_empty());
        assert_eq!(host.pump(), 3);
        let outcomes = outcomes.lock();
        assert_eq!(outcomes[0], Ok(json!(0)));
        assert_eq!(outcomes[1], Ok(json!(2)));
        assert_eq!(
            outcomes[2],
            Ok(json!([
                {"text": "hi", "score": 1.5},
                {"text": "'); DROP TABLE quotes; --", "score": null}
            ]))
        );
    }

    #[test]
    fn bad_sql_reports_an_error_only() {
        let outcomes: Outcomes = Arc::default();
        let mut host = with_db(&outcomes, |conn, sink| {
            conn.query("SELEC nothing", vec![], move |_, result| {
                sink.lock().push(result.map(|rows| Value::from(rows.len())))
            });
        });
        host.pump();
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], Err(err) if err.kind == OperationErrorKind::InvalidRequest));
    }

    #[test]
    fn only_sqlite_can_be_opened() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let outbox = Outbox::new(ScriptId(0), Arc::default(), tx, EventHub::new());
        let db = DbNamespace::new(outbox);
        let params = DbParams {
            driver: Some("mysql".into()),
            host: Some("127.0.0.1".into()),
            ..DbParams::default()
        };
        assert_eq!(
            db.connect(&params).err().map(|err| err.kind),
            Some(OperationErrorKind::InvalidRequest)
        );
        assert!(db.connect(&DbParams::default()).is_ok());
    }
}
