use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension as _, params};
use tokio::sync::Semaphore;

use crate::{
    config::DbConfig,
    error::StoreError,
    record::{RequestRecord, ResponseRecord},
};

const SCHEMA_VERSION: i32 = 1;

/// Request/response persistence. Cheap to clone; every clone shares the same
/// bound on concurrently running operations.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db_path: PathBuf,
    permits: Arc<Semaphore>,
}

impl RecordStore {
    pub fn from_config(config: &DbConfig) -> anyhow::Result<Self> {
        Self::open(config.path.clone(), config.max_connections)
    }

    pub fn open(db_path: PathBuf, max_connections: usize) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let mut conn = open_connection(&db_path)
            .with_context(|| format!("open record store {}", db_path.display()))?;
        migrate(&mut conn)?;

        Ok(Self {
            db_path,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn insert_request(&self, request: RequestRecord) -> Result<i64, StoreError> {
        self.run("insert_request", move |conn| {
            insert_request_blocking(conn, &request)
        })
        .await
    }

    pub async fn insert_response(
        &self,
        request_id: i64,
        response: ResponseRecord,
    ) -> Result<(), StoreError> {
        self.run("insert_response", move |conn| {
            insert_response_blocking(conn, request_id, &response)
        })
        .await
    }

    /// Stores the request and, when present, its response. Returns the
    /// request id.
    pub async fn record_transaction(
        &self,
        request: RequestRecord,
        response: Option<ResponseRecord>,
    ) -> Result<i64, StoreError> {
        let request_id = self.insert_request(request).await?;
        if let Some(response) = response {
            self.insert_response(request_id, response).await?;
        }
        Ok(request_id)
    }

    /// Every stored request, oldest first.
    pub async fn list_all(&self) -> Result<Vec<RequestRecord>, StoreError> {
        self.run("list_all", list_all_blocking).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<RequestRecord, StoreError> {
        self.run("get_by_id", move |conn| get_by_id_blocking(conn, id))
            .await
    }

    pub async fn get_response(&self, request_id: i64) -> Result<Option<ResponseRecord>, StoreError> {
        self.run("get_response", move |conn| {
            get_response_blocking(conn, request_id)
        })
        .await
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| StoreError::Backend(format!("{operation}: {err}")))?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            f(&mut conn)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("join {operation} task: {err}")))?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS requests (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  method TEXT NOT NULL,
                  scheme TEXT NOT NULL,
                  host TEXT NOT NULL,
                  path TEXT NOT NULL,
                  get_params TEXT NOT NULL,
                  headers TEXT NOT NULL,
                  cookies TEXT NOT NULL,
                  post_params TEXT NOT NULL,
                  raw BLOB NOT NULL,
                  is_https INTEGER NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS responses (
                  request_id INTEGER PRIMARY KEY REFERENCES requests(id) ON DELETE CASCADE,
                  code INTEGER NOT NULL,
                  message TEXT NOT NULL,
                  headers TEXT NOT NULL,
                  body BLOB NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported record store schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn insert_request_blocking(conn: &Connection, request: &RequestRecord) -> Result<i64, StoreError> {
    conn.execute(
        r#"
        INSERT INTO requests (
          method,
          scheme,
          host,
          path,
          get_params,
          headers,
          cookies,
          post_params,
          raw,
          is_https,
          created_at_unix_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            request.method,
            request.scheme,
            request.host,
            request.path,
            to_json(&request.get_params, "get_params")?,
            to_json(&request.headers, "headers")?,
            to_json(&request.cookies, "cookies")?,
            to_json(&request.post_params, "post_params")?,
            request.raw,
            request.is_https,
            request.created_at_unix_ms,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

fn insert_response_blocking(
    conn: &mut Connection,
    request_id: i64,
    response: &ResponseRecord,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    let exists = tx
        .query_row(
            "SELECT 1 FROM requests WHERE id = ?1",
            params![request_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(StoreError::NotFound(request_id));
    }

    let inserted = tx.execute(
        r#"
        INSERT INTO responses (request_id, code, message, headers, body)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            request_id,
            i64::from(response.code),
            response.message,
            to_json(&response.headers, "response headers")?,
            response.body,
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            return Err(StoreError::Duplicate(request_id));
        }
        Err(err) => return Err(err.into()),
    }

    tx.commit()?;
    Ok(())
}

const REQUEST_COLUMNS: &str = "id, method, scheme, host, path, get_params, headers, cookies, \
                               post_params, raw, is_https, created_at_unix_ms";

fn list_all_blocking(conn: &mut Connection) -> Result<Vec<RequestRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests ORDER BY id ASC"
    ))?;
    let mut rows = stmt.query([])?;

    let mut requests = Vec::new();
    while let Some(row) = rows.next()? {
        requests.push(deserialize_request(row)?);
    }
    Ok(requests)
}

fn get_by_id_blocking(conn: &mut Connection, id: i64) -> Result<RequestRecord, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => deserialize_request(row),
        None => Err(StoreError::NotFound(id)),
    }
}

fn get_response_blocking(
    conn: &mut Connection,
    request_id: i64,
) -> Result<Option<ResponseRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT request_id, code, message, headers, body FROM responses WHERE request_id = ?1",
    )?;
    let mut rows = stmt.query(params![request_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let code = row.get::<_, i64>(1)?;
    let headers_json = row.get::<_, String>(3)?;
    Ok(Some(ResponseRecord {
        request_id: row.get(0)?,
        code: u16::try_from(code)
            .map_err(|_| StoreError::Backend(format!("response code {code} out of range")))?,
        message: row.get(2)?,
        headers: from_json(&headers_json, "response headers")?,
        body: row.get(4)?,
    }))
}

fn deserialize_request(row: &rusqlite::Row<'_>) -> Result<RequestRecord, StoreError> {
    let get_params_json = row.get::<_, String>(5)?;
    let headers_json = row.get::<_, String>(6)?;
    let cookies_json = row.get::<_, String>(7)?;
    let post_params_json = row.get::<_, String>(8)?;

    Ok(RequestRecord {
        id: row.get(0)?,
        method: row.get(1)?,
        scheme: row.get(2)?,
        host: row.get(3)?,
        path: row.get(4)?,
        get_params: from_json(&get_params_json, "get_params")?,
        headers: from_json(&headers_json, "headers")?,
        cookies: from_json::<BTreeMap<String, String>>(&cookies_json, "cookies")?,
        post_params: from_json::<BTreeMap<String, String>>(&post_params_json, "post_params")?,
        raw: row.get(9)?,
        is_https: row.get(10)?,
        created_at_unix_ms: row.get(11)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T, field_name: &str) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::Backend(format!("serialize {field_name}: {err}")))
}

fn from_json<T: serde::de::DeserializeOwned>(
    json: &str,
    field_name: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(json)
        .map_err(|err| StoreError::Backend(format!("deserialize {field_name}: {err}")))
}
