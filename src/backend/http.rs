//! REST adapter for a remote engine
//!
//! Statements are posted as `{"sql": ...}`:
//!
//! - `POST {target}/rest/v2/query` answers with a column-major result
//!   (`expressions`, optional `data_types`, `timestamps`, `values`)
//! - `POST {target}/rest/v2/nonQuery` answers with `{"code", "message"}`
//! - `GET {target}/ping` for health checks
//!
//! When `data_types` is absent the column type is inferred from the JSON
//! values it carries.

use crate::backend::{
    Backend, BackendError, BackendResult, BackendType, ColumnMeta, Connection, FieldValue, Row,
    RowCursor,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Status code the engine uses for success
const SUCCESS_CODE: i64 = 200;

/// Credentials and timeouts for the REST adapter
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: "root".to_string(),
            request_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Backend reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    settings: HttpSettings,
}

impl HttpBackend {
    pub fn new(settings: HttpSettings) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self { client, settings })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn connect(&self, target: &str) -> BackendResult<Box<dyn Connection>> {
        let mut conn = HttpConnection {
            client: self.client.clone(),
            target: target.to_string(),
            base_url: normalize_target(target),
            settings: self.settings.clone(),
        };

        conn.ping().await.map_err(|e| BackendError::Connect {
            target: target.to_string(),
            message: e.to_string(),
        })?;

        Ok(Box::new(conn))
    }
}

/// Prefix a bare `host:port` with a scheme and strip trailing slashes
fn normalize_target(target: &str) -> String {
    let trimmed = target.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[derive(Serialize)]
struct SqlRequest<'a> {
    sql: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecutionStatus {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    expressions: Option<Vec<String>>,
    #[serde(default)]
    column_names: Option<Vec<String>>,
    #[serde(default)]
    data_types: Option<Vec<String>>,
    #[serde(default)]
    timestamps: Vec<i64>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Connection to one remote instance
pub struct HttpConnection {
    client: Client,
    target: String,
    base_url: String,
    settings: HttpSettings,
}

impl HttpConnection {
    async fn post<T: DeserializeOwned>(&self, endpoint: &str, sql: &str) -> BackendResult<T> {
        let url = format!("{}/rest/v2/{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .json(&SqlRequest { sql })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            // Errors come back as an execution status even on the query endpoint
            match serde_json::from_str::<ExecutionStatus>(&body) {
                Ok(status) if status.code != SUCCESS_CODE => BackendError::Statement {
                    sql: sql.to_string(),
                    message: status.message,
                },
                _ => BackendError::Protocol(format!("Unexpected response from {}: {}", url, e)),
            }
        })
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn target(&self) -> &str {
        &self.target
    }

    async fn query(&mut self, sql: &str) -> BackendResult<Box<dyn RowCursor>> {
        let response: QueryResponse = self.post("query", sql).await?;
        tracing::trace!(instance = %self.target, sql, "Query answered");
        Ok(Box::new(HttpCursor::from_response(response)?))
    }

    async fn execute_batch(&mut self, statements: &[String]) -> BackendResult<()> {
        for sql in statements {
            let status: ExecutionStatus = self.post("nonQuery", sql).await?;
            if status.code != SUCCESS_CODE {
                return Err(BackendError::Statement {
                    sql: sql.clone(),
                    message: status.message,
                });
            }
        }
        Ok(())
    }

    async fn ping(&mut self) -> BackendResult<()> {
        let url = format!("{}/ping", self.base_url);
        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: response.status().as_u16(),
                message: format!("ping to {} failed", self.target),
            })
        }
    }
}

/// Cursor over a decoded column-major response
struct HttpCursor {
    columns: Vec<ColumnMeta>,
    timestamps: Vec<i64>,
    values: Vec<Vec<Value>>,
    position: usize,
}

impl HttpCursor {
    fn from_response(response: QueryResponse) -> BackendResult<Self> {
        let names = response
            .expressions
            .or(response.column_names)
            .unwrap_or_default();

        if response.values.len() != names.len() {
            return Err(BackendError::Protocol(format!(
                "{} columns but {} value lists",
                names.len(),
                response.values.len()
            )));
        }
        if let Some(column) = response
            .values
            .iter()
            .find(|column| column.len() != response.timestamps.len())
        {
            return Err(BackendError::Protocol(format!(
                "column has {} values for {} timestamps",
                column.len(),
                response.timestamps.len()
            )));
        }

        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let data_type = match response.data_types.as_ref().and_then(|t| t.get(i)) {
                    Some(declared) => BackendType::from_name(declared),
                    None => infer_type(&response.values[i]),
                };
                ColumnMeta::new(name, data_type)
            })
            .collect();

        Ok(Self {
            columns,
            timestamps: response.timestamps,
            values: response.values,
            position: 0,
        })
    }
}

#[async_trait]
impl RowCursor for HttpCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> BackendResult<Option<Row>> {
        let Some(&timestamp) = self.timestamps.get(self.position) else {
            return Ok(None);
        };

        let values = self
            .values
            .iter()
            .map(|column| field_value(&column[self.position]))
            .collect();

        self.position += 1;
        Ok(Some(Row { timestamp, values }))
    }
}

fn field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FieldValue::Integer(i)),
            None => n.as_f64().map(FieldValue::Double),
        },
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        other => Some(FieldValue::Text(other.to_string())),
    }
}

/// Widest type among the non-null values of a column
fn infer_type(values: &[Value]) -> BackendType {
    let mut inferred: Option<BackendType> = None;

    for value in values {
        let current = match value {
            Value::Null => continue,
            Value::Bool(_) => BackendType::Boolean,
            Value::Number(n) if n.is_i64() => BackendType::Int64,
            Value::Number(_) => BackendType::Double,
            _ => return BackendType::Text,
        };

        inferred = Some(match (inferred, current) {
            (None, t) => t,
            (Some(BackendType::Int64), BackendType::Double) => BackendType::Double,
            (Some(BackendType::Double), BackendType::Int64) => BackendType::Double,
            (Some(prev), t) if prev == t => t,
            _ => return BackendType::Text,
        });
    }

    inferred.unwrap_or_else(|| BackendType::Unknown("NULL".to_string()))
}
