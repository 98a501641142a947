//! REST backend: the real wire client for an Azure-Tables-compatible
//! endpoint (cloud or emulator).
//!
//! Covers the four operations the harness needs: create table, insert
//! entity, multipart batch, and filtered/paged listing. Requests are signed
//! with SharedKeyLite (HMAC-SHA256 over the date and canonicalized
//! resource).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{Continuation, QueryPage, TableBackend};
use crate::batch::{BatchOperation, BatchResponse, BatchResult};
use crate::connection::ConnectionString;
use crate::entity::TableEntity;
use crate::error::{Result, TableError};
use crate::query::QueryOptions;

const API_VERSION: &str = "2019-02-02";
const ODATA_ACCEPT: &str = "application/json;odata=minimalmetadata";

type HmacSha256 = Hmac<Sha256>;

pub struct RestBackend {
    http: reqwest::Client,
    /// Endpoint with any trailing slash removed, e.g.
    /// `http://127.0.0.1:10002/devstoreaccount1`.
    endpoint: String,
    /// Path component of the endpoint; the emulator carries the account name
    /// here and it participates in the canonicalized resource.
    base_path: String,
    account: String,
    key: Vec<u8>,
}

impl RestBackend {
    pub fn new(conn: ConnectionString) -> Result<Self> {
        let key = conn.decoded_key()?;
        let endpoint = conn.table_endpoint.trim_end_matches('/').to_string();

        let base_path = match endpoint.split_once("://") {
            Some((_, rest)) => match rest.find('/') {
                Some(idx) => rest[idx..].to_string(),
                None => String::new(),
            },
            None => {
                return Err(TableError::Config(format!(
                    "TableEndpoint is not a URL: {}",
                    endpoint
                )));
            }
        };

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            base_path,
            account: conn.account_name,
            key,
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}{}", self.endpoint, resource)
    }

    /// SharedKeyLite canonicalized resource: `/account/path`, query string
    /// excluded. For emulator endpoints the account appears twice, once for
    /// the signature and once from the URL path.
    fn canonical_resource(&self, resource: &str) -> String {
        format!("/{}{}{}", self.account, self.base_path, resource)
    }

    fn string_to_sign(&self, date: &str, resource: &str) -> String {
        format!("{}\n{}", date, self.canonical_resource(resource))
    }

    fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| TableError::Config("AccountKey has an invalid length".into()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, resource: &str) -> Result<Vec<(&'static str, String)>> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let signature = self.sign(&self.string_to_sign(&date, resource))?;

        Ok(vec![
            ("x-ms-date", date),
            ("x-ms-version", API_VERSION.to_string()),
            (
                "Authorization",
                format!("SharedKeyLite {}:{}", self.account, signature),
            ),
            ("DataServiceVersion", "3.0;NetFx".to_string()),
            ("MaxDataServiceVersion", "3.0;NetFx".to_string()),
        ])
    }

    fn request(&self, method: reqwest::Method, resource: &str) -> Result<reqwest::RequestBuilder> {
        let mut builder = self
            .http
            .request(method, self.url(resource))
            .header("Accept", ODATA_ACCEPT);
        for (name, value) in self.auth_headers(resource)? {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }

    /// Map a non-success response to the error taxonomy, using the OData
    /// error code when the body carries one.
    fn classify_error(&self, table: &str, status: u16, body: &str) -> TableError {
        let code = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.pointer("/odata.error/code")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        match status {
            404 => TableError::TableNotFound(table.to_string()),
            409 if code == "TableAlreadyExists" => TableError::Conflict {
                resource: format!("table {}", table),
            },
            409 => TableError::Conflict {
                resource: format!("entity in table {}", table),
            },
            400 => TableError::Validation(format!("{}: {}", code, body)),
            _ => TableError::Transport(format!("status {} ({}): {}", status, code, body)),
        }
    }

    fn entity_resource(table: &str, entity: &TableEntity) -> String {
        // Single quotes inside key values are doubled, as in filter literals.
        let escape = |s: &str| s.replace('\'', "''");
        format!(
            "/{}(PartitionKey='{}',RowKey='{}')",
            table,
            escape(entity.partition_key()),
            escape(entity.row_key())
        )
    }

    /// Render the multipart/mixed batch payload: one changeset holding one
    /// embedded HTTP request per operation.
    fn batch_body(
        &self,
        table: &str,
        operations: &[BatchOperation],
        batch_boundary: &str,
        changeset_boundary: &str,
    ) -> String {
        let mut body = String::new();
        body.push_str(&format!("--{}\r\n", batch_boundary));
        body.push_str(&format!(
            "Content-Type: multipart/mixed; boundary={}\r\n\r\n",
            changeset_boundary
        ));

        for op in operations {
            let (verb, uri) = match op {
                BatchOperation::Insert { .. } => ("POST", self.url(&format!("/{}", table))),
                BatchOperation::InsertOrReplace { entity, .. } => {
                    ("PUT", self.url(&Self::entity_resource(table, entity)))
                }
                BatchOperation::InsertOrMerge { entity, .. } => {
                    ("MERGE", self.url(&Self::entity_resource(table, entity)))
                }
            };
            let prefer = if op.echo() {
                "return-content"
            } else {
                "return-no-content"
            };
            let payload = op.entity().to_wire_json().to_string();

            body.push_str(&format!("--{}\r\n", changeset_boundary));
            body.push_str("Content-Type: application/http\r\n");
            body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
            body.push_str(&format!("{} {} HTTP/1.1\r\n", verb, uri));
            body.push_str(&format!("Accept: {}\r\n", ODATA_ACCEPT));
            body.push_str("Content-Type: application/json\r\n");
            body.push_str(&format!("Prefer: {}\r\n", prefer));
            body.push_str(&format!("Content-Length: {}\r\n\r\n", payload.len()));
            body.push_str(&payload);
            body.push_str("\r\n");
        }

        body.push_str(&format!("--{}--\r\n", changeset_boundary));
        body.push_str(&format!("--{}--\r\n", batch_boundary));
        body
    }

    /// Pick apart the multipart batch response. Sub-responses arrive in
    /// operation order; any embedded failure fails the whole batch, matching
    /// its all-or-nothing semantics.
    fn parse_batch_response(
        &self,
        table: &str,
        operations: &[BatchOperation],
        body: &str,
    ) -> Result<BatchResult> {
        let mut parts = Vec::new();
        for chunk in body.split("HTTP/1.1 ").skip(1) {
            let status: u16 = chunk
                .get(..3)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    TableError::Transport(format!("unparseable batch response: {}", chunk))
                })?;
            parts.push((status, chunk));
        }

        for (status, chunk) in &parts {
            if *status >= 400 {
                let payload = chunk
                    .split_once("\r\n\r\n")
                    .map(|(_, rest)| rest)
                    .unwrap_or(chunk);
                let payload = payload.split("\r\n--").next().unwrap_or(payload).trim();
                return Err(self.classify_error(table, *status, payload));
            }
        }

        if parts.len() != operations.len() {
            return Err(TableError::Transport(format!(
                "batch returned {} responses for {} operations",
                parts.len(),
                operations.len()
            )));
        }

        let mut responses = Vec::with_capacity(operations.len());
        for (op, (_, chunk)) in operations.iter().zip(parts.iter()) {
            let echoed = if op.echo() {
                let payload = chunk
                    .split_once("\r\n\r\n")
                    .map(|(_, rest)| rest)
                    .unwrap_or("");
                let payload = payload.split("\r\n--").next().unwrap_or("").trim();
                let value: Value = serde_json::from_str(payload).map_err(|e| {
                    TableError::Transport(format!("malformed echoed entity: {}", e))
                })?;
                Some(TableEntity::from_wire_json(&value)?)
            } else {
                None
            };
            responses.push(BatchResponse {
                row_key: op.entity().row_key().to_string(),
                echoed,
            });
        }

        Ok(BatchResult { responses })
    }
}

#[async_trait]
impl TableBackend for RestBackend {
    async fn create_table(&self, table: &str) -> Result<()> {
        let resource = "/Tables";
        let body = serde_json::json!({ "TableName": table });

        let response = self
            .request(reqwest::Method::POST, resource)?
            .header("Content-Type", "application/json")
            .header("Prefer", "return-no-content")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            201 | 204 => {
                info!(table, "created table");
                Ok(())
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(self.classify_error(table, status, &body))
            }
        }
    }

    async fn insert_entity(&self, table: &str, entity: &TableEntity) -> Result<()> {
        let resource = format!("/{}", table);

        let response = self
            .request(reqwest::Method::POST, &resource)?
            .header("Content-Type", "application/json")
            .header("Prefer", "return-no-content")
            .json(&entity.to_wire_json())
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            201 | 204 => Ok(()),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(self.classify_error(table, status, &body))
            }
        }
    }

    async fn submit_batch(
        &self,
        table: &str,
        operations: &[BatchOperation],
    ) -> Result<BatchResult> {
        if operations.is_empty() {
            return Err(TableError::Validation("batch has no operations".into()));
        }

        let resource = "/$batch";
        let batch_boundary = format!("batch_{}", Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", Uuid::new_v4());
        let body = self.batch_body(table, operations, &batch_boundary, &changeset_boundary);

        debug!(table, operations = operations.len(), "submitting batch");

        let response = self
            .request(reqwest::Method::POST, resource)?
            .header(
                "Content-Type",
                format!("multipart/mixed; boundary={}", batch_boundary),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        if status != 200 && status != 202 {
            return Err(self.classify_error(table, status, &text));
        }

        self.parse_batch_response(table, operations, &text)
    }

    async fn query_entities(
        &self,
        table: &str,
        options: &QueryOptions,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage> {
        let resource = format!("/{}()", table);

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(filter) = &options.filter {
            params.push(("$filter", filter.clone()));
        }
        if let Some(select) = &options.select {
            params.push(("$select", select.join(",")));
        }
        if let Some(top) = options.top {
            params.push(("$top", top.to_string()));
        }
        if let Some(token) = continuation {
            params.push(("NextPartitionKey", token.next_partition_key.clone()));
            if !token.next_row_key.is_empty() {
                params.push(("NextRowKey", token.next_row_key.clone()));
            }
        }

        let response = self
            .request(reqwest::Method::GET, &resource)?
            .query(&params)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_error(table, status, &body));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let next = header("x-ms-continuation-NextPartitionKey").map(|pk| Continuation {
            next_partition_key: pk,
            next_row_key: header("x-ms-continuation-NextRowKey").unwrap_or_default(),
        });

        let payload: Value = response
            .json()
            .await
            .map_err(|e| TableError::Transport(format!("malformed query response: {}", e)))?;
        let rows = payload
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| TableError::Transport("query response has no value array".into()))?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            entities.push(TableEntity::from_wire_json(row)?);
        }

        Ok(QueryPage {
            entities,
            continuation: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EMULATOR_CONNECTION_STRING;

    fn backend() -> RestBackend {
        let conn = ConnectionString::parse(EMULATOR_CONNECTION_STRING).unwrap();
        RestBackend::new(conn).unwrap()
    }

    fn sample_ops() -> Vec<BatchOperation> {
        let insert = TableEntity::new("1", "rowkey1").unwrap();
        let replace = TableEntity::new("1", "rowkey2").unwrap();
        vec![
            BatchOperation::Insert { entity: insert },
            BatchOperation::InsertOrReplace {
                entity: replace,
                echo: true,
            },
        ]
    }

    #[test]
    fn canonical_resource_repeats_account_for_emulator_paths() {
        let backend = backend();
        assert_eq!(
            backend.canonical_resource("/Tables"),
            "/devstoreaccount1/devstoreaccount1/Tables"
        );
    }

    #[test]
    fn string_to_sign_is_date_then_resource() {
        let backend = backend();
        let sts = backend.string_to_sign("Mon, 01 Jan 2024 00:00:00 GMT", "/$batch");
        assert_eq!(
            sts,
            "Mon, 01 Jan 2024 00:00:00 GMT\n/devstoreaccount1/devstoreaccount1/$batch"
        );
    }

    #[test]
    fn batch_body_carries_one_embedded_request_per_operation() {
        let backend = backend();
        let body = backend.batch_body("InsertBatchTestTable", &sample_ops(), "batch_b", "changeset_c");

        assert_eq!(body.matches("--changeset_c\r\n").count(), 2);
        assert!(body.contains("POST http://127.0.0.1:10002/devstoreaccount1/InsertBatchTestTable HTTP/1.1"));
        assert!(body.contains(
            "PUT http://127.0.0.1:10002/devstoreaccount1/InsertBatchTestTable(PartitionKey='1',RowKey='rowkey2') HTTP/1.1"
        ));
        assert!(body.contains("Prefer: return-no-content"));
        assert!(body.contains("Prefer: return-content"));
        assert!(body.ends_with("--batch_b--\r\n"));
    }

    #[test]
    fn batch_response_parses_statuses_and_echoes() {
        let backend = backend();
        let ops = sample_ops();
        let body = concat!(
            "--batchresponse_x\r\n",
            "Content-Type: multipart/mixed; boundary=changesetresponse_y\r\n\r\n",
            "--changesetresponse_y\r\n",
            "Content-Type: application/http\r\n\r\n",
            "HTTP/1.1 204 No Content\r\n",
            "DataServiceVersion: 3.0;\r\n\r\n",
            "\r\n",
            "--changesetresponse_y\r\n",
            "Content-Type: application/http\r\n\r\n",
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: application/json;odata=minimalmetadata\r\n\r\n",
            "{\"PartitionKey\":\"1\",\"RowKey\":\"rowkey2\",\"Product\":\"Ticonderoga Pencils\"}\r\n",
            "--changesetresponse_y--\r\n",
            "--batchresponse_x--\r\n",
        );

        let result = backend
            .parse_batch_response("InsertBatchTestTable", &ops, body)
            .unwrap();
        assert_eq!(result.responses.len(), 2);
        assert!(result.responses[0].echoed.is_none());
        let echoed = result.responses[1].echoed.as_ref().unwrap();
        assert_eq!(echoed.row_key(), "rowkey2");
    }

    #[test]
    fn batch_response_with_table_not_found_maps_to_the_recovery_error() {
        let backend = backend();
        let ops = sample_ops();
        let body = concat!(
            "--batchresponse_x\r\n",
            "Content-Type: multipart/mixed; boundary=changesetresponse_y\r\n\r\n",
            "--changesetresponse_y\r\n",
            "Content-Type: application/http\r\n\r\n",
            "HTTP/1.1 404 Not Found\r\n",
            "Content-Type: application/json;odata=minimalmetadata\r\n\r\n",
            "{\"odata.error\":{\"code\":\"TableNotFound\",\"message\":{\"lang\":\"en-US\",\"value\":\"The table specified does not exist.\"}}}\r\n",
            "--changesetresponse_y--\r\n",
            "--batchresponse_x--\r\n",
        );

        let err = backend
            .parse_batch_response("InsertBatchTestTable", &ops, body)
            .unwrap_err();
        assert!(err.is_table_missing());
    }

    #[test]
    fn conflict_classification_distinguishes_tables_from_entities() {
        let backend = backend();
        let table_exists =
            "{\"odata.error\":{\"code\":\"TableAlreadyExists\",\"message\":{\"value\":\"x\"}}}";
        match backend.classify_error("stock", 409, table_exists) {
            TableError::Conflict { resource } => assert!(resource.starts_with("table")),
            other => panic!("unexpected {:?}", other),
        }

        let entity_exists =
            "{\"odata.error\":{\"code\":\"EntityAlreadyExists\",\"message\":{\"value\":\"x\"}}}";
        match backend.classify_error("stock", 409, entity_exists) {
            TableError::Conflict { resource } => assert!(resource.starts_with("entity")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
