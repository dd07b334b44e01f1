//! Remote collaborator client.
//!
//! All four collaborator roles are served by one task endpoint that speaks
//! JSON over HTTP: `POST {endpoint}/{path}` with a camelCase body.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    CollectionManager, DocumentIndexer, IndexRequest, IndexedDocument, InfraProvisioner,
    InfraStatus, ObjectSource, TaskError,
};
use crate::catalog::{Document, ObjectRef, Repository};
use crate::config::TasksConfig;
use crate::error::FlowError;

/// JSON client for the task endpoint
#[derive(Debug, Clone)]
pub struct HttpTasks {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionResponse {
    #[serde(default)]
    stack_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeResponse {
    status: InfraStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedResponse {
    all_deleted: bool,
}

#[derive(Debug, Deserialize)]
struct ObjectsResponse {
    #[serde(default)]
    objects: Vec<ObjectRef>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifiedRequest<'a> {
    bucket: &'a str,
    prefix: &'a str,
    since: DateTime<Utc>,
}

impl HttpTasks {
    pub fn new(config: &TasksConfig) -> Result<Self, FlowError> {
        let endpoint = reqwest::Url::parse(&config.endpoint)
            .map_err(|e| FlowError::Config(format!("invalid tasks endpoint: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FlowError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TaskError> {
        let url = format!("{}/{}", self.endpoint, path);
        debug!(url = %url, "Calling task endpoint");

        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(path, e))
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TaskError> {
        let response = self.post(path, body).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(path, status, &body))
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TaskError> {
        let response = self.send(path, body).await?;
        decode(path, response).await
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T, TaskError> {
    response
        .json::<T>()
        .await
        .map_err(|e| TaskError::failed("Task.InvalidResponse", format!("{path}: {e}")))
}

fn transport_error(path: &str, err: reqwest::Error) -> TaskError {
    if err.is_builder() {
        return TaskError::Invocation(format!("{path}: {err}"));
    }
    TaskError::Transient(format!("{path}: {err}"))
}

fn status_error(path: &str, status: StatusCode, body: &str) -> TaskError {
    let message = format!("{path} returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TaskError::Transient(message)
    } else {
        TaskError::Invocation(message)
    }
}

#[async_trait]
impl InfraProvisioner for HttpTasks {
    async fn request_create(&self, repository: &Repository) -> Result<Option<String>, TaskError> {
        let response: ProvisionResponse = self.call("infrastructure/create", repository).await?;
        Ok(response.stack_name)
    }

    async fn describe(&self, stack_name: &str) -> Result<InfraStatus, TaskError> {
        let path = "infrastructure/describe";
        let response = self.post(path, &json!({ "stackName": stack_name })).await?;

        // an unknown stack is a status, not an error
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(InfraStatus::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(path, status, &body));
        }

        let described: DescribeResponse = decode(path, response).await?;
        Ok(described.status)
    }

    async fn request_delete(&self, stack_name: &str) -> Result<(), TaskError> {
        let body = json!({ "stackName": stack_name });
        self.send("infrastructure/delete", &body).await?;
        Ok(())
    }
}

#[async_trait]
impl CollectionManager for HttpTasks {
    async fn create_default_collection(&self, repository: &Repository) -> Result<(), TaskError> {
        self.send("collections/default", repository).await?;
        Ok(())
    }

    async fn collections_deleted(&self, repository_id: &str) -> Result<bool, TaskError> {
        let body = json!({ "repositoryId": repository_id });
        let response: DeletedResponse = self.call("collections/deleted", &body).await?;
        Ok(response.all_deleted)
    }
}

#[async_trait]
impl DocumentIndexer for HttpTasks {
    async fn index(&self, request: &IndexRequest) -> Result<IndexedDocument, TaskError> {
        self.call("documents/index", request).await
    }

    async fn remove(&self, document: &Document) -> Result<(), TaskError> {
        self.send("documents/remove", document).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectSource for HttpTasks {
    async fn list_modified(
        &self,
        bucket: &str,
        prefix: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ObjectRef>, TaskError> {
        let body = ModifiedRequest {
            bucket,
            prefix,
            since,
        };
        let response: ObjectsResponse = self.call("objects/modified", &body).await?;
        Ok(response.objects)
    }
}
