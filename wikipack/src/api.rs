// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Thin HTTP façade. Mutating endpoints enqueue operations and
//! answer with an operation id; reads go straight to the store and
//! registries.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::FutureExt;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::db::operation::Kind;
use crate::operation::Completion;
use crate::service::Service;
use crate::session::Command;
use crate::{content, db, operation, selection, session, store};

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/repos", get(list_repos).post(add_repo))
        .route("/repos/sync", post(sync_repo))
        .route("/repos/remove", post(remove_repo))
        .route("/repos/:url/:ref/manifest", get(get_manifest))
        .route("/repos/:url/:ref/hierarchy", get(get_hierarchy))
        .route("/repos/:url/:ref/graph", get(get_graph))
        .route("/packs", post(pack_command))
        .route("/selection/resolve", post(resolve_selection))
        .route("/operations/:id", get(get_operation))
        .with_state(service)
}

/// Serve until ctrl-c; running operations get a cancellation signal
/// and drain at their next checkpoint
pub async fn serve(service: Arc<Service>) -> Result<(), std::io::Error> {
    service.operations.spawn_sweeper(
        std::time::Duration::from_secs(60 * 60),
        service.config.retention(),
        service.config.sweep_only_completed,
    );

    let listener = tokio::net::TcpListener::bind(service.config.listen).await?;
    info!("listening on {}", service.config.listen);

    let operations = service.operations.clone();

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            operations.cancel_all();
        })
        .await
}

#[derive(Debug, Deserialize)]
struct AddRepo {
    repo_url: Url,
    #[serde(default = "default_ref")]
    default_ref: String,
}

fn default_ref() -> String {
    "main".to_owned()
}

#[derive(Debug, Deserialize)]
struct RepoUrl {
    repo_url: Url,
}

#[derive(Debug, Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    refresh: u8,
}

/// The command envelope accepted by POST /packs
#[derive(Debug, Deserialize)]
struct Envelope {
    command: String,
    repo_url: Url,
    #[serde(rename = "ref")]
    source_ref: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    client_state_hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct Snapshot {
    id: String,
    #[serde(rename = "type")]
    kind: Kind,
    status: db::operation::Status,
    progress: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_data: Option<String>,
    created_at: i64,
    updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<i64>,
}

impl From<db::operation::Operation> for Snapshot {
    fn from(operation: db::operation::Operation) -> Self {
        Self {
            id: operation.id,
            kind: operation.kind,
            status: operation.status,
            progress: operation.progress,
            message: operation.message,
            result_data: operation.result_data,
            created_at: operation.created_at,
            updated_at: operation.updated_at,
            started_at: operation.started_at,
        }
    }
}

async fn list_repos(State(service): State<Arc<Service>>) -> Result<Json<Value>, ApiError> {
    let mut repos = vec![];

    for repo in service.db.list_repos().await? {
        let refs = service.db.list_refs(repo.id).await?;

        repos.push(json!({
            "id": repo.id,
            "url": repo.url,
            "default_ref": repo.default_ref,
            "last_fetched": repo.last_fetched,
            "refs": refs.iter().map(|r| &r.source_ref).collect::<Vec<_>>(),
        }));
    }

    Ok(Json(json!({ "repos": repos })))
}

async fn add_repo(
    State(service): State<Arc<Service>>,
    Json(body): Json<AddRepo>,
) -> Result<Json<Value>, ApiError> {
    let worker = service.clone();
    let AddRepo { repo_url, default_ref } = body;
    let message = format!("adding {repo_url}");

    let id = service
        .operations
        .enqueue(
            Kind::RepoAdd,
            "api",
            &message,
            None,
            Box::new(move |handle| {
                async move {
                    handle.progress(10, "mirroring repository").await;

                    worker
                        .content
                        .ensure_bare_repo(&repo_url, &default_ref)
                        .await
                        .map_err(into_completion)?;

                    handle.progress(60, "creating worktree").await;

                    worker
                        .content
                        .ensure_worktree(&repo_url, &default_ref)
                        .await
                        .map_err(into_completion)?;

                    Ok(Completion {
                        message: "repository ready".to_owned(),
                        result_data: None,
                    })
                }
                .boxed()
            }),
        )
        .await?;

    Ok(Json(json!({ "operation_id": id })))
}

async fn sync_repo(
    State(service): State<Arc<Service>>,
    Json(body): Json<RepoUrl>,
) -> Result<Json<Value>, ApiError> {
    let worker = service.clone();
    let repo_url = body.repo_url;
    let message = format!("syncing {repo_url}");

    let id = service
        .operations
        .enqueue(
            Kind::RepoSync,
            "api",
            &message,
            None,
            Box::new(move |_handle| {
                async move {
                    let report = worker.content.sync_repo(&repo_url).await.map_err(into_completion)?;

                    let data = json!({
                        "synced": report.synced,
                        "failures": report.failures,
                    })
                    .to_string();

                    if report.failures.is_empty() {
                        Ok(Completion {
                            message: format!("synced {} ref(s)", report.synced),
                            result_data: Some(data),
                        })
                    } else {
                        Err(Completion {
                            message: format!(
                                "synced {} ref(s), {} failed",
                                report.synced,
                                report.failures.len()
                            ),
                            result_data: Some(data),
                        })
                    }
                }
                .boxed()
            }),
        )
        .await?;

    Ok(Json(json!({ "operation_id": id })))
}

async fn remove_repo(
    State(service): State<Arc<Service>>,
    Json(body): Json<RepoUrl>,
) -> Result<Json<Value>, ApiError> {
    let worker = service.clone();
    let repo_url = body.repo_url;
    let message = format!("removing {repo_url}");

    let id = service
        .operations
        .enqueue(
            Kind::RepoRemove,
            "api",
            &message,
            None,
            Box::new(move |_handle| {
                async move {
                    worker.content.remove_repo(&repo_url).await.map_err(into_completion)?;

                    Ok(Completion {
                        message: "repository removed".to_owned(),
                        result_data: None,
                    })
                }
                .boxed()
            }),
        )
        .await?;

    Ok(Json(json!({ "operation_id": id })))
}

async fn get_manifest(
    State(service): State<Arc<Service>>,
    Path((url, source_ref)): Path<(String, String)>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<Value>, ApiError> {
    let url = parse_repo_url(&url)?;
    let response = fetch_entry(&service, &url, &source_ref, query.refresh != 0).await?;

    Ok(Json(json!({
        "manifest": response.data.manifest,
        "stats": response.data.stats,
        "meta": { "hash": response.meta.hash, "from_cache": response.meta.from_cache },
    })))
}

async fn get_hierarchy(
    State(service): State<Arc<Service>>,
    Path((url, source_ref)): Path<(String, String)>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<Value>, ApiError> {
    let url = parse_repo_url(&url)?;
    let response = fetch_entry(&service, &url, &source_ref, query.refresh != 0).await?;

    Ok(Json(json!({
        "hierarchy": response.data.hierarchy,
        "meta": { "hash": response.meta.hash, "from_cache": response.meta.from_cache },
    })))
}

async fn get_graph(
    State(service): State<Arc<Service>>,
    Path((url, source_ref)): Path<(String, String)>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<Value>, ApiError> {
    let url = parse_repo_url(&url)?;
    let response = fetch_entry(&service, &url, &source_ref, query.refresh != 0).await?;

    Ok(Json(json!({
        "graph": response.data.graph,
        "meta": { "hash": response.meta.hash, "from_cache": response.meta.from_cache },
    })))
}

async fn fetch_entry(
    service: &Service,
    url: &Url,
    source_ref: &str,
    refresh: bool,
) -> Result<store::Response<Arc<store::Entry>>, ApiError> {
    let response = if refresh {
        service.store.refresh(url, source_ref).await?
    } else {
        service.store.get(url, source_ref).await?
    };

    Ok(response)
}

async fn pack_command(
    State(service): State<Arc<Service>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Value>, ApiError> {
    let command = build_command(&envelope.command, envelope.data.clone())?;
    let user = envelope.user_id.as_deref().unwrap_or("anonymous");

    let outcome = service
        .engine
        .handle(
            user,
            &envelope.repo_url,
            &envelope.source_ref,
            envelope.client_state_hash.as_deref(),
            command,
        )
        .await?;

    let mut body = json!({
        "diff": outcome.diff,
        "state_hash": outcome.state_hash,
        "warnings": outcome.warnings,
        "replace": outcome.replace,
    });

    if let Some(operation) = outcome.operation {
        body["operation"] = json!(operation);
    }
    if let Some(differences) = outcome.differences {
        body["differences"] = differences;
    }
    if let Some(reconcile) = outcome.reconcile {
        body["reconcile"] = json!(reconcile);
    }

    Ok(Json(body))
}

async fn get_operation(
    State(service): State<Arc<Service>>,
    Path(id): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    let operation = service.db.get_operation(&id).await?;

    Ok(Json(operation.into()))
}

/// What the selection UI calls to preview a plan: closure over the
/// picked packs plus per-page actions against the live wiki
#[derive(Debug, Deserialize)]
struct ResolveSelection {
    repo_url: Url,
    #[serde(rename = "ref")]
    source_ref: String,
    packs: Vec<String>,
    #[serde(default)]
    global_prefix: Option<String>,
    #[serde(default)]
    skip: Vec<String>,
    #[serde(default)]
    renames: std::collections::BTreeMap<String, String>,
}

async fn resolve_selection(
    State(service): State<Arc<Service>>,
    Json(body): Json<ResolveSelection>,
) -> Result<Json<Value>, ApiError> {
    let entry = service.store.get(&body.repo_url, &body.source_ref).await?.data;

    let closure = selection::closure(&entry.manifest, &body.packs);

    let normalized = content::normalize_url(&body.repo_url);
    let repo = service.db.repo_by_url(&normalized).await?.ok_or(ApiError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: format!("unknown repository {normalized}"),
    })?;
    let reference = service
        .db
        .ref_by_key(repo.id, &body.source_ref)
        .await?
        .ok_or(ApiError {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: format!("unknown ref {}", body.source_ref),
        })?;

    let installed: Vec<String> = service
        .db
        .list_pages_for_ref(reference.id)
        .await?
        .into_iter()
        .map(|page| page.name)
        .collect();

    let collisions: Vec<String> = match service.wiki.titles().await {
        Ok(titles) => titles,
        Err(_) => vec![],
    };

    let input = selection::PlanInput {
        overrides: body
            .skip
            .iter()
            .map(|page| (page.as_str(), selection::PageAction::Skip))
            .collect(),
        installed: installed.iter().map(String::as_str).collect(),
        collisions: collisions.iter().map(String::as_str).collect(),
        renames: body
            .renames
            .iter()
            .map(|(from, to)| (from.as_str(), to.as_str()))
            .collect(),
        global_prefix: body.global_prefix.as_deref(),
    };

    let plan = selection::resolve_plan(&closure, &input);

    Ok(Json(json!({ "closure": closure, "plan": plan })))
}

/// Inline the envelope's `data` fields next to the command tag so
/// the tagged enum can deserialize it
fn build_command(command: &str, data: Option<Value>) -> Result<Command, ApiError> {
    let mut object = match data {
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ApiError {
                status: StatusCode::BAD_REQUEST,
                code: "validation",
                message: "data must be an object".to_owned(),
            })
        }
        None => serde_json::Map::new(),
    };

    object.insert("command".to_owned(), Value::String(command.to_owned()));

    serde_json::from_value(Value::Object(object)).map_err(|error| ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "validation",
        message: error.to_string(),
    })
}

fn parse_repo_url(raw: &str) -> Result<Url, ApiError> {
    Url::parse(raw).map_err(|error| ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "validation",
        message: format!("bad repository url: {error}"),
    })
}

fn into_completion(error: impl std::fmt::Display) -> Completion {
    Completion {
        message: error.to_string(),
        result_data: None,
    }
}

/// Uniform error body: `{"error": {"code", "message"}}` with the
/// spec'd code taxonomy
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "code": self.code, "message": self.message }
        }));

        (self.status, body).into_response()
    }
}

impl From<db::Error> for ApiError {
    fn from(error: db::Error) -> Self {
        let (status, code) = match &error {
            db::Error::RowNotFound => (StatusCode::NOT_FOUND, "not_found"),
            db::Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        Self {
            status,
            code,
            message: error.to_string(),
        }
    }
}

impl From<content::Error> for ApiError {
    fn from(error: content::Error) -> Self {
        match error {
            content::Error::Database(db) => db.into(),
            content::Error::UnknownRepo(_) | content::Error::UnknownRef { .. } => Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: error.to_string(),
            },
            content::Error::Git(_) | content::Error::RefVanished { .. } => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "fetch",
                message: error.to_string(),
            },
            content::Error::Io(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: error.to_string(),
            },
        }
    }
}

impl From<store::Error> for ApiError {
    fn from(error: store::Error) -> Self {
        match error {
            store::Error::Database(db) => db.into(),
            store::Error::UnknownRepo(_) | store::Error::UnknownRef { .. } => Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: error.to_string(),
            },
            store::Error::Missing { .. } => Self {
                status: StatusCode::NOT_FOUND,
                code: "missing",
                message: error.to_string(),
            },
            store::Error::Fetch(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "fetch",
                message: error.to_string(),
            },
            store::Error::Read(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: error.to_string(),
            },
            store::Error::Manifest(manifest) => {
                let code = match &manifest {
                    manifest::Error::SchemaVersion(_) => "schema-version",
                    manifest::Error::Parse(_) | manifest::Error::TooLarge(_) | manifest::Error::TooDeep => "parse",
                    _ => "schema",
                };

                Self {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    code,
                    message: manifest.to_string(),
                }
            }
        }
    }
}

impl From<session::Error> for ApiError {
    fn from(error: session::Error) -> Self {
        match error {
            session::Error::Store(store) => store.into(),
            session::Error::Database(db) => db.into(),
            session::Error::Operations(operations) => operations.into(),
            session::Error::UnknownRepo(_)
            | session::Error::UnknownRef { .. }
            | session::Error::UnknownPack(_)
            | session::Error::UnknownPage { .. } => Self {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: error.to_string(),
            },
            session::Error::Internal(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: error.to_string(),
            },
            _ => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "validation",
                message: error.to_string(),
            },
        }
    }
}

impl From<operation::Error> for ApiError {
    fn from(error: operation::Error) -> Self {
        match error {
            operation::Error::Database(db) => db.into(),
            operation::Error::QueueFull => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: "queue_full",
                message: error.to_string(),
            },
            operation::Error::Timeout(_) => Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                code: "timeout",
                message: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_data_inlines_into_command() {
        let command = build_command(
            "set_pack_action",
            Some(json!({"pack_name": "core", "action": "install"})),
        )
        .unwrap();

        assert!(matches!(command, Command::SetPackAction { .. }));
    }

    #[test]
    fn bare_commands_need_no_data() {
        assert!(matches!(build_command("init", None).unwrap(), Command::Init));
        assert!(matches!(
            build_command("apply", None).unwrap(),
            Command::Apply { delete_pages: false }
        ));
    }

    #[test]
    fn unknown_command_is_a_validation_error() {
        let error = build_command("explode", None).unwrap_err();
        assert_eq!(error.code, "validation");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }
}
