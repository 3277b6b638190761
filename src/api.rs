// src/api.rs
use actix_web::{delete, get, post, web, Error, HttpRequest, HttpResponse};

use crate::app_state::AppState;
use crate::dto::{FileCacheRequestDto, FileCopyDto, FileDeletionDto, FileStorageRequestDto};
use crate::service::{
    delete_errors_service, group_status_service, retry_errors_service, submit_service, StorageFilter,
};

#[post("/groups/{group_id}/store")]
pub async fn store(
    group_id: web::Path<String>,
    body: web::Json<Vec<FileStorageRequestDto>>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    submit_service(group_id.into_inner(), body.into_inner(), req, app_state).await
}

#[post("/groups/{group_id}/copy")]
pub async fn copy(
    group_id: web::Path<String>,
    body: web::Json<Vec<FileCopyDto>>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    submit_service(group_id.into_inner(), body.into_inner(), req, app_state).await
}

#[post("/groups/{group_id}/delete")]
pub async fn remove(
    group_id: web::Path<String>,
    body: web::Json<Vec<FileDeletionDto>>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    submit_service(group_id.into_inner(), body.into_inner(), req, app_state).await
}

#[post("/groups/{group_id}/cache")]
pub async fn cache(
    group_id: web::Path<String>,
    body: web::Json<Vec<FileCacheRequestDto>>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    submit_service(group_id.into_inner(), body.into_inner(), req, app_state).await
}

#[get("/groups/{group_id}")]
pub async fn group_status(
    group_id: web::Path<String>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    group_status_service(group_id.into_inner(), req, app_state).await
}

#[post("/requests/{request_type}/errors/retry")]
pub async fn retry_errors(
    request_type: web::Path<String>,
    filter: web::Query<StorageFilter>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    retry_errors_service(request_type.into_inner(), filter.into_inner(), req, app_state).await
}

#[delete("/requests/{request_type}/errors")]
pub async fn delete_errors(
    request_type: web::Path<String>,
    filter: web::Query<StorageFilter>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    delete_errors_service(request_type.into_inner(), filter.into_inner(), req, app_state).await
}

/// Register every intake endpoint.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(store)
        .service(copy)
        .service(remove)
        .service(cache)
        .service(group_status)
        .service(retry_errors)
        .service(delete_errors);
}
