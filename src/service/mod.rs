//service/mod.rs
pub mod archive_service;
pub mod dispatch;
pub mod request_service;
pub mod result_service;
pub mod user_context;

#[cfg(test)]
mod comprehensive_test;

use actix_web::error::{ErrorBadRequest, ErrorInternalServerError};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use log::{debug, info};
use log_mdc;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::dto::FileRequestDto;
use crate::model::RequestType;
use crate::service::user_context::UserContext;

/// Optional `?storage=` filter of the administrative endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StorageFilter {
    pub storage: Option<String>,
}

/// Body returned by the administrative endpoints.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AffectedRequests {
    pub request_type: RequestType,
    pub storage: Option<String>,
    pub count: usize,
}

fn header_handler(req: &HttpRequest) -> Result<UserContext, Error> {
    let user_id = req
        .headers()
        .get("User")
        .ok_or_else(|| ErrorBadRequest("Missing User header"))?
        .to_str()
        .map_err(|_| ErrorBadRequest("Invalid User header value"))?
        .to_string();

    let session = req
        .headers()
        .get("Session")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    log_mdc::insert("user", &user_id);

    let mut context = match session {
        Some(session) => {
            log_mdc::insert("session", &session);
            UserContext::with_session(user_id, session)
        }
        None => UserContext::new(user_id),
    };

    // Extract any additional headers as metadata
    for (header_name, header_value) in req.headers() {
        if let Ok(value_str) = header_value.to_str() {
            if header_name.as_str() != "user" && header_name.as_str() != "session" {
                context.set_metadata(header_name.as_str().to_string(), value_str.to_string());
            }
        }
    }

    Ok(context)
}

fn parse_request_type(raw: &str) -> Result<RequestType, Error> {
    raw.parse::<RequestType>().map_err(Error::from)
}

pub async fn submit_service<D>(
    group_id: String,
    requests: Vec<D>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error>
where
    D: FileRequestDto + Send + 'static,
{
    let context = header_handler(&req)?;
    log_mdc::insert("group", &group_id);
    debug!(
        "Submit service called for user: {}, group: {}, {} requests",
        context.user_id,
        group_id,
        requests.len()
    );

    let service = app_state.request_service.clone();
    let summary = web::block(move || service.submit_group(&group_id, requests, &context))
        .await
        .map_err(ErrorInternalServerError)??;

    Ok(HttpResponse::Accepted().json(summary))
}

pub async fn group_status_service(
    group_id: String,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    log_mdc::insert("group", &group_id);
    debug!("Group status requested by {} for {}", context.user_id, group_id);

    let service = app_state.request_service.clone();
    let status = web::block(move || service.group_status(&group_id))
        .await
        .map_err(ErrorInternalServerError)??;

    Ok(HttpResponse::Ok().json(status))
}

pub async fn retry_errors_service(
    request_type: String,
    filter: StorageFilter,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let request_type = parse_request_type(&request_type)?;

    let service = app_state.request_service.clone();
    let storage = filter.storage.clone();
    let count = web::block(move || service.retry_errors(request_type, storage.as_deref()))
        .await
        .map_err(ErrorInternalServerError)??;

    info!("User {} retried {} {} requests in error", context.user_id, count, request_type);
    Ok(HttpResponse::Ok().json(AffectedRequests {
        request_type,
        storage: filter.storage,
        count,
    }))
}

pub async fn delete_errors_service(
    request_type: String,
    filter: StorageFilter,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req)?;
    let request_type = parse_request_type(&request_type)?;

    let service = app_state.request_service.clone();
    let storage = filter.storage.clone();
    let count = web::block(move || service.delete_errors(request_type, storage.as_deref()))
        .await
        .map_err(ErrorInternalServerError)??;

    info!("User {} deleted {} {} requests in error", context.user_id, count, request_type);
    Ok(HttpResponse::Ok().json(AffectedRequests {
        request_type,
        storage: filter.storage,
        count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test as actix_test;

    #[test]
    fn test_header_handler_with_valid_user() {
        let req = actix_test::TestRequest::default()
            .insert_header(("User", "test_user"))
            .to_http_request();

        let context = header_handler(&req).unwrap();
        assert_eq!(context.user_id, "test_user");
        assert_eq!(context.session, None);
        println!("Header handler with valid user test passed!");
    }

    #[test]
    fn test_header_handler_with_session() {
        let req = actix_test::TestRequest::default()
            .insert_header(("User", "alice"))
            .insert_header(("Session", "s-42"))
            .insert_header(("X-Trace", "abc"))
            .to_http_request();

        let context = header_handler(&req).unwrap();
        assert_eq!(context.session.as_deref(), Some("s-42"));
        assert_eq!(context.session_owner().as_deref(), Some("alice"));
        assert_eq!(context.metadata.get("x-trace").map(String::as_str), Some("abc"));
        assert!(!context.metadata.contains_key("session"));
        println!("Header handler with session test passed!");
    }

    #[test]
    fn test_header_handler_missing_user_header() {
        let req = actix_test::TestRequest::default().to_http_request();
        assert!(header_handler(&req).is_err());
        println!("Header handler missing user header test passed!");
    }

    #[test]
    fn test_unknown_request_type_is_rejected() {
        assert!(parse_request_type("cache").is_ok());
        assert!(parse_request_type("archive").is_err());
    }
}
