use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trellis_common::Error;
use trellis_config::PAYMENT_SERVICE;
use trellis_db::{Page, User};

use crate::state::SharedState;

pub const GREETING: &str = "Hello World from new Server";
/// KV key read by `GET /redis`.
pub const GREETING_KEY: &str = "greeting";
pub const PERSON_COLLECTION: &str = "person";
/// File store prefix listed by `GET /s3`.
pub const SOFTWARE_PREFIX: &str = "software";

#[derive(Serialize)]
struct Envelope<T> {
    data: T,
}

/// Success body wrapped as `{"data": ...}`.
pub struct Data<T>(pub T);

impl<T: Serialize> IntoResponse for Data<T> {
    fn into_response(self) -> Response {
        Json(Envelope { data: self.0 }).into_response()
    }
}

/// Error body `{"error": {"message": ...}}` with a status derived from the
/// error kind.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({ "error": { "message": self.0.to_string() } })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// GET /health: every database answers.
pub async fn health(State(state): State<SharedState>) -> Response {
    match state.with_datasources(|ds| ds.ping()).await {
        Ok(()) => "ok".into_response(),
        Err(e) => {
            warn!("health check failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

/// GET /greet
pub async fn greet() -> impl IntoResponse {
    (
        [
            (
                HeaderName::from_static("x-custom-header"),
                HeaderValue::from_static("CustomValue"),
            ),
            (
                HeaderName::from_static("x-another-header"),
                HeaderValue::from_static("AnotherValue"),
            ),
        ],
        Data(GREETING),
    )
}

/// Raw `page`/`size` query values. Anything unparsable falls back to the
/// defaults instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub size: Option<String>,
}

impl PageParams {
    fn to_page(&self) -> Page {
        let parse =
            |v: &Option<String>| -> Option<i64> { v.as_deref().and_then(|s| s.trim().parse().ok()) };
        Page::from_params(parse(&self.page), parse(&self.size))
    }
}

#[derive(Debug, Serialize)]
pub struct UserPage {
    pub users: Vec<User>,
    pub page: i64,
}

/// GET /users?page=&size=
pub async fn list_users(
    State(state): State<SharedState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Data<UserPage>> {
    let page = params.to_page();
    let users = state
        .with_datasources(move |ds| ds.sql.list_users(page))
        .await?;
    Ok(Data(UserPage {
        users,
        page: page.page,
    }))
}

/// POST /users
pub async fn create_user(
    State(state): State<SharedState>,
    body: Result<Json<User>, JsonRejection>,
) -> ApiResult<(StatusCode, Data<User>)> {
    let Json(user) = body?;
    let created = state
        .with_datasources(move |ds| ds.sql.create_user(&user))
        .await?;
    info!("created user {:?}", created.id);
    Ok((StatusCode::CREATED, Data(created)))
}

/// GET /users/{id}
pub async fn get_user(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Data<User>> {
    let user = state.with_datasources(move |ds| ds.sql.get_user(id)).await?;
    Ok(Data(user))
}

/// PUT /users/{id}
pub async fn update_user(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    body: Result<Json<User>, JsonRejection>,
) -> ApiResult<Data<User>> {
    let Json(user) = body?;
    let updated = state
        .with_datasources(move |ds| ds.sql.update_user(id, &user))
        .await?;
    Ok(Data(updated))
}

/// DELETE /users/{id}
pub async fn delete_user(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .with_datasources(move |ds| ds.sql.delete_user(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
}

/// POST /customer/{name}
pub async fn create_customer(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Data<Customer>)> {
    let stored = name.clone();
    let id = state
        .with_datasources(move |ds| ds.sql.insert_customer(&stored))
        .await?;
    Ok((StatusCode::CREATED, Data(Customer { id, name })))
}

/// GET /customer: body of the payment service's `/user`.
pub async fn get_customer(State(state): State<SharedState>) -> ApiResult<Data<String>> {
    let body = state.service(PAYMENT_SERVICE)?.get("/user").await?;
    Ok(Data(body))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub age: i64,
    pub city: String,
}

/// POST /mongo: returns the generated document id.
pub async fn insert_person(
    State(state): State<SharedState>,
    body: Result<Json<Person>, JsonRejection>,
) -> ApiResult<(StatusCode, Data<String>)> {
    let Json(person) = body?;
    let id = state
        .with_datasources(move |ds| ds.documents.insert_one(PERSON_COLLECTION, &person))
        .await?;
    Ok((StatusCode::CREATED, Data(id)))
}

#[derive(Debug, Deserialize)]
pub struct PersonQuery {
    pub name: Option<String>,
}

/// GET /mongo?name=
pub async fn find_person(
    State(state): State<SharedState>,
    Query(query): Query<PersonQuery>,
) -> ApiResult<Data<Person>> {
    let name = query
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Validation("name query parameter is required".into()))?;

    let lookup = name.clone();
    let person = state
        .with_datasources(move |ds| {
            ds.documents
                .find_one::<Person>(PERSON_COLLECTION, "name", lookup)
        })
        .await?;

    person
        .map(Data)
        .ok_or_else(|| Error::NotFound(format!("person {name}")).into())
}

/// GET /redis: the cached greeting, empty when unset.
pub async fn get_greeting(State(state): State<SharedState>) -> ApiResult<Data<String>> {
    let value = state
        .with_datasources(|ds| ds.kv.get(GREETING_KEY))
        .await?;
    Ok(Data(value.unwrap_or_default()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub m_time: DateTime<Utc>,
}

/// GET /s3: every entry under the `software` prefix, directories included.
pub async fn list_software(State(state): State<SharedState>) -> ApiResult<Data<Vec<ObjectInfo>>> {
    let (root, entries) = state
        .with_datasources(|ds| {
            let entries = ds.files.read_dir(SOFTWARE_PREFIX)?;
            Ok((ds.files.working_dir().to_path_buf(), entries))
        })
        .await?;

    info!("listing {SOFTWARE_PREFIX} under {}", root.display());
    let objects = entries
        .into_iter()
        .map(|e| {
            let kind = if e.is_dir { "dir" } else { "file" };
            debug!(
                "{kind} {}: {} bytes, modified {}",
                e.name,
                e.size,
                e.modified.to_rfc3339()
            );
            ObjectInfo {
                name: e.name,
                size: e.size,
                m_time: e.modified,
            }
        })
        .collect();
    Ok(Data(objects))
}

#[cfg(test)]
mod tests {
    use super::{ApiError, PageParams};
    use axum::http::StatusCode;
    use trellis_common::Error;

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (Error::NotFound("user 1".into()), StatusCode::NOT_FOUND),
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::Upstream("down".into()), StatusCode::BAD_GATEWAY),
            (Error::Database("locked".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn unparsable_page_params_fall_back_to_defaults() {
        let params = PageParams {
            page: Some("two".into()),
            size: Some("".into()),
        };
        let page = params.to_page();
        assert_eq!((page.page, page.size), (1, 10));

        let params = PageParams {
            page: Some("4".into()),
            size: Some(" 4 ".into()),
        };
        let page = params.to_page();
        assert_eq!((page.page, page.size), (4, 4));

        let params = PageParams {
            page: Some("2".into()),
            size: Some("25".into()),
        };
        assert_eq!(params.to_page().size, 10);
    }
}
