//! JSON API for the browser UI
//!
//! Mounted under `/app`. Every response uses the `ApiResponse` envelope; a
//! failed operation also queues a toast, fetched with `GET /app/toasts`.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::Resource;
use crate::commands::{AppState, DrugListView, HistoryDetail, ListParams, OpdInput, PdfPreview, Screen};
use crate::error::{AppError, FieldErrors};
use crate::filters::{CompanyFilter, DrugFilter, HistoryFilter, ListFilter, PatientFilter};
use crate::listing::ListView;
use crate::models::{AuthState, Company, CompanyRef, Drug, PatientHistory, PodPatient, User};
use crate::opd::{LineInput, OpdTab, OpdView};
use crate::toast::Toast;

pub type SharedState = Arc<AppState>;

/// API response envelope
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldErrors>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            fields: None,
        }
    }
}

/// `AppError` rendered as an HTTP response
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AppError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Busy(_) => StatusCode::CONFLICT,
        AppError::Api { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        AppError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(AppError::BadRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::error!("[web] {}", self.0);
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.user_message()),
            fields: self.0.field_errors(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

fn require_auth(state: &AppState) -> Result<(), ApiError> {
    state.session.require_token()?;
    Ok(())
}

/// Record types with a list screen
trait ScreenAccess: Resource {
    type Filter: ListFilter;

    fn screen(state: &AppState) -> &Screen<Self, Self::Filter>;
}

impl ScreenAccess for Drug {
    type Filter = DrugFilter;

    fn screen(state: &AppState) -> &Screen<Self, DrugFilter> {
        &state.drugs
    }
}

impl ScreenAccess for Company {
    type Filter = CompanyFilter;

    fn screen(state: &AppState) -> &Screen<Self, CompanyFilter> {
        &state.companies
    }
}

impl ScreenAccess for PodPatient {
    type Filter = PatientFilter;

    fn screen(state: &AppState) -> &Screen<Self, PatientFilter> {
        &state.patients
    }
}

impl ScreenAccess for PatientHistory {
    type Filter = HistoryFilter;

    fn screen(state: &AppState) -> &Screen<Self, HistoryFilter> {
        &state.histories
    }
}

/// Create the web API router
pub fn create_web_api_router(state: SharedState) -> Router {
    Router::new()
        // Auth
        .route("/auth/login", post(login_api))
        .route("/auth/register", post(register_api))
        .route("/auth/logout", post(logout_api))
        .route("/auth/me", get(me_api))
        .route("/auth/state", get(auth_state_api))
        .route("/toasts", get(toasts_api))
        // Drugs
        .route("/drugs", get(list_drugs_api).post(create_api::<Drug>))
        .route("/drugs/options", get(drug_options_api))
        .route("/drugs/bulk-delete", post(bulk_delete_api::<Drug>))
        .route("/drugs/reset-filters", post(reset_filters_api::<Drug>))
        .route(
            "/drugs/{id}",
            get(get_api::<Drug>)
                .patch(update_api::<Drug>)
                .delete(delete_api::<Drug>),
        )
        // Companies
        .route("/companies", get(list_api::<Company>).post(create_api::<Company>))
        .route("/companies/options", get(company_options_api))
        .route("/companies/bulk-delete", post(bulk_delete_api::<Company>))
        .route("/companies/reset-filters", post(reset_filters_api::<Company>))
        .route(
            "/companies/{id}",
            get(get_api::<Company>)
                .patch(update_api::<Company>)
                .delete(delete_api::<Company>),
        )
        // OPD patients
        .route("/patients", get(list_api::<PodPatient>).post(create_api::<PodPatient>))
        .route("/patients/bulk-delete", post(bulk_delete_api::<PodPatient>))
        .route("/patients/reset-filters", post(reset_filters_api::<PodPatient>))
        .route(
            "/patients/{id}",
            get(get_api::<PodPatient>)
                .patch(update_api::<PodPatient>)
                .delete(delete_api::<PodPatient>),
        )
        // Patient histories
        .route("/histories", get(list_api::<PatientHistory>))
        .route("/histories/reset-filters", post(reset_filters_api::<PatientHistory>))
        .route("/histories/{id}", get(history_detail_api))
        .route("/histories/{id}/preview", get(pdf_preview_api))
        // OPD wizard
        .route("/opd", get(opd_view_api).patch(opd_update_api))
        .route("/opd/next", post(opd_next_api))
        .route("/opd/back", post(opd_back_api))
        .route("/opd/go-to", post(opd_go_to_api))
        .route("/opd/lines", post(opd_add_line_api))
        .route(
            "/opd/lines/{index}",
            put(opd_replace_line_api).delete(opd_remove_line_api),
        )
        .route("/opd/reset", post(opd_reset_api))
        .route("/opd/submit", post(opd_submit_api))
        .with_state(state)
}

// ============ Auth API ============

#[derive(Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct RegisterBody {
    name: String,
    email: String,
    password: String,
}

async fn login_api(State(state): State<SharedState>, Json(body): Json<LoginBody>) -> ApiResult<AuthState> {
    ok(state.login(&body.email, &body.password).await?)
}

async fn register_api(
    State(state): State<SharedState>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<AuthState> {
    ok(state.register(&body.name, &body.email, &body.password).await?)
}

async fn logout_api(State(state): State<SharedState>) -> ApiResult<()> {
    state.logout().await?;
    ok(())
}

async fn me_api(State(state): State<SharedState>) -> ApiResult<User> {
    ok(state.me().await?)
}

async fn auth_state_api(State(state): State<SharedState>) -> ApiResult<AuthState> {
    ok(state.auth_state())
}

async fn toasts_api(State(state): State<SharedState>) -> ApiResult<Vec<Toast>> {
    ok(state.drain_toasts())
}

// ============ List screens ============

#[derive(Deserialize)]
struct BulkDelete {
    ids: Vec<i64>,
}

async fn list_api<R: ScreenAccess>(
    State(state): State<SharedState>,
    filter: Result<Query<R::Filter>, QueryRejection>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<ListView<R, R::Filter>> {
    require_auth(&state)?;
    let (Query(filter), Query(params)) = (filter?, params?);
    ok(R::screen(&state).load(filter, params).await)
}

async fn list_drugs_api(
    State(state): State<SharedState>,
    filter: Result<Query<DrugFilter>, QueryRejection>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<DrugListView> {
    require_auth(&state)?;
    let (Query(filter), Query(params)) = (filter?, params?);
    let list = state.drugs.load(filter, params).await;
    ok(state.drug_view(list))
}

async fn get_api<R: ScreenAccess>(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<R> {
    require_auth(&state)?;
    ok(R::screen(&state).get(id).await?)
}

async fn create_api<R: ScreenAccess>(
    State(state): State<SharedState>,
    Json(draft): Json<R::Draft>,
) -> ApiResult<R> {
    require_auth(&state)?;
    ok(R::screen(&state).create(draft).await?)
}

async fn update_api<R: ScreenAccess>(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(draft): Json<R::Draft>,
) -> ApiResult<R> {
    require_auth(&state)?;
    ok(R::screen(&state).update(id, draft).await?)
}

async fn delete_api<R: ScreenAccess>(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<()> {
    require_auth(&state)?;
    R::screen(&state).delete(id).await?;
    ok(())
}

async fn bulk_delete_api<R: ScreenAccess>(
    State(state): State<SharedState>,
    Json(body): Json<BulkDelete>,
) -> ApiResult<()> {
    require_auth(&state)?;
    R::screen(&state).delete_many(&body.ids).await?;
    ok(())
}

async fn reset_filters_api<R: ScreenAccess>(State(state): State<SharedState>) -> ApiResult<ListView<R, R::Filter>> {
    require_auth(&state)?;
    ok(R::screen(&state).reset_filters().await)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OptionsQuery {
    search: String,
}

async fn company_options_api(State(state): State<SharedState>) -> ApiResult<Vec<CompanyRef>> {
    require_auth(&state)?;
    ok(state.company_options().await?)
}

async fn drug_options_api(
    State(state): State<SharedState>,
    Query(query): Query<OptionsQuery>,
) -> ApiResult<Vec<Drug>> {
    require_auth(&state)?;
    ok(state.drug_options(&query.search).await?)
}

// ============ Patient histories ============

async fn history_detail_api(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<HistoryDetail> {
    require_auth(&state)?;
    ok(state.history_detail(id).await?)
}

async fn pdf_preview_api(State(state): State<SharedState>, Path(id): Path<i64>) -> ApiResult<PdfPreview> {
    require_auth(&state)?;
    ok(state.pdf_preview(id).await?)
}

// ============ OPD wizard ============

#[derive(Deserialize)]
struct GoTo {
    tab: OpdTab,
}

async fn opd_view_api(State(state): State<SharedState>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_view().await)
}

async fn opd_update_api(State(state): State<SharedState>, Json(input): Json<OpdInput>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_update(input).await)
}

async fn opd_next_api(State(state): State<SharedState>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_next().await?)
}

async fn opd_back_api(State(state): State<SharedState>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_back().await)
}

async fn opd_go_to_api(State(state): State<SharedState>, Json(body): Json<GoTo>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_go_to(body.tab).await?)
}

async fn opd_add_line_api(State(state): State<SharedState>, Json(input): Json<LineInput>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_add_line(input).await?)
}

async fn opd_replace_line_api(
    State(state): State<SharedState>,
    Path(index): Path<usize>,
    Json(input): Json<LineInput>,
) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_replace_line(index, input).await?)
}

async fn opd_remove_line_api(State(state): State<SharedState>, Path(index): Path<usize>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_remove_line(index).await?)
}

async fn opd_reset_api(State(state): State<SharedState>) -> ApiResult<OpdView> {
    require_auth(&state)?;
    ok(state.opd_reset().await)
}

async fn opd_submit_api(State(state): State<SharedState>) -> ApiResult<PatientHistory> {
    require_auth(&state)?;
    ok(state.opd_submit().await?)
}
