//! External REST API client
//!
//! Every request carries `Authorization: Bearer <token>` when a token is in
//! local storage. Non-2xx responses become [`AppError::Api`] with the
//! backend's `detail` parsed out of the body; a 401 also drops the stored
//! token so the session layer forces a new login.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::db::LocalStore;
use crate::error::{AppError, AppResult, FieldErrors};
use crate::models::Page;

/// Local storage key of the bearer token
pub const TOKEN_KEY: &str = "access_token";

/// A record type served by a REST collection endpoint.
pub trait Resource:
    Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Create/update payload
    type Draft: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Collection path, e.g. `/drugs`
    const PATH: &'static str;
    /// Human name used in toasts
    const LABEL: &'static str;

    fn id(&self) -> i64;

    fn display_name(&self) -> String;

    /// Copies the draft's fields onto `self`.
    fn apply(&mut self, draft: &Self::Draft);

    fn validate(_draft: &Self::Draft) -> Result<(), FieldErrors> {
        Ok(())
    }

    /// How a not-yet-saved draft renders in a list.
    fn preview(draft: &Self::Draft) -> Self {
        let mut record = Self::default();
        record.apply(draft);
        record
    }

    /// How an existing record renders while its update is in flight.
    fn preview_update(existing: &Self, draft: &Self::Draft) -> Self {
        let mut record = existing.clone();
        record.apply(draft);
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(format!("unknown sort order `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Parameters of one list request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListQuery {
    /// 1-based
    pub page: u32,
    pub per_page: u32,
    pub filters: Vec<(String, String)>,
    pub sort: Option<SortSpec>,
}

impl ListQuery {
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let page = self.page.max(1);
        let mut pairs = vec![
            ("skip".to_string(), ((page - 1) * self.per_page).to_string()),
            ("limit".to_string(), self.per_page.to_string()),
        ];
        pairs.extend(self.filters.iter().cloned());
        if let Some(sort) = &self.sort {
            pairs.push(("sort_by".to_string(), sort.field.clone()));
            pairs.push(("sort_order".to_string(), sort.direction.as_str().to_string()));
        }
        pairs
    }
}

/// Remote side of a list screen.
#[async_trait]
pub trait ResourceBackend<R: Resource>: Send + Sync {
    async fn list(&self, query: &ListQuery) -> AppResult<Page<R>>;

    async fn get(&self, id: i64) -> AppResult<R>;

    async fn create(&self, draft: &R::Draft) -> AppResult<R>;

    async fn update(&self, id: i64, draft: &R::Draft) -> AppResult<R>;

    async fn delete(&self, id: i64) -> AppResult<()>;

    /// Stops at the first failure.
    async fn delete_many(&self, ids: &[i64]) -> AppResult<()> {
        for id in ids {
            self.delete(*id).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
    store: Arc<LocalStore>,
}

impl ApiClient {
    pub fn new(config: &AppConfig, store: Arc<LocalStore>) -> AppResult<Self> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            http,
            store,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn token(&self) -> Option<String> {
        match self.store.get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                log::warn!("[api] cannot read token: {}", e);
                None
            }
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> AppResult<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = AppError::from_response(status.as_u16(), &body);
        log::warn!("[api] request failed: {}", error);

        if status.as_u16() == 401 {
            if let Err(e) = self.store.remove(TOKEN_KEY) {
                log::error!("[api] failed to clear token: {}", e);
            }
        }
        Err(error)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(String, String)]) -> AppResult<T> {
        let request = self.http.get(self.url(path)).query(query);
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> AppResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.post(self.url(path)).json(body);
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> AppResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.patch(self.url(path)).json(body);
        Ok(self.send(request).await?.json().await?)
    }

    /// POST without a meaningful response body.
    pub async fn post_empty(&self, path: &str) -> AppResult<()> {
        self.send(self.http.post(self.url(path))).await?;
        Ok(())
    }

    pub async fn delete_path(&self, path: &str) -> AppResult<()> {
        self.send(self.http.delete(self.url(path))).await?;
        Ok(())
    }
}

#[async_trait]
impl<R: Resource> ResourceBackend<R> for ApiClient {
    async fn list(&self, query: &ListQuery) -> AppResult<Page<R>> {
        log::debug!("[api] GET {} {:?}", R::PATH, query);
        self.get_json(R::PATH, &query.to_pairs()).await
    }

    async fn get(&self, id: i64) -> AppResult<R> {
        self.get_json(&format!("{}/{}", R::PATH, id), &[]).await
    }

    async fn create(&self, draft: &R::Draft) -> AppResult<R> {
        self.post_json(R::PATH, draft).await
    }

    async fn update(&self, id: i64, draft: &R::Draft) -> AppResult<R> {
        self.patch_json(&format!("{}/{}", R::PATH, id), draft).await
    }

    async fn delete(&self, id: i64) -> AppResult<()> {
        self.delete_path(&format!("{}/{}", R::PATH, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, CompanyDraft, Drug, Status};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ApiClient {
        let config = AppConfig {
            api_base_url: server.uri(),
            ..Default::default()
        };
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        ApiClient::new(&config, store).unwrap()
    }

    #[test]
    fn test_list_query_pairs() {
        let query = ListQuery {
            page: 3,
            per_page: 10,
            filters: vec![("status".into(), "active".into())],
            sort: Some(SortSpec {
                field: "name".into(),
                direction: SortDirection::Desc,
            }),
        };
        let pairs = query.to_pairs();
        assert_eq!(pairs[0], ("skip".to_string(), "20".to_string()));
        assert_eq!(pairs[1], ("limit".to_string(), "10".to_string()));
        assert!(pairs.contains(&("status".to_string(), "active".to_string())));
        assert!(pairs.contains(&("sort_order".to_string(), "desc".to_string())));
    }

    #[tokio::test]
    async fn test_list_sends_params_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drugs"))
            .and(query_param("skip", "10"))
            .and(query_param("limit", "10"))
            .and(query_param("search", "para"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 11, "name": "Paracetamol", "stock_quantity": 40}],
                "total": 11
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.store().set(TOKEN_KEY, "secret").unwrap();

        let query = ListQuery {
            page: 2,
            per_page: 10,
            filters: vec![("search".into(), "para".into())],
            sort: None,
        };
        let page: Page<Drug> = ResourceBackend::<Drug>::list(&client, &query).await.unwrap();
        assert_eq!(page.total, 11);
        assert_eq!(page.items[0].name, "Paracetamol");
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/companies"))
            .and(body_json(json!({"name": "Acme", "status": "active"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 5, "name": "Acme", "status": "active"})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/companies/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5, "name": "Acme", "status": "inactive"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let draft = CompanyDraft {
            name: "Acme".into(),
            status: Status::Active,
        };
        let created: Company = ResourceBackend::<Company>::create(&client, &draft).await.unwrap();
        assert_eq!(created.id, 5);

        let draft = CompanyDraft {
            status: Status::Inactive,
            ..draft
        };
        let updated: Company = ResourceBackend::<Company>::update(&client, 5, &draft).await.unwrap();
        assert_eq!(updated.status, Status::Inactive);
    }

    #[tokio::test]
    async fn test_error_detail_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/drugs/3"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({"detail": "Drug is used in a prescription"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = ResourceBackend::<Drug>::delete(&client, 3).await.unwrap_err();
        assert_eq!(err.status(), Some(409));
        assert_eq!(err.user_message(), "Drug is used in a prescription");
    }

    #[tokio::test]
    async fn test_unauthorized_clears_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/companies"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "Not authenticated"})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.store().set(TOKEN_KEY, "stale").unwrap();

        let err = ResourceBackend::<Company>::list(&client, &ListQuery::default())
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(client.token(), None);
    }

    #[tokio::test]
    async fn test_delete_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/companies/9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        ResourceBackend::<Company>::delete(&client, 9).await.unwrap();
    }
}
