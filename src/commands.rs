//! Application operations behind the web API
//!
//! List screens hold their `ResourceList` behind an async mutex that is only
//! taken for the synchronous begin/finish steps, never across a request, so
//! a reader sees optimistic rows while the backend call is still running.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::{ApiClient, ListQuery, Resource, ResourceBackend, SortDirection, SortSpec};
use crate::auth::SessionManager;
use crate::config::AppConfig;
use crate::db::LocalStore;
use crate::error::AppResult;
use crate::filters::{blank_as_none, CompanyFilter, DrugFilter, HistoryFilter, ListFilter, PatientFilter, StatusFilter};
use crate::listing::{ListView, ResourceList};
use crate::models::{
    date_part, AuthState, Company, CompanyRef, Drug, OpdSnapshot, PatientHistory, PodPatient, Status, User,
};
use crate::opd::{DiagnosisInput, LineInput, OpdForm, OpdTab, OpdView, PatientInput, VitalsInput};
use crate::pdf::{self, PrescriptionPdf};
use crate::toast::{Toast, Toaster};

/// Days ahead that count as "expiring soon"
pub const EXPIRY_WARNING_DAYS: i64 = 30;
const OPTIONS_LIMIT: u32 = 500;

/// Page, size and sort requested by a list screen; absent values keep the current state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    #[serde(deserialize_with = "blank_as_none")]
    pub page: Option<u32>,
    #[serde(deserialize_with = "blank_as_none")]
    pub per_page: Option<u32>,
    pub sort_by: Option<String>,
    #[serde(deserialize_with = "blank_as_none")]
    pub sort_order: Option<SortDirection>,
}

pub struct Screen<R: Resource, F: ListFilter> {
    list: Mutex<ResourceList<R, F>>,
    backend: Arc<dyn ResourceBackend<R>>,
}

impl<R: Resource, F: ListFilter> Screen<R, F> {
    pub fn new(backend: Arc<dyn ResourceBackend<R>>, page_size: u32, toaster: Toaster) -> Self {
        Self {
            list: Mutex::new(ResourceList::new(page_size, toaster)),
            backend,
        }
    }

    pub async fn view(&self) -> ListView<R, F> {
        self.list.lock().await.view()
    }

    pub async fn refresh(&self) -> ListView<R, F> {
        let ticket = self.list.lock().await.begin_fetch();
        let result = self.backend.list(&ticket.query).await;

        let mut list = self.list.lock().await;
        list.finish_fetch(ticket, &result);
        list.view()
    }

    /// Applies filter and paging input, then reloads.
    pub async fn load(&self, filter: F, params: ListParams) -> ListView<R, F> {
        {
            let mut list = self.list.lock().await;
            list.set_filter(filter);
            if let Some(field) = params.sort_by.filter(|f| !f.is_empty()) {
                list.set_sort(Some(SortSpec {
                    field,
                    direction: params.sort_order.unwrap_or_default(),
                }));
            }
            if let Some(per_page) = params.per_page {
                list.set_page_size(per_page);
            }
            if let Some(page) = params.page {
                list.set_page(page);
            }
        }
        self.refresh().await
    }

    pub async fn reset_filters(&self) -> ListView<R, F> {
        self.list.lock().await.reset_filters();
        self.refresh().await
    }

    pub async fn get(&self, id: i64) -> AppResult<R> {
        self.backend.get(id).await
    }

    pub async fn create(&self, draft: R::Draft) -> AppResult<R> {
        let pending = self.list.lock().await.begin_create(&draft)?;
        let result = self.backend.create(&draft).await;
        self.list.lock().await.finish_create(pending, result)
    }

    pub async fn update(&self, id: i64, draft: R::Draft) -> AppResult<R> {
        let pending = self.list.lock().await.begin_update(id, &draft)?;
        let result = self.backend.update(id, &draft).await;
        self.list.lock().await.finish_update(pending, result)
    }

    pub async fn delete(&self, id: i64) -> AppResult<()> {
        let pending = self.list.lock().await.begin_delete(&[id])?;
        let result = self.backend.delete(id).await;
        self.list.lock().await.finish_delete(pending, result)
    }

    pub async fn delete_many(&self, ids: &[i64]) -> AppResult<()> {
        let pending = self.list.lock().await.begin_delete(ids)?;
        let result = self.backend.delete_many(&pending.ids).await;
        self.list.lock().await.finish_delete(pending, result)
    }

    /// Unpaged lookup used by dropdowns; does not touch the screen's state.
    pub async fn options(&self, filters: Vec<(String, String)>) -> AppResult<Vec<R>> {
        let query = ListQuery {
            page: 1,
            per_page: OPTIONS_LIMIT,
            filters,
            sort: Some(SortSpec {
                field: "name".into(),
                direction: SortDirection::Asc,
            }),
        };
        Ok(self.backend.list(&query).await?.items)
    }
}

// ============ Drug flags ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrugAlert {
    pub id: i64,
    pub expired: bool,
    pub expiring_soon: bool,
    pub low_stock: bool,
}

pub fn drug_alerts(drugs: &[Drug], today: NaiveDate, low_stock_threshold: i64) -> Vec<DrugAlert> {
    drugs
        .iter()
        .map(|d| DrugAlert {
            id: d.id,
            expired: d.is_expired(today),
            expiring_soon: d.expires_within(today, EXPIRY_WARNING_DAYS),
            low_stock: d.is_low_stock(low_stock_threshold),
        })
        .filter(|a| a.expired || a.expiring_soon || a.low_stock)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DrugListView {
    #[serde(flatten)]
    pub list: ListView<Drug, DrugFilter>,
    pub alerts: Vec<DrugAlert>,
}

// ============ History detail ============

#[derive(Debug, Clone, Serialize)]
pub struct HistoryDetail {
    pub history: PatientHistory,
    pub snapshot: OpdSnapshot,
    pub pdf_filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PdfPreview {
    pub filename: String,
    pub pages: u32,
    /// base64 of the PDF bytes, for an `<iframe src="data:application/pdf;base64,...">`
    pub data: String,
}

/// Partial update of the wizard's form fields
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpdInput {
    pub patient: Option<PatientInput>,
    pub vitals: Option<VitalsInput>,
    pub diagnosis: Option<DiagnosisInput>,
}

pub struct AppState {
    pub config: AppConfig,
    pub api: ApiClient,
    pub session: Arc<SessionManager>,
    pub toaster: Toaster,
    pub drugs: Screen<Drug, DrugFilter>,
    pub companies: Screen<Company, CompanyFilter>,
    pub patients: Screen<PodPatient, PatientFilter>,
    pub histories: Screen<PatientHistory, HistoryFilter>,
    pub opd: Mutex<OpdForm>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<LocalStore>) -> AppResult<Self> {
        let api = ApiClient::new(&config, store)?;
        let backend = Arc::new(api.clone());
        let toaster = Toaster::new();
        let page_size = config.page_size;

        Ok(Self {
            session: Arc::new(SessionManager::new(api.clone())),
            drugs: Screen::new(backend.clone(), page_size, toaster.clone()),
            companies: Screen::new(backend.clone(), page_size, toaster.clone()),
            patients: Screen::new(backend.clone(), page_size, toaster.clone()),
            histories: Screen::new(backend, page_size, toaster.clone()),
            opd: Mutex::new(OpdForm::new()),
            toaster,
            api,
            config,
        })
    }

    // ============ Auth ============

    pub async fn login(&self, email: &str, password: &str) -> AppResult<AuthState> {
        let result = self.session.login(email, password).await;
        if let Err(e) = &result {
            self.toaster.error("Login failed", e.user_message());
        }
        result
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> AppResult<AuthState> {
        let state = self.session.register(name, email, password).await?;
        self.toaster.success("Account created", format!("Welcome, {}", name.trim()));
        Ok(state)
    }

    pub async fn logout(&self) -> AppResult<()> {
        self.session.logout().await?;
        self.opd.lock().await.reset();
        Ok(())
    }

    pub async fn me(&self) -> AppResult<User> {
        self.session.me().await
    }

    pub fn auth_state(&self) -> AuthState {
        self.session.auth_state()
    }

    pub fn drain_toasts(&self) -> Vec<Toast> {
        self.toaster.drain()
    }

    // ============ Drugs & companies ============

    pub fn drug_view(&self, list: ListView<Drug, DrugFilter>) -> DrugListView {
        let drugs: Vec<Drug> = list.items.iter().map(|row| row.record.clone()).collect();
        DrugListView {
            alerts: drug_alerts(&drugs, Local::now().date_naive(), self.config.low_stock_threshold),
            list,
        }
    }

    /// Active companies for the drug form's dropdown
    pub async fn company_options(&self) -> AppResult<Vec<CompanyRef>> {
        let filters = vec![("status".to_string(), Status::Active.as_str().to_string())];
        let companies = self.companies.options(filters).await?;
        Ok(companies
            .into_iter()
            .map(|c| CompanyRef { id: c.id, name: c.name })
            .collect())
    }

    /// Active drugs matching `term`, for the prescription tab.
    pub async fn drug_options(&self, term: &str) -> AppResult<Vec<Drug>> {
        let filter = DrugFilter {
            search: term.to_string(),
            status: StatusFilter::Active,
            ..Default::default()
        };
        self.drugs.options(filter.query_pairs()).await
    }

    // ============ Patient histories ============

    pub async fn history_detail(&self, id: i64) -> AppResult<HistoryDetail> {
        let history = self.histories.get(id).await?;
        let snapshot = history.snapshot()?;
        let date = snapshot
            .visit_date
            .as_deref()
            .and_then(date_part)
            .or_else(|| history.created_date())
            .unwrap_or_else(|| Local::now().date_naive());
        Ok(HistoryDetail {
            pdf_filename: pdf::pdf_filename(&snapshot.patient.name, date),
            history,
            snapshot,
        })
    }

    pub async fn history_pdf(&self, id: i64) -> AppResult<PrescriptionPdf> {
        let history = self.histories.get(id).await?;
        let result = pdf::render_history(&history, &self.config.clinic_name);
        if let Err(e) = &result {
            self.toaster.error("Could not create PDF", e.user_message());
        }
        result
    }

    pub async fn pdf_preview(&self, id: i64) -> AppResult<PdfPreview> {
        let document = self.history_pdf(id).await?;
        Ok(PdfPreview {
            filename: document.filename,
            pages: document.pages,
            data: BASE64.encode(&document.bytes),
        })
    }

    // ============ OPD wizard ============

    pub async fn opd_view(&self) -> OpdView {
        self.opd.lock().await.view()
    }

    pub async fn opd_update(&self, input: OpdInput) -> OpdView {
        let mut form = self.opd.lock().await;
        if let Some(patient) = input.patient {
            form.patient = patient;
        }
        if let Some(vitals) = input.vitals {
            form.vitals = vitals;
        }
        if let Some(diagnosis) = input.diagnosis {
            form.diagnosis = diagnosis;
        }
        form.view()
    }

    pub async fn opd_next(&self) -> AppResult<OpdView> {
        let mut form = self.opd.lock().await;
        form.next()?;
        Ok(form.view())
    }

    pub async fn opd_back(&self) -> OpdView {
        let mut form = self.opd.lock().await;
        form.back();
        form.view()
    }

    pub async fn opd_go_to(&self, tab: OpdTab) -> AppResult<OpdView> {
        let mut form = self.opd.lock().await;
        form.go_to(tab)?;
        Ok(form.view())
    }

    pub async fn opd_add_line(&self, input: LineInput) -> AppResult<OpdView> {
        let drug = self.drugs.get(input.drug_id).await?;
        let mut form = self.opd.lock().await;
        form.add_line(&drug, &input)?;
        Ok(form.view())
    }

    pub async fn opd_replace_line(&self, index: usize, input: LineInput) -> AppResult<OpdView> {
        let drug = self.drugs.get(input.drug_id).await?;
        let mut form = self.opd.lock().await;
        form.replace_line(index, &drug, &input)?;
        Ok(form.view())
    }

    pub async fn opd_remove_line(&self, index: usize) -> AppResult<OpdView> {
        let mut form = self.opd.lock().await;
        form.remove_line(index)?;
        Ok(form.view())
    }

    pub async fn opd_reset(&self) -> OpdView {
        let mut form = self.opd.lock().await;
        form.reset();
        form.view()
    }

    /// Held for the whole submission so a double click cannot save the visit twice.
    pub async fn opd_submit(&self) -> AppResult<PatientHistory> {
        let mut form = self.opd.lock().await;
        match form.submit(&self.api).await {
            Ok(history) => {
                self.toaster
                    .success("Visit saved", format!("{} recorded", history.display_name()));
                Ok(history)
            }
            Err(e) => {
                self.toaster.error("Could not save visit", e.user_message());
                Err(e)
            }
        }
    }
}
