use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::api::Resource;
use crate::error::{AppError, AppResult, FieldErrors};

/// Active/inactive flag shared by drugs and companies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    #[serde(alias = "Active")]
    Active,
    #[serde(alias = "Inactive")]
    Inactive,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[serde(alias = "Male", alias = "M")]
    Male,
    #[serde(alias = "Female", alias = "F")]
    Female,
    #[serde(alias = "Other")]
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::Other => "Other",
        }
    }
}

// ============ Company ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub status: Status,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyDraft {
    pub name: String,
    pub status: Status,
}

/// Company as embedded in a drug payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyRef {
    pub id: i64,
    pub name: String,
}

impl Resource for Company {
    type Draft = CompanyDraft;
    const PATH: &'static str = "/companies";
    const LABEL: &'static str = "Company";

    fn id(&self) -> i64 {
        self.id
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn apply(&mut self, draft: &CompanyDraft) {
        self.name = draft.name.trim().to_string();
        self.status = draft.status;
    }

    fn validate(draft: &CompanyDraft) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        if draft.name.trim().is_empty() {
            errors.insert("name".into(), "Company name is required".into());
        }
        finish(errors)
    }
}

// ============ Drug ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Drug {
    pub id: i64,
    pub name: String,
    pub generic_name: Option<String>,
    pub brand_name: Option<String>,
    pub company_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<CompanyRef>,
    pub box_price: Option<f64>,
    pub strip_price: Option<f64>,
    pub tablet_price: Option<f64>,
    pub stock_quantity: i64,
    pub expiry_date: Option<NaiveDate>,
    pub barcode: Option<String>,
    pub status: Status,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Drug {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|d| d < today)
    }

    /// Not yet expired but expiring within `days` days.
    pub fn expires_within(&self, today: NaiveDate, days: i64) -> bool {
        self.expiry_date
            .is_some_and(|d| d >= today && (d - today).num_days() <= days)
    }

    pub fn is_low_stock(&self, threshold: i64) -> bool {
        self.stock_quantity <= threshold
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrugDraft {
    pub name: String,
    pub generic_name: Option<String>,
    pub brand_name: Option<String>,
    pub company_id: Option<i64>,
    pub box_price: Option<f64>,
    pub strip_price: Option<f64>,
    pub tablet_price: Option<f64>,
    pub stock_quantity: i64,
    pub expiry_date: Option<NaiveDate>,
    pub barcode: Option<String>,
    pub status: Status,
}

impl Resource for Drug {
    type Draft = DrugDraft;
    const PATH: &'static str = "/drugs";
    const LABEL: &'static str = "Drug";

    fn id(&self) -> i64 {
        self.id
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn apply(&mut self, draft: &DrugDraft) {
        self.name = draft.name.trim().to_string();
        self.generic_name = draft.generic_name.clone();
        self.brand_name = draft.brand_name.clone();
        if self.company_id != draft.company_id {
            self.company = None;
        }
        self.company_id = draft.company_id;
        self.box_price = draft.box_price;
        self.strip_price = draft.strip_price;
        self.tablet_price = draft.tablet_price;
        self.stock_quantity = draft.stock_quantity;
        self.expiry_date = draft.expiry_date;
        self.barcode = draft.barcode.clone();
        self.status = draft.status;
    }

    fn validate(draft: &DrugDraft) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        if draft.name.trim().is_empty() {
            errors.insert("name".into(), "Drug name is required".into());
        }
        if draft.company_id.is_none() {
            errors.insert("company_id".into(), "Company is required".into());
        }
        if draft.stock_quantity < 0 {
            errors.insert("stock_quantity".into(), "Stock cannot be negative".into());
        }
        for (field, price) in [
            ("box_price", draft.box_price),
            ("strip_price", draft.strip_price),
            ("tablet_price", draft.tablet_price),
        ] {
            if price.is_some_and(|p| p < 0.0) {
                errors.insert(field.into(), "Price cannot be negative".into());
            }
        }
        finish(errors)
    }
}

// ============ OPD patient ============

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VitalSigns {
    /// e.g. "120/80"
    pub blood_pressure: Option<String>,
    pub pulse: Option<f64>,
    pub temperature: Option<f64>,
    pub weight: Option<f64>,
    pub height: Option<f64>,
    pub respiratory_rate: Option<f64>,
}

impl VitalSigns {
    pub fn is_empty(&self) -> bool {
        *self == VitalSigns::default()
    }

    /// One-line summary for printouts, skipping unset values.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(bp) = self.blood_pressure.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("BP {} mmHg", bp));
        }
        if let Some(v) = self.pulse {
            parts.push(format!("Pulse {} bpm", trim_number(v)));
        }
        if let Some(v) = self.temperature {
            parts.push(format!("Temp {} C", trim_number(v)));
        }
        if let Some(v) = self.respiratory_rate {
            parts.push(format!("RR {}/min", trim_number(v)));
        }
        if let Some(v) = self.weight {
            parts.push(format!("Wt {} kg", trim_number(v)));
        }
        if let Some(v) = self.height {
            parts.push(format!("Ht {} cm", trim_number(v)));
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodPatient {
    pub id: i64,
    pub name: String,
    pub gender: Option<Gender>,
    pub age: Option<u32>,
    pub telephone: Option<String>,
    pub address: Option<String>,
    #[serde(flatten)]
    pub vitals: VitalSigns,
    pub symptom: Option<String>,
    pub diagnosis: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodPatientDraft {
    pub name: String,
    pub gender: Option<Gender>,
    pub age: Option<u32>,
    pub telephone: Option<String>,
    pub address: Option<String>,
    #[serde(flatten)]
    pub vitals: VitalSigns,
    pub symptom: Option<String>,
    pub diagnosis: Option<String>,
}

impl Resource for PodPatient {
    type Draft = PodPatientDraft;
    const PATH: &'static str = "/pod-patients";
    const LABEL: &'static str = "Patient";

    fn id(&self) -> i64 {
        self.id
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn apply(&mut self, draft: &PodPatientDraft) {
        self.name = draft.name.trim().to_string();
        self.gender = draft.gender;
        self.age = draft.age;
        self.telephone = draft.telephone.clone();
        self.address = draft.address.clone();
        self.vitals = draft.vitals.clone();
        self.symptom = draft.symptom.clone();
        self.diagnosis = draft.diagnosis.clone();
    }

    fn validate(draft: &PodPatientDraft) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        if draft.name.trim().is_empty() {
            errors.insert("name".into(), "Patient name is required".into());
        }
        if draft.gender.is_none() {
            errors.insert("gender".into(), "Gender is required".into());
        }
        match draft.age {
            None => {
                errors.insert("age".into(), "Age is required".into());
            }
            Some(age) if age == 0 || age > 150 => {
                errors.insert("age".into(), "Age must be between 1 and 150".into());
            }
            Some(_) => {}
        }
        finish(errors)
    }
}

// ============ Prescription ============

/// Tablets per time of day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dosage {
    pub morning: f64,
    pub afternoon: f64,
    pub evening: f64,
    pub night: f64,
}

impl Dosage {
    pub fn new(morning: f64, afternoon: f64, evening: f64, night: f64) -> Self {
        Self {
            morning,
            afternoon,
            evening,
            night,
        }
    }

    pub fn per_day(&self) -> f64 {
        self.morning + self.afternoon + self.evening + self.night
    }

    /// "1-0-1-0" style label
    pub fn label(&self) -> String {
        [self.morning, self.afternoon, self.evening, self.night]
            .iter()
            .map(|v| trim_number(*v))
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrescriptionItem {
    pub drug_id: Option<i64>,
    pub drug_name: String,
    pub dosage: Dosage,
    pub period_days: u32,
    pub quantity: u32,
    pub before_meal: bool,
    pub after_meal: bool,
    pub unit_price: f64,
    pub price: f64,
}

impl PrescriptionItem {
    pub fn meal_label(&self) -> &'static str {
        match (self.before_meal, self.after_meal) {
            (true, true) => "Before & after meal",
            (true, false) => "Before meal",
            (false, true) => "After meal",
            (false, false) => "-",
        }
    }
}

/// What gets frozen into `PatientHistory.json_data` at the end of a visit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpdSnapshot {
    #[serde(alias = "patient_info", default)]
    pub patient: PodPatient,
    #[serde(alias = "prescription", default, deserialize_with = "deserialize_lines")]
    pub prescriptions: Vec<PrescriptionItem>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub visit_date: Option<String>,
}

impl OpdSnapshot {
    /// Stored total, or the sum of line prices for older records without one.
    pub fn grand_total(&self) -> f64 {
        self.total
            .unwrap_or_else(|| round2(self.prescriptions.iter().map(|p| p.price).sum()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LinesShape {
    List(Vec<PrescriptionItem>),
    Wrapped { items: Vec<PrescriptionItem> },
    /// `null`
    Empty,
}

fn deserialize_lines<'de, D>(deserializer: D) -> Result<Vec<PrescriptionItem>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match LinesShape::deserialize(deserializer)? {
        LinesShape::List(items) | LinesShape::Wrapped { items } => items,
        LinesShape::Empty => Vec::new(),
    })
}

// ============ Patient history ============

pub const HISTORY_TYPE_OPD: &str = "opd";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientHistory {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    /// Either a JSON string or an already decoded object, depending on the backend version
    pub json_data: serde_json::Value,
    pub patient_id: Option<i64>,
    pub created_at: Option<String>,
}

impl PatientHistory {
    pub fn snapshot(&self) -> AppResult<OpdSnapshot> {
        match &self.json_data {
            serde_json::Value::String(raw) => Ok(serde_json::from_str(raw)?),
            serde_json::Value::Null => Err(AppError::NotFound(format!(
                "patient history {} has no visit data",
                self.id
            ))),
            value => Ok(serde_json::from_value(value.clone())?),
        }
    }

    pub fn created_date(&self) -> Option<NaiveDate> {
        self.created_at.as_deref().and_then(date_part)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPatientHistory {
    #[serde(rename = "type")]
    pub kind: String,
    pub json_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<i64>,
}

impl NewPatientHistory {
    pub fn opd(snapshot: &OpdSnapshot, patient_id: Option<i64>) -> AppResult<Self> {
        Ok(Self {
            kind: HISTORY_TYPE_OPD.to_string(),
            json_data: serde_json::to_string(snapshot)?,
            patient_id,
        })
    }
}

impl Resource for PatientHistory {
    type Draft = NewPatientHistory;
    const PATH: &'static str = "/patient-histories";
    const LABEL: &'static str = "Patient history";

    fn id(&self) -> i64 {
        self.id
    }

    fn display_name(&self) -> String {
        self.snapshot()
            .map(|s| s.patient.name)
            .unwrap_or_else(|_| format!("#{}", self.id))
    }

    fn apply(&mut self, draft: &NewPatientHistory) {
        self.kind = draft.kind.clone();
        self.json_data = serde_json::Value::String(draft.json_data.clone());
        self.patient_id = draft.patient_id;
    }
}

// ============ Paging ============

/// One page of a list endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageShape<T> {
    Items { items: Vec<T>, total: Option<u64> },
    Data { data: Vec<T>, total: Option<u64> },
    Plain(Vec<T>),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Page<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (items, total) = match PageShape::<T>::deserialize(deserializer)? {
            PageShape::Items { items, total } => (items, total),
            PageShape::Data { data, total } => (data, total),
            PageShape::Plain(items) => (items, None),
        };
        let total = total.unwrap_or(items.len() as u64);
        Ok(Page { items, total })
    }
}

// ============ Auth ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
}

/// What the UI sees about the current session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub user: Option<User>,
}

// ============ Helpers ============

fn finish(errors: FieldErrors) -> Result<(), FieldErrors> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 1.0 -> "1", 0.5 -> "0.5"
pub fn trim_number(value: f64) -> String {
    let s = format!("{:.2}", value);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Date portion of "2024-05-01", "2024-05-01T10:00:00" or an RFC 3339 timestamp.
pub fn date_part(value: &str) -> Option<NaiveDate> {
    let head = value.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_shapes() {
        let page: Page<Company> =
            serde_json::from_value(json!({"items": [{"id": 1, "name": "Acme"}], "total": 41})).unwrap();
        assert_eq!(page.total, 41);
        assert_eq!(page.items[0].name, "Acme");

        let page: Page<Company> =
            serde_json::from_value(json!({"data": [{"id": 1}, {"id": 2}]})).unwrap();
        assert_eq!(page.total, 2);

        let page: Page<Company> = serde_json::from_value(json!([{"id": 3}])).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_drug_expiry_and_stock() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let mut drug = Drug {
            expiry_date: NaiveDate::from_ymd_opt(2024, 5, 31),
            stock_quantity: 5,
            ..Default::default()
        };
        assert!(drug.is_expired(today));
        assert!(!drug.expires_within(today, 30));
        assert!(drug.is_low_stock(10));

        drug.expiry_date = NaiveDate::from_ymd_opt(2024, 6, 20);
        assert!(!drug.is_expired(today));
        assert!(drug.expires_within(today, 30));

        drug.expiry_date = None;
        assert!(!drug.is_expired(today));
    }

    #[test]
    fn test_drug_validation() {
        let errors = Drug::validate(&DrugDraft {
            stock_quantity: -1,
            tablet_price: Some(-2.0),
            ..Default::default()
        })
        .unwrap_err();
        assert!(errors.contains_key("name"));
        assert!(errors.contains_key("company_id"));
        assert!(errors.contains_key("stock_quantity"));
        assert!(errors.contains_key("tablet_price"));

        assert!(Drug::validate(&DrugDraft {
            name: "Paracetamol".into(),
            company_id: Some(1),
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn test_patient_flattened_vitals() {
        let patient: PodPatient = serde_json::from_value(json!({
            "id": 7,
            "name": "Sok Dara",
            "gender": "Male",
            "age": 42,
            "blood_pressure": "120/80",
            "pulse": 72,
        }))
        .unwrap();
        assert_eq!(patient.gender, Some(Gender::Male));
        assert_eq!(patient.vitals.blood_pressure.as_deref(), Some("120/80"));
        assert_eq!(patient.vitals.summary(), "BP 120/80 mmHg, Pulse 72 bpm");

        let value = serde_json::to_value(&patient).unwrap();
        assert_eq!(value["pulse"], json!(72.0));
        assert_eq!(value["gender"], json!("male"));
    }

    #[test]
    fn test_snapshot_legacy_shapes() {
        let current = json!({
            "patient": {"name": "Chan Sophea", "age": 30},
            "prescriptions": [{"drug_name": "Amoxicillin", "price": 3.5}],
            "total": 3.5
        });
        let legacy = json!({
            "patient_info": {"name": "Chan Sophea", "age": 30},
            "prescription": {"items": [{"drug_name": "Amoxicillin", "price": 3.5}]}
        });
        let legacy_list = json!({
            "patient_info": {"name": "Chan Sophea", "age": 30},
            "prescription": [{"drug_name": "Amoxicillin", "price": 3.5}]
        });

        let a: OpdSnapshot = serde_json::from_value(current).unwrap();
        let b: OpdSnapshot = serde_json::from_value(legacy).unwrap();
        let c: OpdSnapshot = serde_json::from_value(legacy_list).unwrap();
        assert_eq!(a.patient, b.patient);
        assert_eq!(a.prescriptions, b.prescriptions);
        assert_eq!(b.prescriptions, c.prescriptions);
        assert_eq!(b.grand_total(), 3.5);

        let empty: OpdSnapshot = serde_json::from_value(json!({
            "patient_info": {"name": "Chan Sophea"},
            "prescription": null
        }))
        .unwrap();
        assert!(empty.prescriptions.is_empty());
        assert_eq!(empty.grand_total(), 0.0);
    }

    #[test]
    fn test_history_snapshot_string_or_object() {
        let snapshot = OpdSnapshot {
            patient: PodPatient {
                name: "Keo".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let as_string = PatientHistory {
            id: 1,
            json_data: serde_json::Value::String(serde_json::to_string(&snapshot).unwrap()),
            ..Default::default()
        };
        let as_object = PatientHistory {
            id: 2,
            json_data: serde_json::to_value(&snapshot).unwrap(),
            ..Default::default()
        };
        assert_eq!(as_string.snapshot().unwrap(), snapshot);
        assert_eq!(as_object.snapshot().unwrap(), snapshot);
        assert!(PatientHistory::default().snapshot().is_err());
    }

    #[test]
    fn test_number_helpers() {
        assert_eq!(trim_number(1.0), "1");
        assert_eq!(trim_number(0.5), "0.5");
        assert_eq!(trim_number(1.999), "2");
        assert_eq!(trim_number(1.001), "1");
        assert_eq!(trim_number(36.25), "36.25");
        assert_eq!(trim_number(120.0), "120");
        assert_eq!(Dosage::new(1.0, 0.0, 0.5, 1.0).label(), "1-0-0.5-1");
        assert_eq!(round2(3.14159), 3.14);
        assert_eq!(
            date_part("2024-03-09T08:15:00"),
            NaiveDate::from_ymd_opt(2024, 3, 9)
        );
        assert_eq!(date_part("bad"), None);
    }
}
