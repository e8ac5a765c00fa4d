//! OPD visit registration wizard
//!
//! Tabs run `PatientInfo → VitalSigns → Diagnosis → Prescription → Review`.
//! Each tab validates before the wizard moves past it. Submitting creates the
//! patient, then stores the whole visit as an `opd` patient history.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::api::{Resource, ResourceBackend};
use crate::error::{AppError, AppResult, FieldErrors};
use crate::models::{
    round2, Dosage, Drug, Gender, NewPatientHistory, OpdSnapshot, PatientHistory, PodPatient,
    PodPatientDraft, PrescriptionItem, VitalSigns,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpdTab {
    #[default]
    PatientInfo,
    VitalSigns,
    Diagnosis,
    Prescription,
    Review,
}

impl OpdTab {
    pub const ALL: [OpdTab; 5] = [
        OpdTab::PatientInfo,
        OpdTab::VitalSigns,
        OpdTab::Diagnosis,
        OpdTab::Prescription,
        OpdTab::Review,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<OpdTab> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn prev(&self) -> Option<OpdTab> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn title(&self) -> &'static str {
        match self {
            OpdTab::PatientInfo => "Patient information",
            OpdTab::VitalSigns => "Vital signs",
            OpdTab::Diagnosis => "Symptoms & diagnosis",
            OpdTab::Prescription => "Prescription",
            OpdTab::Review => "Review",
        }
    }

    /// Tab that owns a form field, used to route server-side field errors.
    pub fn for_field(field: &str) -> OpdTab {
        match field {
            "blood_pressure" | "pulse" | "temperature" | "weight" | "height" | "respiratory_rate" => {
                OpdTab::VitalSigns
            }
            "symptom" | "diagnosis" => OpdTab::Diagnosis,
            "prescriptions" | "json_data" => OpdTab::Prescription,
            _ => OpdTab::PatientInfo,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientInput {
    pub name: String,
    pub gender: Option<Gender>,
    pub age: Option<u32>,
    pub telephone: String,
    pub address: String,
}

/// Vital signs as typed; every field may be left blank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VitalsInput {
    pub blood_pressure: String,
    pub pulse: String,
    pub temperature: String,
    pub weight: String,
    pub height: String,
    pub respiratory_rate: String,
}

impl VitalsInput {
    pub fn parse(&self) -> Result<VitalSigns, FieldErrors> {
        let mut errors = FieldErrors::new();

        let blood_pressure = match self.blood_pressure.trim() {
            "" => None,
            bp if is_blood_pressure(bp) => Some(bp.to_string()),
            _ => {
                errors.insert("blood_pressure".into(), "Use the form 120/80".into());
                None
            }
        };

        let mut number = |field: &str, raw: &str| -> Option<f64> {
            let raw = raw.trim();
            if raw.is_empty() {
                return None;
            }
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() && v > 0.0 => Some(v),
                _ => {
                    errors.insert(field.to_string(), "Must be a positive number".into());
                    None
                }
            }
        };

        let vitals = VitalSigns {
            blood_pressure,
            pulse: number("pulse", &self.pulse),
            temperature: number("temperature", &self.temperature),
            weight: number("weight", &self.weight),
            height: number("height", &self.height),
            respiratory_rate: number("respiratory_rate", &self.respiratory_rate),
        };

        if errors.is_empty() {
            Ok(vitals)
        } else {
            Err(errors)
        }
    }
}

fn is_blood_pressure(value: &str) -> bool {
    match value.split_once('/') {
        Some((sys, dia)) => sys.trim().parse::<u32>().is_ok() && dia.trim().parse::<u32>().is_ok(),
        None => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisInput {
    pub symptom: String,
    pub diagnosis: String,
}

/// One medication as entered on the prescription tab
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineInput {
    pub drug_id: i64,
    pub dosage: Dosage,
    pub period_days: u32,
    pub before_meal: bool,
    pub after_meal: bool,
}

/// Computes a prescription line from the chosen drug.
///
/// `quantity = ceil(tablets_per_day * period_days)`, priced per tablet.
pub fn prescription_line(drug: &Drug, input: &LineInput) -> AppResult<PrescriptionItem> {
    let mut errors = FieldErrors::new();
    let dosage = &input.dosage;
    if [dosage.morning, dosage.afternoon, dosage.evening, dosage.night]
        .iter()
        .any(|v| *v < 0.0 || !v.is_finite())
    {
        errors.insert("dosage".into(), "Dosage cannot be negative".into());
    } else if dosage.per_day() <= 0.0 {
        errors.insert("dosage".into(), "Enter at least one dose".into());
    }
    if input.period_days == 0 {
        errors.insert("period_days".into(), "Period must be at least one day".into());
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let quantity = (dosage.per_day() * f64::from(input.period_days)).ceil() as u32;
    let unit_price = drug.tablet_price.unwrap_or(0.0);
    Ok(PrescriptionItem {
        drug_id: Some(drug.id),
        drug_name: drug.name.clone(),
        dosage: dosage.clone(),
        period_days: input.period_days,
        quantity,
        before_meal: input.before_meal,
        after_meal: input.after_meal,
        unit_price,
        price: round2(f64::from(quantity) * unit_price),
    })
}

#[derive(Debug, Clone, Default)]
pub struct OpdForm {
    tab: OpdTab,
    pub patient: PatientInput,
    pub vitals: VitalsInput,
    pub diagnosis: DiagnosisInput,
    lines: Vec<PrescriptionItem>,
    errors: FieldErrors,
    /// Set once the patient exists on the server, so a retried submit does not create it twice
    saved_patient: Option<PodPatient>,
}

impl OpdForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tab(&self) -> OpdTab {
        self.tab
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn lines(&self) -> &[PrescriptionItem] {
        &self.lines
    }

    pub fn total(&self) -> f64 {
        round2(self.lines.iter().map(|l| l.price).sum())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // ============ Validation ============

    fn validate_patient(&self) -> Result<(), FieldErrors> {
        PodPatient::validate(&self.patient_fields())
    }

    pub fn validate_tab(&self, tab: OpdTab) -> Result<(), FieldErrors> {
        match tab {
            OpdTab::PatientInfo => self.validate_patient(),
            OpdTab::VitalSigns => self.vitals.parse().map(|_| ()),
            OpdTab::Diagnosis => Ok(()),
            OpdTab::Prescription => {
                if self.lines.is_empty() {
                    let mut errors = FieldErrors::new();
                    errors.insert("prescriptions".into(), "Add at least one medication".into());
                    Err(errors)
                } else {
                    Ok(())
                }
            }
            OpdTab::Review => self.validate_through(OpdTab::Prescription),
        }
    }

    /// Validates every tab up to and including `last`, stopping at the first failure.
    fn validate_through(&self, last: OpdTab) -> Result<(), FieldErrors> {
        for tab in OpdTab::ALL.iter().take_while(|t| **t <= last) {
            if *tab != OpdTab::Review {
                self.validate_tab(*tab)?;
            }
        }
        Ok(())
    }

    fn record(&mut self, result: Result<(), FieldErrors>) -> AppResult<()> {
        match result {
            Ok(()) => {
                self.errors.clear();
                Ok(())
            }
            Err(errors) => {
                self.errors = errors.clone();
                Err(AppError::Validation(errors))
            }
        }
    }

    // ============ Navigation ============

    pub fn next(&mut self) -> AppResult<OpdTab> {
        let result = self.validate_tab(self.tab);
        self.record(result)?;
        if let Some(next) = self.tab.next() {
            self.tab = next;
        }
        Ok(self.tab)
    }

    pub fn back(&mut self) -> OpdTab {
        if let Some(prev) = self.tab.prev() {
            self.tab = prev;
        }
        self.errors.clear();
        self.tab
    }

    /// Backwards always; forwards only when every earlier tab validates.
    pub fn go_to(&mut self, tab: OpdTab) -> AppResult<OpdTab> {
        if tab > self.tab {
            if let Some(last) = tab.prev() {
                let result = self.validate_through(last);
                if let Err(errors) = &result {
                    if let Some(first) = errors.keys().next() {
                        self.tab = self.tab.max(OpdTab::for_field(first)).min(tab);
                    }
                }
                self.record(result)?;
            }
        } else {
            self.errors.clear();
        }
        self.tab = tab;
        Ok(self.tab)
    }

    // ============ Prescription lines ============

    pub fn add_line(&mut self, drug: &Drug, input: &LineInput) -> AppResult<usize> {
        let line = prescription_line(drug, input)?;
        self.lines.push(line);
        self.errors.remove("prescriptions");
        Ok(self.lines.len() - 1)
    }

    pub fn replace_line(&mut self, index: usize, drug: &Drug, input: &LineInput) -> AppResult<()> {
        if index >= self.lines.len() {
            return Err(AppError::NotFound(format!("prescription line {}", index + 1)));
        }
        self.lines[index] = prescription_line(drug, input)?;
        Ok(())
    }

    pub fn remove_line(&mut self, index: usize) -> AppResult<PrescriptionItem> {
        if index >= self.lines.len() {
            return Err(AppError::NotFound(format!("prescription line {}", index + 1)));
        }
        Ok(self.lines.remove(index))
    }

    // ============ Submission ============

    fn patient_fields(&self) -> PodPatientDraft {
        let optional = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        PodPatientDraft {
            name: self.patient.name.trim().to_string(),
            gender: self.patient.gender,
            age: self.patient.age,
            telephone: optional(&self.patient.telephone),
            address: optional(&self.patient.address),
            vitals: self.vitals.parse().unwrap_or_default(),
            symptom: optional(&self.diagnosis.symptom),
            diagnosis: optional(&self.diagnosis.diagnosis),
        }
    }

    /// Validated patient payload; fails with every tab's field errors merged.
    pub fn patient_draft(&self) -> AppResult<PodPatientDraft> {
        let mut errors = FieldErrors::new();
        for tab in [OpdTab::PatientInfo, OpdTab::VitalSigns, OpdTab::Prescription] {
            if let Err(e) = self.validate_tab(tab) {
                errors.extend(e);
            }
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }
        Ok(self.patient_fields())
    }

    pub fn build_snapshot(&self, patient: &PodPatient, visit_date: NaiveDate) -> OpdSnapshot {
        OpdSnapshot {
            patient: patient.clone(),
            prescriptions: self.lines.clone(),
            total: Some(self.total()),
            visit_date: Some(visit_date.format("%Y-%m-%d").to_string()),
        }
    }

    fn absorb_error(&mut self, error: &AppError) {
        if let Some(errors) = error.field_errors() {
            if let Some(first) = errors.keys().next() {
                self.tab = OpdTab::for_field(first);
            }
            self.errors = errors;
        }
    }

    /// Creates the patient and records the visit. On success the wizard is
    /// cleared and the stored history returned; on failure the form keeps
    /// its input, with any 422 details mapped onto fields.
    pub async fn submit<B>(&mut self, backend: &B) -> AppResult<PatientHistory>
    where
        B: ResourceBackend<PodPatient> + ResourceBackend<PatientHistory> + ?Sized,
    {
        let draft = match self.patient_draft() {
            Ok(draft) => draft,
            Err(e) => {
                self.absorb_error(&e);
                return Err(e);
            }
        };

        let patient = match self.saved_patient.take() {
            Some(patient) => patient,
            None => {
                let created = ResourceBackend::<PodPatient>::create(backend, &draft).await;
                match created {
                    Ok(patient) => patient,
                    Err(e) => {
                        log::warn!("[opd] patient creation failed: {}", e);
                        self.absorb_error(&e);
                        return Err(e);
                    }
                }
            }
        };

        let snapshot = self.build_snapshot(&patient, Local::now().date_naive());
        let record = NewPatientHistory::opd(&snapshot, Some(patient.id))?;
        match ResourceBackend::<PatientHistory>::create(backend, &record).await {
            Ok(history) => {
                log::info!("[opd] visit saved for patient {} (history {})", patient.id, history.id);
                self.reset();
                Ok(history)
            }
            Err(e) => {
                log::warn!("[opd] history creation failed: {}", e);
                self.absorb_error(&e);
                self.saved_patient = Some(patient);
                Err(e)
            }
        }
    }

    pub fn view(&self) -> OpdView {
        OpdView {
            tab: self.tab,
            tabs: OpdTab::ALL
                .iter()
                .map(|t| TabView {
                    tab: *t,
                    title: t.title(),
                    complete: *t < self.tab,
                })
                .collect(),
            patient: self.patient.clone(),
            vitals: self.vitals.clone(),
            diagnosis: self.diagnosis.clone(),
            lines: self.lines.clone(),
            total: self.total(),
            errors: self.errors.clone(),
            patient_saved: self.saved_patient.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TabView {
    pub tab: OpdTab,
    pub title: &'static str,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpdView {
    pub tab: OpdTab,
    pub tabs: Vec<TabView>,
    pub patient: PatientInput,
    pub vitals: VitalsInput,
    pub diagnosis: DiagnosisInput,
    pub lines: Vec<PrescriptionItem>,
    pub total: f64,
    pub errors: FieldErrors,
    pub patient_saved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::config::AppConfig;
    use crate::db::LocalStore;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn amoxicillin() -> Drug {
        Drug {
            id: 12,
            name: "Amoxicillin 500mg".into(),
            tablet_price: Some(0.25),
            stock_quantity: 300,
            ..Default::default()
        }
    }

    fn line(morning: f64, evening: f64, days: u32) -> LineInput {
        LineInput {
            drug_id: 12,
            dosage: Dosage::new(morning, 0.0, evening, 0.0),
            period_days: days,
            after_meal: true,
            ..Default::default()
        }
    }

    fn filled_form() -> OpdForm {
        let mut form = OpdForm::new();
        form.patient = PatientInput {
            name: "Sok Dara".into(),
            gender: Some(Gender::Male),
            age: Some(42),
            telephone: "012 345 678".into(),
            ..Default::default()
        };
        form.vitals.blood_pressure = "120/80".into();
        form.vitals.pulse = "72".into();
        form.diagnosis.diagnosis = "Tonsillitis".into();
        form.add_line(&amoxicillin(), &line(1.0, 1.0, 7)).unwrap();
        form
    }

    #[test]
    fn test_line_quantity_rounds_up() {
        let item = prescription_line(&amoxicillin(), &line(1.0, 0.5, 5)).unwrap();
        // 1.5 a day for 5 days
        assert_eq!(item.quantity, 8);
        assert_eq!(item.unit_price, 0.25);
        assert_eq!(item.price, 2.0);
        assert_eq!(item.drug_id, Some(12));

        let err = prescription_line(&amoxicillin(), &line(0.0, 0.0, 0)).unwrap_err();
        let fields = err.field_errors().unwrap();
        assert!(fields.contains_key("dosage"));
        assert!(fields.contains_key("period_days"));
    }

    #[test]
    fn test_next_requires_patient_fields() {
        let mut form = OpdForm::new();
        assert!(form.next().is_err());
        assert_eq!(form.tab(), OpdTab::PatientInfo);
        assert!(form.errors().contains_key("name"));
        assert!(form.errors().contains_key("gender"));

        form.patient.name = "Keo".into();
        form.patient.gender = Some(Gender::Female);
        form.patient.age = Some(151);
        assert!(form.next().is_err());
        assert_eq!(form.errors().len(), 1);

        form.patient.age = Some(30);
        assert_eq!(form.next().unwrap(), OpdTab::VitalSigns);
        assert!(form.errors().is_empty());
    }

    #[test]
    fn test_vitals_optional_but_parsed() {
        let mut vitals = VitalsInput::default();
        assert!(vitals.parse().unwrap().is_empty());

        vitals.pulse = "fast".into();
        vitals.blood_pressure = "120-80".into();
        let errors = vitals.parse().unwrap_err();
        assert!(errors.contains_key("pulse"));
        assert!(errors.contains_key("blood_pressure"));

        vitals.pulse = " 80 ".into();
        vitals.blood_pressure = "110/70".into();
        let parsed = vitals.parse().unwrap();
        assert_eq!(parsed.pulse, Some(80.0));
    }

    #[test]
    fn test_review_needs_a_prescription() {
        let mut form = filled_form();
        form.remove_line(0).unwrap();
        form.go_to(OpdTab::Prescription).unwrap();
        assert!(form.next().is_err());
        assert!(form.errors().contains_key("prescriptions"));

        form.add_line(&amoxicillin(), &line(1.0, 0.0, 3)).unwrap();
        assert_eq!(form.next().unwrap(), OpdTab::Review);
        assert_eq!(form.back(), OpdTab::Prescription);
    }

    #[test]
    fn test_go_to_forward_stops_at_invalid_tab() {
        let mut form = OpdForm::new();
        form.patient.name = "Keo".into();
        form.patient.gender = Some(Gender::Female);
        form.patient.age = Some(30);
        form.vitals.temperature = "hot".into();

        assert!(form.go_to(OpdTab::Review).is_err());
        assert_eq!(form.tab(), OpdTab::VitalSigns);
        assert!(form.errors().contains_key("temperature"));

        form.vitals.temperature = "37.5".into();
        form.go_to(OpdTab::Diagnosis).unwrap();
        assert_eq!(form.go_to(OpdTab::PatientInfo).unwrap(), OpdTab::PatientInfo);
    }

    #[test]
    fn test_replace_and_total() {
        let mut form = filled_form();
        assert_eq!(form.total(), 3.5);
        form.replace_line(0, &amoxicillin(), &line(1.0, 0.0, 2)).unwrap();
        assert_eq!(form.total(), 0.5);
        assert!(form.replace_line(4, &amoxicillin(), &line(1.0, 0.0, 2)).is_err());
        assert!(form.remove_line(3).is_err());
    }

    #[test]
    fn test_snapshot_carries_patient_and_lines() {
        let form = filled_form();
        let draft = form.patient_draft().unwrap();
        assert_eq!(draft.telephone.as_deref(), Some("012 345 678"));
        assert_eq!(draft.address, None);
        assert_eq!(draft.vitals.pulse, Some(72.0));

        let mut patient = PodPatient::preview(&draft);
        patient.id = 4;
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let snapshot = form.build_snapshot(&patient, date);
        assert_eq!(snapshot.patient.id, 4);
        assert_eq!(snapshot.prescriptions.len(), 1);
        assert_eq!(snapshot.total, Some(3.5));
        assert_eq!(snapshot.visit_date.as_deref(), Some("2024-05-01"));
    }

    fn client_for(server: &MockServer) -> ApiClient {
        let config = AppConfig {
            api_base_url: server.uri(),
            ..Default::default()
        };
        ApiClient::new(&config, Arc::new(LocalStore::open_in_memory().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_submit_creates_patient_then_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pod-patients"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 31, "name": "Sok Dara", "gender": "male", "age": 42
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/patient-histories"))
            .respond_with(|req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                ResponseTemplate::new(201).set_body_json(json!({
                    "id": 90,
                    "type": body["type"],
                    "json_data": body["json_data"],
                    "patient_id": body["patient_id"],
                }))
            })
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut form = filled_form();
        let history = form.submit(&client).await.unwrap();

        assert_eq!(history.id, 90);
        assert_eq!(history.kind, "opd");
        assert_eq!(history.patient_id, Some(31));
        let snapshot = history.snapshot().unwrap();
        assert_eq!(snapshot.patient.name, "Sok Dara");
        assert_eq!(snapshot.prescriptions[0].quantity, 14);

        assert_eq!(form.tab(), OpdTab::PatientInfo);
        assert!(form.lines().is_empty());
    }

    #[tokio::test]
    async fn test_submit_maps_422_to_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pod-patients"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "detail": [{"loc": ["body", "telephone"], "msg": "invalid phone number"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut form = filled_form();
        form.go_to(OpdTab::Review).unwrap();

        let err = form.submit(&client).await.unwrap_err();
        assert_eq!(err.status(), Some(422));
        assert_eq!(form.errors().get("telephone").map(String::as_str), Some("invalid phone number"));
        assert_eq!(form.tab(), OpdTab::PatientInfo);
        assert_eq!(form.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_reuses_created_patient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pod-patients"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 8, "name": "Sok Dara"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/patient-histories"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/patient-histories"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 3, "type": "opd", "patient_id": 8})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mut form = filled_form();
        assert!(form.submit(&client).await.is_err());
        assert!(form.view().patient_saved);

        let history = form.submit(&client).await.unwrap();
        assert_eq!(history.patient_id, Some(8));
    }
}
