//! Printable prescription for an OPD visit
//!
//! A4, builtin Helvetica. The medication table continues onto as many pages
//! as it needs, repeating its header row on each one.

use std::io::BufWriter;

use chrono::{Local, NaiveDate};
use printpdf::{
    BuiltinFont, IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference, Point,
};

use crate::error::{AppError, AppResult};
use crate::models::{date_part, OpdSnapshot, PatientHistory, PrescriptionItem};

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const LEFT: f32 = 15.0;
const RIGHT: f32 = PAGE_WIDTH - 15.0;
const TOP: f32 = PAGE_HEIGHT - 18.0;
/// Lowest baseline a table row may use; below is the footer
const BOTTOM: f32 = 28.0;
const ROW: f32 = 6.5;

/// Table column x positions: #, drug, dosage, days, qty, meal, price
const COLUMNS: [(&str, f32); 7] = [
    ("#", LEFT),
    ("Medication", LEFT + 8.0),
    ("Dosage (M-A-E-N)", 82.0),
    ("Days", 114.0),
    ("Qty", 127.0),
    ("Meal", 140.0),
    ("Price", 178.0),
];

#[derive(Debug, Clone)]
pub struct PrescriptionPdf {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub pages: u32,
}

/// Lowercase ASCII name with every run of other characters collapsed to `-`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "patient".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn pdf_filename(patient_name: &str, date: NaiveDate) -> String {
    format!("prescription-{}-{}.pdf", sanitize_name(patient_name), date.format("%Y-%m-%d"))
}

/// Builtin fonts only cover ASCII reliably.
fn printable(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Cell texts of one medication row, in column order.
fn row_cells(index: usize, item: &PrescriptionItem) -> [String; 7] {
    [
        (index + 1).to_string(),
        truncate(&item.drug_name, 30),
        item.dosage.label(),
        item.period_days.to_string(),
        item.quantity.to_string(),
        item.meal_label().to_string(),
        format!("{:.2}", item.price),
    ]
}

fn pdf_err(context: &str) -> impl Fn(printpdf::Error) -> AppError + '_ {
    move |e| AppError::Pdf(format!("{}: {}", context, e))
}

struct Writer {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    y: f32,
    pages: u32,
    footer: String,
}

impl Writer {
    fn new(title: &str, footer: String) -> AppResult<Self> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        let layer = doc.get_page(page).get_layer(layer);
        let regular = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(pdf_err("font"))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(pdf_err("font"))?;
        Ok(Self {
            doc,
            layer,
            regular,
            bold,
            y: TOP,
            pages: 1,
            footer,
        })
    }

    fn text(&self, text: &str, size: f32, x: f32, bold: bool) {
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.use_text(printable(text), size, Mm(x), Mm(self.y), font);
    }

    fn rule(&self, y: f32, thickness: f32) {
        self.layer.set_outline_thickness(thickness);
        self.layer.add_line(Line {
            points: vec![
                (Point::new(Mm(LEFT), Mm(y)), false),
                (Point::new(Mm(RIGHT), Mm(y)), false),
            ],
            is_closed: false,
        });
    }

    fn down(&mut self, by: f32) {
        self.y -= by;
    }

    fn draw_footer(&self) {
        let y = 14.0;
        self.rule(y + 5.0, 0.5);
        let font = &self.regular;
        self.layer
            .use_text(printable(&self.footer), 8.0, Mm(LEFT), Mm(y), font);
        self.layer
            .use_text(format!("Page {}", self.pages), 8.0, Mm(RIGHT - 14.0), Mm(y), font);
    }

    fn new_page(&mut self) {
        self.draw_footer();
        let (page, layer) = self.doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.pages += 1;
        self.y = TOP;
    }

    fn table_header(&mut self) {
        for (title, x) in COLUMNS {
            self.text(title, 9.0, x, true);
        }
        self.rule(self.y - 2.0, 0.8);
        self.down(ROW + 1.0);
    }

    /// Starts a new page when fewer than `rows` rows fit; returns whether it did.
    fn ensure_rows(&mut self, rows: f32) -> bool {
        if self.y - rows * ROW < BOTTOM {
            self.new_page();
            true
        } else {
            false
        }
    }

    fn finish(self) -> AppResult<(Vec<u8>, u32)> {
        self.draw_footer();
        let pages = self.pages;
        let mut buf = BufWriter::new(Vec::new());
        self.doc.save(&mut buf).map_err(pdf_err("save"))?;
        let bytes = buf
            .into_inner()
            .map_err(|e| AppError::Pdf(format!("buffer: {}", e)))?;
        Ok((bytes, pages))
    }
}

/// Renders the prescription for a stored visit.
pub fn render_history(history: &PatientHistory, clinic_name: &str) -> AppResult<PrescriptionPdf> {
    let snapshot = history.snapshot()?;
    let date = snapshot
        .visit_date
        .as_deref()
        .and_then(date_part)
        .or_else(|| history.created_date())
        .unwrap_or_else(|| Local::now().date_naive());
    render_snapshot(&snapshot, date, clinic_name)
}

pub fn render_snapshot(snapshot: &OpdSnapshot, date: NaiveDate, clinic_name: &str) -> AppResult<PrescriptionPdf> {
    let patient = &snapshot.patient;
    let footer = format!(
        "{} - printed {}",
        clinic_name,
        Local::now().format("%Y-%m-%d %H:%M")
    );
    let mut w = Writer::new(&format!("Prescription - {}", patient.name), footer)?;

    // Header
    w.text(clinic_name, 16.0, LEFT, true);
    w.down(7.0);
    w.text("Outpatient Prescription", 11.0, LEFT, false);
    w.text(&format!("Date: {}", date.format("%d %b %Y")), 10.0, 150.0, false);
    w.down(4.0);
    w.rule(w.y, 1.0);
    w.down(8.0);

    // Patient
    let gender = patient.gender.map(|g| g.label()).unwrap_or("-");
    let age = patient.age.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
    w.text("Patient:", 10.0, LEFT, true);
    w.text(&patient.name, 10.0, LEFT + 18.0, false);
    w.text("Gender:", 10.0, 110.0, true);
    w.text(gender, 10.0, 126.0, false);
    w.text("Age:", 10.0, 150.0, true);
    w.text(&age, 10.0, 160.0, false);
    w.down(ROW);

    let details = [
        ("Telephone:", patient.telephone.clone()),
        ("Address:", patient.address.clone()),
        ("Vitals:", Some(patient.vitals.summary()).filter(|s| !s.is_empty())),
        ("Symptoms:", patient.symptom.clone()),
        ("Diagnosis:", patient.diagnosis.clone()),
    ];
    for (label, value) in details {
        let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        for (i, line) in wrap_text(&value, 85).iter().enumerate() {
            w.ensure_rows(1.0);
            if i == 0 {
                w.text(label, 10.0, LEFT, true);
            }
            w.text(line, 10.0, LEFT + 22.0, false);
            w.down(5.0);
        }
        w.down(1.0);
    }
    w.down(5.0);

    // Medication table
    w.ensure_rows(3.0);
    w.table_header();
    if snapshot.prescriptions.is_empty() {
        w.text("No medication prescribed", 9.0, COLUMNS[1].1, false);
        w.down(ROW);
    }
    for (index, item) in snapshot.prescriptions.iter().enumerate() {
        if w.ensure_rows(1.0) {
            w.table_header();
        }
        for ((_, x), cell) in COLUMNS.iter().zip(row_cells(index, item)) {
            w.text(&cell, 9.0, *x, false);
        }
        w.down(ROW);
    }

    // Total
    w.ensure_rows(2.0);
    w.rule(w.y + ROW - 2.0, 0.8);
    w.down(1.0);
    w.text("Total", 10.0, COLUMNS[5].1, true);
    w.text(&format!("{:.2}", snapshot.grand_total()), 10.0, COLUMNS[6].1, true);
    w.down(ROW * 2.0);

    if w.ensure_rows(3.0) {
        w.down(ROW);
    }
    w.text("Doctor's signature: ____________________", 10.0, 115.0, false);

    let (bytes, pages) = w.finish()?;
    log::debug!(
        "[pdf] rendered {} lines on {} page(s) for {}",
        snapshot.prescriptions.len(),
        pages,
        patient.name
    );
    Ok(PrescriptionPdf {
        filename: pdf_filename(&patient.name, date),
        bytes,
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dosage, Gender, PodPatient};
    use serde_json::json;

    fn snapshot(lines: usize) -> OpdSnapshot {
        OpdSnapshot {
            patient: PodPatient {
                name: "Chan Sophea".into(),
                gender: Some(Gender::Female),
                age: Some(34),
                diagnosis: Some("Acute pharyngitis".into()),
                ..Default::default()
            },
            prescriptions: (0..lines)
                .map(|i| PrescriptionItem {
                    drug_name: format!("Drug {}", i + 1),
                    dosage: Dosage::new(1.0, 0.0, 1.0, 0.0),
                    period_days: 5,
                    quantity: 10,
                    unit_price: 0.2,
                    price: 2.0,
                    after_meal: true,
                    ..Default::default()
                })
                .collect(),
            total: None,
            visit_date: Some("2024-03-09".into()),
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Chan Sophea"), "chan-sophea");
        assert_eq!(sanitize_name("  O'Brien,  Mary-Jane "), "o-brien-mary-jane");
        assert_eq!(sanitize_name("***"), "patient");
        assert_eq!(sanitize_name(""), "patient");
        assert_eq!(
            pdf_filename("Sok Dara", NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()),
            "prescription-sok-dara-2024-01-05.pdf"
        );
    }

    #[test]
    fn test_render_is_pdf() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let pdf = render_snapshot(&snapshot(3), date, "OPD Clinic").unwrap();
        assert!(pdf.bytes.starts_with(b"%PDF"));
        assert_eq!(pdf.pages, 1);
        assert_eq!(pdf.filename, "prescription-chan-sophea-2024-03-09.pdf");
    }

    #[test]
    fn test_long_table_spans_pages() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let pdf = render_snapshot(&snapshot(80), date, "OPD Clinic").unwrap();
        assert!(pdf.pages >= 3);

        let empty = render_snapshot(&snapshot(0), date, "OPD Clinic").unwrap();
        assert_eq!(empty.pages, 1);
    }

    #[test]
    fn test_long_details_continue_on_next_page() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let mut long = snapshot(1);
        // roughly 200 wrapped lines, four pages of details alone
        long.patient.address = Some("Street ".repeat(2500));
        let pdf = render_snapshot(&long, date, "OPD Clinic").unwrap();
        assert!(pdf.pages >= 4);
    }

    #[test]
    fn test_legacy_history_renders_same_rows() {
        let current = PatientHistory {
            id: 1,
            kind: "opd".into(),
            json_data: json!({
                "patient": {"name": "Chan Sophea"},
                "prescriptions": [{"drug_name": "Amoxicillin", "quantity": 14, "period_days": 7, "price": 3.5}],
                "visit_date": "2024-03-09"
            }),
            ..Default::default()
        };
        let legacy = PatientHistory {
            id: 2,
            kind: "opd".into(),
            json_data: json!(json!({
                "patient_info": {"name": "Chan Sophea"},
                "prescription": {"items": [{"drug_name": "Amoxicillin", "quantity": 14, "period_days": 7, "price": 3.5}]}
            })
            .to_string()),
            created_at: Some("2024-03-09T10:30:00".into()),
            ..Default::default()
        };

        let a = current.snapshot().unwrap();
        let b = legacy.snapshot().unwrap();
        let rows_a: Vec<_> = a.prescriptions.iter().enumerate().map(|(i, p)| row_cells(i, p)).collect();
        let rows_b: Vec<_> = b.prescriptions.iter().enumerate().map(|(i, p)| row_cells(i, p)).collect();
        assert_eq!(rows_a, rows_b);

        let pdf_a = render_history(&current, "OPD Clinic").unwrap();
        let pdf_b = render_history(&legacy, "OPD Clinic").unwrap();
        assert_eq!(pdf_a.filename, pdf_b.filename);
    }

    #[test]
    fn test_history_without_data_fails() {
        let history = PatientHistory {
            id: 5,
            ..Default::default()
        };
        assert!(matches!(render_history(&history, "x"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_text_helpers() {
        assert_eq!(printable("Sok\u{17A0}"), "Sok?");
        assert_eq!(truncate("Paracetamol 500mg tablets", 12), "Paracetam...");
        assert_eq!(wrap_text("a bb ccc dddd", 6), vec!["a bb", "ccc", "dddd"]);
    }
}
