//! Per-screen filter state
//!
//! `Default` is the reset state: every enum filter on "all", every text and
//! date filter empty. Only non-default values are sent to the backend.

use std::fmt::Display;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::HISTORY_TYPE_OPD;

pub trait ListFilter:
    Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn query_pairs(&self) -> Vec<(String, String)>;

    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose<T> {
    Value(T),
    Text(String),
}

/// Reads an optional value that a form may send as an empty string.
///
/// Query strings carry every value as text, so non-string types are parsed
/// with `FromStr`; blank text means "not set".
pub fn blank_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Option::<Loose<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Loose::Value(value)) => Ok(Some(value)),
        Some(Loose::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                Ok(None)
            } else {
                text.parse().map(Some).map_err(de::Error::custom)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    #[serde(alias = "")]
    All,
    Active,
    Inactive,
}

impl StatusFilter {
    fn param(&self) -> Option<&'static str> {
        match self {
            StatusFilter::All => None,
            StatusFilter::Active => Some("active"),
            StatusFilter::Inactive => Some("inactive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryFilter {
    #[default]
    #[serde(alias = "")]
    All,
    Expired,
    ExpiringSoon,
    Valid,
}

impl ExpiryFilter {
    fn param(&self) -> Option<&'static str> {
        match self {
            ExpiryFilter::All => None,
            ExpiryFilter::Expired => Some("expired"),
            ExpiryFilter::ExpiringSoon => Some("expiring_soon"),
            ExpiryFilter::Valid => Some("valid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderFilter {
    #[default]
    #[serde(alias = "")]
    All,
    Male,
    Female,
    Other,
}

impl GenderFilter {
    fn param(&self) -> Option<&'static str> {
        match self {
            GenderFilter::All => None,
            GenderFilter::Male => Some("male"),
            GenderFilter::Female => Some("female"),
            GenderFilter::Other => Some("other"),
        }
    }
}

fn push_search(pairs: &mut Vec<(String, String)>, search: &str) {
    let search = search.trim();
    if !search.is_empty() {
        pairs.push(("search".to_string(), search.to_string()));
    }
}

fn push_date(pairs: &mut Vec<(String, String)>, date: Option<NaiveDate>) {
    if let Some(date) = date {
        pairs.push(("date".to_string(), date.format("%Y-%m-%d").to_string()));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrugFilter {
    pub search: String,
    pub status: StatusFilter,
    #[serde(deserialize_with = "blank_as_none")]
    pub company_id: Option<i64>,
    pub expiry: ExpiryFilter,
}

impl ListFilter for DrugFilter {
    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        push_search(&mut pairs, &self.search);
        if let Some(status) = self.status.param() {
            pairs.push(("status".to_string(), status.to_string()));
        }
        if let Some(company_id) = self.company_id {
            pairs.push(("company_id".to_string(), company_id.to_string()));
        }
        if let Some(expiry) = self.expiry.param() {
            pairs.push(("expiry".to_string(), expiry.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyFilter {
    pub search: String,
    pub status: StatusFilter,
}

impl ListFilter for CompanyFilter {
    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        push_search(&mut pairs, &self.search);
        if let Some(status) = self.status.param() {
            pairs.push(("status".to_string(), status.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientFilter {
    pub search: String,
    pub gender: GenderFilter,
    /// Registration date
    #[serde(deserialize_with = "blank_as_none")]
    pub date: Option<NaiveDate>,
}

impl ListFilter for PatientFilter {
    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        push_search(&mut pairs, &self.search);
        if let Some(gender) = self.gender.param() {
            pairs.push(("gender".to_string(), gender.to_string()));
        }
        push_date(&mut pairs, self.date);
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryFilter {
    pub search: String,
    #[serde(deserialize_with = "blank_as_none")]
    pub date: Option<NaiveDate>,
}

impl ListFilter for HistoryFilter {
    fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("type".to_string(), HISTORY_TYPE_OPD.to_string())];
        push_search(&mut pairs, &self.search);
        push_date(&mut pairs, self.date);
        pairs
    }
}
