//! Core data models shared by the import, ingestion and query passes.
//!
//! Enumerations carry stable lowercase identifiers (`as_str` / `parse`) that
//! are what the database stores.

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub purchase_price: Option<f64>,
    pub mortgage_amount: Option<f64>,
    pub construction_year: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Apartment,
    Office,
    Retail,
    Parking,
    Storage,
    Restaurant,
    Workshop,
    Technical,
}

impl UnitType {
    pub const ALL: [UnitType; 8] = [
        UnitType::Apartment,
        UnitType::Office,
        UnitType::Retail,
        UnitType::Parking,
        UnitType::Storage,
        UnitType::Restaurant,
        UnitType::Workshop,
        UnitType::Technical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Apartment => "apartment",
            UnitType::Office => "office",
            UnitType::Retail => "retail",
            UnitType::Parking => "parking",
            UnitType::Storage => "storage",
            UnitType::Restaurant => "restaurant",
            UnitType::Workshop => "workshop",
            UnitType::Technical => "technical",
        }
    }

    /// Accepts the stored identifiers as well as the French labels found in
    /// older exports ("Appartement", "Bureau", "Dépôt", ...).
    pub fn parse(s: &str) -> Option<UnitType> {
        let s = s.trim().to_lowercase();
        let t = match s.as_str() {
            "apartment" | "appartement" | "logement" | "wohnung" => UnitType::Apartment,
            "office" | "bureau" | "büro" => UnitType::Office,
            "retail" | "magasin" | "commerce" | "shop" => UnitType::Retail,
            "parking" | "garage" | "place de parc" => UnitType::Parking,
            "storage" | "dépôt" | "depot" | "cave" | "lager" => UnitType::Storage,
            "restaurant" => UnitType::Restaurant,
            "workshop" | "atelier" => UnitType::Workshop,
            "technical" | "local technique" => UnitType::Technical,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Unit {
    pub id: String,
    pub property_id: String,
    pub unit_number: String,
    pub unit_type: UnitType,
    pub surface_area: Option<f64>,
    pub rooms: Option<f64>,
    pub floor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Terminated,
    Pending,
    Draft,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Terminated => "terminated",
            LeaseStatus::Pending => "pending",
            LeaseStatus::Draft => "draft",
        }
    }

    pub fn parse(s: &str) -> Option<LeaseStatus> {
        match s.trim().to_lowercase().as_str() {
            "active" => Some(LeaseStatus::Active),
            "terminated" => Some(LeaseStatus::Terminated),
            "pending" => Some(LeaseStatus::Pending),
            "draft" => Some(LeaseStatus::Draft),
            _ => None,
        }
    }

    /// Status implied by a lease's dates on `today`. A lease without an end
    /// date is open-ended.
    pub fn from_dates(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> LeaseStatus {
        if matches!(end, Some(e) if e < today) {
            LeaseStatus::Terminated
        } else if matches!(start, Some(s) if s > today) {
            LeaseStatus::Pending
        } else {
            LeaseStatus::Active
        }
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub id: String,
    pub unit_id: String,
    pub tenant_id: String,
    pub rent_net: f64,
    pub charges: f64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: LeaseStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    Lease,
    Insurance,
    Maintenance,
    Incident,
    Dispute,
    Invoice,
    Financial,
    LandRegistry,
    Other,
}

impl DocumentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentCategory::Lease => "lease",
            DocumentCategory::Insurance => "insurance",
            DocumentCategory::Maintenance => "maintenance",
            DocumentCategory::Incident => "incident",
            DocumentCategory::Dispute => "dispute",
            DocumentCategory::Invoice => "invoice",
            DocumentCategory::Financial => "financial",
            DocumentCategory::LandRegistry => "land_registry",
            DocumentCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentCategory> {
        let c = match s.trim().to_lowercase().as_str() {
            "lease" => DocumentCategory::Lease,
            "insurance" => DocumentCategory::Insurance,
            "maintenance" => DocumentCategory::Maintenance,
            "incident" => DocumentCategory::Incident,
            "dispute" => DocumentCategory::Dispute,
            "invoice" => DocumentCategory::Invoice,
            "financial" => DocumentCategory::Financial,
            "land_registry" => DocumentCategory::LandRegistry,
            "other" => DocumentCategory::Other,
            _ => return None,
        };
        Some(c)
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file found by the scanner, before extraction.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the scan root, with `/` separators.
    pub relative_path: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub content_type: String,
}

/// Normalized document stored in SQLite.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_hash: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub category: DocumentCategory,
    pub language: Option<String>,
    pub extraction: String,
    pub body: String,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}
