//! Heuristic classifiers for units, files and languages.
//!
//! Portfolio data comes in French, German and Italian, so every table below
//! lists the terms of all three languages. All functions are pure.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::models::{DocumentCategory, UnitType};

lazy_static! {
    /// Unit type vocabulary, checked in order. The first match wins.
    static ref UNIT_TYPE_PATTERNS: Vec<(UnitType, Regex)> = vec![
        (
            UnitType::Apartment,
            Regex::new(r"(?i)appartement|logement|habitation|wohnung|wohneinheit|appartamento|abitazione").unwrap(),
        ),
        (
            UnitType::Office,
            Regex::new(r"(?i)\bbureau|\bcabinet\b|büro|geschäftsraum|ufficio").unwrap(),
        ),
        (
            UnitType::Retail,
            Regex::new(r"(?i)commerce|commercial|magasin|boutique|arcade|geschäft|laden|verkaufsfläche|commercio|negozio").unwrap(),
        ),
        (
            UnitType::Parking,
            Regex::new(r"(?i)parking|place.*parc|garage|\bpp\b|\bbox\b|parkplatz|stellplatz|parcheggio|posto.*auto").unwrap(),
        ),
        (
            UnitType::Storage,
            Regex::new(r"(?i)\bcave\b|dépôt|\bdepot\b|réduit|keller|lager|abstellraum|cantina|deposito").unwrap(),
        ),
        (
            UnitType::Restaurant,
            Regex::new(r"(?i)restaurant|café|\bbar\b|brasserie|gaststätte|ristorante").unwrap(),
        ),
        (
            UnitType::Workshop,
            Regex::new(r"(?i)atelier|werkstatt|laboratorio|officina").unwrap(),
        ),
    ];

    static ref COMPANY_SUFFIX: Regex =
        Regex::new(r"(?i)\b(sa|s\.a\.|sarl|sàrl|s\.à\.r\.l\.|gmbh|ag)(\s|$)").unwrap();

    static ref UNIT_REFERENCE: Regex = Regex::new(r"(\d{5}\.\d{2}\.\d{6})").unwrap();

    static ref WORD: Regex = Regex::new(r"\p{L}+").unwrap();
}

/// Keyword rules applied to a unit number, in priority order.
const UNIT_NUMBER_RULES: &[(UnitType, &[&str])] = &[
    (UnitType::Parking, &["place", "parking", "garage", "box"]),
    (UnitType::Storage, &["dépôt", "depot", "cave", "lager"]),
    (UnitType::Technical, &["local technique", "concierge"]),
    (UnitType::Retail, &["magasin", "commerce", "laden", "shop"]),
    (UnitType::Office, &["bureau", "büro", "office"]),
];

/// Filename keywords per category, in priority order.
const CATEGORY_RULES: &[(DocumentCategory, &[&str])] = &[
    (
        DocumentCategory::Lease,
        &["bail", "baux", "lease", "mietvertrag"],
    ),
    (
        DocumentCategory::Insurance,
        &["assurance", "police", "insurance", "versicherung"],
    ),
    (
        DocumentCategory::Maintenance,
        &["maintenance", "entretien", "wartung"],
    ),
    (
        DocumentCategory::Incident,
        &["sinistre", "incident", "schaden"],
    ),
    (DocumentCategory::Dispute, &["litige", "dispute", "streit"]),
    (
        DocumentCategory::Invoice,
        &["facture", "invoice", "rechnung"],
    ),
    (
        DocumentCategory::Financial,
        &["financier", "compte", "resultat", "résultat", "bilan", "finanz"],
    ),
    (
        DocumentCategory::LandRegistry,
        &["registre foncier", "registre_foncier", "servitude", "grundbuch"],
    ),
];

/// Detects a unit type from free text. Returns `None` when no vocabulary
/// term appears.
pub fn detect_unit_type(text: &str) -> Option<UnitType> {
    UNIT_TYPE_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(t, _)| *t)
}

/// Infers the type of a unit from its number, its tenant and its size.
///
/// Rules, first hit wins:
/// 1. keywords in the unit number (parking, storage, technical, retail, office);
/// 2. any other type vocabulary in the unit number (restaurant, workshop, ...);
/// 3. a company tenant (SA, Sàrl, GmbH, AG) is an office above 100 m², retail
///    below;
/// 4. a unit with an explicit zero surface and zero rooms is a parking space;
/// 5. otherwise an apartment.
pub fn classify_unit(
    unit_number: &str,
    tenant_name: Option<&str>,
    surface_area: Option<f64>,
    rooms: Option<f64>,
) -> UnitType {
    let number = unit_number.to_lowercase();

    for (unit_type, keywords) in UNIT_NUMBER_RULES {
        if keywords.iter().any(|k| number.contains(k)) {
            return *unit_type;
        }
    }

    if let Some(t) = detect_unit_type(unit_number) {
        return t;
    }

    if let Some(tenant) = tenant_name {
        if COMPANY_SUFFIX.is_match(tenant.trim()) {
            match surface_area {
                Some(s) if s > 100.0 => return UnitType::Office,
                Some(s) if s > 0.0 => return UnitType::Retail,
                _ => {}
            }
        }
    }

    if surface_area == Some(0.0) && rooms == Some(0.0) {
        return UnitType::Parking;
    }

    UnitType::Apartment
}

/// Categorizes a document by keywords in its file name.
pub fn categorize_file(name: &str) -> DocumentCategory {
    let name = name.to_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| name.contains(k)))
        .map(|(c, _)| *c)
        .unwrap_or(DocumentCategory::Other)
}

/// Extracts a land-registry style unit reference (`NNNNN.NN.NNNNNN`).
pub fn extract_unit_reference(name: &str) -> Option<String> {
    UNIT_REFERENCE
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    French,
    German,
    Italian,
    Unknown,
}

impl Language {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Language::French => Some("fr"),
            Language::German => Some("de"),
            Language::Italian => Some("it"),
            Language::Unknown => None,
        }
    }
}

const FRENCH_WORDS: &[&str] = &[
    "le", "la", "les", "des", "du", "et", "est", "une", "pour", "avec", "dans", "loyer",
    "locataire", "bailleur",
];
const GERMAN_WORDS: &[&str] = &[
    "der", "die", "das", "und", "ist", "mit", "für", "nicht", "ein", "eine", "miete", "mieter",
    "vermieter",
];
const ITALIAN_WORDS: &[&str] = &[
    "il", "lo", "gli", "della", "che", "è", "per", "con", "una", "affitto", "inquilino",
    "locatore",
];

/// Guesses the language of a text by counting common function words.
/// Ties resolve to French, then German.
pub fn detect_language(text: &str) -> Language {
    let mut counts = [0usize; 3];
    for word in WORD.find_iter(text) {
        let w = word.as_str().to_lowercase();
        let w = w.as_str();
        if FRENCH_WORDS.contains(&w) {
            counts[0] += 1;
        }
        if GERMAN_WORDS.contains(&w) {
            counts[1] += 1;
        }
        if ITALIAN_WORDS.contains(&w) {
            counts[2] += 1;
        }
    }

    let langs = [Language::French, Language::German, Language::Italian];
    let mut best = Language::Unknown;
    let mut best_count = 0;
    for (lang, count) in langs.iter().zip(counts) {
        if count > best_count {
            best = *lang;
            best_count = count;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_unit_type_in_three_languages() {
        assert_eq!(
            detect_unit_type("Appartement 3.5 pièces"),
            Some(UnitType::Apartment)
        );
        assert_eq!(detect_unit_type("Büro 2. OG"), Some(UnitType::Office));
        assert_eq!(
            detect_unit_type("Posto auto coperto"),
            Some(UnitType::Parking)
        );
        assert_eq!(detect_unit_type("Keller Nr. 4"), Some(UnitType::Storage));
        assert_eq!(
            detect_unit_type("Ristorante al piano terra"),
            Some(UnitType::Restaurant)
        );
        assert_eq!(detect_unit_type("Atelier"), Some(UnitType::Workshop));
        assert_eq!(detect_unit_type("Lot 12"), None);
    }

    #[test]
    fn detection_follows_table_order() {
        // "appartement" is listed before "garage"
        assert_eq!(
            detect_unit_type("appartement avec garage"),
            Some(UnitType::Apartment)
        );
    }

    #[test]
    fn classify_by_unit_number_keywords() {
        assert_eq!(
            classify_unit("Place de parc 12", None, None, None),
            UnitType::Parking
        );
        assert_eq!(classify_unit("Dépôt 2", None, None, None), UnitType::Storage);
        assert_eq!(
            classify_unit("Local technique", None, None, None),
            UnitType::Technical
        );
        assert_eq!(classify_unit("Magasin RDC", None, None, None), UnitType::Retail);
        assert_eq!(classify_unit("Bureau 3", None, None, None), UnitType::Office);
        assert_eq!(
            classify_unit("Restaurant", None, None, None),
            UnitType::Restaurant
        );
    }

    #[test]
    fn company_tenants_by_surface() {
        assert_eq!(
            classify_unit("1.01", Some("Fiduciaire Alpes SA"), Some(140.0), Some(5.0)),
            UnitType::Office
        );
        assert_eq!(
            classify_unit("1.02", Some("Boulangerie Rey Sàrl"), Some(60.0), Some(1.0)),
            UnitType::Retail
        );
        assert_eq!(
            classify_unit("1.03", Some("Muster GmbH"), None, None),
            UnitType::Apartment
        );
        // a surname starting with "Sa" is not a company
        assert_eq!(
            classify_unit("1.04", Some("Jean Sauvage"), Some(140.0), Some(4.0)),
            UnitType::Apartment
        );
    }

    #[test]
    fn zero_surface_and_rooms_is_parking() {
        assert_eq!(
            classify_unit("17", Some("Marc Dubois"), Some(0.0), Some(0.0)),
            UnitType::Parking
        );
        assert_eq!(classify_unit("17", None, None, None), UnitType::Apartment);
    }

    #[test]
    fn categorizes_file_names() {
        assert_eq!(
            categorize_file("Bail_Dupont_2021.pdf"),
            DocumentCategory::Lease
        );
        assert_eq!(
            categorize_file("Police assurance bâtiment.pdf"),
            DocumentCategory::Insurance
        );
        assert_eq!(
            categorize_file("contrat_entretien_ascenseur.pdf"),
            DocumentCategory::Maintenance
        );
        assert_eq!(
            categorize_file("Sinistre dégât d'eau.docx"),
            DocumentCategory::Incident
        );
        assert_eq!(categorize_file("Litige Rossi.pdf"), DocumentCategory::Dispute);
        assert_eq!(
            categorize_file("Facture 2023-114.pdf"),
            DocumentCategory::Invoice
        );
        assert_eq!(
            categorize_file("Compte de résultat 2023.xlsx"),
            DocumentCategory::Financial
        );
        assert_eq!(
            categorize_file("Extrait registre foncier.pdf"),
            DocumentCategory::LandRegistry
        );
        assert_eq!(categorize_file("photo.pdf"), DocumentCategory::Other);
    }

    #[test]
    fn extracts_unit_reference() {
        assert_eq!(
            extract_unit_reference("Bail 60530.01.000214 Dupont.pdf").as_deref(),
            Some("60530.01.000214")
        );
        assert_eq!(extract_unit_reference("Bail 6053.01.0002.pdf"), None);
    }

    #[test]
    fn detects_language() {
        assert_eq!(
            detect_language("Le locataire paie le loyer pour la période et les charges"),
            Language::French
        );
        assert_eq!(
            detect_language("Der Mieter zahlt die Miete und die Nebenkosten"),
            Language::German
        );
        assert_eq!(
            detect_language("Il locatore e l'inquilino della casa con affitto"),
            Language::Italian
        );
        assert_eq!(detect_language("12345 67890"), Language::Unknown);
        assert_eq!(Language::German.code(), Some("de"));
    }
}
