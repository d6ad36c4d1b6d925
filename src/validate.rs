//! Record validation before anything is written by the importers.
//!
//! Optional fields validate when absent. Record validators collect every
//! problem instead of stopping at the first one so a rejected rent-roll row
//! can be reported in full.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::models::{Lease, Tenant, Unit};

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap();
    static ref SWISS_PHONE: Regex = Regex::new(r"^(\+41|0041|0)[0-9]{9}$").unwrap();
}

pub const LEASE_STATUSES: &[&str] = &["active", "terminated", "pending", "draft"];
pub const MAINTENANCE_STATUSES: &[&str] = &["active", "to_terminate", "terminated"];
pub const SERVITUDE_STATUSES: &[&str] = &["active", "cancelled", "expired"];
pub const DISPUTE_STATUSES: &[&str] = &["open", "in_progress", "resolved", "closed", "pending"];
pub const INCIDENT_STATUSES: &[&str] = &[
    "reported",
    "investigating",
    "resolved",
    "closed",
    "insurance_claim",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("invalid email format: {0}")]
    InvalidEmail(String),
    #[error("invalid Swiss phone format: {0}")]
    InvalidPhone(String),
    #[error("{field} must be non-negative (got {value})")]
    Negative { field: &'static str, value: f64 },
    #[error("{0} must be a finite number")]
    NotANumber(&'static str),
    #[error("end date {end} is before start date {start}")]
    DateRange { start: NaiveDate, end: NaiveDate },
    #[error("invalid status '{status}', must be one of: {allowed}")]
    InvalidStatus { status: String, allowed: String },
}

pub fn validate_email(email: Option<&str>) -> Result<(), ValidationError> {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(e) if !EMAIL.is_match(e) => Err(ValidationError::InvalidEmail(e.to_string())),
        _ => Ok(()),
    }
}

/// Accepts `+41`, `0041` and `0` prefixed numbers with nine digits after the
/// prefix; spaces, dashes and dots are ignored.
pub fn validate_phone(phone: Option<&str>) -> Result<(), ValidationError> {
    let Some(raw) = phone.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(());
    };
    let compact: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.'))
        .collect();
    if SWISS_PHONE.is_match(&compact) {
        Ok(())
    } else {
        Err(ValidationError::InvalidPhone(raw.to_string()))
    }
}

pub fn validate_non_negative(value: Option<f64>, field: &'static str) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() => Err(ValidationError::NotANumber(field)),
        Some(v) if v < 0.0 => Err(ValidationError::Negative { field, value: v }),
        _ => Ok(()),
    }
}

/// An end date equal to the start date is accepted.
pub fn validate_date_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<(), ValidationError> {
    match (start, end) {
        (Some(s), Some(e)) if e < s => Err(ValidationError::DateRange { start: s, end: e }),
        _ => Ok(()),
    }
}

/// Case-insensitive membership in `allowed`.
pub fn validate_status(status: Option<&str>, allowed: &[&str]) -> Result<(), ValidationError> {
    let Some(s) = status.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(s)) {
        Ok(())
    } else {
        Err(ValidationError::InvalidStatus {
            status: s.to_string(),
            allowed: allowed.join(", "),
        })
    }
}

fn collect(checks: Vec<Result<(), ValidationError>>) -> Result<(), Vec<ValidationError>> {
    let errors: Vec<ValidationError> = checks.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn non_empty(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::Empty(field))
    } else {
        Ok(())
    }
}

pub fn validate_tenant(tenant: &Tenant) -> Result<(), Vec<ValidationError>> {
    collect(vec![
        non_empty(&tenant.name, "name"),
        validate_email(tenant.email.as_deref()),
        validate_phone(tenant.phone.as_deref()),
    ])
}

pub fn validate_unit(unit: &Unit) -> Result<(), Vec<ValidationError>> {
    collect(vec![
        non_empty(&unit.unit_number, "unit_number"),
        validate_non_negative(unit.surface_area, "surface_area"),
        validate_non_negative(unit.rooms, "rooms"),
    ])
}

pub fn validate_lease(lease: &Lease) -> Result<(), Vec<ValidationError>> {
    collect(vec![
        validate_non_negative(Some(lease.rent_net), "rent_net"),
        validate_non_negative(Some(lease.charges), "charges"),
        validate_date_range(lease.start_date, lease.end_date),
        validate_status(Some(lease.status.as_str()), LEASE_STATUSES),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LeaseStatus, UnitType};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn emails() {
        assert!(validate_email(None).is_ok());
        assert!(validate_email(Some("  ")).is_ok());
        assert!(validate_email(Some("marie.dupont@bluewin.ch")).is_ok());
        assert!(validate_email(Some("marie.dupont@bluewin")).is_err());
        assert!(validate_email(Some("nan")).is_err());
    }

    #[test]
    fn swiss_phones() {
        assert!(validate_phone(Some("+41 27 722 11 22")).is_ok());
        assert!(validate_phone(Some("0041 79-123-45-67")).is_ok());
        assert!(validate_phone(Some("027.722.11.22")).is_ok());
        assert!(validate_phone(Some("+33 1 23 45 67 89")).is_err());
        assert!(validate_phone(Some("027 722 11")).is_err());
        assert!(validate_phone(None).is_ok());
    }

    #[test]
    fn numbers_and_dates() {
        assert!(validate_non_negative(Some(0.0), "rent_net").is_ok());
        assert_eq!(
            validate_non_negative(Some(-1.5), "rent_net"),
            Err(ValidationError::Negative {
                field: "rent_net",
                value: -1.5
            })
        );
        assert!(validate_non_negative(Some(f64::NAN), "rooms").is_err());
        assert!(validate_date_range(Some(date(2024, 1, 1)), Some(date(2024, 1, 1))).is_ok());
        assert!(validate_date_range(Some(date(2024, 2, 1)), Some(date(2024, 1, 1))).is_err());
        assert!(validate_date_range(None, Some(date(2024, 1, 1))).is_ok());
    }

    #[test]
    fn statuses() {
        assert!(validate_status(Some("Active"), LEASE_STATUSES).is_ok());
        assert!(validate_status(None, LEASE_STATUSES).is_ok());
        let err = validate_status(Some("archived"), DISPUTE_STATUSES).unwrap_err();
        assert!(err.to_string().contains("in_progress"));
        assert!(validate_status(Some("insurance_claim"), INCIDENT_STATUSES).is_ok());
    }

    #[test]
    fn record_validators_collect_all_errors() {
        let tenant = Tenant {
            id: String::new(),
            name: " ".to_string(),
            email: Some("bad".to_string()),
            phone: Some("123".to_string()),
        };
        assert_eq!(validate_tenant(&tenant).unwrap_err().len(), 3);

        let unit = Unit {
            id: String::new(),
            property_id: String::new(),
            unit_number: "3.2".to_string(),
            unit_type: UnitType::Apartment,
            surface_area: Some(-10.0),
            rooms: Some(3.5),
            floor: None,
        };
        assert_eq!(validate_unit(&unit).unwrap_err().len(), 1);

        let lease = Lease {
            id: String::new(),
            unit_id: String::new(),
            tenant_id: String::new(),
            rent_net: 1500.0,
            charges: 180.0,
            start_date: Some(date(2023, 4, 1)),
            end_date: Some(date(2028, 3, 31)),
            status: LeaseStatus::Active,
        };
        assert!(validate_lease(&lease).is_ok());
    }
}
