//! Deal records and filtered lookup.
//!
//! The search tool reads through [`DealRepository::search`]; inserts exist
//! for seeding and tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use dealchat_core::error::DealchatError;

use crate::db::Database;
use crate::repository::millis_to_datetime;

/// A company deal with optional financial metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    pub title: String,
    pub ebitda: Option<f64>,
    pub revenue: Option<f64>,
    pub company_location: Option<String>,
    pub ebitda_margin: Option<f64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Filter for [`DealRepository::search`]. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DealFilter {
    pub id: Option<String>,
    /// Case-insensitive substring of the title.
    pub title: Option<String>,
    pub min_ebitda: Option<f64>,
    pub max_ebitda: Option<f64>,
    pub min_revenue: Option<f64>,
    pub max_revenue: Option<f64>,
    /// Overrides the revenue range when set.
    pub exact_revenue: Option<f64>,
    /// Case-insensitive substring of the location.
    pub company_location: Option<String>,
    pub min_ebitda_margin: Option<f64>,
    pub max_ebitda_margin: Option<f64>,
    pub limit: usize,
}

/// Repository for deals.
pub struct DealRepository {
    db: Arc<Database>,
}

impl DealRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, deal: &Deal) -> Result<(), DealchatError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deals (id, title, ebitda, revenue, company_location, ebitda_margin, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    deal.id,
                    deal.title,
                    deal.ebitda,
                    deal.revenue,
                    deal.company_location,
                    deal.ebitda_margin,
                    deal.created_at.timestamp_millis(),
                ],
            )
            .map_err(|e| DealchatError::Storage(format!("Failed to save deal: {}", e)))?;
            Ok(())
        })
    }

    /// Deals matching every set field of `filter`, highest EBITDA first.
    pub fn search(&self, filter: &DealFilter) -> Result<Vec<Deal>, DealchatError> {
        let (clause, mut values) = build_where(filter);
        let sql = format!(
            "SELECT id, title, ebitda, revenue, company_location, ebitda_margin, created_at
             FROM deals{}
             ORDER BY ebitda DESC, created_at DESC
             LIMIT ?",
            clause
        );
        values.push(Value::Integer(filter.limit as i64));

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| DealchatError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    Ok(Deal {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        ebitda: row.get(2)?,
                        revenue: row.get(3)?,
                        company_location: row.get(4)?,
                        ebitda_margin: row.get(5)?,
                        created_at: millis_to_datetime(row.get(6)?),
                    })
                })
                .map_err(|e| DealchatError::Storage(e.to_string()))?;

            let mut deals = Vec::new();
            for row in rows {
                deals.push(row.map_err(|e| DealchatError::Storage(e.to_string()))?);
            }
            Ok(deals)
        })
    }
}

fn build_where(filter: &DealFilter) -> (String, Vec<Value>) {
    let mut conditions: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(id) = &filter.id {
        conditions.push("id = ?");
        values.push(Value::Text(id.clone()));
    }
    if let Some(title) = &filter.title {
        conditions.push("instr(fold_case(title), ?) > 0");
        values.push(Value::Text(title.to_lowercase()));
    }
    if let Some(min) = filter.min_ebitda {
        conditions.push("ebitda >= ?");
        values.push(Value::Real(min));
    }
    if let Some(max) = filter.max_ebitda {
        conditions.push("ebitda <= ?");
        values.push(Value::Real(max));
    }
    if let Some(exact) = filter.exact_revenue {
        conditions.push("revenue = ?");
        values.push(Value::Real(exact));
    } else {
        if let Some(min) = filter.min_revenue {
            conditions.push("revenue >= ?");
            values.push(Value::Real(min));
        }
        if let Some(max) = filter.max_revenue {
            conditions.push("revenue <= ?");
            values.push(Value::Real(max));
        }
    }
    if let Some(location) = &filter.company_location {
        conditions.push("instr(fold_case(company_location), ?) > 0");
        values.push(Value::Text(location.to_lowercase()));
    }
    if let Some(min) = filter.min_ebitda_margin {
        conditions.push("ebitda_margin >= ?");
        values.push(Value::Real(min));
    }
    if let Some(max) = filter.max_ebitda_margin {
        conditions.push("ebitda_margin <= ?");
        values.push(Value::Real(max));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}
