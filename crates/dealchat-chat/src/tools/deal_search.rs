//! Deal search tool.
//!
//! Read-only filtered lookup over the deals table. Numeric fields are
//! rendered for humans (`$1,234,567`, `12.5%`, `N/A` when missing).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dealchat_core::config::ToolsConfig;
use dealchat_storage::{Deal, DealFilter, DealRepository};

use crate::error::ChatError;
use crate::tools::{Tool, ToolInput, ToolOutput, ToolSpec};

pub const DEAL_SEARCH_TOOL: &str = "databaseQueryTool";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DealSearchInput {
    id: Option<String>,
    title: Option<String>,
    min_ebitda: Option<f64>,
    max_ebitda: Option<f64>,
    min_revenue: Option<f64>,
    max_revenue: Option<f64>,
    exact_revenue: Option<f64>,
    company_location: Option<String>,
    min_ebitda_margin: Option<f64>,
    max_ebitda_margin: Option<f64>,
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DealView {
    id: String,
    title: String,
    ebitda: String,
    revenue: String,
    company_location: String,
    ebitda_margin: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Deal> for DealView {
    fn from(deal: Deal) -> Self {
        Self {
            id: deal.id,
            title: deal.title,
            ebitda: deal.ebitda.map(format_currency).unwrap_or_else(na),
            revenue: deal.revenue.map(format_currency).unwrap_or_else(na),
            company_location: deal.company_location.unwrap_or_else(na),
            ebitda_margin: deal.ebitda_margin.map(format_percent).unwrap_or_else(na),
            created_at: deal.created_at,
        }
    }
}

fn na() -> String {
    "N/A".to_string()
}

/// Searches deals by id, title, EBITDA, revenue, location and margin.
pub struct DealSearchTool {
    deals: Arc<DealRepository>,
    default_results: usize,
    max_results: usize,
}

impl DealSearchTool {
    pub fn new(deals: Arc<DealRepository>, config: &ToolsConfig) -> Self {
        Self {
            deals,
            default_results: config.default_results,
            max_results: config.max_results,
        }
    }

    fn parse(&self, input: &ToolInput) -> Result<DealFilter, ChatError> {
        let value = serde_json::to_value(input)
            .map_err(|e| ChatError::InvalidToolInput(e.to_string()))?;
        let parsed: DealSearchInput = serde_json::from_value(value)
            .map_err(|e| ChatError::InvalidToolInput(e.to_string()))?;

        let limit = parsed
            .limit
            .map(|l| l.min(self.max_results as u64) as usize)
            .unwrap_or(self.default_results)
            .min(self.max_results);

        Ok(DealFilter {
            id: parsed.id,
            title: parsed.title.filter(|t| !t.is_empty()),
            min_ebitda: parsed.min_ebitda,
            max_ebitda: parsed.max_ebitda,
            min_revenue: parsed.min_revenue,
            max_revenue: parsed.max_revenue,
            exact_revenue: parsed.exact_revenue,
            company_location: parsed.company_location.filter(|l| !l.is_empty()),
            min_ebitda_margin: parsed.min_ebitda_margin,
            max_ebitda_margin: parsed.max_ebitda_margin,
            limit,
        })
    }
}

#[async_trait]
impl Tool for DealSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: DEAL_SEARCH_TOOL.to_string(),
            description: "Search for deal information in the database. Use this tool when users \
                ask about deals with specific criteria like EBITDA amounts, revenue, location, or \
                other deal characteristics."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "id": {"type": "string", "description": "Specific deal ID"},
                    "title": {"type": "string", "description": "Text contained in the deal title"},
                    "minEbitda": {"type": "number", "description": "Minimum EBITDA, e.g. 350000"},
                    "maxEbitda": {"type": "number"},
                    "minRevenue": {"type": "number"},
                    "maxRevenue": {"type": "number"},
                    "exactRevenue": {"type": "number"},
                    "companyLocation": {"type": "string", "description": "City, state or country"},
                    "minEbitdaMargin": {"type": "number", "description": "Percentage"},
                    "maxEbitdaMargin": {"type": "number"},
                    "limit": {"type": "integer", "minimum": 0, "default": self.default_results}
                }
            }),
        }
    }

    fn validate(&self, input: &ToolInput) -> Result<(), ChatError> {
        self.parse(input).map(|_| ())
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput, ChatError> {
        let filter = self.parse(input)?;
        let deals = self
            .deals
            .search(&filter)
            .map_err(|e| ChatError::ToolExecutionFailed(e.to_string()))?;

        let mut results = Vec::with_capacity(deals.len());
        for deal in deals {
            let view = serde_json::to_value(DealView::from(deal))
                .map_err(|e| ChatError::ToolExecutionFailed(e.to_string()))?;
            results.push(view);
        }
        Ok(ToolOutput(results))
    }
}

/// Format a dollar amount with thousands separators and at most two decimals.
pub fn format_currency(amount: f64) -> String {
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = cents / 100;
    let frac = cents % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    if frac == 0 {
        format!("{}${}", sign, grouped)
    } else {
        let frac = format!("{:02}", frac);
        format!("{}${}.{}", sign, grouped, frac.trim_end_matches('0'))
    }
}

/// Format a percentage the way it was stored, e.g. `12.5%`.
pub fn format_percent(value: f64) -> String {
    format!("{}%", value)
}
