//! Built-in tools: current date/time, configured location, and a simulated
//! information lookup.

use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{required_arg, Tool, ToolError, ToolParam};

// ─── get_current_datetime ───────────────────────────────────────────────────

pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Returns the current date and time. Use when the user asks for the current date, time, or day."
    }

    async fn call(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
        let now = chrono::Local::now();
        Ok(format!(
            "The current date and time is: {}",
            now.format("%Y-%m-%d %H:%M:%S")
        ))
    }
}

// ─── get_current_location ───────────────────────────────────────────────────

pub struct LocationTool {
    location: String,
}

impl LocationTool {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
        }
    }
}

#[async_trait]
impl Tool for LocationTool {
    fn name(&self) -> &str {
        "get_current_location"
    }

    fn description(&self) -> &str {
        "Returns the user's current known location (city, state, country). Use when the user \
         asks about their location, or needs location-specific info (like weather) and hasn't \
         specified a location."
    }

    async fn call(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
        Ok(self.location.clone())
    }
}

// ─── simple_osint_search ────────────────────────────────────────────────────

/// Canned answers keyed on the query and the configured location.
pub struct OsintSearchTool {
    location: String,
    /// Lowercased first component of the location, e.g. `happy valley`.
    locality: String,
}

impl OsintSearchTool {
    pub fn new(location: &str) -> Self {
        let locality = location
            .split(',')
            .next()
            .unwrap_or(location)
            .trim()
            .to_lowercase();
        Self {
            location: location.to_string(),
            locality,
        }
    }

    fn answer(&self, query: &str) -> String {
        let q = query.to_lowercase();
        let mentions_locality = !self.locality.is_empty() && q.contains(&self.locality);

        if q.contains("weather") {
            format!("Simulated weather for {}: Partly cloudy, 15°C.", self.location)
        } else if q.contains("news") && mentions_locality {
            format!(
                "Simulated news for {}: Local council discusses new park proposal. \
                 Upcoming farmers market this weekend.",
                self.location
            )
        } else if q.contains("events") && mentions_locality {
            format!(
                "Simulated events in {}: Farmers Market (Sat), Community Garage Sale (Sun).",
                self.location
            )
        } else {
            format!(
                "OSINT Tool Simulation: No specific information found for '{query}'. \
                 Try queries like 'weather' or 'news {}'.",
                self.locality
            )
        }
    }
}

fn osint_params() -> &'static [ToolParam] {
    static PARAMS: OnceLock<Vec<ToolParam>> = OnceLock::new();
    PARAMS.get_or_init(|| {
        vec![ToolParam::new(
            "query",
            "The search term or question (e.g., \"weather\", \"local news\", \"events this weekend\").",
        )]
    })
}

#[async_trait]
impl Tool for OsintSearchTool {
    fn name(&self) -> &str {
        "simple_osint_search"
    }

    fn description(&self) -> &str {
        "Performs a basic simulated search for up-to-date information such as weather, local \
         news, or events in the current location. Be specific in the query."
    }

    fn parameters(&self) -> &[ToolParam] {
        osint_params()
    }

    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let query = required_arg(args, "query")?;
        tracing::info!(query = %query, "simulated osint search");
        Ok(self.answer(&query))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
