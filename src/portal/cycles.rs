//! Which review cycle(s) a request is about.
//!
//! Precedence, evaluated per request:
//! 1. an admin-supplied `cycleId` query parameter, if that cycle is open;
//! 2. the global `active_cycle_id` setting, if that cycle is open;
//! 3. the most recent open cycle (start date descending).
//!
//! "Open" means draft or calibrating. No open cycle → empty resolution, and
//! callers render their empty state instead of querying further.

use serde::Serialize;

use super::models::ReviewCycle;

pub const ACTIVE_CYCLE_SETTING: &str = "active_cycle_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSource {
    QueryOverride,
    GlobalSetting,
    MostRecentOpen,
    NoneOpen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResolution {
    pub selected_cycle_id: Option<String>,
    pub open_cycle_ids: Vec<String>,
    pub cycle_ids_to_use: Vec<String>,
    pub source: CycleSource,
    pub label: String,
    /// `?cycleId=...` to carry an admin override across links, or "".
    pub cycle_qs: String,
}

impl CycleResolution {
    pub fn is_empty(&self) -> bool {
        self.cycle_ids_to_use.is_empty()
    }
}

/// Resolve the cycle for a request.
///
/// `cycles` may contain any statuses in any order; only open ones are
/// candidates. Non-admin query overrides are ignored.
pub fn resolve(
    cycles: &[ReviewCycle],
    is_admin: bool,
    query_cycle_id: Option<&str>,
    global_active_id: Option<&str>,
) -> CycleResolution {
    let mut open: Vec<&ReviewCycle> = cycles.iter().filter(|c| c.status.is_open()).collect();
    open.sort_by(|a, b| {
        b.start_date
            .cmp(&a.start_date)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    let open_cycle_ids: Vec<String> = open.iter().map(|c| c.id.clone()).collect();
    let is_open = |id: &str| open_cycle_ids.iter().any(|o| o == id);

    let override_id = query_cycle_id
        .filter(|_| is_admin)
        .map(str::trim)
        .filter(|id| !id.is_empty() && is_open(id));

    let (selected, source) = if let Some(id) = override_id {
        (Some(id.to_string()), CycleSource::QueryOverride)
    } else if let Some(id) = global_active_id.filter(|id| is_open(id)) {
        (Some(id.to_string()), CycleSource::GlobalSetting)
    } else if let Some(first) = open_cycle_ids.first() {
        (Some(first.clone()), CycleSource::MostRecentOpen)
    } else {
        (None, CycleSource::NoneOpen)
    };

    let label = cycle_label(selected.as_deref(), &open_cycle_ids, |id| {
        cycles.iter().find(|c| c.id == id).map(|c| c.name.clone())
    });
    let cycle_qs = match (source, &selected) {
        (CycleSource::QueryOverride, Some(id)) => format!("?cycleId={}", id),
        _ => String::new(),
    };

    CycleResolution {
        cycle_ids_to_use: selected.iter().cloned().collect(),
        selected_cycle_id: selected,
        open_cycle_ids,
        source,
        label,
        cycle_qs,
    }
}

/// Display label for the cycle picker.
pub fn cycle_label<F>(selected: Option<&str>, open_cycle_ids: &[String], name_of: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(id) = selected {
        return name_of(id).unwrap_or_else(|| "Selected cycle".to_string());
    }
    match open_cycle_ids {
        [] => "No open cycles".to_string(),
        [only] => name_of(only).unwrap_or_else(|| "Open cycle".to_string()),
        _ => "All open cycles".to_string(),
    }
}
