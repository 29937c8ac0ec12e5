use crate::error::Result;
use crate::expr::is_abnormal;
use crate::Schedule;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use vigil_common::conf::AlertDef;
use vigil_common::types::{Event, ExprResult};
use vigil_common::{AlertKey, TagSet};

/// Keeps only results that trigger a dependency: non-zero and not NaN.
pub fn filter_dependency_results(results: Vec<ExprResult>) -> Vec<TagSet> {
    results
        .into_iter()
        .filter(|r| !r.value.is_nan() && is_abnormal(r.value))
        .map(|r| r.group)
        .collect()
}

/// Marks every event whose group is covered by a triggered dependency as
/// unevaluated. An empty dependency group covers every key.
pub fn mark_dependencies_unevaluated(events: &mut BTreeMap<AlertKey, Event>, deps: &[TagSet]) {
    if deps.is_empty() {
        return;
    }
    for (ak, event) in events.iter_mut() {
        if deps.iter().any(|dep| dep.is_empty() || dep.overlaps(ak.group())) {
            event.unevaluated = true;
        }
    }
}

impl Schedule {
    /// Groups for which `alert`'s dependencies are currently triggered: the
    /// abnormal results of its `depends` expression plus the groups of
    /// active open incidents of every alert named in `depends_on`.
    pub(crate) async fn dependency_groups(
        &self,
        alert: &AlertDef,
        now: DateTime<Utc>,
    ) -> Result<Vec<TagSet>> {
        let mut groups = Vec::new();
        if let Some(expr) = &alert.depends {
            let results = self
                .evaluator
                .evaluate(expr, alert.time_window(), now)
                .await?;
            groups.extend(filter_dependency_results(results));
        }
        if !alert.depends_on.is_empty() {
            let open = self.incidents.get_all_open_incidents().await?;
            groups.extend(
                open.into_iter()
                    .filter(|inc| inc.is_active() && alert.depends_on.iter().any(|d| d == inc.alert()))
                    .map(|inc| inc.alert_key.group().clone()),
            );
        }
        Ok(groups)
    }
}
