use crate::error::Result;
use crate::Schedule;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use vigil_common::types::{IncidentState, Status};
use vigil_common::AlertKey;

/// Groups alert keys for batched display or notification.
///
/// The tag pair shared by the most keys is taken repeatedly while at least
/// `min_group` keys share it; ties go to the lexicographically smallest
/// pair. Leftovers are grouped by alert name when enough share one, and
/// are otherwise returned one key per group.
///
/// Group names are `{k=v}` for tag groups, the alert name for name groups
/// and the full key for single keys.
pub fn group_sets(keys: &[AlertKey], min_group: usize) -> BTreeMap<String, Vec<AlertKey>> {
    let min_group = min_group.max(1);
    let mut remaining: Vec<AlertKey> = keys.to_vec();
    remaining.sort();
    remaining.dedup();

    let mut groups: BTreeMap<String, Vec<AlertKey>> = BTreeMap::new();
    loop {
        let mut counts: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for ak in &remaining {
            for pair in ak.group().iter() {
                *counts.entry(pair).or_default() += 1;
            }
        }
        let mut best: Option<((&str, &str), usize)> = None;
        for (pair, count) in counts {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((pair, count));
            }
        }
        let Some(((k, v), count)) = best else { break };
        if count < min_group || count < 2 {
            break;
        }
        let name = format!("{{{k}={v}}}");
        let (members, rest): (Vec<AlertKey>, Vec<AlertKey>) = remaining
            .iter()
            .cloned()
            .partition(|ak| ak.group().get(k) == Some(v));
        groups.insert(name, members);
        remaining = rest;
    }

    let mut by_name: BTreeMap<String, Vec<AlertKey>> = BTreeMap::new();
    for ak in remaining {
        by_name.entry(ak.name().to_string()).or_default().push(ak);
    }
    for (name, members) in by_name {
        if members.len() >= min_group && members.len() > 1 {
            groups.insert(name, members);
        } else {
            for ak in members {
                groups.insert(ak.to_string(), vec![ak]);
            }
        }
    }
    groups
}

/// The display-relevant state of an open incident. Incidents with equal
/// tuples are shown together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StateTuple {
    pub need_ack: bool,
    pub active: bool,
    pub status: Status,
    pub current_status: Status,
    pub silenced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateGroup {
    pub state: StateTuple,
    pub groups: BTreeMap<String, Vec<AlertKey>>,
}

/// Buckets incidents by [`StateTuple`], then groups each bucket's keys
/// with [`group_sets`].
pub fn group_states(
    incidents: &[IncidentState],
    is_silenced: impl Fn(&AlertKey) -> bool,
    min_group: usize,
) -> Vec<StateGroup> {
    let mut buckets: BTreeMap<StateTuple, Vec<AlertKey>> = BTreeMap::new();
    for inc in incidents {
        let tuple = StateTuple {
            need_ack: inc.need_ack,
            active: inc.is_active(),
            status: inc.worst_status,
            current_status: inc.current_status,
            silenced: is_silenced(&inc.alert_key),
        };
        buckets.entry(tuple).or_default().push(inc.alert_key.clone());
    }
    buckets
        .into_iter()
        .map(|(state, keys)| StateGroup {
            state,
            groups: group_sets(&keys, min_group),
        })
        .collect()
}

impl Schedule {
    /// Open incidents grouped by state, for dashboards.
    pub async fn group_states(&self, now: DateTime<Utc>) -> Result<Vec<StateGroup>> {
        let open = self.incidents.get_all_open_incidents().await?;
        let silenced = self.silence_tester(now).await?;
        Ok(group_states(
            &open,
            |ak| silenced.is_silenced(ak),
            self.system.min_group_size(),
        ))
    }
}
