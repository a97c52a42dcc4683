//! Audience resolution — expands targeting lists to concrete user ids.

use std::collections::HashSet;

use nudge_core::error::Result;
use nudge_core::traits::Membership;
use serde::{Deserialize, Serialize};

use crate::records::TargetSpec;

/// The resolved audience for one run, attributable to that run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTargets {
    pub include_user_ids: Vec<String>,
    pub exclude_user_ids: Vec<String>,
    pub pack_ids: Vec<String>,
    /// (pack members ∪ includes) − excludes, de-duplicated.
    pub final_user_ids: Vec<String>,
}

/// Expand `pack_ids` through the membership collaborator, union the include
/// list, then drop every excluded id. Exclusion always wins, even for ids
/// reachable through a pack; the result keeps first-seen order with no
/// duplicates.
pub async fn resolve_targets(
    spec: &TargetSpec,
    membership: &dyn Membership,
) -> Result<JobTargets> {
    let pack_members = if spec.pack_ids.is_empty() {
        Vec::new()
    } else {
        membership.members_of(&spec.pack_ids).await?
    };

    let excluded: HashSet<&str> = spec.exclude_user_ids.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut final_user_ids = Vec::new();

    for id in pack_members.iter().chain(spec.include_user_ids.iter()) {
        if excluded.contains(id.as_str()) {
            continue;
        }
        if seen.insert(id.clone()) {
            final_user_ids.push(id.clone());
        }
    }

    Ok(JobTargets {
        include_user_ids: spec.include_user_ids.clone(),
        exclude_user_ids: spec.exclude_user_ids.clone(),
        pack_ids: spec.pack_ids.clone(),
        final_user_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeMembership {
        packs: HashMap<String, Vec<String>>,
    }

    impl FakeMembership {
        fn new(entries: &[(&str, &[&str])]) -> Self {
            let packs = entries
                .iter()
                .map(|(pack, members)| {
                    (
                        pack.to_string(),
                        members.iter().map(|m| m.to_string()).collect(),
                    )
                })
                .collect();
            Self { packs }
        }
    }

    #[async_trait]
    impl Membership for FakeMembership {
        async fn members_of(&self, pack_ids: &[String]) -> Result<Vec<String>> {
            let mut out = Vec::new();
            for pack in pack_ids {
                if let Some(members) = self.packs.get(pack) {
                    out.extend(members.clone());
                }
            }
            Ok(out)
        }
    }

    fn spec(include: &[&str], exclude: &[&str], packs: &[&str]) -> TargetSpec {
        TargetSpec {
            include_user_ids: include.iter().map(|s| s.to_string()).collect(),
            exclude_user_ids: exclude.iter().map(|s| s.to_string()).collect(),
            pack_ids: packs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_exclude_wins_over_pack_membership() {
        let membership = FakeMembership::new(&[("p1", &["u1", "u2"])]);
        let targets = resolve_targets(&spec(&["u3"], &["u1"], &["p1"]), &membership)
            .await
            .unwrap();
        assert_eq!(targets.final_user_ids, vec!["u2", "u3"]);
    }

    #[tokio::test]
    async fn test_no_duplicates_across_packs_and_includes() {
        let membership = FakeMembership::new(&[("p1", &["u1", "u2"]), ("p2", &["u2", "u3"])]);
        let targets = resolve_targets(&spec(&["u1", "u4"], &[], &["p1", "p2"]), &membership)
            .await
            .unwrap();
        assert_eq!(targets.final_user_ids, vec!["u1", "u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn test_unknown_pack_resolves_empty() {
        let membership = FakeMembership::new(&[]);
        let targets = resolve_targets(&spec(&["u1"], &[], &["ghost"]), &membership)
            .await
            .unwrap();
        assert_eq!(targets.final_user_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn test_exclude_applies_to_includes_too() {
        let membership = FakeMembership::new(&[]);
        let targets = resolve_targets(&spec(&["u1", "u2"], &["u2"], &[]), &membership)
            .await
            .unwrap();
        assert_eq!(targets.final_user_ids, vec!["u1"]);
    }
}
