//! Per-layer merge of user partitions and the template baseline.
//!
//! Every record id in the candidate pool resolves to exactly one record. The
//! rules are applied in a fixed order, first match wins:
//!
//! 1. More than one live (non-template) candidate and a resolver is present:
//!    ask the resolver, whatever the configured strategy.
//! 2. Exactly one template and one live candidate: the live edit wins.
//! 3. A single candidate: take it.
//! 4. Otherwise apply the strategy. The template only takes part when no live
//!    candidate exists.
//!
//! Chosen records are bucketed by their own `owner_id`; the template bucket
//! becomes a separate template partition.

use crate::error::ReconcileError;
use fieldsync_core::identity::user_candidates;
use fieldsync_core::model::{Owner, Partition, Record, Strategy};
use std::collections::HashSet;

/// Answers a genuine multi-writer conflict by picking one candidate.
#[async_trait::async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve_conflict(
        &self,
        candidates: Vec<Record>,
        id: &str,
    ) -> Result<Record, ReconcileError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutput {
    pub user_partitions: Vec<Partition>,
    pub template: Option<Partition>,
}

/// Candidate with the greatest `updated_at`; ties go to the later candidate.
/// A missing timestamp sorts before any present one.
pub fn pick_latest(candidates: &[Record]) -> Option<&Record> {
    candidates
        .iter()
        .reduce(|best, c| if c.updated_at >= best.updated_at { c } else { best })
}

/// Candidate owned by `own_user_id`, else the first one.
pub fn pick_own_or_first<'a>(candidates: &'a [Record], own_user_id: &str) -> Option<&'a Record> {
    candidates
        .iter()
        .find(|c| c.owner_id.is_user(own_user_id))
        .or_else(|| candidates.first())
}

/// Merge one layer's user partitions against its template partition.
pub async fn merge(
    user_partitions: &[Partition],
    template: Option<&Partition>,
    own_user_id: &str,
    strategy: Strategy,
    resolver: Option<&dyn ConflictResolver>,
) -> Result<MergeOutput, ReconcileError> {
    let layer_id = match user_partitions.first().or(template) {
        Some(p) => p.layer_id.clone(),
        None => return Ok(MergeOutput::default()),
    };

    let pool: Vec<&Record> = user_partitions
        .iter()
        .chain(template)
        .flat_map(|p| p.records.iter())
        .collect();

    let mut seen = HashSet::new();
    let ids: Vec<&str> = pool
        .iter()
        .map(|r| r.id.as_str())
        .filter(|id| seen.insert(*id))
        .collect();

    let mut buckets: Vec<(Owner, Vec<Record>)> = Vec::new();

    for id in ids {
        let candidates: Vec<Record> = pool
            .iter()
            .filter(|r| r.id == id)
            .map(|r| (*r).clone())
            .collect();
        let users = user_candidates(&candidates);

        let chosen = match resolver {
            Some(resolver) if users.len() > 1 => {
                tracing::debug!(layer = %layer_id, record_id = id, candidates = users.len(), "Multi-writer conflict");
                resolver.resolve_conflict(users, id).await?
            }
            _ if candidates.len() == 2 && users.len() == 1 => users[0].clone(),
            _ if candidates.len() == 1 => candidates[0].clone(),
            _ => {
                let pool = if users.is_empty() { candidates } else { users };
                apply_strategy(pool, id, own_user_id, strategy, resolver).await?
            }
        };

        match buckets.iter_mut().find(|(owner, _)| *owner == chosen.owner_id) {
            Some((_, records)) => records.push(chosen),
            None => buckets.push((chosen.owner_id.clone(), vec![chosen])),
        }
    }

    let mut output = MergeOutput::default();
    for (owner, records) in buckets {
        if owner.is_template() {
            output.template = Some(Partition::new(layer_id.clone(), owner, records));
        } else {
            output
                .user_partitions
                .push(Partition::new(layer_id.clone(), owner, records));
        }
    }
    Ok(output)
}

async fn apply_strategy(
    mut candidates: Vec<Record>,
    id: &str,
    own_user_id: &str,
    strategy: Strategy,
    resolver: Option<&dyn ConflictResolver>,
) -> Result<Record, ReconcileError> {
    let picked = match (strategy, resolver) {
        (Strategy::Latest, _) => pick_latest(&candidates).cloned(),
        (Strategy::SelfOwned, _) => pick_own_or_first(&candidates, own_user_id).cloned(),
        (Strategy::Manual, Some(resolver)) => {
            return resolver.resolve_conflict(candidates, id).await;
        }
        (Strategy::Manual, None) => None,
    };
    // Ids come from existing records, so `candidates` is never empty here.
    Ok(match picked {
        Some(record) => record,
        None => candidates.swap_remove(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rec(id: &str, owner: Owner) -> Record {
        Record::new(id, owner)
    }

    fn part(owner: Owner, records: Vec<Record>) -> Partition {
        Partition::new("l1", owner, records)
    }

    /// Picks the candidate at a fixed index and remembers what it was asked.
    struct ScriptedResolver {
        index: usize,
        calls: Mutex<Vec<(String, Vec<Owner>)>>,
    }

    impl ScriptedResolver {
        fn new(index: usize) -> Self {
            Self {
                index,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Vec<Owner>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ConflictResolver for ScriptedResolver {
        async fn resolve_conflict(
            &self,
            candidates: Vec<Record>,
            id: &str,
        ) -> Result<Record, ReconcileError> {
            self.calls.lock().unwrap().push((
                id.to_string(),
                candidates.iter().map(|c| c.owner_id.clone()).collect(),
            ));
            Ok(candidates[self.index].clone())
        }
    }

    struct FailingResolver;

    #[async_trait::async_trait]
    impl ConflictResolver for FailingResolver {
        async fn resolve_conflict(
            &self,
            _candidates: Vec<Record>,
            id: &str,
        ) -> Result<Record, ReconcileError> {
            Err(ReconcileError::Resolver {
                record_id: id.to_string(),
                message: "operator dismissed dialog".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let out = merge(&[], None, "me", Strategy::Latest, None).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_single_candidate_unchanged() {
        let record = rec("a", Owner::user("bob")).named("Pump").updated(at(5));
        let out = merge(
            &[part(Owner::user("bob"), vec![record.clone()])],
            None,
            "me",
            Strategy::SelfOwned,
            None,
        )
        .await
        .unwrap();
        assert_eq!(out.user_partitions.len(), 1);
        assert_eq!(out.user_partitions[0].records, vec![record]);
        assert!(out.template.is_none());
    }

    #[tokio::test]
    async fn test_template_never_overrides_live_edit() {
        for strategy in [Strategy::Latest, Strategy::SelfOwned, Strategy::Manual] {
            let template = part(
                Owner::Template,
                vec![rec("a", Owner::Template).updated(at(100))],
            );
            let users = [part(
                Owner::user("bob"),
                vec![rec("a", Owner::user("bob")).updated(at(1))],
            )];
            let resolver = ScriptedResolver::new(0);
            let out = merge(&users, Some(&template), "me", strategy, Some(&resolver))
                .await
                .unwrap();
            assert_eq!(out.user_partitions.len(), 1, "strategy {strategy}");
            assert!(out.user_partitions[0].owner_id.is_user("bob"));
            assert!(out.template.is_none());
            assert!(resolver.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_template_only_id_stays_in_template_bucket() {
        let template = part(
            Owner::Template,
            vec![rec("a", Owner::Template), rec("t", Owner::Template)],
        );
        let users = [part(Owner::Unclaimed, vec![rec("a", Owner::Unclaimed)])];
        let out = merge(&users, Some(&template), "me", Strategy::Manual, None)
            .await
            .unwrap();

        assert_eq!(out.user_partitions.len(), 1);
        assert_eq!(out.user_partitions[0].owner_id, Owner::Unclaimed);
        let template = out.template.unwrap();
        assert_eq!(template.records.len(), 1);
        assert_eq!(template.records[0].id, "t");
    }

    #[tokio::test]
    async fn test_template_without_user_partitions() {
        let template = part(Owner::Template, vec![rec("t", Owner::Template)]);
        let out = merge(&[], Some(&template), "me", Strategy::Latest, None)
            .await
            .unwrap();
        assert!(out.user_partitions.is_empty());
        assert_eq!(out.template.unwrap().layer_id, "l1");
    }

    #[tokio::test]
    async fn test_multi_writer_conflict_goes_to_resolver_regardless_of_strategy() {
        let users = [
            part(Owner::user("me"), vec![rec("a", Owner::user("me")).updated(at(1))]),
            part(Owner::user("bob"), vec![rec("a", Owner::user("bob")).updated(at(9))]),
        ];
        let template = part(Owner::Template, vec![rec("a", Owner::Template)]);
        let resolver = ScriptedResolver::new(0);
        let out = merge(&users, Some(&template), "me", Strategy::Latest, Some(&resolver))
            .await
            .unwrap();

        assert_eq!(
            resolver.calls(),
            vec![("a".to_string(), vec![Owner::user("me"), Owner::user("bob")])]
        );
        assert_eq!(out.user_partitions.len(), 1);
        assert!(out.user_partitions[0].owner_id.is_user("me"));
        assert!(out.template.is_none());
    }

    #[tokio::test]
    async fn test_latest_picks_max_and_ties_favor_later() {
        let users = [
            part(Owner::user("a1"), vec![rec("x", Owner::user("a1")).updated(at(3))]),
            part(Owner::user("a2"), vec![rec("x", Owner::user("a2")).updated(at(7))]),
            part(Owner::user("a3"), vec![rec("x", Owner::user("a3")).updated(at(2))]),
            part(Owner::user("a4"), vec![rec("y", Owner::user("a4")).updated(at(4))]),
            part(Owner::user("a5"), vec![rec("y", Owner::user("a5")).updated(at(4))]),
        ];
        let out = merge(&users, None, "me", Strategy::Latest, None)
            .await
            .unwrap();

        let owners: Vec<&Owner> = out.user_partitions.iter().map(|p| &p.owner_id).collect();
        assert_eq!(owners, vec![&Owner::user("a2"), &Owner::user("a5")]);
    }

    #[tokio::test]
    async fn test_self_prefers_own_else_first() {
        let users = [
            part(Owner::user("bob"), vec![rec("x", Owner::user("bob")), rec("y", Owner::user("bob"))]),
            part(Owner::user("me"), vec![rec("x", Owner::user("me"))]),
            part(Owner::user("eve"), vec![rec("y", Owner::user("eve"))]),
        ];
        let out = merge(&users, None, "me", Strategy::SelfOwned, None)
            .await
            .unwrap();

        assert_eq!(out.user_partitions.len(), 2);
        let mine = out.user_partitions.iter().find(|p| p.is_owned_by("me")).unwrap();
        assert_eq!(mine.records[0].id, "x");
        let bobs = out.user_partitions.iter().find(|p| p.is_owned_by("bob")).unwrap();
        assert_eq!(bobs.records[0].id, "y");
    }

    #[tokio::test]
    async fn test_manual_without_resolver_takes_first() {
        let users = [
            part(Owner::user("bob"), vec![rec("x", Owner::user("bob"))]),
            part(Owner::user("me"), vec![rec("x", Owner::user("me"))]),
        ];
        let out = merge(&users, None, "me", Strategy::Manual, None)
            .await
            .unwrap();
        assert_eq!(out.user_partitions.len(), 1);
        assert!(out.user_partitions[0].is_owned_by("bob"));
    }

    #[tokio::test]
    async fn test_template_loses_when_three_candidates_fall_through() {
        let users = [
            part(Owner::user("bob"), vec![rec("x", Owner::user("bob")).updated(at(1))]),
            part(Owner::user("eve"), vec![rec("x", Owner::user("eve")).updated(at(2))]),
        ];
        let template = part(Owner::Template, vec![rec("x", Owner::Template).updated(at(50))]);
        let out = merge(&users, Some(&template), "me", Strategy::Latest, None)
            .await
            .unwrap();
        assert!(out.template.is_none());
        assert!(out.user_partitions[0].is_owned_by("eve"));
    }

    #[tokio::test]
    async fn test_records_bucket_by_record_owner() {
        let users = [part(
            Owner::user("me"),
            vec![rec("a", Owner::user("me")), rec("b", Owner::user("bob"))],
        )];
        let out = merge(&users, None, "me", Strategy::Manual, None)
            .await
            .unwrap();
        assert_eq!(out.user_partitions.len(), 2);
        assert!(out.user_partitions.iter().all(|p| p.records.len() == 1));
    }

    #[tokio::test]
    async fn test_resolver_error_propagates() {
        let users = [
            part(Owner::user("me"), vec![rec("a", Owner::user("me"))]),
            part(Owner::user("bob"), vec![rec("a", Owner::user("bob"))]),
        ];
        let err = merge(&users, None, "me", Strategy::Manual, Some(&FailingResolver))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Resolver { ref record_id, .. } if record_id == "a"));
    }

    #[test]
    fn test_pick_helpers() {
        let candidates = vec![
            rec("x", Owner::user("bob")).updated(at(2)),
            rec("x", Owner::Unclaimed),
            rec("x", Owner::user("me")).updated(at(1)),
        ];
        assert!(pick_latest(&candidates).unwrap().owner_id.is_user("bob"));
        assert!(pick_own_or_first(&candidates, "me").unwrap().owner_id.is_user("me"));
        assert!(pick_own_or_first(&candidates, "zed").unwrap().owner_id.is_user("bob"));
        assert!(pick_latest(&[]).is_none());
    }
}
