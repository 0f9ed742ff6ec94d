//! Ownership helpers shared by the reconciler and the reset tooling.

use crate::model::{Owner, Partition, Record};

/// Where a record came from, relative to the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    Template,
    /// Unclaimed, device-local edit.
    Local,
    Own,
    Foreign,
}

pub fn classify(record: &Record, own_user_id: &str) -> RecordOrigin {
    match &record.owner_id {
        Owner::Template => RecordOrigin::Template,
        Owner::Unclaimed => RecordOrigin::Local,
        Owner::User(id) if id == own_user_id => RecordOrigin::Own,
        Owner::User(_) => RecordOrigin::Foreign,
    }
}

pub fn is_template(record: &Record) -> bool {
    record.is_template()
}

/// Candidates that are live user edits, i.e. everything except the baseline.
pub fn user_candidates(candidates: &[Record]) -> Vec<Record> {
    candidates
        .iter()
        .filter(|r| !is_template(r))
        .cloned()
        .collect()
}

/// Copy of `record` with ownership metadata removed, as a fresh local edit.
pub fn strip_ownership(record: &Record) -> Record {
    Record {
        owner_id: Owner::Unclaimed,
        updated_at: None,
        ..record.clone()
    }
}

/// Private partition for the template's layer holding unclaimed copies of
/// every baseline record.
pub fn reset_layer_from_template(template: &Partition) -> Partition {
    Partition::new(
        template.layer_id.clone(),
        Owner::Unclaimed,
        template.records.iter().map(strip_ownership).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&Record::new("a", Owner::Template), "me"),
            RecordOrigin::Template
        );
        assert_eq!(
            classify(&Record::new("a", Owner::Unclaimed), "me"),
            RecordOrigin::Local
        );
        assert_eq!(
            classify(&Record::new("a", Owner::user("me")), "me"),
            RecordOrigin::Own
        );
        assert_eq!(
            classify(&Record::new("a", Owner::user("bob")), "me"),
            RecordOrigin::Foreign
        );
    }

    #[test]
    fn test_user_candidates_drops_template() {
        let candidates = vec![
            Record::new("a", Owner::Template),
            Record::new("a", Owner::user("bob")),
            Record::new("a", Owner::Unclaimed),
        ];
        let users = user_candidates(&candidates);
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|r| !is_template(r)));
    }

    #[test]
    fn test_strip_ownership_keeps_content() {
        let mut record = Record::new("a", Owner::user("bob"))
            .named("Well 4")
            .updated(Utc::now());
        record
            .fields
            .insert("depth".into(), serde_json::json!(12.5));

        let stripped = strip_ownership(&record);
        assert_eq!(stripped.owner_id, Owner::Unclaimed);
        assert!(stripped.updated_at.is_none());
        assert_eq!(stripped.display_name, "Well 4");
        assert_eq!(stripped.fields, record.fields);
    }

    #[test]
    fn test_reset_layer_from_template() {
        let template = Partition::new(
            "wells",
            Owner::Template,
            vec![
                Record::new("a", Owner::Template),
                Record::new("b", Owner::Template),
            ],
        );
        let reset = reset_layer_from_template(&template);
        assert_eq!(reset.layer_id, "wells");
        assert_eq!(reset.owner_id, Owner::Unclaimed);
        assert_eq!(reset.records.len(), 2);
        assert!(reset.records.iter().all(|r| r.owner_id == Owner::Unclaimed));
    }
}
