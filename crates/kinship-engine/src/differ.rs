use kinship_core::{FieldChanges, FieldValue, Issue, IssueField, PROTECTED_FIELDS};
use kinship_store::{IssueStore, StoreError};
use serde::Serialize;

/// What `upsert_issue` did with an incoming record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated(Vec<IssueField>),
    Unchanged,
}

/// Fields of `incoming` that differ from `existing`, skipping `protected`.
pub fn diff(existing: &Issue, incoming: &Issue, protected: &[IssueField]) -> FieldChanges {
    IssueField::ALL
        .into_iter()
        .filter(|field| !protected.contains(field))
        .filter_map(|field| {
            let new_value = incoming.field(field);
            values_differ(&existing.field(field), &new_value).then_some((field, new_value))
        })
        .collect()
}

/// Absent on both sides is equal; surrounding whitespace in text is not significant.
pub fn values_differ(existing: &FieldValue, incoming: &FieldValue) -> bool {
    match (existing, incoming) {
        (FieldValue::Absent, FieldValue::Absent) => false,
        (FieldValue::Absent, _) | (_, FieldValue::Absent) => true,
        (FieldValue::Text(left), FieldValue::Text(right)) => left.trim() != right.trim(),
        (left, right) => left != right,
    }
}

/// Inserts an unseen issue or writes only its changed fields.
pub async fn upsert_issue(
    store: &dyn IssueStore,
    issue: Issue,
) -> Result<UpsertOutcome, StoreError> {
    let Some(existing) = store.get(issue.external_id).await? else {
        tracing::info!(
            external_id = issue.external_id,
            number = issue.number,
            title = %issue.title,
            "inserting new issue"
        );
        store.insert(issue).await?;
        return Ok(UpsertOutcome::Inserted);
    };

    let changes = diff(&existing, &issue, &PROTECTED_FIELDS);
    if changes.is_empty() {
        tracing::debug!(number = issue.number, "no changes detected, skipping update");
        return Ok(UpsertOutcome::Unchanged);
    }

    let fields = changes.keys().copied().collect::<Vec<_>>();
    tracing::info!(
        number = issue.number,
        changed = fields.len(),
        fields = ?fields,
        "updating changed fields"
    );
    store.update(&changes, issue.external_id).await?;
    Ok(UpsertOutcome::Updated(fields))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};
    use kinship_core::IssueState;

    use super::*;

    fn issue() -> Issue {
        Issue {
            external_id: 10,
            number: 3,
            repository: "acme/widgets".to_owned(),
            title: "Crash on startup".to_owned(),
            body: Some("Panics in main".to_owned()),
            state: IssueState::Open,
            locked: false,
            author_login: "octocat".to_owned(),
            labels: BTreeSet::from(["bug".to_owned()]),
            assignees: BTreeSet::new(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            closed_at: None,
            html_url: "https://github.com/acme/widgets/issues/3".to_owned(),
            comments_count: 0,
            milestone_title: None,
            author_association: None,
            state_reason: None,
            title_vec: Some(vec![1.0, 0.0]),
            body_vec: None,
        }
    }

    #[test]
    fn diff_of_identical_records_is_empty() {
        let record = issue();
        assert!(diff(&record, &record, &PROTECTED_FIELDS).is_empty());
        assert!(diff(&record, &record, &[IssueField::ExternalId]).is_empty());
    }

    #[test]
    fn diff_never_reports_protected_fields() {
        let existing = issue();
        let mut incoming = issue();
        incoming.external_id = 99;
        incoming.title_vec = Some(vec![0.0, 1.0]);
        incoming.body_vec = Some(vec![0.5, 0.5]);
        incoming.comments_count = 4;

        let changes = diff(&existing, &incoming, &PROTECTED_FIELDS);
        assert_eq!(
            changes.keys().copied().collect::<Vec<_>>(),
            vec![IssueField::CommentsCount]
        );
    }

    #[test]
    fn diff_ignores_surrounding_whitespace_in_text() {
        let existing = issue();
        let mut incoming = issue();
        incoming.title = "Crash on startup  \n".to_owned();
        incoming.body = Some("  Panics in main".to_owned());

        assert!(diff(&existing, &incoming, &PROTECTED_FIELDS).is_empty());
    }

    #[test]
    fn diff_reports_absence_transitions_and_set_changes() {
        let existing = issue();
        let mut incoming = issue();
        incoming.body = None;
        incoming.closed_at = Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        incoming.labels.insert("p1".to_owned());

        let changes = diff(&existing, &incoming, &PROTECTED_FIELDS);
        assert_eq!(changes.get(&IssueField::Body), Some(&FieldValue::Absent));
        assert!(changes.contains_key(&IssueField::ClosedAt));
        assert!(changes.contains_key(&IssueField::Labels));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn values_differ_follows_comparison_rules() {
        assert!(!values_differ(&FieldValue::Absent, &FieldValue::Absent));
        assert!(values_differ(
            &FieldValue::Absent,
            &FieldValue::Text(String::new())
        ));
        assert!(!values_differ(
            &FieldValue::Text(" a ".to_owned()),
            &FieldValue::Text("a".to_owned())
        ));
        assert!(values_differ(&FieldValue::Integer(1), &FieldValue::Integer(2)));
        assert!(!values_differ(&FieldValue::Bool(true), &FieldValue::Bool(true)));
    }
}
