use std::collections::HashMap;

use kinship_core::{ExternalId, Issue, SearchField, SimilarIssue, truncate_for_display};
use kinship_store::SimilaritySearch;

const LOGGED_CANDIDATES: usize = 5;
const LOGGED_TITLE_CHARS: usize = 60;

/// Related issues across all searchable fields, nearest first.
///
/// One query per non-blank field, merged by `external_id` keeping the closer
/// match, never including `subject` itself and capped at `2 * limit_per_field`.
/// Search failures degrade to an empty list.
pub async fn find_similar(
    search: &dyn SimilaritySearch,
    subject: &Issue,
    limit_per_field: u32,
    distance_threshold: f32,
) -> Vec<SimilarIssue> {
    let mut all_results = Vec::new();
    let mut queried = false;

    for field in SearchField::ALL {
        let Some(text) = subject.searchable_text(field) else {
            continue;
        };
        queried = true;

        match search
            .search(text, field, limit_per_field, distance_threshold)
            .await
        {
            Ok(rows) => {
                tracing::debug!(
                    number = subject.number,
                    field = field.as_str(),
                    found = rows.len(),
                    "similarity query finished"
                );
                all_results.extend(
                    rows.into_iter()
                        .filter(|row| row.distance <= distance_threshold)
                        .take(limit_per_field as usize)
                        .map(|row| SimilarIssue {
                            matched_field: field,
                            ..row
                        }),
                );
            }
            Err(err) => {
                tracing::error!(
                    number = subject.number,
                    field = field.as_str(),
                    error = %err,
                    "similarity search failed"
                );
                return Vec::new();
            }
        }
    }

    if !queried {
        tracing::warn!(
            number = subject.number,
            "issue has no title or body for similarity search"
        );
        return Vec::new();
    }

    let mut results = deduplicate_by_distance(all_results, subject.external_id);
    results.sort_by(|left, right| left.distance.total_cmp(&right.distance));
    results.truncate(limit_per_field as usize * 2);

    tracing::info!(
        number = subject.number,
        found = results.len(),
        "similar issues found"
    );
    results
}

/// One entry per `external_id`, keeping the strictly closer match and first-seen order.
fn deduplicate_by_distance(
    results: Vec<SimilarIssue>,
    exclude_id: ExternalId,
) -> Vec<SimilarIssue> {
    let mut positions = HashMap::<ExternalId, usize>::new();
    let mut unique: Vec<SimilarIssue> = Vec::with_capacity(results.len());

    for result in results {
        let external_id = result.issue.external_id;
        if external_id == exclude_id {
            continue;
        }

        match positions.get(&external_id) {
            Some(&index) => {
                if result.distance < unique[index].distance {
                    unique[index] = result;
                }
            }
            None => {
                positions.insert(external_id, unique.len());
                unique.push(result);
            }
        }
    }

    unique
}

pub fn log_similar_issues(similar: &[SimilarIssue], subject: &Issue) {
    if similar.is_empty() {
        tracing::info!(number = subject.number, "no similar issues found");
        return;
    }

    tracing::info!(
        number = subject.number,
        count = similar.len(),
        "similar issues"
    );
    for (rank, candidate) in similar.iter().take(LOGGED_CANDIDATES).enumerate() {
        tracing::info!(
            rank = rank + 1,
            number = candidate.issue.number,
            distance = format_args!("{:.4}", candidate.distance),
            field = candidate.matched_field.as_str(),
            state = candidate.issue.state.as_str(),
            title = %truncate_for_display(&candidate.issue.title, LOGGED_TITLE_CHARS),
            "similar issue"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};
    use kinship_core::IssueState;

    use super::*;

    fn candidate(external_id: ExternalId, distance: f32, field: SearchField) -> SimilarIssue {
        SimilarIssue {
            issue: Issue {
                external_id,
                number: external_id,
                repository: "acme/widgets".to_owned(),
                title: format!("issue {external_id}"),
                body: None,
                state: IssueState::Open,
                locked: false,
                author_login: "octocat".to_owned(),
                labels: BTreeSet::new(),
                assignees: BTreeSet::new(),
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                closed_at: None,
                html_url: String::new(),
                comments_count: 0,
                milestone_title: None,
                author_association: None,
                state_reason: None,
                title_vec: None,
                body_vec: None,
            },
            distance,
            matched_field: field,
        }
    }

    #[test]
    fn deduplicate_keeps_closer_match_and_drops_subject() {
        let results = vec![
            candidate(1, 0.4, SearchField::Title),
            candidate(2, 0.2, SearchField::Title),
            candidate(7, 0.0, SearchField::Title),
            candidate(1, 0.1, SearchField::Body),
            candidate(2, 0.2, SearchField::Body),
        ];

        let unique = deduplicate_by_distance(results, 7);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].issue.external_id, 1);
        assert_eq!(unique[0].matched_field, SearchField::Body);
        assert_eq!(unique[1].issue.external_id, 2);
        assert_eq!(unique[1].matched_field, SearchField::Title);
    }
}
