use kinship_github::IssueLabeler;
use serde::Serialize;

use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyTrigger {
    pub issue_number: i64,
    pub label: String,
    /// Whether the label was on the issue before the toggle.
    pub was_labeled: bool,
}

/// Removes `label` from the issue and adds it back, so automation keyed on
/// the `labeled` event runs again.
pub async fn trigger_reply(
    labeler: &dyn IssueLabeler,
    issue_number: i64,
    label: &str,
) -> Result<ReplyTrigger, EngineError> {
    let was_labeled = labeler.remove_label(issue_number, label).await?;
    labeler.add_labels(issue_number, &[label]).await?;

    tracing::info!(issue_number, label, was_labeled, "re-triggered reply label");
    Ok(ReplyTrigger {
        issue_number,
        label: label.to_owned(),
        was_labeled,
    })
}
