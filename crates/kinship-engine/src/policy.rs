use kinship_config::TriageConfig;
use kinship_core::{Issue, IssueAction, SimilarIssue};

/// Gate for the automated "possibly related" reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentPolicy {
    pub threshold: f32,
    pub bot_marker: String,
}

impl CommentPolicy {
    pub fn new(threshold: f32, bot_marker: impl Into<String>) -> Self {
        Self {
            threshold,
            bot_marker: bot_marker.into(),
        }
    }

    pub fn from_config(config: &TriageConfig) -> Self {
        Self::new(
            config.effective_comment_threshold(),
            config.bot_marker.clone(),
        )
    }

    pub fn should_notify(
        &self,
        action: &IssueAction,
        subject: &Issue,
        candidates: &[SimilarIssue],
    ) -> bool {
        if !action.is_creation() {
            return false;
        }

        let Some(best) = candidates
            .iter()
            .map(|candidate| candidate.distance)
            .min_by(f32::total_cmp)
        else {
            return false;
        };
        if best > self.threshold {
            tracing::debug!(
                number = subject.number,
                best_distance = best,
                threshold = self.threshold,
                "closest match is not similar enough"
            );
            return false;
        }

        if self.is_bot(&subject.author_login) {
            tracing::debug!(
                number = subject.number,
                author = %subject.author_login,
                "skipping reply to bot author"
            );
            return false;
        }

        true
    }

    /// Case-insensitive substring heuristic on the handle; an empty marker flags nobody.
    pub fn is_bot(&self, login: &str) -> bool {
        let marker = self.bot_marker.trim();
        !marker.is_empty() && login.to_lowercase().contains(&marker.to_lowercase())
    }
}
