use std::fmt::Write as _;

use kinship_core::SimilarIssue;

pub const MAX_COMMENT_CANDIDATES: usize = 5;
pub const HIGH_CONFIDENCE_DISTANCE: f32 = 0.3;

const COMMENT_HEADER: &str = "### Possibly related issues";

pub fn similarity_label(distance: f32) -> &'static str {
    if distance < HIGH_CONFIDENCE_DISTANCE {
        "high confidence"
    } else {
        "possible match"
    }
}

/// Markdown reply listing the top candidates in the given order.
pub fn format_comment(candidates: &[SimilarIssue]) -> String {
    let mut comment = String::new();
    let _ = writeln!(comment, "{COMMENT_HEADER}");
    let _ = writeln!(comment);

    if candidates.is_empty() {
        let _ = writeln!(comment, "No similar issues were found.");
        return comment;
    }

    let _ = writeln!(
        comment,
        "This issue looks similar to the following existing issues:"
    );
    let _ = writeln!(comment);

    for (index, candidate) in candidates.iter().take(MAX_COMMENT_CANDIDATES).enumerate() {
        let issue = &candidate.issue;
        let _ = writeln!(
            comment,
            "{}. **{}** [#{} {}]({}) (matched on {}, distance {:.2})",
            index + 1,
            similarity_label(candidate.distance),
            issue.number,
            escape_link_text(issue.title.trim()),
            issue.html_url,
            candidate.matched_field.label(),
            candidate.distance,
        );
    }

    let _ = writeln!(comment);
    let _ = write!(
        comment,
        "_If one of these already covers your report, please add details there instead._"
    );
    comment
}

fn escape_link_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
