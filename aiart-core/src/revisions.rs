use std::collections::BTreeSet;

use crate::{Credentials, Git, Result};

/// Branches offered when the remote can't be queried, and listed first
/// when it can.
pub const DEFAULT_REVISIONS: [&str; 2] = ["fp16", "main"];

/// Deduplicates `branches`, putting the default revisions first in their
/// fixed order and the rest in lexicographic order.
pub fn sort_branches<I, S>(branches: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut unsorted: BTreeSet<String> = branches.into_iter().map(Into::into).collect();
    let mut sorted = Vec::with_capacity(unsorted.len());

    for branch in DEFAULT_REVISIONS {
        if unsorted.remove(branch) {
            sorted.push(branch.to_string());
        }
    }
    sorted.extend(unsorted);
    sorted
}

/// Branches of `repo`, sorted, falling back to the default revisions when
/// the remote can't be listed (bad credentials, no network, ...).
pub fn compute_revisions(
    git: &Git,
    repo: Result<String>,
    credentials: Option<&Credentials>,
) -> Vec<String> {
    let branches = repo.and_then(|repo| git.get_branches(&repo, credentials));
    match branches {
        Ok(branches) => sort_branches(branches),
        Err(err) => {
            tracing::error!(
                "Unable to get Git revisions dynamically. Falling back to the default revisions: {err}"
            );
            sort_branches(DEFAULT_REVISIONS)
        }
    }
}
