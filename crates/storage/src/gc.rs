//! Pure selection logic shared by both backends' garbage collectors.

use std::collections::HashSet;

use shared::domain::DismissAction;

/// Stored ids that are neither reserved nor accessible from a live session.
pub fn collectable_content_ids<'a>(
    stored_ids: impl IntoIterator<Item = &'a String>,
    reserved_ids: &HashSet<String>,
    accessible_ids: &HashSet<String>,
) -> Vec<String> {
    stored_ids
        .into_iter()
        .filter(|id| !reserved_ids.contains(*id) && !accessible_ids.contains(*id))
        .cloned()
        .collect()
}

/// Actions whose target content is no longer valid.
pub fn invalid_actions(actions: &[DismissAction], valid_ids: &[String]) -> Vec<DismissAction> {
    let valid: HashSet<&str> = valid_ids.iter().map(String::as_str).collect();
    actions
        .iter()
        .filter(|action| !valid.contains(action.content_id.as_str()))
        .cloned()
        .collect()
}
