//! Inbound request preparation
//!
//! Runs once per request before the first round: attachment notes are
//! added to every turn that carries files, files on the latest turn are
//! copied into the user's area, and stale image links are stripped from
//! earlier replies.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use super::AgentError;
use crate::fetch::Fetcher;
use crate::protocol::Turn;
use crate::storage::PersistentArea;

lazy_static! {
    static ref IMAGE_LINK: Regex = Regex::new(r"!\[[^\]]*\]\(https?://[^)\s]*\)")
        .expect("failed to compile image link pattern");
}

/// Sentence appended to a turn for each of its attachments
pub fn attachment_note(name: &str) -> String {
    format!("\n\nThe user has provided {} in the current directory.", name)
}

/// Note every attachment in the content of the turn that carries it
pub fn annotate_attachments(conversation: &mut [Turn]) {
    for turn in conversation.iter_mut() {
        for attachment in &turn.attachments {
            turn.content.push_str(&attachment_note(&attachment.name));
        }
    }
}

/// Remove markdown image references to http(s) URLs from every turn.
///
/// Returns the number of links removed.
pub fn redact_image_links(conversation: &mut [Turn]) -> usize {
    let mut removed = 0;
    for turn in conversation.iter_mut() {
        let count = IMAGE_LINK.find_iter(&turn.content).count();
        if count > 0 {
            turn.content = IMAGE_LINK.replace_all(&turn.content, "").into_owned();
            removed += count;
        }
    }
    removed
}

/// Copy the attachments of the latest turn into the user's area.
///
/// Any failure aborts the request. Returns the stored file names.
pub async fn download_attachments(
    conversation: &[Turn],
    area: &dyn PersistentArea,
    fetcher: &dyn Fetcher,
) -> Result<Vec<String>, AgentError> {
    let Some(last) = conversation.last() else {
        return Ok(Vec::new());
    };

    let mut stored = Vec::with_capacity(last.attachments.len());
    for attachment in &last.attachments {
        debug!(name = %attachment.name, url = %attachment.url, "Downloading attachment");
        let fetched = fetcher.fetch(&attachment.url).await?;
        let size = fetched.bytes.len();
        area.put(&attachment.name, fetched.bytes).await?;
        info!(name = %attachment.name, size, volume = %area.name(), "Stored attachment");
        stored.push(attachment.name.clone());
    }
    Ok(stored)
}
