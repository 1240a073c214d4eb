use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Pre-assigned event ID for one part of a remote message in a room.
///
/// The same inputs always give the same ID, so a batch that is converted twice
/// carries identical IDs and relations between its events stay valid.
pub fn deterministic_event_id(
    room_id: &str,
    remote_message_id: &str,
    part_name: &str,
    server_name: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{room_id}/ferry/{remote_message_id}/{part_name}"));
    let digest = hasher.finalize();
    format!("${}:{}", URL_SAFE_NO_PAD.encode(digest), server_name)
}
