use std::collections::{HashMap, HashSet};

use studyhub_store::{MessageId, MessageRecord};

use super::message::{Message, MessageStatus};

/// Merges the local optimistic view with a store snapshot into one ordered,
/// de-duplicated view.
///
/// Messages are keyed by id. Confirmed store order comes first; local
/// messages the store has not reflected yet follow in their insertion order.
/// Where both sides hold an id, the confirmed store copy wins, except that a
/// copy the view already finalized is never regressed by a stale echo: the
/// later timestamp wins, and a store copy with no timestamp yet loses to a
/// finalized local copy.
pub fn merge_views(local: &[Message], remote: &[MessageRecord]) -> Vec<Message> {
    let local_by_id: HashMap<MessageId, &Message> = local
        .iter()
        .map(|message| (message.id, message))
        .collect();

    let mut merged = Vec::with_capacity(remote.len() + local.len());
    let mut reflected: HashSet<MessageId> = HashSet::with_capacity(remote.len());

    for record in remote {
        reflected.insert(record.id);
        match local_by_id.get(&record.id) {
            Some(local_message) if prefer_local(local_message, record) => {
                merged.push((*local_message).clone());
            }
            _ => merged.push(Message::from_record(record)),
        }
    }

    for message in local {
        if !reflected.contains(&message.id) {
            merged.push(message.clone());
        }
    }

    merged
}

fn prefer_local(local: &Message, remote: &MessageRecord) -> bool {
    // A placeholder still awaiting its content never outranks a confirmed
    // store copy carrying the same id.
    if local.status == MessageStatus::Pending {
        return false;
    }

    match (local.created_at_unix_millis, remote.created_at_unix_millis) {
        (Some(local_at), Some(remote_at)) => local_at > remote_at,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
