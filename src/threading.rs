//! Reply-graph threading.
//!
//! Partitions one batch of messages into conversation groups keyed by the
//! earliest ancestor each message names, whether or not that ancestor is
//! part of the batch.

use std::collections::{HashMap, HashSet};

use crate::model::message::MessageRecord;
use crate::model::thread::ThreadGroup;

/// Group a batch of messages into threads.
///
/// Groups are ordered by their earliest member; members are ordered by date
/// (stable on input order).
pub fn resolve_threads(messages: Vec<MessageRecord>) -> Vec<ThreadGroup> {
    if messages.is_empty() {
        return Vec::new();
    }

    let roots: Vec<String> = {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(messages.len());
        for (i, msg) in messages.iter().enumerate() {
            index.entry(msg.message_id.as_str()).or_insert(i);
        }

        let mut memo: HashMap<usize, String> = HashMap::with_capacity(messages.len());
        (0..messages.len())
            .map(|i| resolve_root(i, &messages, &index, &mut memo))
            .collect()
    };

    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<ThreadGroup> = Vec::new();
    for (msg, root) in messages.into_iter().zip(roots) {
        let slot = *slots.entry(root.clone()).or_insert_with(|| {
            groups.push(ThreadGroup {
                root_id: root,
                members: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].members.push(msg);
    }

    for group in &mut groups {
        group.members.sort_by_key(|m| m.date);
    }
    groups.sort_by_key(|g| g.members.first().map(|m| m.date));

    groups
}

/// Nearest id this message claims as an ancestor.
///
/// References come first (oldest ancestor first), then In-Reply-To; the
/// message's own id never counts.
pub fn candidate_ancestor(msg: &MessageRecord) -> Option<&str> {
    msg.references
        .iter()
        .map(String::as_str)
        .chain(msg.in_reply_to.as_deref())
        .find(|id| !id.is_empty() && *id != msg.message_id)
}

/// Walk ancestors until a memoized root, a message without ancestors, or an
/// id outside the batch. Every message on the walk gets the same root.
///
/// On a cycle, the message whose ancestor is already on the walk becomes the root.
fn resolve_root(
    start: usize,
    messages: &[MessageRecord],
    index: &HashMap<&str, usize>,
    memo: &mut HashMap<usize, String>,
) -> String {
    let mut path: Vec<usize> = Vec::new();
    let mut on_path: HashSet<usize> = HashSet::new();
    let mut current = start;

    let root = loop {
        if let Some(root) = memo.get(&current) {
            break root.clone();
        }
        if !on_path.insert(current) {
            let last = path.last().copied().unwrap_or(current);
            break messages[last].message_id.clone();
        }
        path.push(current);

        match candidate_ancestor(&messages[current]) {
            None => break messages[current].message_id.clone(),
            Some(ancestor) => match index.get(ancestor) {
                Some(&next) => current = next,
                None => break ancestor.to_string(),
            },
        }
    };

    for i in path {
        memo.insert(i, root.clone());
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::address::EmailAddress;
    use chrono::{DateTime, TimeZone, Utc};

    fn make_record(
        message_id: &str,
        in_reply_to: Option<&str>,
        references: Vec<&str>,
        date: DateTime<Utc>,
    ) -> MessageRecord {
        MessageRecord {
            message_id: message_id.to_string(),
            in_reply_to: in_reply_to.map(String::from),
            references: references.into_iter().map(String::from).collect(),
            raw_subject: format!("Re: about {message_id}"),
            subject: format!("about {message_id}"),
            from: EmailAddress {
                display_name: String::new(),
                address: format!("{}@example.com", message_id.replace('@', ".")),
            },
            date,
            body: String::new(),
            transfer_encoding: Default::default(),
            has_patch: false,
            patch_status: None,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 4, hour, 0, 0).unwrap()
    }

    fn ids(group: &ThreadGroup) -> Vec<&str> {
        group.members.iter().map(|m| m.message_id.as_str()).collect()
    }

    #[test]
    fn test_empty_batch() {
        assert!(resolve_threads(Vec::new()).is_empty());
    }

    #[test]
    fn test_simple_reply_chain() {
        let groups = resolve_threads(vec![
            make_record("m3@x", Some("m2@x"), vec![], at(12)),
            make_record("m1@x", None, vec![], at(10)),
            make_record("m2@x", Some("m1@x"), vec![], at(11)),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].root_id, "m1@x");
        assert_eq!(ids(&groups[0]), vec!["m1@x", "m2@x", "m3@x"]);
    }

    #[test]
    fn test_absent_ancestor_merges_siblings() {
        // m1 is not in this batch; both replies must still share a group
        let groups = resolve_threads(vec![
            make_record("m2@x", Some("m1@x"), vec!["m1@x"], at(11)),
            make_record("m3@x", Some("m2@x"), vec!["m1@x", "m2@x"], at(12)),
            make_record("m4@x", Some("m1@x"), vec![], at(13)),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].root_id, "m1@x");
        assert_eq!(groups[0].members.len(), 3);
    }

    #[test]
    fn test_absent_ancestor_through_in_batch_parent() {
        let groups = resolve_threads(vec![
            make_record("m2@x", Some("m1@x"), vec![], at(11)),
            make_record("m3@x", Some("m2@x"), vec![], at(12)),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].root_id, "m1@x");
    }

    #[test]
    fn test_references_take_precedence_over_in_reply_to() {
        let msg = make_record("m3@x", Some("m2@x"), vec!["m1@x", "m2@x"], at(12));
        assert_eq!(candidate_ancestor(&msg), Some("m1@x"));
    }

    #[test]
    fn test_self_reference_is_root() {
        let msg = make_record("m1@x", Some("m1@x"), vec!["m1@x"], at(10));
        assert_eq!(candidate_ancestor(&msg), None);
        let groups = resolve_threads(vec![msg]);
        assert_eq!(groups[0].root_id, "m1@x");
    }

    #[test]
    fn test_cycle_is_broken() {
        let groups = resolve_threads(vec![
            make_record("a@x", Some("b@x"), vec![], at(10)),
            make_record("b@x", Some("a@x"), vec![], at(11)),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 2);
        assert_eq!(groups[0].root_id, "b@x");
    }

    #[test]
    fn test_independent_threads_ordered_by_earliest() {
        let groups = resolve_threads(vec![
            make_record("late@x", None, vec![], at(15)),
            make_record("early@x", None, vec![], at(9)),
            make_record("reply@x", Some("late@x"), vec![], at(10)),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].root_id, "early@x");
        assert_eq!(groups[1].root_id, "late@x");
        // The reply predates its parent; members are still date-ordered
        assert_eq!(ids(&groups[1]), vec!["reply@x", "late@x"]);
    }
}
