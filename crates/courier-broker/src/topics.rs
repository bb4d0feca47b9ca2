use indexmap::{IndexMap, IndexSet};

/// Topic name to subscriber set.
///
/// Subscribers are stored by client *name*, never by handle, so session
/// records can move between connected and lost without touching the index.
/// Entries are created by the first subscriber and deleted with the last:
/// the index never holds an empty set.
#[derive(Debug, Default)]
pub struct TopicIndex {
    topics: IndexMap<String, IndexSet<String>>,
}

impl TopicIndex {
    pub fn add(&mut self, topic: &str, name: &str) {
        self.topics.entry(topic.to_owned()).or_default().insert(name.to_owned());
    }

    pub fn remove(&mut self, topic: &str, name: &str) {
        if let Some(set) = self.topics.get_mut(topic) {
            set.swap_remove(name);
            if set.is_empty() {
                self.topics.swap_remove(topic);
            }
        }
    }

    /// Subscribers of `topic`; empty for an unknown topic.
    pub fn subscribers(&self, topic: &str) -> impl Iterator<Item = &str> {
        self.topics.get(topic).into_iter().flatten().map(String::as_str)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_creates_topic() {
        let mut idx = TopicIndex::default();
        assert!(!idx.contains("t"));
        idx.add("t", "alice");
        assert!(idx.contains("t"));
        assert_eq!(idx.subscribers("t").collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn last_unsubscriber_deletes_topic() {
        let mut idx = TopicIndex::default();
        idx.add("t", "alice");
        idx.add("t", "bob");
        idx.remove("t", "alice");
        assert!(idx.contains("t"));
        idx.remove("t", "bob");
        assert!(!idx.contains("t"));
        assert!(idx.is_empty());
    }

    #[test]
    fn add_is_idempotent() {
        let mut idx = TopicIndex::default();
        idx.add("t", "alice");
        idx.add("t", "alice");
        assert_eq!(idx.subscribers("t").count(), 1);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut idx = TopicIndex::default();
        idx.remove("t", "nobody");
        idx.add("t", "alice");
        idx.remove("t", "nobody");
        assert_eq!(idx.subscribers("t").count(), 1);
    }

    #[test]
    fn unknown_topic_has_no_subscribers() {
        let idx = TopicIndex::default();
        assert_eq!(idx.subscribers("missing").count(), 0);
    }
}
