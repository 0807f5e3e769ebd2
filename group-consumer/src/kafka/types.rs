use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rdkafka::TopicPartitionList;

/// Identity of one ordered shard of a topic. Key for locating the owning worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Topic -> partition indices, as delivered by the group coordinator in
/// assign / revoke / lost events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPartitions(BTreeMap<String, BTreeSet<i32>>);

impl TopicPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for the common single-topic case.
    pub fn single(topic: &str, partitions: impl IntoIterator<Item = i32>) -> Self {
        let mut out = Self::new();
        for p in partitions {
            out.insert(topic, p);
        }
        out
    }

    pub fn insert(&mut self, topic: &str, partition: i32) {
        self.0.entry(topic.to_owned()).or_default().insert(partition);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    /// Total number of partitions across all topics
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.0
            .get(partition.topic())
            .is_some_and(|set| set.contains(&partition.partition_number()))
    }

    /// Partitions in (topic, index) order
    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        self.0
            .iter()
            .flat_map(|(topic, set)| set.iter().map(move |p| Partition::new(topic.as_str(), *p)))
    }
}

impl From<&TopicPartitionList> for TopicPartitions {
    fn from(list: &TopicPartitionList) -> Self {
        let mut out = Self::new();
        for elem in list.elements() {
            out.insert(elem.topic(), elem.partition());
        }
        out
    }
}

impl FromIterator<Partition> for TopicPartitions {
    fn from_iter<I: IntoIterator<Item = Partition>>(iter: I) -> Self {
        let mut out = Self::new();
        for p in iter {
            out.insert(p.topic(), p.partition_number());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Offset;

    #[test]
    fn test_partition_display() {
        assert_eq!(Partition::new("T", 3).to_string(), "T:3");
    }

    #[test]
    fn test_topic_partitions_from_list() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("topic-b", 1, Offset::Beginning)
            .unwrap();
        list.add_partition_offset("topic-a", 2, Offset::Beginning)
            .unwrap();
        list.add_partition_offset("topic-a", 0, Offset::Beginning)
            .unwrap();

        let tps = TopicPartitions::from(&list);
        assert_eq!(tps.len(), 3);
        assert!(tps.contains(&Partition::new("topic-a", 2)));
        assert!(!tps.contains(&Partition::new("topic-b", 0)));

        let ordered: Vec<Partition> = tps.partitions().collect();
        assert_eq!(
            ordered,
            vec![
                Partition::new("topic-a", 0),
                Partition::new("topic-a", 2),
                Partition::new("topic-b", 1),
            ]
        );
    }

    #[test]
    fn test_topic_partitions_dedup_and_empty() {
        let tps = TopicPartitions::single("T", [1, 1, 0]);
        assert_eq!(tps.len(), 2);
        assert!(TopicPartitions::new().is_empty());
        assert!(!tps.is_empty());
    }
}
