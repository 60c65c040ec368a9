//! Chunk groups: the unit of ordered delivery for the POST output queue.
//!
//! A batch of file changes flushed by a project's batcher is split into
//! chunks, and all chunks sharing one (project, batch-timestamp) form a chunk
//! group. Groups are drained strictly in ascending timestamp order: no chunk
//! of a later group is sent while an earlier group still has unsent or
//! unacknowledged chunks.

use std::collections::BTreeMap;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Available to be picked up by the next free worker.
    AvailableToSend,
    /// Currently being sent by a worker.
    WaitingForAck,
    /// Sent and acknowledged by the server.
    Complete,
}

/// A subset of a batch's change list, compressed into one POST body.
/// Immutable after construction. `group_id` is a weak back-reference to the
/// owning group, so a worker's completion can be routed home even after
/// other groups have been reordered ahead of it.
#[derive(Debug, Clone)]
pub struct PostQueueChunk {
    /// 1 <= chunk_id <= chunk_total
    pub chunk_id: usize,
    pub chunk_total: usize,
    pub base64_compressed: String,
    pub project_id: String,
    pub timestamp: i64,
    pub group_id: u64,
}

/// All chunks for a single (project, batch-timestamp).
#[derive(Debug)]
pub struct PostQueueChunkGroup {
    group_id: u64,
    chunk_map: BTreeMap<usize, PostQueueChunk>,
    chunk_status: BTreeMap<usize, ChunkStatus>,
    timestamp: i64,
}

impl PostQueueChunkGroup {
    pub fn new(
        group_id: u64,
        project_id: &str,
        timestamp: i64,
        base64_compressed: Vec<String>,
    ) -> Self {
        let total = base64_compressed.len();
        let mut chunk_map = BTreeMap::new();
        let mut chunk_status = BTreeMap::new();

        for (index, payload) in base64_compressed.into_iter().enumerate() {
            let chunk = PostQueueChunk {
                chunk_id: index + 1,
                chunk_total: total,
                base64_compressed: payload,
                project_id: project_id.to_string(),
                timestamp,
                group_id,
            };
            chunk_status.insert(chunk.chunk_id, ChunkStatus::AvailableToSend);
            chunk_map.insert(chunk.chunk_id, chunk);
        }

        Self {
            group_id,
            chunk_map,
            chunk_status,
            timestamp,
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn project_id(&self) -> Option<&str> {
        self.chunk_map
            .values()
            .next()
            .map(|chunk| chunk.project_id.as_str())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_map.len()
    }

    pub fn is_group_complete(&self) -> bool {
        self.chunk_status
            .values()
            .all(|status| *status == ChunkStatus::Complete)
    }

    /// Transition one available chunk to waiting and return it for sending.
    pub fn acquire_next_chunk_available_to_send(&mut self) -> Option<PostQueueChunk> {
        let id = self
            .chunk_status
            .iter()
            .find(|(_, status)| **status == ChunkStatus::AvailableToSend)
            .map(|(id, _)| *id)?;

        self.chunk_status.insert(id, ChunkStatus::WaitingForAck);
        self.chunk_map.get(&id).cloned()
    }

    pub fn inform_chunk_sent(&mut self, chunk_id: usize) {
        if self.chunk_status.get(&chunk_id) != Some(&ChunkStatus::WaitingForAck) {
            error!("Unexpected status of chunk, should be WAITING");
        }
        self.chunk_status.insert(chunk_id, ChunkStatus::Complete);
    }

    pub fn inform_chunk_failed_to_send(&mut self, chunk_id: usize) {
        if self.chunk_status.get(&chunk_id) != Some(&ChunkStatus::WaitingForAck) {
            error!("Unexpected status of chunk, should be WAITING");
        }
        self.chunk_status
            .insert(chunk_id, ChunkStatus::AvailableToSend);
    }
}

/// Chunk groups ordered ascending by batch timestamp. The sort is stable, so
/// groups sharing a timestamp keep insertion order. Owned and driven solely
/// by the output queue's dispatcher task.
#[derive(Debug, Default)]
pub struct ChunkGroupPriorityList {
    list: Vec<PostQueueChunkGroup>,
}

impl ChunkGroupPriorityList {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn add_to_list(&mut self, group: PostQueueChunkGroup) {
        self.list.push(group);
        if self.list.len() >= 2 {
            self.list.sort_by_key(|g| g.timestamp());
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn peek_mut(&mut self) -> Option<&mut PostQueueChunkGroup> {
        self.list.first_mut()
    }

    pub fn find_mut(&mut self, group_id: u64) -> Option<&mut PostQueueChunkGroup> {
        self.list.iter_mut().find(|g| g.group_id() == group_id)
    }

    pub fn pop(&mut self) -> Option<PostQueueChunkGroup> {
        if self.list.is_empty() {
            return None;
        }
        Some(self.list.remove(0))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostQueueChunkGroup> {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(timestamp: i64, payloads: usize) -> PostQueueChunkGroup {
        let payloads = (0..payloads).map(|i| format!("payload-{}", i)).collect();
        PostQueueChunkGroup::new(timestamp as u64, "proj", timestamp, payloads)
    }

    #[test]
    fn chunk_lifecycle() {
        let mut g = group(100, 2);
        assert!(!g.is_group_complete());

        let first = g.acquire_next_chunk_available_to_send().unwrap();
        assert_eq!(first.chunk_id, 1);
        assert_eq!(first.chunk_total, 2);

        let second = g.acquire_next_chunk_available_to_send().unwrap();
        assert_eq!(second.chunk_id, 2);

        // Everything is in flight now.
        assert!(g.acquire_next_chunk_available_to_send().is_none());

        g.inform_chunk_sent(first.chunk_id);
        assert!(!g.is_group_complete());

        // A failed chunk becomes available again.
        g.inform_chunk_failed_to_send(second.chunk_id);
        let retry = g.acquire_next_chunk_available_to_send().unwrap();
        assert_eq!(retry.chunk_id, 2);

        g.inform_chunk_sent(retry.chunk_id);
        assert!(g.is_group_complete());
    }

    #[test]
    fn priority_list_sorts_ascending_by_timestamp() {
        let mut list = ChunkGroupPriorityList::new();
        list.add_to_list(group(300, 1));
        list.add_to_list(group(100, 1));
        list.add_to_list(group(200, 1));

        assert_eq!(list.pop().unwrap().timestamp(), 100);
        assert_eq!(list.pop().unwrap().timestamp(), 200);
        assert_eq!(list.pop().unwrap().timestamp(), 300);
        assert!(list.pop().is_none());
    }

    #[test]
    fn priority_list_is_stable_for_equal_timestamps() {
        let mut list = ChunkGroupPriorityList::new();

        list.add_to_list(PostQueueChunkGroup::new(1, "first", 100, vec!["a".into()]));
        list.add_to_list(PostQueueChunkGroup::new(2, "second", 100, vec!["b".into()]));

        assert_eq!(list.pop().unwrap().project_id(), Some("first"));
        assert_eq!(list.pop().unwrap().project_id(), Some("second"));
    }
}
