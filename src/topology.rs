use bytes::Bytes;
use kafka_protocol::{error::ResponseError, messages::TopicName, protocol::StrBytes};
use std::collections::VecDeque;

/// Byte length of the v2 record-batch header through the record count:
/// base offset (8) + batch length (4) + partition leader epoch (4) +
/// magic (1) + crc (4) + attributes (2) + last offset delta (4) +
/// base timestamp (8) + max timestamp (8) + producer id (8) +
/// producer epoch (2) + base sequence (4) + record count (4).
const RECORD_BATCH_HEADER_LEN: usize = 61;
const RECORD_BATCH_MAGIC_OFFSET: usize = 16;
const RECORD_BATCH_COUNT_OFFSET: usize = 57;

/// Default retention bounds for a partition log. Test logs are small; these
/// exist so a runaway producer cannot grow a partition without bound.
pub const DEFAULT_PARTITION_MAX_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_PARTITION_MAX_CNT: usize = 100_000;

/// A pre-serialized record batch, stored exactly as produced.
pub struct MessageSet {
    pub first_offset: i64,
    /// Last offset in the batch, inclusive.
    pub last_offset: i64,
    pub bytes: Bytes,
}

/// Latest committed offset for a consumer group on one partition.
pub struct CommittedOffset {
    pub group: String,
    pub offset: i64,
    pub metadata: Option<StrBytes>,
}

pub struct Partition {
    pub id: i32,

    /// Leader log start/end offsets. `end_offset` is the next offset to be
    /// assigned, one past the last stored record.
    pub start_offset: i64,
    pub end_offset: i64,
    /// Offsets exposed to clients fetching from the preferred follower.
    pub follower_start_offset: i64,
    pub follower_end_offset: i64,
    /// When set, the corresponding follower offset tracks the leader's.
    pub update_follower_start_offset: bool,
    pub update_follower_end_offset: bool,

    msgsets: VecDeque<MessageSet>,
    /// Total bytes across `msgsets`.
    pub size: usize,
    pub max_size: usize,
    pub max_cnt: usize,

    committed_offsets: Vec<CommittedOffset>,

    /// Broker id of the partition leader.
    pub leader: i32,
    /// Replica broker ids; always contains `leader`.
    pub replicas: Vec<i32>,
    /// Preferred read replica, or -1 when unset.
    pub follower_id: i32,
}

impl Partition {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            start_offset: 0,
            end_offset: 0,
            follower_start_offset: 0,
            follower_end_offset: 0,
            update_follower_start_offset: true,
            update_follower_end_offset: true,
            msgsets: VecDeque::new(),
            size: 0,
            max_size: DEFAULT_PARTITION_MAX_SIZE,
            max_cnt: DEFAULT_PARTITION_MAX_CNT,
            committed_offsets: Vec::new(),
            leader: -1,
            replicas: Vec::new(),
            follower_id: -1,
        }
    }

    pub fn msgset_cnt(&self) -> usize {
        self.msgsets.len()
    }

    /// Append a pre-serialized record batch and return its assigned base
    /// offset. The batch is stored intact; only the header is inspected to
    /// learn the record count.
    pub fn log_append(&mut self, bytes: Bytes) -> Result<i64, ResponseError> {
        let record_cnt = batch_record_count(&bytes).ok_or(ResponseError::InvalidRecord)?;

        let base_offset = self.end_offset;
        self.size += bytes.len();
        self.msgsets.push_back(MessageSet {
            first_offset: base_offset,
            last_offset: base_offset + record_cnt - 1,
            bytes,
        });
        self.end_offset += record_cnt;
        if self.update_follower_end_offset {
            self.follower_end_offset = self.end_offset;
        }

        // Retention: drop oldest msgsets until both bounds hold again.
        while self.size > self.max_size || self.msgsets.len() > self.max_cnt {
            let dropped = self
                .msgsets
                .pop_front()
                .expect("retention loop runs only while msgsets is non-empty");
            self.size -= dropped.bytes.len();
            self.start_offset = dropped.last_offset + 1;
            if self.update_follower_start_offset {
                self.follower_start_offset = self.start_offset;
            }
        }

        Ok(base_offset)
    }

    /// Locate the stored msgset containing `offset`, validated against the
    /// leader or follower offset range.
    pub fn msgset_find(&self, offset: i64, on_follower: bool) -> Option<&MessageSet> {
        let (start, end) = self.visible_offsets(on_follower);
        if offset < start || offset >= end {
            return None;
        }
        self.msgsets
            .iter()
            .find(|m| offset >= m.first_offset && offset <= m.last_offset)
    }

    /// Msgsets from the one containing `offset` onward, bounded by the
    /// follower end offset when fetching from a follower.
    pub fn msgsets_from(&self, offset: i64, on_follower: bool) -> impl Iterator<Item = &MessageSet> {
        let (_, end) = self.visible_offsets(on_follower);
        self.msgsets
            .iter()
            .skip_while(move |m| m.last_offset < offset)
            .take_while(move |m| m.first_offset < end)
    }

    /// The (start, end) offset range visible to a leader or follower fetch.
    pub fn visible_offsets(&self, on_follower: bool) -> (i64, i64) {
        if on_follower {
            (self.follower_start_offset, self.follower_end_offset)
        } else {
            (self.start_offset, self.end_offset)
        }
    }

    /// Upsert the committed offset for `group`.
    pub fn commit_offset(&mut self, group: &str, offset: i64, metadata: Option<StrBytes>) {
        match self.committed_offsets.iter_mut().find(|c| c.group == group) {
            Some(entry) => {
                entry.offset = offset;
                entry.metadata = metadata;
            }
            None => self.committed_offsets.push(CommittedOffset {
                group: group.to_string(),
                offset,
                metadata,
            }),
        }
    }

    pub fn committed_offset_find(&self, group: &str) -> Option<&CommittedOffset> {
        self.committed_offsets.iter().find(|c| c.group == group)
    }
}

pub struct Topic {
    pub name: TopicName,
    pub partitions: Vec<Partition>,
    /// Sticky error returned for all protocol requests touching this topic.
    pub err: Option<i16>,
}

impl Topic {
    pub fn new(name: TopicName, partition_cnt: i32) -> Self {
        Self {
            name,
            partitions: (0..partition_cnt).map(Partition::new).collect(),
            err: None,
        }
    }

    pub fn partition(&self, id: i32) -> Option<&Partition> {
        self.partitions.get(usize::try_from(id).ok()?)
    }

    pub fn partition_mut(&mut self, id: i32) -> Option<&mut Partition> {
        self.partitions.get_mut(usize::try_from(id).ok()?)
    }
}

/// Record count of a v2 record batch, or `None` if the header is not a
/// parseable v2 batch.
fn batch_record_count(batch: &Bytes) -> Option<i64> {
    if batch.len() < RECORD_BATCH_HEADER_LEN {
        return None;
    }
    if batch[RECORD_BATCH_MAGIC_OFFSET] != 2 {
        return None;
    }
    let cnt = i32::from_be_bytes(
        batch[RECORD_BATCH_COUNT_OFFSET..RECORD_BATCH_COUNT_OFFSET + 4]
            .try_into()
            .expect("slice is exactly four bytes"),
    );
    (cnt > 0).then_some(cnt as i64)
}
