//! # Flow buffer
//!
//! Buffers a flow's packets so that a pattern can be searched for, removed,
//! or replaced as if the flow were one contiguous byte stream, even when the
//! pattern straddles a packet boundary.
//!
//! Each buffered packet remembers the sequence number of its first byte so
//! that a caller performing a removal/replacement can translate the edit
//! into an absolute position for the
//! [`ModificationList`](crate::modlist::ModificationList).

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use mbox_wire::Seq32;

struct FlowPacket {
    seq: Seq32,
    data: BytesMut,
}

/// A byte position inside the buffer, as `(packet_index, offset_in_packet)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentPosition {
    pub packet_index: usize,
    pub offset: usize,
}

/// Result of searching for a pattern across the buffered packets.
///
/// `Inconclusive` means the pattern was not found but could still match if
/// more data were appended — the tail of the buffer is a prefix of the
/// pattern — so the caller should hold off deciding until another packet
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(ContentPosition),
    NotFound,
    Inconclusive,
}

/// The outcome of an edit: the absolute sequence position of the edit and
/// the byte offset it introduces (negative for a removal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditRecord {
    pub first_position: Seq32,
    pub position: Seq32,
    pub offset: i32,
}

#[derive(Default)]
pub struct FlowBuffer {
    packets: VecDeque<FlowPacket>,
}

impl FlowBuffer {
    pub fn new() -> Self {
        FlowBuffer::default()
    }

    pub fn enqueue(&mut self, seq: Seq32, data: Bytes) {
        self.packets.push_back(FlowPacket {
            seq,
            data: BytesMut::from(&data[..]),
        });
    }

    pub fn dequeue(&mut self) -> Option<(Seq32, Bytes)> {
        self.packets.pop_front().map(|p| (p.seq, p.data.freeze()))
    }

    pub fn dequeue_all(&mut self) -> Vec<(Seq32, Bytes)> {
        self.packets.drain(..).map(|p| (p.seq, p.data.freeze())).collect()
    }

    /// Dequeue every packet strictly before `position`.
    pub fn dequeue_up_to(&mut self, position: ContentPosition) -> Vec<(Seq32, Bytes)> {
        let n = position.packet_index.min(self.packets.len());
        self.packets.drain(..n).map(|p| (p.seq, p.data.freeze())).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    fn total_len_from(&self, pos: ContentPosition) -> usize {
        if pos.packet_index >= self.packets.len() {
            return 0;
        }
        let mut total = self.packets[pos.packet_index].data.len() - pos.offset;
        for p in self.packets.iter().skip(pos.packet_index + 1) {
            total += p.data.len();
        }
        total
    }

    fn byte_at(&self, pos: ContentPosition) -> Option<u8> {
        self.packets.get(pos.packet_index)?.data.get(pos.offset).copied()
    }

    fn advance(&self, mut pos: ContentPosition) -> Option<ContentPosition> {
        pos.offset += 1;
        while let Some(pkt) = self.packets.get(pos.packet_index) {
            if pos.offset < pkt.data.len() {
                return Some(pos);
            }
            pos.packet_index += 1;
            pos.offset = 0;
        }
        None
    }

    pub fn content_begin(&self) -> ContentPosition {
        ContentPosition {
            packet_index: 0,
            offset: 0,
        }
    }

    /// Search for `pattern` starting at `start`.
    pub fn search(&self, start: ContentPosition, pattern: &[u8]) -> (SearchResult, ContentPosition) {
        if pattern.is_empty() {
            return (SearchResult::Found(start), start);
        }
        let mut cursor = Some(start);
        while let Some(pos) = cursor {
            let mut probe = pos;
            let mut matched = 0;
            loop {
                if matched == pattern.len() {
                    return (SearchResult::Found(pos), pos);
                }
                match self.byte_at(probe) {
                    Some(b) if b == pattern[matched] => {
                        matched += 1;
                        match self.advance(probe) {
                            Some(next) => probe = next,
                            None => {
                                // Ran off the end of buffered data mid-match.
                                return (SearchResult::Inconclusive, pos);
                            }
                        }
                    }
                    Some(_) => break,
                    None => {
                        // Nothing buffered at all from `probe` onward.
                        if matched > 0 {
                            return (SearchResult::Inconclusive, pos);
                        }
                        break;
                    }
                }
            }
            cursor = self.advance(pos);
        }
        (SearchResult::NotFound, start)
    }

    /// Remove the first occurrence of `pattern`, producing an [`EditRecord`]
    /// the caller commits into a [`ModificationList`](crate::modlist::ModificationList).
    pub fn remove_in_flow(&mut self, pattern: &[u8]) -> (SearchResult, Option<EditRecord>) {
        let (result, pos) = self.search(self.content_begin(), pattern);
        let SearchResult::Found(pos) = result else {
            return (result, None);
        };
        let record = self.remove_at(pos, pattern.len());
        (SearchResult::Found(pos), Some(record))
    }

    /// Replace the first occurrence of `pattern` with `replacement`.
    pub fn replace_in_flow(
        &mut self,
        pattern: &[u8],
        replacement: &[u8],
    ) -> (SearchResult, Option<EditRecord>) {
        let (result, pos) = self.search(self.content_begin(), pattern);
        let SearchResult::Found(pos) = result else {
            return (result, None);
        };
        let removed = self.remove_at(pos, pattern.len());
        self.insert_at(pos, replacement);
        let record = EditRecord {
            first_position: removed.first_position,
            position: removed.position,
            offset: replacement.len() as i32 - pattern.len() as i32,
        };
        (SearchResult::Found(pos), Some(record))
    }

    fn absolute_seq(&self, pos: ContentPosition) -> Seq32 {
        let pkt = &self.packets[pos.packet_index];
        pkt.seq.add(pos.offset as u32)
    }

    fn remove_at(&mut self, start: ContentPosition, length: usize) -> EditRecord {
        let first_position = self.packets[start.packet_index].seq;
        let position = self.absolute_seq(start);
        let mut remaining = length;
        let mut idx = start.packet_index;
        let mut off = start.offset;

        while remaining > 0 {
            let Some(pkt) = self.packets.get_mut(idx) else { break };
            let avail = pkt.data.len() - off;
            let take = avail.min(remaining);
            pkt.data.copy_within(off + take.., off);
            pkt.data.truncate(pkt.data.len() - take);
            remaining -= take;
            if remaining > 0 {
                idx += 1;
                off = 0;
            }
        }

        EditRecord {
            first_position,
            position,
            offset: -(length as i32),
        }
    }

    fn insert_at(&mut self, pos: ContentPosition, data: &[u8]) {
        if let Some(pkt) = self.packets.get_mut(pos.packet_index) {
            let tail = pkt.data.split_off(pos.offset);
            pkt.data.extend_from_slice(data);
            pkt.data.unsplit(tail);
        }
    }

    /// 1 if the search was conclusive and something was decided, -1 if
    /// conclusively not found, 0 if inconclusive — mirrors the tri-state
    /// contract the search API exposes, for callers that prefer an integer.
    pub fn search_code(result: SearchResult) -> i32 {
        match result {
            SearchResult::Found(_) => 1,
            SearchResult::NotFound => -1,
            SearchResult::Inconclusive => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_within_single_packet() {
        let mut fb = FlowBuffer::new();
        fb.enqueue(Seq32::new(0), Bytes::from_static(b"hello world"));
        let (result, pos) = fb.search(fb.content_begin(), b"world");
        assert_eq!(result, SearchResult::Found(pos));
        assert_eq!(pos, ContentPosition { packet_index: 0, offset: 6 });
    }

    #[test]
    fn search_spanning_two_packets() {
        let mut fb = FlowBuffer::new();
        fb.enqueue(Seq32::new(0), Bytes::from_static(b"hel"));
        fb.enqueue(Seq32::new(3), Bytes::from_static(b"lo world"));
        let (result, _) = fb.search(fb.content_begin(), b"hello");
        assert_eq!(result, SearchResult::Found(ContentPosition { packet_index: 0, offset: 0 }));
    }

    #[test]
    fn search_not_found_is_conclusive_with_no_prefix_match() {
        let mut fb = FlowBuffer::new();
        fb.enqueue(Seq32::new(0), Bytes::from_static(b"hello world"));
        let (result, _) = fb.search(fb.content_begin(), b"xyz");
        assert_eq!(result, SearchResult::NotFound);
    }

    #[test]
    fn search_inconclusive_when_tail_is_a_prefix() {
        let mut fb = FlowBuffer::new();
        fb.enqueue(Seq32::new(0), Bytes::from_static(b"hello wor"));
        let (result, _) = fb.search(fb.content_begin(), b"world");
        assert_eq!(result, SearchResult::Inconclusive);
    }

    #[test]
    fn remove_in_flow_shrinks_packet_and_records_offset() {
        let mut fb = FlowBuffer::new();
        fb.enqueue(Seq32::new(100), Bytes::from_static(b"hello bad world"));
        let (result, record) = fb.remove_in_flow(b"bad ");
        assert!(matches!(result, SearchResult::Found(_)));
        let record = record.unwrap();
        assert_eq!(record.offset, -4);
        assert_eq!(record.position, Seq32::new(106));

        let (_, data) = fb.dequeue().unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[test]
    fn replace_in_flow_adjusts_length_and_offset() {
        let mut fb = FlowBuffer::new();
        fb.enqueue(Seq32::new(0), Bytes::from_static(b"foo bar baz"));
        let (result, record) = fb.replace_in_flow(b"bar", b"quux");
        assert!(matches!(result, SearchResult::Found(_)));
        assert_eq!(record.unwrap().offset, 1);

        let (_, data) = fb.dequeue().unwrap();
        assert_eq!(&data[..], b"foo quux baz");
    }
}
