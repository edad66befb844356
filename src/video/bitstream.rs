use super::{FrameSideData, FrameType};

/// One encoded access unit.
///
/// Payload bytes live in `buffer[offset..offset + length]`; `buffer.len()` is the
/// allocated capacity. Consuming bytes from the front only moves `offset`.
#[derive(Debug, Clone)]
pub struct BitstreamUnit {
    buffer: Vec<u8>,
    offset: usize,
    length: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub frame_type: FrameType,
    pub avg_qp: u32,
    pub frame_index: u64,
    side_data: Vec<FrameSideData>,
}

impl Default for BitstreamUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl BitstreamUnit {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            offset: 0,
            length: 0,
            pts: 0,
            dts: 0,
            duration: 0,
            frame_type: FrameType::P,
            avg_qp: 0,
            frame_index: 0,
            side_data: Vec::new(),
        }
    }

    pub fn from_slice(data: &[u8], pts: i64, dts: i64) -> Self {
        let mut unit = Self::with_capacity(data.len());
        unit.copy_from(data);
        unit.pts = pts;
        unit.dts = dts;
        unit
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.length]
    }

    pub fn size(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Drops `count` bytes from the front of the payload.
    pub fn add_offset(&mut self, count: usize) {
        let count = count.min(self.length);
        self.offset += count;
        self.length -= count;
        if self.length == 0 {
            self.offset = 0;
        }
    }

    /// Shrinks the payload, or grows it into already allocated space.
    pub fn set_size(&mut self, size: usize) -> bool {
        if self.offset + size > self.buffer.len() {
            return false;
        }
        self.length = size;
        true
    }

    /// Moves the payload to the start of the buffer.
    pub fn trim(&mut self) {
        if self.offset > 0 && self.length > 0 {
            self.buffer
                .copy_within(self.offset..self.offset + self.length, 0);
        }
        self.offset = 0;
    }

    /// Replaces the payload with `data`, growing the buffer if needed.
    pub fn copy_from(&mut self, data: &[u8]) {
        if self.buffer.len() < data.len() {
            self.buffer = vec![0; data.len()];
        }
        self.buffer[..data.len()].copy_from_slice(data);
        self.offset = 0;
        self.length = data.len();
    }

    /// Reallocates to `capacity` bytes, keeping as much payload as fits.
    pub fn change_size(&mut self, capacity: usize) {
        let keep = self.length.min(capacity);
        let mut resized = vec![0; capacity];
        resized[..keep].copy_from_slice(&self.buffer[self.offset..self.offset + keep]);
        self.buffer = resized;
        self.offset = 0;
        self.length = keep;
    }

    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let new_length = self.length + data.len();
        if self.buffer.len() < new_length {
            self.change_size(new_length.max(self.buffer.len() * 2));
        } else if self.buffer.len() < self.offset + new_length {
            self.trim();
        }
        let start = self.offset + self.length;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.length = new_length;
    }

    pub fn clear(&mut self) {
        self.offset = 0;
        self.length = 0;
        self.side_data.clear();
    }

    pub fn side_data(&self) -> &[FrameSideData] {
        &self.side_data
    }

    pub fn add_side_data(&mut self, item: FrameSideData) {
        self.side_data.push(item);
    }

    pub fn take_side_data(&mut self) -> Vec<FrameSideData> {
        std::mem::take(&mut self.side_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_after_trim_preserves_bytes() {
        let prefixes: [&[u8]; 3] = [b"", b"xy", b"header-bytes"];
        for prefix in prefixes {
            for consumed in 0..=prefix.len() {
                let mut unit = BitstreamUnit::from_slice(prefix, 0, 0);
                unit.add_offset(consumed);
                unit.trim();
                unit.append(b"abc");
                unit.append(b"defgh");
                let mut expected = prefix[consumed..].to_vec();
                expected.extend_from_slice(b"abcdefgh");
                assert_eq!(unit.data(), expected.as_slice());
                assert_eq!(unit.size(), expected.len());
                assert!(unit.offset() + unit.size() <= unit.capacity());
            }
        }
    }

    #[test]
    fn append_compacts_when_front_space_is_enough() {
        let mut unit = BitstreamUnit::with_capacity(8);
        unit.copy_from(b"12345678");
        unit.add_offset(6);
        unit.append(b"abcd");
        assert_eq!(unit.data(), b"78abcd");
        assert_eq!(unit.offset(), 0);
        assert_eq!(unit.capacity(), 8);
    }

    #[test]
    fn change_size_truncates_payload() {
        let mut unit = BitstreamUnit::from_slice(b"abcdef", 10, 9);
        unit.change_size(3);
        assert_eq!(unit.data(), b"abc");
        assert!(!unit.set_size(4));
        assert!(unit.set_size(2));
        assert_eq!(unit.data(), b"ab");
        assert_eq!(unit.pts, 10);
    }
}
