/// Reader 持有的密文累积缓冲。
///
/// - **契约 (What)**：未读数据始终位于 `data[pos..]`；追加前先压缩到起始位置，
///   容量只增不减，不足时按倍数扩容直到容纳新数据。
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl ReadBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.max(1)),
            pos: 0,
        }
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.compact();
        let required = self.data.len() + bytes.len();
        let mut capacity = self.data.capacity().max(1);
        while capacity < required {
            capacity = capacity.saturating_mul(2);
        }
        if capacity > self.data.capacity() {
            self.data.reserve_exact(capacity - self.data.len());
        }
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn unread(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
        if self.pos == self.data.len() {
            self.data.clear();
            self.pos = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// 丢弃未读数据，容量保留。
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }
}
