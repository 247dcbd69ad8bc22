use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct RingLog {
    // cursors are sequence numbers, compared by wrapping distance
    slots: Vec<Option<String>>,
    write_pos: u64,
    read_pos: u64,
    rewind_mark: u64,
}

impl Default for RingLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl RingLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            write_pos: 0,
            read_pos: 0,
            rewind_mark: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn write(&mut self, text: impl Into<String>) {
        let capacity = self.slots.len() as u64;
        let slot = self.slot(self.write_pos);
        self.slots[slot] = Some(text.into());
        self.write_pos = self.write_pos.wrapping_add(1);

        let oldest = self.write_pos.wrapping_sub(capacity);
        if self.write_pos.wrapping_sub(self.read_pos) > capacity {
            self.read_pos = oldest;
        }
        if self.write_pos.wrapping_sub(self.rewind_mark) > capacity {
            self.rewind_mark = oldest;
        }
    }

    pub fn read(&mut self) -> Option<String> {
        if self.read_pos == self.write_pos {
            return None;
        }
        let entry = self.slots[self.slot(self.read_pos)].clone();
        self.read_pos = self.read_pos.wrapping_add(1);
        entry
    }

    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.unread());
        while let Some(line) = self.read() {
            lines.push(line);
        }
        lines
    }

    pub fn rewind(&mut self) {
        self.read_pos = self.rewind_mark;
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.write_pos = 0;
        self.read_pos = 0;
        self.rewind_mark = 0;
    }

    pub fn len(&self) -> usize {
        self.write_pos.min(self.slots.len() as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.write_pos == 0
    }

    pub fn unread(&self) -> usize {
        self.write_pos.wrapping_sub(self.read_pos) as usize
    }

    fn slot(&self, seq: u64) -> usize {
        (seq % self.slots.len() as u64) as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedLog(Arc<Mutex<RingLog>>);

impl SharedLog {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(RingLog::with_capacity(capacity))))
    }

    pub fn record(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("{text}");
        self.lock().write(text);
    }

    pub fn drain(&self) -> Vec<String> {
        self.lock().drain()
    }

    pub fn replay(&self) -> Vec<String> {
        let mut log = self.lock();
        log.rewind();
        log.drain()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn unread(&self) -> usize {
        self.lock().unread()
    }

    fn lock(&self) -> MutexGuard<'_, RingLog> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
