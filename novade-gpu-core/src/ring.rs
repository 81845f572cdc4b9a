//! Fixed-order rotation over a cohort of same-lifetime objects.
//!
//! Used for a queue's command-buffer slots, a pipeline's descriptor-set
//! generations and a render pass's framebuffer cache. Items are addressed by
//! stable indices and never removed; the ring only appends. There is no
//! overflow detection: handing out a slot again after a full lap is the
//! caller's contract to keep (see the frame fence in `sync`).

use std::ops::Range;

#[derive(Debug)]
pub struct Ring<T> {
    label: &'static str,
    items: Vec<T>,
    cursor: usize,
    laps: u64,
}

impl<T> Ring<T> {
    pub fn new(label: &'static str, items: Vec<T>) -> Self {
        Self {
            label,
            items,
            cursor: 0,
            laps: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index the next call to [`Ring::next_index`] will return.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of completed trips around the ring.
    pub fn laps(&self) -> u64 {
        self.laps
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Item under the cursor, without moving it.
    pub fn current(&self) -> Option<&T> {
        self.items.get(self.cursor)
    }

    /// Moves the cursor one step forward, wrapping at the end.
    pub fn advance(&mut self) {
        if self.items.is_empty() {
            return;
        }
        self.cursor += 1;
        if self.cursor == self.items.len() {
            self.cursor = 0;
            self.laps += 1;
            tracing::trace!(ring = self.label, laps = self.laps, "ring wrapped");
        }
    }

    /// Returns the index under the cursor and then advances past it.
    pub fn next_index(&mut self) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }
        let index = self.cursor;
        self.advance();
        Some(index)
    }

    /// Returns the item under the cursor and then advances past it.
    pub fn next(&mut self) -> Option<&T> {
        let index = self.next_index()?;
        self.items.get(index)
    }

    /// Appends `items` and moves the cursor to the first appended one.
    /// Existing entries keep their indices.
    pub fn append(&mut self, items: impl IntoIterator<Item = T>) -> Range<usize> {
        let start = self.items.len();
        self.items.extend(items);
        let end = self.items.len();
        if end > start {
            self.cursor = start;
        }
        start..end
    }

    /// Consumes the ring, yielding items in index order.
    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(8)]
    fn next_index_round_robin(#[case] n: usize) {
        let mut ring = Ring::new("test", (0..n).collect::<Vec<_>>());
        let first_lap: Vec<usize> = (0..n).map(|_| ring.next_index().unwrap()).collect();
        assert_eq!(first_lap, (0..n).collect::<Vec<_>>());
        // The (n+1)th call returns the same slot as the first.
        assert_eq!(ring.next_index(), Some(0));
        assert_eq!(ring.laps(), 1);
    }

    #[test]
    fn advance_then_current() {
        let mut ring = Ring::new("gen", vec!['a', 'b']);
        assert_eq!(ring.current(), Some(&'a'));
        ring.advance();
        assert_eq!(ring.current(), Some(&'b'));
        ring.advance();
        assert_eq!(ring.current(), Some(&'a'));
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let mut ring: Ring<u32> = Ring::new("empty", Vec::new());
        assert_eq!(ring.next_index(), None);
        assert_eq!(ring.next(), None);
        ring.advance();
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn append_keeps_indices_and_moves_cursor() {
        let mut ring = Ring::new("fb", vec![10, 11]);
        ring.advance();
        let added = ring.append([20, 21, 22]);
        assert_eq!(added, 2..5);
        assert_eq!(ring.get(0), Some(&10));
        assert_eq!(ring.next(), Some(&20));
        assert_eq!(ring.next(), Some(&21));
        assert_eq!(ring.next(), Some(&22));
        assert_eq!(ring.next(), Some(&10));
    }
}
