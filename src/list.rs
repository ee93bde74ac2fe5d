//! Circular line lists, kept as (head, tail, len) triples over arena
//! handles. The successor of each node lives inside the line itself, so
//! splicing is O(1) and walking a list touches every member line.

use std::collections::HashSet;

use crate::error::ListError;
use crate::line::{LineArena, LineHandle};

#[derive(Clone, Default, Debug)]
pub struct LineList {
    head: Option<LineHandle>,
    tail: Option<LineHandle>,
    len: usize,
}

impl LineList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<LineHandle> {
        self.head
    }

    /// Append one node, closing the ring back to the head.
    pub fn push_back(&mut self, arena: &mut LineArena, h: LineHandle) {
        match self.tail {
            Some(t) => arena.set_next(t, Some(h)),
            None => self.head = Some(h),
        }
        self.tail = Some(h);
        self.len += 1;
        arena.set_next(h, self.head);
    }

    /// Splice a whole list onto the back in O(1).
    pub fn append(&mut self, arena: &mut LineArena, other: LineList) {
        let (Some(other_head), Some(other_tail)) = (other.head, other.tail) else {
            return;
        };
        match self.tail {
            Some(t) => arena.set_next(t, Some(other_head)),
            None => self.head = Some(other_head),
        }
        self.tail = Some(other_tail);
        self.len += other.len;
        arena.set_next(other_tail, self.head);
    }

    pub fn pop_front(&mut self, arena: &mut LineArena) -> Option<LineHandle> {
        let h = self.head?;
        let next = arena.next_of(h);
        if next == Some(h) || next.is_none() {
            self.head = None;
            self.tail = None;
        } else {
            self.head = next;
            arena.set_next(self.tail.unwrap(), next);
        }
        arena.set_next(h, None);
        self.len -= 1;
        Some(h)
    }

    /// Split into `n` interleaved sub-lists: node `i` goes to list `i mod n`.
    /// Cooperating walkers each get an interleaved subset, maximizing the
    /// number of outstanding fills across the covered sets.
    pub fn partition(mut self, arena: &mut LineArena, n: usize) -> Vec<LineList> {
        assert!(n >= 1, "partition count must be at least 1");
        let mut parts = vec![LineList::new(); n];
        let mut pos = 0;
        while let Some(h) = self.pop_front(arena) {
            parts[pos].push_back(arena, h);
            pos = (pos + 1) % n;
        }
        parts
    }

    /// Walk the ring once, checking uniqueness, length and that no member
    /// line's physical address moved.
    pub fn validate(&self, arena: &mut LineArena) -> Result<(), ListError> {
        let Some(head) = self.head else {
            return Ok(());
        };
        let mut seen = HashSet::new();
        let mut count = 0usize;
        let mut cur = head;
        loop {
            arena.validate_physical(cur)?;
            seen.insert(cur);
            count += 1;
            match arena.next_of(cur) {
                Some(next) => cur = next,
                None => {
                    return Err(ListError::LengthMismatch {
                        expected: self.len,
                        found: count,
                    })
                }
            }
            if cur == head {
                break;
            }
            if count > self.len {
                break;
            }
        }
        if count != seen.len() {
            return Err(ListError::Duplicates {
                len: count,
                unique: seen.len(),
            });
        }
        if count != self.len {
            return Err(ListError::LengthMismatch {
                expected: self.len,
                found: count,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::translate::IdentityTranslator;

    fn arena_with(n: usize) -> (LineArena, Vec<LineHandle>) {
        let mut arena =
            LineArena::new(64, 8, 256 * PAGE_SIZE, Box::new(IdentityTranslator)).unwrap();
        let handles = (0..n).map(|_| arena.allocate().unwrap()).collect();
        (arena, handles)
    }

    fn build_list(arena: &mut LineArena, handles: &[LineHandle]) -> LineList {
        let mut list = LineList::new();
        for &h in handles {
            list.push_back(arena, h);
        }
        list
    }

    #[test]
    fn ring_closes_back_to_front() {
        let (mut arena, handles) = arena_with(5);
        let list = build_list(&mut arena, &handles);
        assert_eq!(list.len(), 5);
        let head = list.front().unwrap();
        let mut cur = head;
        for _ in 0..5 {
            cur = arena.next_of(cur).unwrap();
        }
        assert_eq!(cur, head);
        list.validate(&mut arena).unwrap();
    }

    #[test]
    fn pop_front_keeps_the_ring_closed() {
        let (mut arena, handles) = arena_with(3);
        let mut list = build_list(&mut arena, &handles);
        assert_eq!(list.pop_front(&mut arena), Some(handles[0]));
        assert_eq!(list.len(), 2);
        list.validate(&mut arena).unwrap();
        assert_eq!(list.pop_front(&mut arena), Some(handles[1]));
        assert_eq!(list.pop_front(&mut arena), Some(handles[2]));
        assert_eq!(list.pop_front(&mut arena), None);
        assert!(list.is_empty());
    }

    #[test]
    fn append_merges_tails() {
        let (mut arena, handles) = arena_with(6);
        let mut a = build_list(&mut arena, &handles[..2]);
        let b = build_list(&mut arena, &handles[2..]);
        a.append(&mut arena, b);
        assert_eq!(a.len(), 6);
        a.validate(&mut arena).unwrap();
        // Order is concatenation order.
        let mut cur = a.front().unwrap();
        for &h in &handles {
            assert_eq!(cur, h);
            cur = arena.next_of(cur).unwrap();
        }
    }

    #[test]
    fn partition_round_robins_and_conserves_lines() {
        let (mut arena, handles) = arena_with(240);
        let list = build_list(&mut arena, &handles);
        let parts = list.partition(&mut arena, 12);
        assert_eq!(parts.len(), 12);
        let mut seen = HashSet::new();
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.len(), 20);
            part.validate(&mut arena).unwrap();
            let mut cur = part.front().unwrap();
            for k in 0..part.len() {
                // Node j of partition i is original node i + 12*k.
                assert_eq!(cur, handles[i + 12 * k]);
                seen.insert(cur);
                cur = arena.next_of(cur).unwrap();
            }
        }
        assert_eq!(seen.len(), 240);
    }

    #[test]
    fn uneven_partition_sizes_differ_by_at_most_one() {
        let (mut arena, handles) = arena_with(10);
        let list = build_list(&mut arena, &handles);
        let parts = list.partition(&mut arena, 4);
        let sizes: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
    }

    #[test]
    fn reconcatenating_partitions_preserves_the_invariant() {
        let (mut arena, handles) = arena_with(240);
        let list = build_list(&mut arena, &handles);
        let parts = list.partition(&mut arena, 12);
        let mut merged = LineList::new();
        for part in parts {
            merged.append(&mut arena, part);
        }
        assert_eq!(merged.len(), 240);
        merged.validate(&mut arena).unwrap();
    }
}
