/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! The cell ring that backs the async log pipeline. Producers append into
//! `cells[curr]`; the writer thread drains `cells[persist]`. `persist` never
//! laps `curr`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Free,
    Full,
}

struct Cell {
    buf: Vec<u8>,
    used: usize,
    state: CellState,
}

impl Cell {
    fn new(capacity: usize) -> Self {
        Cell {
            buf: vec![0u8; capacity],
            used: 0,
            state: CellState::Free,
        }
    }

    fn room(&self) -> usize {
        self.buf.len() - self.used
    }

    fn push(&mut self, data: &[u8]) {
        debug_assert!(self.room() >= data.len());
        let end = self.used + data.len();
        self.buf[self.used..end].copy_from_slice(data);
        self.used = end;
    }
}

/// Outcome of [`Ring::append`].
#[derive(Debug, PartialEq, Eq)]
pub enum AppendResult {
    /// The line was appended. `signal_writer` is true when the ring had to
    /// roll over to a new current cell, meaning the writer should be woken
    /// so it can start draining the cell that was just sealed.
    Appended { signal_writer: bool },
    /// The line was dropped: either the ring is pinned against its 3 GiB
    /// ceiling with the writer still behind, or (the rare race) the current
    /// cell was somehow already FULL when entered.
    Dropped,
}

pub struct Ring {
    cells: Vec<Cell>,
    curr: usize,
    persist: usize,
    cell_capacity: usize,
    max_total_bytes: u64,
}

impl Ring {
    pub fn new(cell_capacity: usize, max_total_bytes: u64) -> Self {
        Ring {
            cells: vec![Cell::new(cell_capacity)],
            curr: 0,
            persist: 0,
            cell_capacity,
            max_total_bytes,
        }
    }

    fn total_bytes(&self) -> u64 {
        self.cells.len() as u64 * self.cell_capacity as u64
    }

    /// Appends one formatted log line, already truncated to the 4 KiB line
    /// cap. Three outcomes:
    /// 1. FREE with room → append in place.
    /// 2. FREE without room → seal, advance to a FREE neighbor, or splice a
    ///    fresh cell in (bounded by `max_total_bytes`), or drop.
    /// 3. Already FULL (the rare race) → drop.
    pub fn append(&mut self, line: &[u8]) -> AppendResult {
        if self.cells[self.curr].state == CellState::Full {
            return AppendResult::Dropped;
        }
        if self.cells[self.curr].room() >= line.len() {
            self.cells[self.curr].push(line);
            return AppendResult::Appended { signal_writer: false };
        }

        self.cells[self.curr].state = CellState::Full;
        let next = (self.curr + 1) % self.cells.len();
        if self.cells[next].state == CellState::Free {
            self.curr = next;
        } else if self.total_bytes() + self.cell_capacity as u64 <= self.max_total_bytes {
            let insert_at = self.curr + 1;
            self.cells.insert(insert_at, Cell::new(self.cell_capacity));
            if self.persist >= insert_at {
                self.persist += 1;
            }
            self.curr = insert_at;
        } else {
            return AppendResult::Dropped;
        }

        if self.cells[self.curr].room() < line.len() {
            // the line itself is larger than one cell; cells are sized in
            // tens of MiB against a 4 KiB line cap, so this is unreachable
            // in practice, kept only as a defensive drop.
            return AppendResult::Dropped;
        }
        self.cells[self.curr].push(line);
        AppendResult::Appended { signal_writer: true }
    }

    /// If the cell at `persist` has anything to drain, either already sealed
    /// FULL or still the live FREE cell that simply hasn't rolled over in a
    /// while, takes ownership of its bytes and installs a fresh FREE cell in
    /// its place, so producers never block on the writer. Rather than copy
    /// 30 MiB out from under a lock, this swaps the whole cell for an empty
    /// one.
    pub fn take_persist_cell(&mut self) -> Option<(usize, Vec<u8>)> {
        if self.cells[self.persist].used == 0 {
            return None;
        }
        if self.persist == self.curr {
            // the writer is flushing the live buffer opportunistically
            // (the 1 s condvar timeout); give producers a new current cell.
            let fresh = Cell::new(self.cell_capacity);
            let sealed = std::mem::replace(&mut self.cells[self.persist], fresh);
            let next = (self.persist + 1) % self.cells.len();
            self.curr = next;
            let used = sealed.used;
            Some((used, sealed.buf))
        } else {
            let fresh = Cell::new(self.cell_capacity);
            let sealed = std::mem::replace(&mut self.cells[self.persist], fresh);
            let used = sealed.used;
            Some((used, sealed.buf))
        }
    }

    /// Advances `persist` to the next ring slot after a successful drain.
    pub fn advance_persist(&mut self) {
        self.persist = (self.persist + 1) % self.cells.len();
    }

    #[cfg(test)]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[cfg(test)]
    pub fn persist_index(&self) -> usize {
        self.persist
    }

    #[cfg(test)]
    pub fn curr_index(&self) -> usize {
        self.curr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_within_room_stays_in_one_cell() {
        let mut ring = Ring::new(64, 10 * 64);
        assert_eq!(ring.append(b"hello"), AppendResult::Appended { signal_writer: false });
        assert_eq!(ring.cell_count(), 1);
    }

    #[test]
    fn append_at_capacity_boundary_rolls_into_a_new_cell() {
        let mut ring = Ring::new(8, 10 * 8);
        assert_eq!(ring.append(b"12345678"), AppendResult::Appended { signal_writer: false });
        // cell is now exactly full; one more byte must roll over.
        assert_eq!(ring.append(b"x"), AppendResult::Appended { signal_writer: true });
        assert_eq!(ring.cell_count(), 2);
        assert_eq!(ring.curr_index(), 1);
    }

    #[test]
    fn splice_is_bounded_by_max_total_bytes() {
        // Only room for exactly 2 cells; writer never drains in this test,
        // so a third cell should be refused and the line dropped.
        let mut ring = Ring::new(8, 2 * 8);
        assert_eq!(ring.append(b"abcd1234"), AppendResult::Appended { signal_writer: false });
        // cell 0 is exactly full; this splices cell 1 into the ring.
        assert_eq!(ring.append(b"efgh5678"), AppendResult::Appended { signal_writer: true });
        assert_eq!(ring.cell_count(), 2);
        // cell 1 is now exactly full too; a third cell would exceed the
        // 16-byte ceiling with the writer still not having drained cell 0.
        assert_eq!(ring.append(b"ijkl9012"), AppendResult::Dropped);
    }

    #[test]
    fn take_persist_cell_installs_a_fresh_free_cell() {
        let mut ring = Ring::new(8, 10 * 8);
        ring.append(b"hello");
        let (used, buf) = ring.take_persist_cell().unwrap();
        assert_eq!(used, 5);
        assert_eq!(&buf[..used], b"hello");
        ring.advance_persist();
        // the cell we just drained is now fresh and reusable.
        assert_eq!(ring.append(b"world"), AppendResult::Appended { signal_writer: false });
    }

    #[test]
    fn empty_current_cell_has_nothing_to_persist() {
        let mut ring = Ring::new(8, 10 * 8);
        assert!(ring.take_persist_cell().is_none());
    }
}
