//! Virtual objects: allocations deferred until something escapes.
//!
//! A `NewStruct` becomes a cell here instead of an emitted op; reads and
//! writes against the cell are free. The cell is *forced* (really
//! allocated, fields written back) the first time its reference escapes:
//! stored into real memory, passed to a call, or carried over the
//! back-edge. Forcing is one-way; after it the cell is an ordinary box.

use super::OptValue;
use crate::trace::boxes::BoxId;
use molten_core::ShapeId;

#[derive(Debug)]
struct VirtualCell {
    shape: ShapeId,
    fields: Vec<OptValue>,
    forced: Option<BoxId>,
}

#[derive(Debug, Default)]
pub struct VirtualState {
    cells: Vec<VirtualCell>,
}

impl VirtualState {
    /// Track a fresh allocation. Fields start at their zero values, exactly
    /// like the real allocation would.
    pub fn new_cell(&mut self, shape: ShapeId, zeroes: Vec<OptValue>) -> u32 {
        let id = self.cells.len() as u32;
        self.cells.push(VirtualCell {
            shape,
            fields: zeroes,
            forced: None,
        });
        id
    }

    #[inline]
    pub fn shape(&self, cell: u32) -> ShapeId {
        self.cells[cell as usize].shape
    }

    #[inline]
    pub fn field(&self, cell: u32, field: u16) -> OptValue {
        self.cells[cell as usize].fields[field as usize]
    }

    #[inline]
    pub fn set_field(&mut self, cell: u32, field: u16, value: OptValue) {
        self.cells[cell as usize].fields[field as usize] = value;
    }

    #[inline]
    pub fn fields(&self, cell: u32) -> &[OptValue] {
        &self.cells[cell as usize].fields
    }

    #[inline]
    pub fn forced(&self, cell: u32) -> Option<BoxId> {
        self.cells[cell as usize].forced
    }

    #[inline]
    pub fn set_forced(&mut self, cell: u32, bx: BoxId) {
        self.cells[cell as usize].forced = Some(bx);
    }

    /// Cells that were never forced (their allocations disappeared).
    pub fn elided_count(&self) -> usize {
        self.cells.iter().filter(|c| c.forced.is_none()).count()
    }
}
