//! Raw component column storage.
//!
//! A [`Column`] is a contiguous, correctly aligned byte buffer holding one
//! component value per table row. The element size and alignment are cached
//! on the column header so the hot paths never consult the registry.
//!
//! Invariant:
//! - The first `len * size` bytes are always initialized (zero-filled on
//!   reservation unless an init hook wrote over them).
//! - Zero-sized columns never allocate; they only track a row count.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Contiguous array of raw component bytes indexed by row.
pub struct Column {
    ptr: Option<NonNull<u8>>,
    capacity_rows: usize,
    len_rows: usize,
    size: u32,
    align: u32,
}

impl Column {
    /// Creates an empty column for elements of `size` bytes aligned to
    /// `align`. Tags pass `size == 0` and never allocate.
    pub fn new(size: usize, align: usize) -> Self {
        debug_assert!(size == 0 || align.is_power_of_two());
        Column {
            ptr: None,
            capacity_rows: 0,
            len_rows: 0,
            size: size as u32,
            align: align.max(1) as u32,
        }
    }

    /// Element size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len_rows
    }

    /// Returns `true` if the column holds no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len_rows == 0
    }

    /// Reserves room for at least `additional` more rows.
    pub fn reserve(&mut self, additional: usize) {
        if self.size == 0 {
            return;
        }
        let required = self.len_rows + additional;
        if required <= self.capacity_rows {
            return;
        }
        let new_capacity = required.max(self.capacity_rows * 2).max(8);
        self.grow_to(new_capacity);
    }

    fn grow_to(&mut self, new_capacity: usize) {
        let size = self.size as usize;
        let align = self.align as usize;
        let layout = Layout::from_size_align(new_capacity * size, align)
            .expect("invalid column layout");

        let new_ptr = if let Some(old_ptr) = self.ptr {
            let old_layout = Layout::from_size_align(self.capacity_rows * size, align)
                .expect("invalid prior column layout");
            // SAFETY: old_ptr was allocated with old_layout.
            unsafe {
                let ptr = alloc::realloc(old_ptr.as_ptr(), old_layout, layout.size());
                NonNull::new(ptr).expect("column reallocation failed")
            }
        } else {
            // SAFETY: layout has non-zero size (size > 0, new_capacity >= 8).
            unsafe {
                let ptr = alloc::alloc(layout);
                NonNull::new(ptr).expect("column allocation failed")
            }
        };

        self.ptr = Some(new_ptr);
        self.capacity_rows = new_capacity;
    }

    /// Reserves one row at the end, zero-filled, and returns its index.
    pub fn push_zeroed(&mut self) -> usize {
        let row = self.len_rows;
        if self.size != 0 {
            self.reserve(1);
            let size = self.size as usize;
            // SAFETY: reserve guarantees capacity; the new row is in bounds.
            unsafe {
                let dst = self.ptr.unwrap().as_ptr().add(row * size);
                std::ptr::write_bytes(dst, 0, size);
            }
        }
        self.len_rows += 1;
        row
    }

    /// Borrows the bytes of one row.
    #[inline]
    pub fn row(&self, row: usize) -> &[u8] {
        debug_assert!(row < self.len_rows);
        if self.size == 0 {
            return &[];
        }
        let size = self.size as usize;
        // SAFETY: row < len, and the first len * size bytes are initialized.
        unsafe {
            std::slice::from_raw_parts(self.ptr.unwrap().as_ptr().add(row * size), size)
        }
    }

    /// Mutably borrows the bytes of one row.
    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        debug_assert!(row < self.len_rows);
        if self.size == 0 {
            return &mut [];
        }
        let size = self.size as usize;
        // SAFETY: row < len, and the first len * size bytes are initialized.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.unwrap().as_ptr().add(row * size), size)
        }
    }

    /// Borrows all rows as one byte slice.
    pub fn bytes(&self) -> &[u8] {
        if self.size == 0 || self.len_rows == 0 {
            return &[];
        }
        let size = self.size as usize;
        // SAFETY: the first len * size bytes are initialized.
        unsafe {
            std::slice::from_raw_parts(self.ptr.unwrap().as_ptr(), self.len_rows * size)
        }
    }

    /// Overwrites one row with `bytes`.
    pub fn write_row(&mut self, row: usize, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.size as usize);
        if self.size == 0 {
            return;
        }
        self.row_mut(row).copy_from_slice(bytes);
    }

    /// Appends a row copied from `src[src_row]`. Element sizes must match.
    pub fn push_from(&mut self, src: &Column, src_row: usize) -> usize {
        debug_assert_eq!(self.size, src.size);
        let row = self.push_zeroed();
        if self.size != 0 {
            let value = src.row(src_row);
            self.row_mut(row).copy_from_slice(value);
        }
        row
    }

    /// Removes `row` by moving the last row into its place.
    ///
    /// Returns the index the last row previously occupied, if a move
    /// happened. The caller repairs whatever metadata referenced it.
    pub fn swap_remove(&mut self, row: usize) -> Option<usize> {
        debug_assert!(row < self.len_rows);
        let last = self.len_rows - 1;
        if self.size != 0 && row != last {
            let size = self.size as usize;
            // SAFETY: both rows are in bounds and distinct.
            unsafe {
                let base = self.ptr.unwrap().as_ptr();
                std::ptr::copy_nonoverlapping(base.add(last * size), base.add(row * size), size);
            }
        }
        self.len_rows = last;
        (row != last).then_some(last)
    }

    /// Drops all rows without releasing capacity.
    pub fn clear(&mut self) {
        self.len_rows = 0;
    }
}

impl Clone for Column {
    fn clone(&self) -> Self {
        let mut copy = Column::new(self.size as usize, self.align as usize);
        if self.size != 0 && self.len_rows > 0 {
            copy.reserve(self.len_rows);
            let bytes = self.len_rows * self.size as usize;
            // SAFETY: source bytes are initialized; destination capacity was
            // just reserved.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.ptr.unwrap().as_ptr(),
                    copy.ptr.unwrap().as_ptr(),
                    bytes,
                );
            }
        }
        copy.len_rows = self.len_rows;
        copy
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            let layout = Layout::from_size_align(
                self.capacity_rows * self.size as usize,
                self.align as usize,
            )
            .expect("invalid column layout in drop");
            if layout.size() > 0 {
                // SAFETY: ptr was allocated with this layout.
                unsafe {
                    alloc::dealloc(ptr.as_ptr(), layout);
                }
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len_rows)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

// SAFETY: the column owns its allocation outright; no thread-local state.
unsafe impl Send for Column {}

// SAFETY: shared references expose read-only access; all mutation requires
// `&mut self`.
unsafe impl Sync for Column {}
