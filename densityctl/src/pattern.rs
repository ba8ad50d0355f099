// Copyright (c) Facebook, Inc. and its affiliates.
//
// Page content pattern shared by all workloads and the per-instance
// selection of pages which are made unique.
use density_util::PageArea;

/// "DENS1TY0" as a little-endian word. Every page starts out filled with it.
pub const TEMPLATE_WORD: u64 = 0x44454E5331545930;
pub const DIRTY_XOR: u64 = 0xBADC0FFEE;

const MIX_ID: u64 = 1315423911;
const MIX_ORD: u64 = 2654435761;

pub fn nr_dirty_pages(nr_pages: usize, dirty_pct: f64) -> usize {
    (nr_pages as f64 * dirty_pct / 100.0).floor() as usize
}

/// Page indices which instance `id` makes unique. The mapping isn't
/// injective and high percentages on small areas yield repeated indices.
/// Repeats are kept as-is so that the number of dirtied pages recorded in
/// past results stays reproducible.
pub fn dirty_indices(id: u64, nr_pages: usize, dirty_pct: f64) -> Vec<usize> {
    if nr_pages == 0 {
        return vec![];
    }
    let total = nr_pages as u64;
    (0..nr_dirty_pages(nr_pages, dirty_pct) as u64)
        .map(|j| {
            (id.wrapping_mul(MIX_ID).wrapping_add(j.wrapping_mul(MIX_ORD)) % total) as usize
        })
        .collect()
}

pub fn dirty_marker(id: u64, counter: u64) -> u64 {
    (id << 32) ^ counter ^ DIRTY_XOR
}

pub fn fill_template(buf: &mut [u8]) {
    let word = TEMPLATE_WORD.to_le_bytes();
    for chunk in buf.chunks_mut(word.len()) {
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

/// Stamp the marker for (`id`, `counter`) at the start of each selected
/// page, leaving the rest of the page template-identical.
pub fn apply_dirty(area: &mut PageArea, indices: &[usize], id: u64, counter: u64) {
    let marker = dirty_marker(id, counter).to_le_bytes();
    for &idx in indices {
        area.page_mut(idx)[..marker.len()].copy_from_slice(&marker);
    }
}
