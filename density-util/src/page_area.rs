// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};

use super::PAGE_SIZE;

/// A single contiguous page-aligned anonymous memory region.
pub struct PageArea {
    data: *mut u8,
    layout: Layout,
}

unsafe impl Send for PageArea {}

impl PageArea {
    /// Allocate `size` bytes rounded up to whole pages, zero-filled.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            bail!("area size must be > 0");
        }
        let size = size
            .checked_add(*PAGE_SIZE - 1)
            .ok_or_else(|| anyhow!("area size {} overflows", size))?
            / *PAGE_SIZE
            * *PAGE_SIZE;
        let layout = Layout::from_size_align(size, *PAGE_SIZE)
            .map_err(|e| anyhow!("area size {} is not allocatable ({})", size, &e))?;

        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            bail!("failed to allocate {} bytes", size);
        }
        Ok(Self { data, layout })
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn nr_pages(&self) -> usize {
        self.size() / *PAGE_SIZE
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.size()) }
    }

    pub fn page_mut(&mut self, page_idx: usize) -> &mut [u8] {
        let page_size = *PAGE_SIZE;
        let off = page_idx * page_size;
        &mut self.as_mut_slice()[off..off + page_size]
    }

    /// Tell the kernel that the area may be merged with identical pages.
    pub fn madvise_mergeable(&self) -> Result<()> {
        let ret = unsafe {
            libc::madvise(
                self.data as *mut libc::c_void,
                self.size(),
                libc::MADV_MERGEABLE,
            )
        };
        if ret < 0 {
            bail!("madvise(MADV_MERGEABLE) failed ({})", std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for PageArea {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.data, self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_area() {
        let mut area = PageArea::new(*PAGE_SIZE * 3 + 1).unwrap();
        assert_eq!(area.nr_pages(), 4);
        assert_eq!(area.as_mut_slice().as_ptr() as usize % *PAGE_SIZE, 0);

        area.as_mut_slice().iter_mut().for_each(|b| *b = 0);
        area.page_mut(3)[0] = 0xaa;
        assert_eq!(area.as_mut_slice()[3 * *PAGE_SIZE], 0xaa);
    }

    #[test]
    fn test_page_area_rejects() {
        assert!(PageArea::new(0).is_err());
        assert!(PageArea::new(usize::MAX).is_err());
        assert!(PageArea::new(isize::MAX as usize + 1).is_err());
    }
}
