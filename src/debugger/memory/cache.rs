use crate::debugger::error::Error;
use crate::debugger::CoreAddr;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Line based write-through data cache.
pub struct DCache {
    lines: LruCache<CoreAddr, Box<[u8]>>,
    line_size: usize,
}

impl DCache {
    /// Create a cache. `line_size` must be a power of two.
    pub fn new(line_size: usize, max_lines: usize) -> Self {
        debug_assert!(line_size.is_power_of_two());
        let cap = NonZeroUsize::new(max_lines).unwrap_or(NonZeroUsize::MIN);
        Self {
            lines: LruCache::new(cap),
            line_size,
        }
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn line_addr(&self, addr: CoreAddr) -> CoreAddr {
        addr & !(self.line_size as u64 - 1)
    }

    /// Read through the cache, filling missed lines with `fill`.
    ///
    /// Return number of bytes copied into `buf`, reading stops at the first line that can't be
    /// filled. Zero means the first line is not readable.
    pub fn read(
        &mut self,
        addr: CoreAddr,
        buf: &mut [u8],
        mut fill: impl FnMut(CoreAddr, &mut [u8]) -> Result<(), Error>,
    ) -> usize {
        let mut done = 0;
        while done < buf.len() {
            // the address space ends here
            let Some(cur) = addr.checked_add(done as u64) else {
                break;
            };
            let line = self.line_addr(cur);
            if !self.lines.contains(&line) {
                let mut data = vec![0u8; self.line_size].into_boxed_slice();
                if fill(line, &mut data).is_err() {
                    break;
                }
                self.lines.put(line, data);
            }
            let Some(data) = self.lines.get(&line) else {
                break;
            };
            let start = (cur - line) as usize;
            let len = (self.line_size - start).min(buf.len() - done);
            buf[done..done + len].copy_from_slice(&data[start..start + len]);
            done += len;
        }
        done
    }

    /// Update cached lines covering written bytes. Lines not in the cache are not created.
    pub fn update(&mut self, addr: CoreAddr, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let Some(cur) = addr.checked_add(done as u64) else {
                break;
            };
            let line = self.line_addr(cur);
            let start = (cur - line) as usize;
            let len = (self.line_size - start).min(data.len() - done);
            if let Some(cached) = self.lines.peek_mut(&line) {
                cached[start..start + len].copy_from_slice(&data[done..done + len]);
            }
            done += len;
        }
    }

    pub fn invalidate(&mut self) {
        self.lines.clear();
    }
}
