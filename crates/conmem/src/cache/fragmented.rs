use std::collections::BTreeMap;

/// Sparse byte store keyed by offset.
///
/// Blocks never overlap or touch; a write that reaches a neighbour merges with it, so a
/// contiguous run of cached bytes is always a single block.
#[derive(Debug, Default)]
pub struct FragmentedBuffer {
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl FragmentedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        // Grow the block that holds or ends at `offset` in place, else start a new one
        let left = self
            .blocks
            .range(..=offset)
            .next_back()
            .filter(|(start, block)| *start + block.len() as u64 >= offset)
            .map(|(&start, _)| start);
        let start = left.unwrap_or(offset);
        let block = self.blocks.entry(start).or_default();
        let at = (offset - start) as usize;
        let overlap = (block.len() - at).min(data.len());
        block[at..at + overlap].copy_from_slice(&data[..overlap]);
        block.extend_from_slice(&data[overlap..]);
        let mut block_end = start + block.len() as u64;

        // Absorb right neighbours that the block now reaches
        loop {
            let next = self
                .blocks
                .range(start + 1..=block_end)
                .next()
                .map(|(&s, _)| s);
            let Some(next) = next else {
                break;
            };
            let Some(right) = self.blocks.remove(&next) else {
                break;
            };
            let covered = (block_end - next) as usize;
            if let Some(block) = self.blocks.get_mut(&start) {
                if covered < right.len() {
                    block.extend_from_slice(&right[covered..]);
                }
                block_end = start + block.len() as u64;
            }
        }
    }

    /// Copy the cached run starting at `offset` into `buffer`; returns the bytes copied
    pub fn read(&self, offset: u64, buffer: &mut [u8]) -> usize {
        let Some((&start, block)) = self.blocks.range(..=offset).next_back() else {
            return 0;
        };
        let skip = (offset - start) as usize;
        if skip >= block.len() {
            return 0;
        }
        let len = buffer.len().min(block.len() - skip);
        buffer[..len].copy_from_slice(&block[skip..skip + len]);
        len
    }

    /// Forget `[offset, offset + count)`
    pub fn clear(&mut self, offset: u64, count: u64) {
        if count == 0 {
            return;
        }
        let end = offset.saturating_add(count);

        let overlapping: Vec<u64> = self
            .blocks
            .range(..end)
            .rev()
            .take_while(|(start, block)| *start + block.len() as u64 > offset)
            .map(|(&start, _)| start)
            .collect();
        for start in overlapping {
            let Some(mut block) = self.blocks.remove(&start) else {
                continue;
            };
            let block_end = start + block.len() as u64;
            if block_end > end {
                let tail = block.split_off((end - start) as usize);
                self.blocks.insert(end, tail);
            }
            if start < offset {
                block.truncate((offset - start) as usize);
                self.blocks.insert(start, block);
            }
        }
    }
}
