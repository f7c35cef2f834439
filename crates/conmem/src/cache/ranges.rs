use std::collections::BTreeMap;
use std::ops::Range;

/// A set of byte offsets stored as disjoint, non-adjacent half-open ranges.
///
/// Inserting a range that touches or overlaps existing ones merges them, so the set is
/// always in its coalesced form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Total bytes covered
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&start, &end)| start..end)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Empty the set, returning what it held
    pub fn take(&mut self) -> RangeSet {
        std::mem::take(self)
    }

    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut end = start.saturating_add(len);

        let touching: Vec<u64> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in touching {
            if let Some(e) = self.ranges.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }

    pub fn remove(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);

        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// Whether every byte of `[start, start + len)` is in the set
    pub fn contains(&self, start: u64, len: u64) -> bool {
        len == 0 || self.contiguous_from(start) >= len
    }

    /// Length of the covered run beginning exactly at `offset`; 0 if `offset` is a gap
    pub fn contiguous_from(&self, offset: u64) -> u64 {
        match self.ranges.range(..=offset).next_back() {
            Some((_, &end)) if end > offset => end - offset,
            _ => 0,
        }
    }

    /// Parts of `[start, start + len)` that are not in the set
    #[cfg(test)]
    pub fn gaps(&self, start: u64, len: u64) -> Vec<Range<u64>> {
        let end = start.saturating_add(len);
        let mut gaps = Vec::new();
        let mut cursor = start;

        let first = self
            .ranges
            .range(..=start)
            .next_back()
            .map(|(&s, _)| s)
            .unwrap_or(start);
        for (&s, &e) in self.ranges.range(first..end) {
            if e <= cursor {
                continue;
            }
            if s > cursor {
                gaps.push(cursor..s);
            }
            cursor = e;
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push(cursor..end);
        }
        gaps
    }
}

impl Extend<Range<u64>> for RangeSet {
    fn extend<T: IntoIterator<Item = Range<u64>>>(&mut self, iter: T) {
        for range in iter {
            self.insert(range.start, range.end.saturating_sub(range.start));
        }
    }
}

impl FromIterator<Range<u64>> for RangeSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        let mut set = RangeSet::new();
        set.extend(iter);
        set
    }
}
