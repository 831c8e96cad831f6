use crate::{Object, RootProvider, VmError};

/// A stack built from fixed capacity segments.
///
/// Segments are kept once allocated, so a stack that shrinks and grows again
/// reuses them. Reads past either end return `None`, writes report
/// [`VmError::RangeCheck`].
#[derive(Debug, Clone)]
pub struct SegmentedStack {
    segments: Vec<Box<[Object]>>,
    // segment holding the top element
    top: usize,
    // occupied slots of segments[top], only 0 when the stack is empty
    fill: usize,
    segment_size: usize,
    limit: usize,
    overflow: VmError,
}

impl SegmentedStack {
    /// `overflow` is what [`SegmentedStack::push`] reports once `limit` items are stored.
    pub fn new(segment_size: usize, limit: usize, overflow: VmError) -> Self {
        debug_assert!(segment_size > 0);
        Self {
            segments: vec![Self::segment(segment_size)],
            top: 0,
            fill: 0,
            segment_size,
            limit,
            overflow,
        }
    }

    fn segment(size: usize) -> Box<[Object]> {
        vec![Object::NULL; size].into_boxed_slice()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.top * self.segment_size + self.fill
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Segments currently allocated, including retained empty ones.
    #[inline]
    pub fn segments(&self) -> usize {
        self.segments.len()
    }

    pub fn push(&mut self, obj: Object) -> Result<(), VmError> {
        if self.count() >= self.limit {
            return Err(self.overflow);
        }
        if self.fill == self.segment_size {
            self.top += 1;
            self.fill = 0;
            if self.top == self.segments.len() {
                self.segments.push(Self::segment(self.segment_size));
            }
        }
        self.segments[self.top][self.fill] = obj;
        self.fill += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Object> {
        if self.fill == 0 {
            return None;
        }
        self.fill -= 1;
        let obj = self.segments[self.top][self.fill];
        if self.fill == 0 && self.top > 0 {
            self.top -= 1;
            self.fill = self.segment_size;
        }
        Some(obj)
    }

    /// Remove `n` items from the top. Fails without changes if there are fewer.
    pub fn drop_top(&mut self, n: usize) -> Result<(), VmError> {
        if n > self.count() {
            return Err(VmError::StackUnderflow);
        }
        let remaining = self.count() - n;
        self.set_count(remaining);
        Ok(())
    }

    fn set_count(&mut self, count: usize) {
        if count == 0 {
            self.top = 0;
            self.fill = 0;
        } else {
            self.top = (count - 1) / self.segment_size;
            self.fill = count - self.top * self.segment_size;
        }
    }

    #[inline]
    pub fn peek(&self) -> Option<Object> {
        self.topdown_fetch(0)
    }

    /// Index 0 is the most recently pushed item.
    pub fn topdown_fetch(&self, index: usize) -> Option<Object> {
        let count = self.count();
        if index >= count {
            return None;
        }
        self.bottomup_fetch(count - 1 - index)
    }

    pub fn topdown_replace(&mut self, index: usize, obj: Object) -> Result<(), VmError> {
        let count = self.count();
        if index >= count {
            return Err(VmError::RangeCheck);
        }
        self.bottomup_replace(count - 1 - index, obj)
    }

    /// Index 0 is the oldest item.
    pub fn bottomup_fetch(&self, index: usize) -> Option<Object> {
        if index >= self.count() {
            return None;
        }
        Some(self.segments[index / self.segment_size][index % self.segment_size])
    }

    pub fn bottomup_replace(&mut self, index: usize, obj: Object) -> Result<(), VmError> {
        if index >= self.count() {
            return Err(VmError::RangeCheck);
        }
        self.segments[index / self.segment_size][index % self.segment_size] = obj;
        Ok(())
    }

    /// Empty the stack, keeping its segments.
    pub fn clear(&mut self) {
        self.set_count(0);
    }

    /// Empty the stack and give back every segment but the first.
    pub fn free(&mut self) {
        self.clear();
        self.segments.truncate(1);
    }

    /// Items from the bottom up.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Object> + '_ {
        (0..self.count()).filter_map(|index| self.bottomup_fetch(index))
    }

    /// Distance from the top to the topmost mark.
    pub fn count_to_mark(&self) -> Result<usize, VmError> {
        (0..self.count())
            .find(|&index| {
                self.topdown_fetch(index)
                    .is_some_and(|obj| obj.ty() == crate::Type::Mark)
            })
            .ok_or(VmError::UnmatchedMark)
    }
}

impl RootProvider for SegmentedStack {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Object)) {
        self.iter().for_each(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(segment_size: usize) -> SegmentedStack {
        SegmentedStack::new(segment_size, 1000, VmError::StackOverflow)
    }

    #[test]
    fn lifo_order_and_empty_sentinel() {
        let mut s = stack(4);
        s.push(Object::int(1)).unwrap();
        s.push(Object::int(2)).unwrap();
        assert_eq!(s.pop(), Some(Object::int(2)));
        assert_eq!(s.pop(), Some(Object::int(1)));
        assert_eq!(s.pop(), None, "popping an empty stack yields the sentinel");
    }

    #[test]
    fn crossing_a_segment_boundary() {
        const SEGMENT: usize = 8;
        let mut s = stack(SEGMENT);
        for i in 0..=SEGMENT as i32 {
            s.push(Object::int(i)).unwrap();
        }
        assert_eq!(s.count(), SEGMENT + 1);
        assert_eq!(s.topdown_fetch(0), Some(Object::int(SEGMENT as i32)));
        assert_eq!(s.bottomup_fetch(0), Some(Object::int(0)));
        assert_eq!(s.segments(), 2);

        // popping back below the boundary keeps the second segment around
        s.pop();
        s.pop();
        assert_eq!(s.count(), SEGMENT - 1);
        assert_eq!(s.segments(), 2);
        s.push(Object::int(42)).unwrap();
        s.push(Object::int(43)).unwrap();
        assert_eq!(s.segments(), 2, "retained segment is reused");
        assert_eq!(s.peek(), Some(Object::int(43)));
    }

    #[test]
    fn indexed_access_from_both_ends() {
        let mut s = stack(2);
        for i in 0..5 {
            s.push(Object::int(i)).unwrap();
        }
        assert_eq!(s.topdown_fetch(1), Some(Object::int(3)));
        assert_eq!(s.bottomup_fetch(3), Some(Object::int(3)));
        s.topdown_replace(4, Object::boolean(true)).unwrap();
        assert_eq!(s.bottomup_fetch(0), Some(Object::boolean(true)));
        s.bottomup_replace(4, Object::mark()).unwrap();
        assert_eq!(s.peek(), Some(Object::mark()));

        assert_eq!(s.topdown_fetch(5), None);
        assert_eq!(s.topdown_replace(5, Object::NULL), Err(VmError::RangeCheck));
        assert_eq!(s.bottomup_replace(9, Object::NULL), Err(VmError::RangeCheck));
    }

    #[test]
    fn limit_reports_the_configured_error() {
        let mut s = SegmentedStack::new(2, 3, VmError::ExecStackOverflow);
        for i in 0..3 {
            s.push(Object::int(i)).unwrap();
        }
        assert_eq!(s.push(Object::int(3)), Err(VmError::ExecStackOverflow));
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn drop_top_clear_and_free() {
        let mut s = stack(3);
        for i in 0..7 {
            s.push(Object::int(i)).unwrap();
        }
        s.drop_top(4).unwrap();
        assert_eq!(s.count(), 3);
        assert_eq!(s.peek(), Some(Object::int(2)));
        assert_eq!(s.drop_top(4), Err(VmError::StackUnderflow));

        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.segments(), 3);
        s.free();
        assert_eq!(s.segments(), 1);
        assert_eq!(s.pop(), None);
    }

    #[test]
    fn count_to_mark_finds_the_topmost_mark() {
        let mut s = stack(4);
        s.push(Object::mark()).unwrap();
        s.push(Object::int(1)).unwrap();
        s.push(Object::mark()).unwrap();
        s.push(Object::int(2)).unwrap();
        s.push(Object::int(3)).unwrap();
        assert_eq!(s.count_to_mark(), Ok(2));
        s.clear();
        assert_eq!(s.count_to_mark(), Err(VmError::UnmatchedMark));
    }
}
