use bytes::BytesMut;

/// Backing memory for message buffers.
///
/// The pool owns one large allocation at a time and carves it into
/// fixed-size [`Segment`]s. Each segment is an owned view into the shared
/// allocation, so segments never overlap and never move. When the current
/// block has no room left for another segment, a new block of the same size
/// is allocated and carving continues there.
///
/// Segments are never returned individually. The number of segments a
/// [`MessagePool`](crate::pool::MessagePool) asks for equals its message
/// count, so the total is known when the pool is built and all allocation
/// happens up front.
///
/// # Examples
///
/// ```
/// # use pooled_logger::segment::SegmentPool;
/// let mut pool = SegmentPool::new(64, 4);
/// let a = pool.acquire();
/// let b = pool.acquire();
/// assert_eq!(a.len(), 64);
/// assert_eq!(b.len(), 64);
/// assert_eq!(pool.blocks_allocated(), 1);
/// ```
pub struct SegmentPool {
    segment_size: usize,
    segments_per_block: usize,
    current: BytesMut,
    blocks_allocated: usize,
    segments_handed_out: usize,
}

impl SegmentPool {
    /// Creates a pool whose blocks hold `segments_per_block` segments of
    /// `segment_size` bytes each. The first block is allocated immediately.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(segment_size: usize, segments_per_block: usize) -> Self {
        assert!(segment_size > 0, "segment size must be non-zero");
        assert!(segments_per_block > 0, "segments per block must be non-zero");

        Self {
            segment_size,
            segments_per_block,
            current: BytesMut::zeroed(segment_size * segments_per_block),
            blocks_allocated: 1,
            segments_handed_out: 0,
        }
    }

    /// Hands out the next free segment, allocating a new block if the
    /// current one is used up.
    pub fn acquire(&mut self) -> Segment {
        if self.current.len() < self.segment_size {
            self.current = BytesMut::zeroed(self.segment_size * self.segments_per_block);
            self.blocks_allocated += 1;
        }

        self.segments_handed_out += 1;
        Segment {
            bytes: self.current.split_to(self.segment_size),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated
    }

    pub fn segments_handed_out(&self) -> usize {
        self.segments_handed_out
    }
}

/// A fixed-size byte region owned by exactly one message.
pub struct Segment {
    bytes: BytesMut,
}

impl Segment {
    /// A segment with its own allocation, used for transient messages built
    /// outside the pool.
    pub(crate) fn standalone(size: usize) -> Self {
        Self {
            bytes: BytesMut::zeroed(size),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}
