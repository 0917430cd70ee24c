/// Fixed-size byte queue shared between one interrupt handler and one task.
///
/// `head` and `tail` count every byte ever pushed and popped and wrap at 256;
/// they are only masked when indexing. `N` must be a power of two no larger
/// than 128 so that `head - tail` always fits in a `u8`.
#[derive(Debug, Clone)]
pub struct RingBuffer<const N: usize> {
    buf: [u8; N],
    head: u8,
    tail: u8,
}

impl<const N: usize> RingBuffer<N> {
    const VALID_SIZE: () = assert!(N.is_power_of_two() && N <= 128, "ring size must be a power of two <= 128");
    const MASK: u8 = (N - 1) as u8;

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SIZE;
        Self { buf: [0; N], head: 0, tail: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        usize::from(self.head.wrapping_sub(self.tail))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Append a byte. Hands the byte back when the buffer is full.
    pub fn push(&mut self, byte: u8) -> Result<(), u8> {
        if self.is_full() {
            return Err(byte);
        }
        self.buf[usize::from(self.head & Self::MASK)] = byte;
        self.head = self.head.wrapping_add(1);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[usize::from(self.tail & Self::MASK)];
        self.tail = self.tail.wrapping_add(1);
        Some(byte)
    }

    pub fn peek(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf[usize::from(self.tail & Self::MASK)])
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Raw counters, for invariant checks.
    pub fn indices(&self) -> (u8, u8) {
        (self.head, self.tail)
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
