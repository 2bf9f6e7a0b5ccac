//! Frame Assembler
//!
//! Slices captured blocks of any length into overlapping analysis frames and
//! stitches the enhanced frames back together with a linear crossfade.
//!
//! Frames advance by `frame_size - overlap`. Each completed frame emits
//! exactly `advance` samples: the first `overlap` of them are the new head
//! faded in over the stored tail of the previous frame, the rest are the
//! frame body untouched. With `overlap <= frame_size / 2` every output sample
//! is final when emitted, so an identity enhancement reproduces the input
//! exactly once the first overlap region has passed.
//!
//! Captured samples that do not yet complete a frame stay buffered and are
//! carried into the next block. Nothing is dropped between blocks.

use ringbuf::{Consumer, Producer, RingBuffer};

pub struct FrameAssembler {
    frame_size: usize,
    overlap: usize,
    advance: usize,
    in_prod: Producer<f32>,
    in_cons: Consumer<f32>,
    // Samples collected for the frame being assembled.
    window: Vec<f32>,
    filled: usize,
    frame: Vec<f32>,
    // Tail of the previous enhanced frame.
    overlap_state: Vec<f32>,
    fade_in: Vec<f32>,
}

impl FrameAssembler {
    /// `overlap` must be in `1..=frame_size / 2`; config validation enforces it.
    pub fn new(frame_size: usize, overlap: usize) -> Self {
        let overlap = overlap.clamp(1, (frame_size / 2).max(1));
        let (in_prod, in_cons) = RingBuffer::<f32>::new(frame_size).split();
        let fade_in = (0..overlap).map(|i| i as f32 / overlap as f32).collect();
        Self {
            frame_size,
            overlap,
            advance: frame_size - overlap,
            in_prod,
            in_cons,
            window: vec![0.0; frame_size],
            filled: 0,
            frame: vec![0.0; frame_size],
            overlap_state: vec![0.0; overlap],
            fade_in,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn advance(&self) -> usize {
        self.advance
    }

    /// Captured samples waiting for a frame to complete.
    pub fn pending(&self) -> usize {
        self.filled + self.in_cons.len()
    }

    /// Upper bound on samples `push_block` can emit for a block of `block_len`.
    pub fn max_output(&self, block_len: usize) -> usize {
        (block_len + self.frame_size) / self.advance * self.advance
    }

    pub fn overlap_state(&self) -> &[f32] {
        &self.overlap_state
    }

    /// Drop buffered input and zero the overlap tail.
    pub fn reset(&mut self) {
        let mut scratch = [0.0f32; 256];
        while self.in_cons.pop_slice(&mut scratch) > 0 {}
        self.window.fill(0.0);
        self.filled = 0;
        self.overlap_state.fill(0.0);
    }

    /// Feed one captured block. `enhance` is called once per completed frame
    /// and the reconstructed samples are appended to `out`.
    pub fn push_block<F>(&mut self, block: &[f32], out: &mut Vec<f32>, mut enhance: F) -> usize
    where
        F: FnMut(&mut [f32]),
    {
        let mut frames = 0;
        let mut pos = 0;
        loop {
            if pos < block.len() {
                pos += self.in_prod.push_slice(&block[pos..]);
            }
            let popped = self.in_cons.pop_slice(&mut self.window[self.filled..]);
            self.filled += popped;

            if self.filled == self.frame_size {
                self.frame.copy_from_slice(&self.window);
                enhance(&mut self.frame);
                self.emit(out);
                self.window.copy_within(self.advance.., 0);
                self.filled = self.frame_size - self.advance;
                frames += 1;
                continue;
            }
            if pos >= block.len() && self.in_cons.is_empty() {
                break;
            }
        }
        frames
    }

    fn emit(&mut self, out: &mut Vec<f32>) {
        let o = self.overlap;
        for i in 0..o {
            let w = self.fade_in[i];
            out.push(self.frame[i] * w + self.overlap_state[i] * (1.0 - w));
        }
        out.extend_from_slice(&self.frame[o..self.advance]);
        self.overlap_state
            .copy_from_slice(&self.frame[self.frame_size - o..]);
    }
}
