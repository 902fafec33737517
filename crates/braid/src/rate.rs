use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Instant,
};

/// Drain rate below which a per-stream estimate is recalibrated, scaled by
/// the ratio the mux hands back when a stream overshoots the carrier.
const WRITE_CALC_THRESHOLD: u32 = 5 * 1024 * 1024;

/// Latency samples beyond this multiple of the ring minimum are spikes and
/// excluded from the reported mean.
const SPIKE_RATIO: f64 = 3.0;

const RING_SLOTS: usize = 16;
const INDEX_BITS: u32 = 4;
const INDEX_MASK: u8 = (1 << INDEX_BITS) - 1;

/// An `f64` published through an atomic word. Readers see zero until the
/// first sample lands; negative values are clamped away.
#[derive(Default)]
pub(crate) struct F64Bits(AtomicU64);

impl F64Bits {
    pub fn get(&self) -> f64 {
        let v = f64::from_bits(self.0.load(Ordering::Relaxed));
        if v > 0.0 { v } else { 0.0 }
    }

    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

/// Carrier read-bandwidth calibration, owned by the reader loop.
///
/// A sample only counts once the bytes accumulated between two measurement
/// points cover the kernel's receive buffer; anything smaller raises the
/// threshold to the buffer size and is discarded, since a partially filled
/// buffer says nothing about the link.
pub(crate) struct ReadBandwidth {
    start: Option<Instant>,
    last_start: Option<Instant>,
    bytes: u32,
    threshold: u32,
    recv_buffer: usize,
}

impl ReadBandwidth {
    pub fn new(recv_buffer: usize) -> Self {
        Self { start: None, last_start: None, bytes: 0, threshold: 0, recv_buffer }
    }

    /// Called before each frame read.
    pub fn start_read(&mut self, published: &F64Bits) {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
        if self.bytes >= self.threshold {
            let now = Instant::now();
            self.last_start = self.start.replace(now);
            self.calc(published, now);
        }
    }

    /// Called with the wire size of each frame read.
    pub fn add(&mut self, n: u16) {
        self.bytes += u32::from(n);
    }

    fn calc(&mut self, published: &F64Bits, now: Instant) {
        if self.bytes as usize >= self.recv_buffer {
            if let Some(last) = self.last_start {
                let secs = now.duration_since(last).as_secs_f64();
                if secs > 0.0 {
                    published.set(f64::from(self.bytes) / secs);
                }
            }
        } else {
            self.threshold = self.recv_buffer as u32;
        }
        self.bytes = 0;
    }
}

/// Per-receive-window drain-rate estimate.
///
/// The published value and the ratio are shared (the window-size calculation
/// reads one and grows the other); the accumulation state belongs to
/// whichever thread is draining the window and travels with its cursor.
pub(crate) struct WriteBandwidth {
    published: F64Bits,
    ratio: AtomicU32,
}

#[derive(Default)]
pub(crate) struct DrainState {
    read_end: Option<Instant>,
    duration: f64,
    bytes: u32,
}

impl WriteBandwidth {
    pub fn new() -> Self {
        Self { published: F64Bits::default(), ratio: AtomicU32::new(1) }
    }

    pub fn get(&self) -> f64 {
        self.published.get()
    }

    /// Widens the calibration threshold; invoked when this stream's estimate
    /// exceeds what the carrier as a whole can move.
    pub fn grow_ratio(&self) {
        self.ratio.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_read(&self, st: &mut DrainState) {
        let now = Instant::now();
        let end = *st.read_end.get_or_insert(now);
        st.duration += now.duration_since(end).as_secs_f64();
        if st.bytes >= WRITE_CALC_THRESHOLD.saturating_mul(self.ratio.load(Ordering::Relaxed)) {
            if st.duration > 0.0 {
                self.published.set(f64::from(st.bytes) / st.duration);
            }
            st.bytes = 0;
            st.duration = 0.0;
        }
    }

    pub fn add(&self, st: &mut DrainState, n: u16) {
        st.bytes += u32::from(n);
        st.read_end = Some(Instant::now());
    }
}

/// Ring of recent round-trip samples with a packed head/minimum byte.
///
/// The reported latency is the mean of entries within [`SPIKE_RATIO`] times
/// the ring minimum, which keeps a single congested probe from doubling the
/// window overnight.
pub(crate) struct LatencyRing {
    buf: [f64; RING_SLOTS],
    head_min: u8,
}

impl LatencyRing {
    pub fn new() -> Self {
        Self { buf: [0.0; RING_SLOTS], head_min: 0 }
    }

    fn unpack(&self) -> (u8, u8) {
        ((self.head_min >> INDEX_BITS) & INDEX_MASK, self.head_min & INDEX_MASK)
    }

    fn pack(head: u8, min: u8) -> u8 {
        ((head & INDEX_MASK) << INDEX_BITS) | (min & INDEX_MASK)
    }

    fn add(&mut self, value: f64) {
        let (head, mut min) = self.unpack();
        self.buf[head as usize] = value;
        if head == min {
            // The previous minimum was just overwritten; rescan.
            min = self.minimal();
        }
        if self.buf[min as usize] > value {
            min = head;
        }
        self.head_min = Self::pack(head.wrapping_add(1), min);
    }

    fn minimal(&self) -> u8 {
        let mut min = 0u8;
        let mut val = f64::INFINITY;
        for (i, &v) in self.buf.iter().enumerate() {
            if v > 0.0 && v < val {
                val = v;
                min = i as u8;
            }
        }
        min
    }

    /// Records a sample and returns the spike-filtered mean.
    pub fn record(&mut self, sample: f64) -> f64 {
        self.add(sample);
        let (_, min) = self.unpack();
        let floor = self.buf[min as usize];
        let mut sum = 0.0;
        let mut count = 0u32;
        for &v in &self.buf {
            if v > 0.0 && v <= SPIKE_RATIO * floor {
                sum += v;
                count += 1;
            }
        }
        if count == 0 { sample } else { sum / f64::from(count) }
    }
}
