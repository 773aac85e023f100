use parking_lot::Mutex;
use tracing::warn;

/// Highest even port whose control port still fits in `u16`
const HIGHEST_DATA_PORT: u32 = 65534;

/// Round-robin allocator over `[base, max]`.
///
/// Every call hands out an even port `p` such that `p + 1` (the control port)
/// is still inside the window. There is no free list: a caller whose bind
/// fails simply asks for the next tuple.
#[derive(Debug)]
pub struct PortAllocator {
    base: u32,
    max: u32,
    /// Next port to hand out; `None` until the first call
    current: Mutex<Option<u32>>,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        let base = ((base as u32 + 1) & !1).min(HIGHEST_DATA_PORT);
        let requested = max as u32;
        let max = requested.max(base + 1);
        if max != requested {
            warn!(base, requested, max, "RTP port range too small, widened to one tuple");
        }
        Self {
            base,
            max,
            current: Mutex::new(None),
        }
    }

    pub fn base(&self) -> u16 {
        self.base as u16
    }

    pub fn max(&self) -> u16 {
        self.max as u16
    }

    pub fn next_port_tuple(&self) -> u16 {
        let mut current = self.current.lock();
        let port = current.unwrap_or(self.base);
        let mut next = port + 2;
        if next + 1 > self.max {
            next = self.base;
        }
        *current = Some(next);
        port as u16
    }
}
