//! 64-bit views of narrow free-running counters
//!
//! A [`CounterWidthExtender`] folds every raw sample into a 64-bit
//! accumulator. At most one wrap may happen between two observations, so
//! the extender either owns a sampling thread or relies on the host calling
//! [`CounterWidthExtender::tick`] often enough.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use pmuflow_raw::counter_mask;

use crate::common::register::{HwRegister, RegisterRef};
use crate::error::{PmuError, Result};

/// Source of raw samples
pub trait RawCounter: Send + Sync {
    fn read(&self) -> Result<u64>;
}

impl RawCounter for RegisterRef {
    fn read(&self) -> Result<u64> {
        HwRegister::read(self.as_ref())
    }
}

#[derive(Debug, Clone, Copy)]
struct ExtendedState {
    extended_value: u64,
    last_raw_value: u64,
}

/// Add the distance from `last` to `new` on a `width`-bit counter
fn fold(extended: u64, last: u64, new: u64, width: u32) -> u64 {
    let delta = if new < last {
        (counter_mask(width) - last).wrapping_add(1).wrapping_add(new)
    } else {
        new - last
    };
    extended.wrapping_add(delta)
}

struct Inner {
    counter: Box<dyn RawCounter>,
    width: u32,
    state: Mutex<ExtendedState>,
}

impl Inner {
    fn sample(&self) -> Result<u64> {
        Ok(self.counter.read()? & counter_mask(self.width))
    }

    fn observe(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let new_raw = self.sample()?;
        state.extended_value = fold(
            state.extended_value,
            state.last_raw_value,
            new_raw,
            self.width,
        );
        state.last_raw_value = new_raw;
        Ok(state.extended_value)
    }
}

struct Worker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

pub struct CounterWidthExtender {
    inner: Arc<Inner>,
    worker: Option<Worker>,
}

impl CounterWidthExtender {
    /// Extender with a sampling thread waking every `watchdog_delay`
    pub fn new(
        counter: Box<dyn RawCounter>,
        width: u32,
        watchdog_delay: Duration,
    ) -> Result<Self> {
        let mut extender = Self::manual(counter, width)?;

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let inner = Arc::clone(&extender.inner);

        let handle = std::thread::Builder::new()
            .name("pmuflow-extender".to_string())
            .spawn(move || {
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                while !*stopped {
                    cvar.wait_for(&mut stopped, watchdog_delay);
                    if *stopped {
                        break;
                    }
                    if let Err(e) = inner.observe() {
                        tracing::debug!("Width extender sample failed: {}", e);
                    }
                }
            })?;

        extender.worker = Some(Worker {
            stop,
            handle: Some(handle),
        });
        Ok(extender)
    }

    /// Extender without a thread; the caller drives [`Self::tick`]
    pub fn manual(counter: Box<dyn RawCounter>, width: u32) -> Result<Self> {
        let width = width.clamp(1, 64);
        let raw = counter.read()? & counter_mask(width);
        Ok(Self {
            inner: Arc::new(Inner {
                counter,
                width,
                state: Mutex::new(ExtendedState {
                    extended_value: raw,
                    last_raw_value: raw,
                }),
            }),
            worker: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    /// Sample and fold without returning the value
    pub fn tick(&self) -> Result<()> {
        self.inner.observe().map(|_| ())
    }

    /// Sample, fold and return the extended value
    pub fn read(&self) -> Result<u64> {
        self.inner.observe()
    }

    /// Like [`Self::read`], but a failed sample yields the last extended
    /// value so the interval reads as idle
    pub fn read_or_last(&self) -> u64 {
        match self.inner.observe() {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Width extender sample failed, repeating last value: {}", e);
                self.inner.state.lock().extended_value
            }
        }
    }

    /// Re-synchronize with the hardware after the raw counter was reset
    pub fn reset(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let raw = self.inner.sample()?;
        state.last_raw_value = raw;
        state.extended_value = raw;
        Ok(())
    }
}

impl Drop for CounterWidthExtender {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            {
                let (lock, cvar) = &*worker.stop;
                *lock.lock() = true;
                cvar.notify_all();
            }
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    tracing::warn!("Width extender thread panicked");
                }
            }
        }
    }
}

/// Register view over an extender; only a reset (0) may be written
pub struct WidthExtendedRegister {
    extender: Arc<CounterWidthExtender>,
}

impl WidthExtendedRegister {
    pub fn new(extender: Arc<CounterWidthExtender>) -> Self {
        Self { extender }
    }
}

impl HwRegister for WidthExtendedRegister {
    fn read(&self) -> Result<u64> {
        self.extender.read()
    }

    fn write(&self, value: u64) -> Result<()> {
        if value != 0 {
            debug_assert!(false, "width-extended register written with 0x{value:x}");
            return Err(PmuError::InvalidRegisterWrite(value));
        }
        self.extender.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Replays a fixed list of samples, repeating the last one
    struct Scripted(Mutex<VecDeque<u64>>);

    impl Scripted {
        fn boxed(samples: &[u64]) -> Box<dyn RawCounter> {
            Box::new(Self(Mutex::new(samples.iter().copied().collect())))
        }
    }

    impl RawCounter for Scripted {
        fn read(&self) -> Result<u64> {
            let mut q = self.0.lock();
            if q.len() > 1 {
                Ok(q.pop_front().unwrap_or(0))
            } else {
                Ok(q.front().copied().unwrap_or(0))
            }
        }
    }

    struct Shared(Arc<AtomicU64>);

    impl RawCounter for Shared {
        fn read(&self) -> Result<u64> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_eight_bit_wrap() {
        let ext = CounterWidthExtender::manual(Scripted::boxed(&[250, 4]), 8).expect("ext");
        let before = 250;
        let after = ext.read().expect("read");
        assert_eq!(after - before, 10);
    }

    #[test]
    fn test_monotonic_across_many_wraps() {
        // 16-bit counter advancing 40000 per sample wraps most of the time
        let mut raw = Vec::new();
        let mut truth = 0u64;
        for _ in 0..50 {
            raw.push(truth & 0xFFFF);
            truth += 40_000;
        }
        let ext = CounterWidthExtender::manual(Scripted::boxed(&raw), 16).expect("ext");

        let mut last = 0;
        for _ in 1..raw.len() {
            let value = ext.read().expect("read");
            assert!(value >= last);
            last = value;
        }
        assert_eq!(last, 40_000 * 49);
    }

    #[test]
    fn test_samples_are_masked() {
        let ext =
            CounterWidthExtender::manual(Scripted::boxed(&[0xFF00_0010, 0xFF00_0020]), 8)
                .expect("ext");
        assert_eq!(ext.read().expect("read"), 0x20);
    }

    #[test]
    fn test_reset_resynchronizes() {
        let ext = CounterWidthExtender::manual(Scripted::boxed(&[100, 200, 5, 7]), 32)
            .expect("ext");
        assert_eq!(ext.read().expect("read"), 200);
        ext.reset().expect("reset");
        assert_eq!(ext.read().expect("read"), 7);
    }

    #[test]
    fn test_background_thread_catches_wraps() {
        let value = Arc::new(AtomicU64::new(0));
        let ext = CounterWidthExtender::new(
            Box::new(Shared(Arc::clone(&value))),
            8,
            Duration::from_millis(5),
        )
        .expect("ext");

        // Three wraps, each observed by the sampler before the next
        for step in [200u64, 100, 50, 250, 30] {
            value.store(step, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(40));
        }
        // 0→200→100(wrap)→50(wrap)→250→30(wrap)
        assert_eq!(ext.read().expect("read"), 3 * 256 + 30);
        drop(ext);
    }

    /// Reads `value`, or fails while `failing` is set
    struct Flaky {
        value: Arc<AtomicU64>,
        failing: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RawCounter for Flaky {
        fn read(&self) -> Result<u64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PmuError::MsrError("flaky read".to_string()));
            }
            Ok(self.value.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_failed_sample_repeats_last_value() {
        let value = Arc::new(AtomicU64::new(100));
        let failing = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ext = CounterWidthExtender::manual(
            Box::new(Flaky {
                value: Arc::clone(&value),
                failing: Arc::clone(&failing),
            }),
            32,
        )
        .expect("ext");

        value.store(150, Ordering::SeqCst);
        assert_eq!(ext.read_or_last(), 150);

        failing.store(true, Ordering::SeqCst);
        value.store(170, Ordering::SeqCst);
        assert_eq!(ext.read_or_last(), 150);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(ext.read_or_last(), 170);
    }

    #[test]
    fn test_fold_full_width() {
        assert_eq!(fold(10, u64::MAX - 1, 3, 64), 10 + 5);
        assert_eq!(fold(0, 5, 9, 64), 4);
    }

    #[test]
    fn test_register_view_reset() {
        let ext = Arc::new(
            CounterWidthExtender::manual(Scripted::boxed(&[10, 20, 30]), 32).expect("ext"),
        );
        let reg = WidthExtendedRegister::new(Arc::clone(&ext));
        assert_eq!(reg.read().expect("read"), 20);
        reg.write(0).expect("reset");
        assert_eq!(reg.read().expect("read"), 30);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn test_register_view_rejects_nonzero_write() {
        let ext = Arc::new(CounterWidthExtender::manual(Scripted::boxed(&[1]), 32).expect("ext"));
        let reg = WidthExtendedRegister::new(ext);
        assert!(matches!(reg.write(5), Err(PmuError::InvalidRegisterWrite(5))));
    }
}
