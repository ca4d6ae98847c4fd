//! One-shot capability detection for the fused attention kernel.
//!
//! The first call attempts to acquire a WebGPU device. Success or failure is
//! cached for the probe's lifetime; a failure is never surfaced as an error,
//! it degrades the process to the portable backend with a single logged
//! notice. `OnceLock` makes the first call safe to race: concurrent callers
//! block until one initialization finishes and then all observe the same
//! answer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::gpu_ops::WgpuContext;

/// Environment variable that forces the portable backend without touching
/// the GPU stack. Set to anything but `0` to activate.
pub const FORCE_PORTABLE_ENV: &str = "ATHYGLI_FORCE_PORTABLE";

/// Cached answer to "is the fused kernel usable here?".
///
/// The process-wide instance lives behind [`global()`] and is never
/// re-evaluated; tests that need a fresh probe construct their own.
pub struct CapabilityProbe {
    cell: OnceLock<Option<Arc<WgpuContext>>>,
    inits: AtomicUsize,
}

impl CapabilityProbe {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            inits: AtomicUsize::new(0),
        }
    }

    /// Whether the fused kernel can run. Probes on first call, cached after.
    pub fn available(&self) -> bool {
        self.context().is_some()
    }

    /// The device context backing the fused kernel, if the probe succeeded.
    pub fn context(&self) -> Option<Arc<WgpuContext>> {
        self.cell
            .get_or_init(|| {
                self.inits.fetch_add(1, Ordering::Relaxed);

                if force_portable() {
                    log::info!(
                        "{} is set, attention runs on the portable kernel",
                        FORCE_PORTABLE_ENV
                    );
                    return None;
                }

                match pollster::block_on(WgpuContext::new()) {
                    Ok(context) => {
                        log::debug!(
                            "fused attention kernel available on {}",
                            context.adapter_name()
                        );
                        Some(context)
                    }
                    Err(err) => {
                        log::warn!(
                            "fused attention kernel unavailable, \
                             falling back to the portable implementation: {err:#}"
                        );
                        None
                    }
                }
            })
            .clone()
    }

    /// How many times the probe body actually ran. Stays at one for the
    /// probe's whole lifetime no matter how many threads call in.
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::Relaxed)
    }
}

impl Default for CapabilityProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide probe used by [`AttentionDispatcher::new`].
///
/// [`AttentionDispatcher::new`]: crate::dispatch::AttentionDispatcher::new
pub fn global() -> &'static CapabilityProbe {
    static PROBE: CapabilityProbe = CapabilityProbe::new();
    &PROBE
}

fn force_portable() -> bool {
    std::env::var(FORCE_PORTABLE_ENV)
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn test_probe_is_stable_across_calls() {
        let probe = CapabilityProbe::new();
        let first = probe.available();
        for _ in 0..16 {
            assert_eq!(probe.available(), first);
        }
        assert_eq!(probe.init_count(), 1);
    }

    #[test]
    fn test_probe_initializes_once_under_contention() {
        let probe = Arc::new(CapabilityProbe::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let probe = probe.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    probe.available()
                })
            })
            .collect();

        let answers: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(probe.init_count(), 1);
        assert!(answers.iter().all(|&a| a == answers[0]));
    }

    #[test]
    fn test_env_override_forces_portable() {
        std::env::set_var(FORCE_PORTABLE_ENV, "1");
        let probe = CapabilityProbe::new();
        assert!(!probe.available());
        std::env::remove_var(FORCE_PORTABLE_ENV);
    }
}
