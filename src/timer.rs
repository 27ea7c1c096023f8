//! Hashed-slot timer wheel and timer service.
//!
//! The wheel has [`SLOTS`] slots of [`TICK_MS`] milliseconds each, wide
//! enough for I/O deadlines, which is the intended clientele. Registration
//! and expiry are O(1) amortised; draining a slot costs that slot's entry
//! count, not the total timer count. Deadlines farther out than one wheel
//! revolution share a slot with nearer ones and are re-inserted when their
//! slot drains early, so they still wait their full term.
//!
//! Deadlines are computed against a monotonic clock, so wall-clock steps do
//! not move them. The service samples both clocks on every drain and raises
//! a diagnostic `time_anomaly` flag when they diverge by more than one
//! second; policy on what to do about it stays with the caller.
//!
//! Cancellation tombstones the callback; the wheel entry is reclaimed on
//! the next sweep of its slot, which keeps `cancel` O(1). `refresh` and
//! `reset` move the deadline and push a fresh entry; the superseded entry
//! identifies itself by a deadline mismatch and is dropped when its slot
//! drains. Insertions that become the new earliest deadline fire a front
//! hook, which the I/O driver wires to its kernel-wait wakeup.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::warn;

/// Number of wheel slots.
pub const SLOTS: usize = 60;
/// Width of one slot in milliseconds.
pub const TICK_MS: u64 = 1000;

/// Callback run when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Sentinel for conditional timers: the callback is skipped if the weak
/// handle is dead at fire time.
pub type Sentinel = Weak<dyn Any + Send + Sync + 'static>;

static MONO_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on the process-wide monotonic clock.
#[must_use]
pub fn monotonic_ms() -> u64 {
    let epoch = *MONO_EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Time source for the service: the real monotonic clock, or a manually
/// advanced one for deterministic tests.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Process monotonic clock.
    Monotonic,
    /// Manually driven clock (milliseconds).
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// Creates a manual clock starting at zero.
    #[must_use]
    pub fn manual() -> (Self, Arc<AtomicU64>) {
        let cell = Arc::new(AtomicU64::new(0));
        (Self::Manual(Arc::clone(&cell)), cell)
    }

    fn now_ms(&self) -> u64 {
        match self {
            Self::Monotonic => monotonic_ms(),
            Self::Manual(cell) => cell.load(Ordering::SeqCst),
        }
    }
}

struct TimerInner {
    deadline: AtomicU64,
    period_ms: AtomicU64,
    recurring: bool,
    callback: Mutex<Option<TimerCallback>>,
}

impl fmt::Debug for TimerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerInner")
            .field("deadline", &self.deadline)
            .field("period_ms", &self.period_ms)
            .field("recurring", &self.recurring)
            .field("callback", &"<callback>")
            .finish()
    }
}

struct WheelEntry {
    at: u64,
    timer: Arc<TimerInner>,
}

struct Slot {
    entries: Vec<WheelEntry>,
    earliest: u64,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            entries: Vec::new(),
            earliest: u64::MAX,
        }
    }
}

struct Wheel {
    slots: Vec<Slot>,
    cursor: usize,
    cursor_time: u64,
}

impl Wheel {
    fn new(now: u64) -> Self {
        let mut slots = Vec::with_capacity(SLOTS);
        slots.resize_with(SLOTS, Slot::empty);
        Self {
            slots,
            cursor: 0,
            cursor_time: now,
        }
    }

    fn earliest(&self) -> u64 {
        self.slots.iter().map(|s| s.earliest).min().unwrap_or(u64::MAX)
    }

    /// Places an entry; `(slot − cursor) mod SLOTS` equals the whole ticks
    /// until the deadline as seen from the wheel's current position.
    fn insert(&mut self, timer: Arc<TimerInner>, at: u64) {
        let ticks = (at.saturating_sub(self.cursor_time) / TICK_MS) as usize;
        let slot = (self.cursor + ticks % SLOTS) % SLOTS;
        let slot = &mut self.slots[slot];
        slot.earliest = slot.earliest.min(at);
        slot.entries.push(WheelEntry { at, timer });
    }
}

/// Handle to a registered timer.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerInner>,
    service: Arc<TimerService>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("deadline", &self.inner.deadline.load(Ordering::Relaxed))
            .field("recurring", &self.inner.recurring)
            .finish()
    }
}

impl TimerHandle {
    /// Clears the callback so the entry is skipped at expiry. Returns
    /// `false` if the timer already fired (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let _wheel = self.service.wheel.write();
        self.inner.callback.lock().take().is_some()
    }

    /// Re-arms the timer for one full period from now. Returns `false` if
    /// it is no longer live.
    pub fn refresh(&self) -> bool {
        let mut wheel = self.service.wheel.write();
        if self.inner.callback.lock().is_none() {
            return false;
        }
        let at = self
            .service
            .clock
            .now_ms()
            .saturating_add(self.inner.period_ms.load(Ordering::Relaxed));
        self.inner.deadline.store(at, Ordering::Relaxed);
        wheel.insert(Arc::clone(&self.inner), at);
        true
    }

    /// Changes the period to `ms`, re-anchoring at the original start
    /// (`from_now == false`) or at the present (`from_now == true`).
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.inner.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let mut wheel = self.service.wheel.write();
        if self.inner.callback.lock().is_none() {
            return false;
        }
        let start = if from_now {
            self.service.clock.now_ms()
        } else {
            self.inner
                .deadline
                .load(Ordering::Relaxed)
                .saturating_sub(self.inner.period_ms.load(Ordering::Relaxed))
        };
        self.inner.period_ms.store(ms, Ordering::Relaxed);
        let at = start.saturating_add(ms);
        self.inner.deadline.store(at, Ordering::Relaxed);
        wheel.insert(Arc::clone(&self.inner), at);
        true
    }

    /// Whether the callback is still armed.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.callback.lock().is_some()
    }
}

/// The timer service: a wheel plus clock bookkeeping and the front-insert
/// hook.
pub struct TimerService {
    wheel: RwLock<Wheel>,
    clock: Clock,
    front_hook: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
    tickled: AtomicBool,
    last_monotonic: AtomicU64,
    last_wall: AtomicU64,
    anomaly: AtomicBool,
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("clock", &self.clock)
            .field("anomaly", &self.anomaly.load(Ordering::Relaxed))
            .finish()
    }
}

impl TimerService {
    /// Creates a service on the monotonic clock.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_clock(Clock::Monotonic)
    }

    /// Creates a service on the given clock.
    #[must_use]
    pub fn with_clock(clock: Clock) -> Arc<Self> {
        let now = clock.now_ms();
        Arc::new(Self {
            wheel: RwLock::new(Wheel::new(now)),
            clock,
            front_hook: RwLock::new(None),
            tickled: AtomicBool::new(false),
            last_monotonic: AtomicU64::new(monotonic_ms()),
            last_wall: AtomicU64::new(wall_ms()),
            anomaly: AtomicBool::new(false),
        })
    }

    /// Installs the hook fired when an insertion becomes the new earliest
    /// deadline. The I/O driver points this at its kernel-wait wakeup.
    pub fn set_front_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.front_hook.write() = Some(hook);
    }

    /// Current time on the service clock, in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Registers a timer firing `ms` milliseconds from now.
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        callback: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        let at = self.clock.now_ms().saturating_add(ms);
        let inner = Arc::new(TimerInner {
            deadline: AtomicU64::new(at),
            period_ms: AtomicU64::new(ms),
            recurring,
            callback: Mutex::new(Some(callback)),
        });
        let at_front = {
            let mut wheel = self.wheel.write();
            let prev = wheel.earliest();
            wheel.insert(Arc::clone(&inner), at);
            at < prev
        };
        if at_front && !self.tickled.swap(true, Ordering::AcqRel) {
            if let Some(hook) = self.front_hook.read().clone() {
                hook();
            }
        }
        TimerHandle {
            inner,
            service: Arc::clone(self),
        }
    }

    /// Registers a timer whose callback only runs while `sentinel` is
    /// still alive.
    pub fn add_condition_timer(
        self: &Arc<Self>,
        ms: u64,
        callback: TimerCallback,
        sentinel: Sentinel,
        recurring: bool,
    ) -> TimerHandle {
        let wrapped: TimerCallback = Arc::new(move || {
            if sentinel.upgrade().is_some() {
                callback();
            }
        });
        self.add_timer(ms, wrapped, recurring)
    }

    /// Milliseconds until the earliest live deadline, or `None` when the
    /// wheel is empty. Also re-arms the front hook.
    #[must_use]
    pub fn next_timer(&self) -> Option<u64> {
        self.tickled.store(false, Ordering::Release);
        let wheel = self.wheel.read();
        let earliest = wheel.earliest();
        if earliest == u64::MAX {
            return None;
        }
        Some(earliest.saturating_sub(self.clock.now_ms()))
    }

    /// Whether any timer is registered.
    #[must_use]
    pub fn has_timer(&self) -> bool {
        self.wheel.read().earliest() != u64::MAX
    }

    /// Whether monotonic and wall clocks have diverged by more than one
    /// second since the service started sampling. Diagnostic only.
    #[must_use]
    pub fn time_anomaly(&self) -> bool {
        self.anomaly.load(Ordering::Relaxed)
    }

    /// Moves every expired callback into `out`, advancing the wheel cursor
    /// across all slots whose window has passed. Recurring timers are
    /// re-registered at `now + period`.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        self.sample_clocks();
        let now = self.clock.now_ms();
        let mut reinserts: SmallVec<[(Arc<TimerInner>, u64); 8]> = SmallVec::new();

        let mut wheel = self.wheel.write();
        for _ in 0..=SLOTS {
            let cursor = wheel.cursor;
            let slot = &mut wheel.slots[cursor];
            if !slot.entries.is_empty() {
                let mut kept = Vec::with_capacity(slot.entries.len());
                let mut earliest = u64::MAX;
                for entry in slot.entries.drain(..) {
                    let current = entry.timer.deadline.load(Ordering::Relaxed);
                    if current != entry.at {
                        // Superseded by refresh/reset; the fresh entry is
                        // elsewhere in the wheel.
                        continue;
                    }
                    if entry.at > now {
                        earliest = earliest.min(entry.at);
                        kept.push(entry);
                        continue;
                    }
                    if entry.timer.recurring {
                        let callback = entry.timer.callback.lock().clone();
                        if let Some(callback) = callback {
                            out.push(callback);
                            let period = entry.timer.period_ms.load(Ordering::Relaxed);
                            let next = now.saturating_add(period);
                            entry.timer.deadline.store(next, Ordering::Relaxed);
                            reinserts.push((entry.timer, next));
                        }
                    } else if let Some(callback) = entry.timer.callback.lock().take() {
                        out.push(callback);
                    }
                }
                slot.entries = kept;
                slot.earliest = earliest;
            }
            if wheel.cursor_time + TICK_MS <= now {
                wheel.cursor = (wheel.cursor + 1) % SLOTS;
                wheel.cursor_time += TICK_MS;
            } else {
                break;
            }
        }
        // A jump past a full revolution has visited every slot once; align
        // the wheel with the present.
        if wheel.cursor_time + TICK_MS <= now {
            wheel.cursor_time = now;
        }
        for (timer, at) in reinserts {
            wheel.insert(timer, at);
        }
    }

    /// Drops every registered timer.
    pub fn clear(&self) {
        let mut wheel = self.wheel.write();
        for slot in &mut wheel.slots {
            slot.entries.clear();
            slot.earliest = u64::MAX;
        }
    }

    fn sample_clocks(&self) {
        if !matches!(self.clock, Clock::Monotonic) {
            return;
        }
        let mono = monotonic_ms();
        let wall = wall_ms();
        let last_mono = self.last_monotonic.swap(mono, Ordering::Relaxed);
        let last_wall = self.last_wall.swap(wall, Ordering::Relaxed);
        let mono_diff = mono.saturating_sub(last_mono) as i64;
        let wall_diff = wall.wrapping_sub(last_wall) as i64;
        if (mono_diff - wall_diff).abs() > 1000 {
            if !self.anomaly.swap(true, Ordering::Relaxed) {
                warn!(mono_diff, wall_diff, "monotonic/wall clock divergence detected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn drain(service: &Arc<TimerService>) -> usize {
        let mut out = Vec::new();
        service.list_expired(&mut out);
        let n = out.len();
        for cb in out {
            cb();
        }
        n
    }

    #[test]
    fn empty_wheel_has_no_deadline() {
        let (clock, _cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        assert_eq!(service.next_timer(), None);
        assert!(!service.has_timer());
    }

    #[test]
    fn timer_fires_once_at_deadline() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let _handle = service.add_timer(500, counter_cb(&fired), false);

        assert_eq!(service.next_timer(), Some(500));
        cell.store(499, Ordering::SeqCst);
        assert_eq!(drain(&service), 0);
        cell.store(500, Ordering::SeqCst);
        assert_eq!(drain(&service), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // One-shot: later drains stay quiet.
        cell.store(5000, Ordering::SeqCst);
        assert_eq!(drain(&service), 0);
    }

    #[test]
    fn cancelled_timer_is_skipped_and_cancel_is_idempotent() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = service.add_timer(100, counter_cb(&fired), false);

        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel is a no-op");
        cell.store(200, Ordering::SeqCst);
        assert_eq!(drain(&service), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_reregisters() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = service.add_timer(1000, counter_cb(&fired), true);

        for step in 1..=3u64 {
            cell.store(step * 1000, Ordering::SeqCst);
            assert_eq!(drain(&service), 1, "tick {step}");
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(handle.is_live());
        handle.cancel();
        cell.store(10_000, Ordering::SeqCst);
        assert_eq!(drain(&service), 0);
    }

    #[test]
    fn condition_timer_skips_dead_sentinel() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));

        let sentinel: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        let _live = service.add_condition_timer(
            100,
            counter_cb(&fired),
            Arc::downgrade(&sentinel),
            false,
        );

        let dead_sentinel: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        let weak_dead = Arc::downgrade(&dead_sentinel);
        drop(dead_sentinel);
        let _dead = service.add_condition_timer(100, counter_cb(&fired), weak_dead, false);

        cell.store(200, Ordering::SeqCst);
        // Both entries expire; only the live sentinel's callback runs.
        assert_eq!(drain(&service), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_pushes_deadline_forward() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = service.add_timer(1000, counter_cb(&fired), false);

        cell.store(900, Ordering::SeqCst);
        assert!(handle.refresh());
        cell.store(1500, Ordering::SeqCst);
        assert_eq!(drain(&service), 0, "stale entry must not fire");
        cell.store(1900, Ordering::SeqCst);
        assert_eq!(drain(&service), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_from_now_changes_period() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = service.add_timer(5000, counter_cb(&fired), false);

        cell.store(100, Ordering::SeqCst);
        assert!(handle.reset(200, true));
        cell.store(300, Ordering::SeqCst);
        assert_eq!(drain(&service), 1);
        assert!(!handle.refresh(), "fired one-shot cannot be refreshed");
    }

    #[test]
    fn far_deadline_waits_full_term_despite_slot_sharing() {
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        // 90 s is beyond one revolution: shares a slot with a 30 s timer.
        let _far = service.add_timer(90_000, counter_cb(&fired), false);
        let _near = service.add_timer(30_000, counter_cb(&fired), false);

        cell.store(30_000, Ordering::SeqCst);
        assert_eq!(drain(&service), 1, "only the near timer fires");
        cell.store(89_000, Ordering::SeqCst);
        assert_eq!(drain(&service), 0);
        cell.store(90_000, Ordering::SeqCst);
        assert_eq!(drain(&service), 1);
    }

    #[test]
    fn front_insert_fires_hook_once_per_rearm() {
        let (clock, _cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let hooks = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hooks);
        service.set_front_hook(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let _far = service.add_timer(50_000, Arc::new(|| {}), false);
        assert_eq!(hooks.load(Ordering::SeqCst), 1, "first timer is the front");
        let _nearer = service.add_timer(10_000, Arc::new(|| {}), false);
        assert_eq!(hooks.load(Ordering::SeqCst), 1, "hook latched until next_timer");
        let _ = service.next_timer();
        let _nearest = service.add_timer(1_000, Arc::new(|| {}), false);
        assert_eq!(hooks.load(Ordering::SeqCst), 2);
    }

    proptest::proptest! {
        /// Placement invariant: the slot distance from the cursor equals
        /// the tick distance to the deadline, modulo the wheel size.
        #[test]
        fn placement_matches_tick_distance(ms in 0u64..600_000) {
            let (clock, _cell) = Clock::manual();
            let service = TimerService::with_clock(clock);
            let _handle = service.add_timer(ms, Arc::new(|| {}), false);

            let wheel = service.wheel.read();
            let slot = wheel
                .slots
                .iter()
                .position(|slot| !slot.entries.is_empty())
                .expect("entry placed");
            let ticks = (ms / TICK_MS) as usize;
            proptest::prop_assert_eq!((slot + SLOTS - wheel.cursor) % SLOTS, ticks % SLOTS);
        }
    }

    #[test]
    fn bulk_drain_preserves_deadline_order_within_tick() {
        crate::test_util::init_test_logging();
        let (clock, cell) = Clock::manual();
        let service = TimerService::with_clock(clock);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Deterministic scatter across [0, 60_000) ms.
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut deadlines = Vec::new();
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            deadlines.push(seed % 60_000);
        }
        for &ms in &deadlines {
            let order = Arc::clone(&order);
            service.add_timer(
                ms,
                Arc::new(move || {
                    order.lock().push(ms);
                }),
                false,
            );
        }

        let mut fired_total = 0;
        let mut now = 0u64;
        while now < 61_000 {
            now += 250;
            cell.store(now, Ordering::SeqCst);
            fired_total += drain(&service);
        }
        assert_eq!(fired_total, 10_000, "every timer fires exactly once");

        let fired = order.lock();
        for pair in fired.windows(2) {
            assert!(
                pair[1] + TICK_MS >= pair[0],
                "deadline order violated beyond tick slop: {} then {}",
                pair[0],
                pair[1]
            );
        }
    }
}
