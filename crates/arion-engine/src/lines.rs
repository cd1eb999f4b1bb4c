//! Outbound line registry and occupancy accounting
//!
//! Each configured trunk number is a [`Line`] with live counters:
//! in-flight calls per direction, a per-second origination window, a
//! sliding one-minute window, and a daily counter that rolls at local
//! midnight (midnight as reported by the system clock; DST transitions
//! follow the clock). Counter mutation happens under a line-scoped mutex
//! held only for the mutation itself — never across I/O.
//!
//! Inbound traffic has priority: callers that land on a saturated line
//! wait in a per-line FIFO, and a line with a non-empty wait queue is
//! never selected for outbound origination until the queue drains.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::LimitSettings;
use crate::numbers;

/// Direction of a leg occupying a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug)]
struct Counters {
    outbound_in_flight: u32,
    inbound_in_flight: u32,
    /// Origination instants within the last second.
    second_window: VecDeque<Instant>,
    /// Call starts within the last minute.
    minute_window: VecDeque<Instant>,
    calls_today: u32,
    day: NaiveDate,
}

impl Counters {
    fn new(day: NaiveDate) -> Self {
        Self {
            outbound_in_flight: 0,
            inbound_in_flight: 0,
            second_window: VecDeque::new(),
            minute_window: VecDeque::new(),
            calls_today: 0,
            day,
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .second_window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
        {
            self.second_window.pop_front();
        }
        while self
            .minute_window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(60))
        {
            self.minute_window.pop_front();
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            self.day = today;
            self.calls_today = 0;
        }
    }

    fn load(&self) -> u32 {
        self.outbound_in_flight + self.inbound_in_flight
    }
}

/// A snapshot of one line's occupancy, for logs and introspection.
#[derive(Debug, Clone)]
pub struct LineSnapshot {
    pub phone_number: String,
    pub outbound_in_flight: u32,
    pub inbound_in_flight: u32,
    pub calls_last_minute: u32,
    pub calls_today: u32,
    pub inbound_waiting: u32,
}

/// One outbound trunk identity with live occupancy state.
pub struct Line {
    /// Panel-side id, learned from the batch response.
    panel_id: Mutex<Option<i64>>,
    pub phone_number: String,
    pub display_name: String,
    /// The synthetic line inbound calls land on when no configured line
    /// matches their DID. Only global limits apply to it.
    pub unmapped: bool,
    counters: Mutex<Counters>,
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl Line {
    fn new(phone_number: String, display_name: String, unmapped: bool) -> Self {
        Self {
            panel_id: Mutex::new(None),
            phone_number,
            display_name,
            unmapped,
            counters: Mutex::new(Counters::new(Local::now().date_naive())),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn panel_id(&self) -> Option<i64> {
        *self.panel_id.lock()
    }

    pub fn set_panel_id(&self, id: i64) {
        *self.panel_id.lock() = Some(id);
    }

    pub fn snapshot(&self) -> LineSnapshot {
        let mut counters = self.counters.lock();
        let now = Instant::now();
        counters.prune(now);
        LineSnapshot {
            phone_number: self.phone_number.clone(),
            outbound_in_flight: counters.outbound_in_flight,
            inbound_in_flight: counters.inbound_in_flight,
            calls_last_minute: counters.minute_window.len() as u32,
            calls_today: counters.calls_today,
            inbound_waiting: self.waiters.lock().len() as u32,
        }
    }

    pub fn inbound_waiting(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether this line may originate right now under the given limits.
    ///
    /// The five admission filters, in order: concurrency ceiling, queued
    /// inbound priority, sliding minute cap, daily cap, per-second spacing.
    pub fn admits_outbound(&self, limits: &LimitSettings, now: Instant) -> bool {
        if self.inbound_waiting() > 0 {
            return false;
        }
        let mut counters = self.counters.lock();
        counters.prune(now);
        counters.roll_day(Local::now().date_naive());
        if counters.load() >= limits.max_concurrent_calls {
            return false;
        }
        if counters.minute_window.len() as u32 >= limits.max_calls_per_minute {
            return false;
        }
        if counters.calls_today >= limits.max_calls_per_day {
            return false;
        }
        let spacing = Duration::from_secs_f64(1.0 / limits.max_originations_per_second as f64);
        if counters
            .second_window
            .back()
            .is_some_and(|last| now.duration_since(*last) < spacing)
        {
            return false;
        }
        true
    }

    /// Current load and per-second count, used for selection ordering.
    pub fn load_key(&self, now: Instant) -> (u32, u32) {
        let mut counters = self.counters.lock();
        counters.prune(now);
        (counters.load(), counters.second_window.len() as u32)
    }

    /// Account a new outbound origination.
    pub fn begin_outbound(&self, now: Instant) {
        let mut counters = self.counters.lock();
        counters.prune(now);
        counters.roll_day(Local::now().date_naive());
        counters.outbound_in_flight += 1;
        counters.second_window.push_back(now);
        counters.minute_window.push_back(now);
        counters.calls_today += 1;
        debug!(line = %self.phone_number, load = counters.load(), "outbound call started");
    }

    /// Account an accepted inbound call.
    pub fn begin_inbound(&self, now: Instant) {
        let mut counters = self.counters.lock();
        counters.prune(now);
        counters.roll_day(Local::now().date_naive());
        counters.inbound_in_flight += 1;
        counters.minute_window.push_back(now);
        counters.calls_today += 1;
        debug!(line = %self.phone_number, load = counters.load(), "inbound call started");
    }

    /// Claim an inbound slot if one is free; check and increment happen
    /// under the same lock so concurrent arrivals cannot oversubscribe.
    pub fn try_begin_inbound(&self, limits: &LimitSettings, now: Instant) -> bool {
        let mut counters = self.counters.lock();
        counters.prune(now);
        counters.roll_day(Local::now().date_naive());
        if counters.load() >= limits.max_concurrent_calls {
            return false;
        }
        counters.inbound_in_flight += 1;
        counters.minute_window.push_back(now);
        counters.calls_today += 1;
        debug!(line = %self.phone_number, load = counters.load(), "inbound call started");
        true
    }

    /// Release a leg's slot and wake the next queued inbound waiter, if any.
    pub fn end_call(&self, direction: Direction) {
        {
            let mut counters = self.counters.lock();
            let slot = match direction {
                Direction::Inbound => &mut counters.inbound_in_flight,
                Direction::Outbound => &mut counters.outbound_in_flight,
            };
            if *slot == 0 {
                warn!(line = %self.phone_number, ?direction, "release without matching acquire");
            }
            *slot = slot.saturating_sub(1);
        }
        self.wake_next_inbound();
    }

    /// Join the inbound wait queue; the receiver fires when a slot frees.
    pub fn enqueue_inbound(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(tx);
        rx
    }

    fn wake_next_inbound(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(tx) = waiters.pop_front() {
            // A closed receiver means the caller gave up (hung up while
            // queued); skip to the next one.
            if tx.send(()).is_ok() {
                break;
            }
        }
    }
}

/// All configured lines, in configuration order, plus the unmapped line.
pub struct LineRegistry {
    lines: Vec<Arc<Line>>,
    unmapped: Arc<Line>,
    limits: LimitSettings,
    global_inbound: AtomicU32,
    global_outbound: AtomicU32,
}

impl LineRegistry {
    pub fn new(numbers: &[String], limits: LimitSettings) -> Self {
        let lines = numbers
            .iter()
            .map(|n| {
                Arc::new(Line::new(
                    numbers::normalize(n),
                    format!("line {}", numbers::normalize(n)),
                    false,
                ))
            })
            .collect();
        Self {
            lines,
            unmapped: Arc::new(Line::new(String::new(), "unmapped".into(), true)),
            limits,
            global_inbound: AtomicU32::new(0),
            global_outbound: AtomicU32::new(0),
        }
    }

    pub fn limits(&self) -> &LimitSettings {
        &self.limits
    }

    pub fn lines(&self) -> &[Arc<Line>] {
        &self.lines
    }

    pub fn unmapped(&self) -> Arc<Line> {
        self.unmapped.clone()
    }

    /// Match an inbound DID to a configured line by its last four digits,
    /// falling back to the unmapped line.
    pub fn match_did(&self, did: &str) -> Arc<Line> {
        self.lines
            .iter()
            .find(|line| numbers::matches_line(did, &line.phone_number))
            .cloned()
            .unwrap_or_else(|| self.unmapped.clone())
    }

    pub fn find_by_number(&self, number: &str) -> Option<Arc<Line>> {
        let number = numbers::normalize(number);
        self.lines
            .iter()
            .find(|line| line.phone_number == number)
            .cloned()
    }

    /// Learn panel-side line ids from a batch response.
    pub fn update_panel_ids(&self, panel_lines: &[(i64, String)]) {
        for (id, number) in panel_lines {
            if let Some(line) = self.find_by_number(number) {
                line.set_panel_id(*id);
            }
        }
    }

    /// Least-loaded permissible line for a new outbound call, or `None`
    /// when every line is currently excluded (the caller sleeps briefly
    /// and retries — this is the inbound-priority yield point).
    pub fn select_for_outbound(&self, now: Instant) -> Option<Arc<Line>> {
        if self.global_outbound.load(Ordering::Relaxed) >= self.limits.max_concurrent_outbound {
            return None;
        }
        self.lines
            .iter()
            .filter(|line| line.admits_outbound(&self.limits, now))
            .min_by_key(|line| line.load_key(now))
            .cloned()
    }

    /// Global inbound admission check.
    pub fn admit_global_inbound(&self) -> bool {
        self.global_inbound.load(Ordering::Relaxed) < self.limits.max_concurrent_inbound
    }

    pub fn count_global(&self, direction: Direction, delta: i32) {
        let counter = match direction {
            Direction::Inbound => &self.global_inbound,
            Direction::Outbound => &self.global_outbound,
        };
        if delta >= 0 {
            counter.fetch_add(delta as u32, Ordering::Relaxed);
        } else {
            let mut current = counter.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_sub((-delta) as u32);
                match counter.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
    }

    pub fn snapshots(&self) -> Vec<LineSnapshot> {
        self.lines.iter().map(|line| line.snapshot()).collect()
    }
}
