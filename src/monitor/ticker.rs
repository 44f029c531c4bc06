/// Sampling cadence.
///
/// The sampler asks its ticker for the next tick and stops when the ticker
/// says so. Real runs use wall-clock intervals; tests drive ticks by hand and
/// read timestamps from a virtual clock.
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// How long a [`TickDriver`] waits for the sampler to finish a tick
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub trait Ticker: Send {
    /// Block until the next tick is due. False once `shutdown` fires or closes.
    fn wait_tick(&mut self, shutdown: &Receiver<()>) -> bool;

    /// Timestamp for events seen in the current tick
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed real-time interval
#[derive(Debug, Clone)]
pub struct IntervalTicker {
    interval: Duration,
}

impl IntervalTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for IntervalTicker {
    fn wait_tick(&mut self, shutdown: &Receiver<()>) -> bool {
        matches!(
            shutdown.recv_timeout(self.interval),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

/// Test ticker: advances only when its [`TickDriver`] says so
#[derive(Debug)]
pub struct ManualTicker {
    ticks: Receiver<()>,
    done: Sender<u64>,
    epoch: DateTime<Utc>,
    step: Duration,
    completed: u64,
    in_tick: bool,
}

/// Handle that fires ticks into a [`ManualTicker`]
#[derive(Debug, Clone)]
pub struct TickDriver {
    ticks: Sender<()>,
    done: Receiver<u64>,
}

impl ManualTicker {
    /// A ticker whose virtual clock advances by `step` per tick
    pub fn new(step: Duration) -> (Self, TickDriver) {
        let (tick_tx, tick_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let ticker = Self {
            ticks: tick_rx,
            done: done_tx,
            epoch: Utc::now(),
            step,
            completed: 0,
            in_tick: false,
        };
        (
            ticker,
            TickDriver {
                ticks: tick_tx,
                done: done_rx,
            },
        )
    }
}

impl Ticker for ManualTicker {
    fn wait_tick(&mut self, shutdown: &Receiver<()>) -> bool {
        if self.in_tick {
            // asking for the next tick means the previous one is finished
            let _ = self.done.send(self.completed);
            self.in_tick = false;
        }
        crossbeam_channel::select! {
            recv(self.ticks) -> msg => {
                if msg.is_err() {
                    return false;
                }
                self.completed += 1;
                self.in_tick = true;
                true
            }
            recv(shutdown) -> _ => false,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = self
            .step
            .as_nanos()
            .checked_mul(u128::from(self.completed))
            .and_then(|nanos| i64::try_from(nanos).ok())
            .map(chrono::Duration::nanoseconds)
            .unwrap_or_else(chrono::Duration::zero);
        self.epoch
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl TickDriver {
    /// Fire one tick and wait until the sampler has processed it
    pub fn tick(&self) -> bool {
        if self.ticks.send(()).is_err() {
            return false;
        }
        self.done.recv_timeout(ACK_TIMEOUT).is_ok()
    }

    pub fn tick_n(&self, n: u64) -> bool {
        (0..n).all(|_| self.tick())
    }
}
