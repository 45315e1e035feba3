//! Per-device idle timers.
//!
//! Every device that has sent a message owns exactly one armed timer. New
//! activity replaces the timer; a timer that reaches its deadline emits the
//! device on the expiry channel and removes its own entry.
//!
//! Each entry carries a generation number. A firing timer only emits if its
//! generation is still the one in the map, checked under the same lock that
//! [`DeviceTimeoutSupervisor::on_activity`] holds while replacing the entry,
//! so a replaced timer can never fire after the replacement returns.
//!
//! An expiry can still sit in the channel while the device sends again, so the
//! consumer checks [`DeviceTimeoutSupervisor::is_current`] before acting on it.

use crate::device::DeviceIdentity;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct DeviceTimer {
    generation: u64,
    deadline: Instant,
    cancel: CancellationToken,
}

type TimerMap = Arc<Mutex<HashMap<DeviceIdentity, DeviceTimer>>>;

/// A device whose idle window elapsed, tagged with the timer that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceExpiry {
    pub device: DeviceIdentity,
    pub generation: u64,
}

/// Maintains one cancellable idle timer per device.
pub struct DeviceTimeoutSupervisor {
    idle_window: Duration,
    timers: TimerMap,
    next_generation: AtomicU64,
    expired_tx: mpsc::UnboundedSender<DeviceExpiry>,
    root: CancellationToken,
}

impl DeviceTimeoutSupervisor {
    /// Create a supervisor that reports expired devices on `expired_tx`.
    pub fn new(idle_window: Duration, expired_tx: mpsc::UnboundedSender<DeviceExpiry>) -> Self {
        Self {
            idle_window,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            expired_tx,
            root: CancellationToken::new(),
        }
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// (Re)arm the timer for `device`, cancelling any pending one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_activity(&self, device: &DeviceIdentity) {
        if self.root.is_cancelled() {
            debug!(device = %device, "Supervisor shut down, not arming timer");
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.idle_window;
        let cancel = self.root.child_token();

        {
            let mut timers = self.timers.lock();
            let previous = timers.insert(
                device.clone(),
                DeviceTimer {
                    generation,
                    deadline,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            metrics::gauge!("bridge.devices.armed").set(timers.len() as f64);
        }

        debug!(device = %device, generation, "Device timer armed");

        tokio::spawn(run_timer(
            Arc::clone(&self.timers),
            device.clone(),
            generation,
            deadline,
            cancel,
            self.expired_tx.clone(),
        ));
    }

    /// Cancel the timer for `device` without firing it.
    pub fn cancel(&self, device: &DeviceIdentity) -> bool {
        let mut timers = self.timers.lock();
        match timers.remove(device) {
            Some(timer) => {
                timer.cancel.cancel();
                metrics::gauge!("bridge.devices.armed").set(timers.len() as f64);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, device: &DeviceIdentity) -> bool {
        self.timers.lock().contains_key(device)
    }

    /// Whether `expiry` still describes the device's latest timer.
    ///
    /// A fired timer removes its own entry, so any entry present now was armed
    /// by activity after the expiry was emitted.
    pub fn is_current(&self, expiry: &DeviceExpiry) -> bool {
        match self.timers.lock().get(&expiry.device) {
            Some(timer) => timer.generation == expiry.generation,
            None => true,
        }
    }

    pub fn deadline(&self, device: &DeviceIdentity) -> Option<Instant> {
        self.timers.lock().get(device).map(|t| t.deadline)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Cancel every live timer.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock();
        let count = timers.len();
        self.root.cancel();
        timers.clear();
        metrics::gauge!("bridge.devices.armed").set(0.0);

        info!(cancelled = count, "Device timers shut down");
    }
}

impl Drop for DeviceTimeoutSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_timer(
    timers: TimerMap,
    device: DeviceIdentity,
    generation: u64,
    deadline: Instant,
    cancel: CancellationToken,
    expired_tx: mpsc::UnboundedSender<DeviceExpiry>,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep_until(deadline) => {}
    }

    let mut timers = timers.lock();

    // Replaced or cancelled while we were waking up
    if cancel.is_cancelled() || timers.get(&device).map(|t| t.generation) != Some(generation) {
        return;
    }

    info!(device = %device, "Device idle window elapsed");
    metrics::counter!("bridge.timeouts.fired").increment(1);

    let expiry = DeviceExpiry {
        device: device.clone(),
        generation,
    };
    if expired_tx.send(expiry).is_err() {
        debug!(device = %device, "Expiry receiver dropped");
    }

    timers.remove(&device);
    metrics::gauge!("bridge.devices.armed").set(timers.len() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    const WINDOW: Duration = Duration::from_secs(30);

    fn device(name: &str) -> DeviceIdentity {
        DeviceIdentity::parse(name).unwrap()
    }

    fn supervisor() -> (DeviceTimeoutSupervisor, mpsc::UnboundedReceiver<DeviceExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeviceTimeoutSupervisor::new(WINDOW, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_idle_window() {
        let (supervisor, mut rx) = supervisor();
        let device7 = device("device7");

        supervisor.on_activity(&device7);
        assert!(supervisor.is_armed(&device7));

        tokio::time::sleep(WINDOW - Duration::from_millis(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.try_recv().map(|e| e.device), Ok(device7.clone()));
        assert!(!supervisor.is_armed(&device7));
        assert_eq!(supervisor.armed_count(), 0);

        tokio::time::sleep(WINDOW * 3).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_pending_timeout() {
        let (supervisor, mut rx) = supervisor();
        let device7 = device("device7");

        supervisor.on_activity(&device7);
        let first_deadline = supervisor.deadline(&device7).unwrap();

        tokio::time::sleep(WINDOW / 2).await;
        supervisor.on_activity(&device7);
        assert!(supervisor.deadline(&device7).unwrap() > first_deadline);

        // Past the original deadline: the cancelled timer stays silent
        tokio::time::sleep(WINDOW / 2 + Duration::from_millis(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(supervisor.is_armed(&device7));

        tokio::time::sleep(WINDOW / 2).await;
        assert_eq!(rx.try_recv().map(|e| e.device), Ok(device7));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_activity_keeps_single_timer() {
        let (supervisor, mut rx) = supervisor();
        let device7 = device("device7");

        for _ in 0..50 {
            supervisor.on_activity(&device7);
            assert_eq!(supervisor.armed_count(), 1);
        }

        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(rx.try_recv().map(|e| e.device), Ok(device7));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_expire_independently() {
        let (supervisor, mut rx) = supervisor();
        let a = device("press_a");
        let b = device("press_b");

        supervisor.on_activity(&a);
        tokio::time::sleep(Duration::from_secs(10)).await;
        supervisor.on_activity(&b);
        assert_eq!(supervisor.armed_count(), 2);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(rx.try_recv().map(|e| e.device), Ok(a.clone()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(supervisor.is_armed(&b));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().map(|e| e.device), Ok(b));
        assert_eq!(supervisor.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (supervisor, mut rx) = supervisor();
        let device7 = device("device7");

        supervisor.on_activity(&device7);
        assert!(supervisor.cancel(&device7));
        assert!(!supervisor.cancel(&device7));

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all() {
        let (supervisor, mut rx) = supervisor();

        for name in ["a1", "a2", "a3"] {
            supervisor.on_activity(&device(name));
        }
        assert_eq!(supervisor.armed_count(), 3);

        supervisor.shutdown();
        assert_eq!(supervisor.armed_count(), 0);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_after_shutdown_is_ignored() {
        let (supervisor, mut rx) = supervisor();
        let device7 = device("device7");

        supervisor.shutdown();
        for _ in 0..5 {
            supervisor.on_activity(&device7);
        }

        assert!(!supervisor.is_armed(&device7));
        assert_eq!(supervisor.armed_count(), 0);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_goes_stale_when_device_rearms() {
        let (supervisor, mut rx) = supervisor();
        let device7 = device("device7");

        supervisor.on_activity(&device7);
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;

        let expiry = rx.try_recv().unwrap();
        assert!(supervisor.is_current(&expiry));

        // Device spoke again before the expiry was handled
        supervisor.on_activity(&device7);
        assert!(!supervisor.is_current(&expiry));
    }
}
