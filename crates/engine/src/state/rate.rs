use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window message counter per user.
///
/// Users with nothing left inside the window are dropped at most once per window, from `check`.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_messages: usize,
    history: Mutex<History>,
}

#[derive(Debug, Default)]
struct History {
    users: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl History {
    fn sweep(&mut self, window: Duration, now: Instant) -> usize {
        let before = self.users.len();
        self.users.retain(|_, queue| {
            prune_older_than(queue, window, now);
            !queue.is_empty()
        });
        self.last_sweep = Some(now);
        before - self.users.len()
    }

    fn sweep_due(&self, window: Duration, now: Instant) -> bool {
        self.last_sweep
            .map_or(true, |at| now.saturating_duration_since(at) >= window)
    }
}

fn prune_older_than(q: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&front) = q.front() {
        if now.saturating_duration_since(front) >= window {
            q.pop_front();
        } else {
            break;
        }
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_messages: usize) -> Self {
        Self {
            window,
            max_messages,
            history: Mutex::new(History::default()),
        }
    }

    /// Record a message now; `true` when the user is over the limit.
    pub fn check(&self, user_id: &str) -> bool {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&self, user_id: &str, now: Instant) -> bool {
        let mut guard = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.sweep_due(self.window, now) {
            let dropped = guard.sweep(self.window, now);
            if dropped > 0 {
                log::debug!("Rate limiter dropped {dropped} idle users");
            }
        }
        let queue = guard.users.entry(user_id.to_string()).or_default();
        prune_older_than(queue, self.window, now);
        queue.push_back(now);
        queue.len() > self.max_messages
    }

    /// Messages currently inside the window for `user_id`.
    #[must_use]
    pub fn recent(&self, user_id: &str, now: Instant) -> usize {
        let mut guard = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.users.get_mut(user_id).map_or(0, |queue| {
            prune_older_than(queue, self.window, now);
            queue.len()
        })
    }

    /// Drop users with no message inside the window.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut guard = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.sweep(self.window, now)
    }

    #[must_use]
    pub fn tracked_users(&self) -> usize {
        self.history.lock().map(|g| g.users.len()).unwrap_or_default()
    }
}
