//! One-time PIN issuance.
//!
//! PINs are 6-digit codes that gate retrieval of an answer. The manager keeps
//! the set of active codes so that no two live sessions share one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Size of the PIN space; codes are drawn from `0..PIN_SPACE`.
pub const PIN_SPACE: u32 = 1_000_000;

/// Draws attempted before giving up on finding a free code.
pub const MAX_GENERATE_ATTEMPTS: usize = 10;

/// Default lifetime of an issued PIN.
pub const PIN_EXPIRY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("cannot generate a unique PIN")]
    Exhausted,
    #[error("PIN expiry out of range: {0:?}")]
    ExpiryOutOfRange(Duration),
}

/// Whether `pin` has the shape of an issued PIN: exactly six ASCII digits.
pub fn is_well_formed(pin: &str) -> bool {
    pin.len() == 6 && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Issues PINs that are unique among the currently active ones.
#[derive(Debug)]
pub struct PinManager {
    /// Active PIN -> expiry.
    active: Mutex<HashMap<String, Instant>>,
    expiry: Duration,
}

impl Default for PinManager {
    fn default() -> Self {
        Self::new(PIN_EXPIRY)
    }
}

impl PinManager {
    pub fn new(expiry: Duration) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Lifetime of every PIN issued by this manager.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Issue a fresh PIN.
    pub fn generate(&self) -> Result<String, PinError> {
        self.generate_with(&mut OsRng)
    }

    fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<String, PinError> {
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let pin = format!("{:06}", rng.gen_range(0..PIN_SPACE));
            let now = Instant::now();
            let expires_at = now
                .checked_add(self.expiry)
                .ok_or(PinError::ExpiryOutOfRange(self.expiry))?;

            // Check and claim under the same lock
            let mut active = self.active.lock();
            if matches!(active.get(&pin), Some(expiry) if *expiry > now) {
                continue;
            }
            active.insert(pin.clone(), expires_at);
            return Ok(pin);
        }

        Err(PinError::Exhausted)
    }

    /// Invalidate a PIN before it expires.
    pub fn remove(&self, pin: &str) {
        self.active.lock().remove(pin);
    }

    /// Whether `pin` is issued and not yet expired.
    pub fn is_active(&self, pin: &str) -> bool {
        let now = Instant::now();
        self.active
            .lock()
            .get(pin)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Number of tracked PINs, including expired ones not yet reaped.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Drop every expired PIN. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|_, expires_at| *expires_at > now);
        before - active.len()
    }

    /// Spawn the reaper that purges expired PINs every `interval`.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, "Reaped expired PINs");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::collections::HashSet;

    #[test]
    fn test_pin_format() {
        let pins = PinManager::default();
        for _ in 0..100 {
            let pin = pins.generate().unwrap();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
            assert!(pins.is_active(&pin));
        }
    }

    #[test]
    fn test_exhaustion_after_bounded_retries() {
        let pins = PinManager::default();
        // Always draws zero
        let mut rng = StepRng::new(0, 0);

        assert_eq!(pins.generate_with(&mut rng).unwrap(), "000000");
        assert_eq!(pins.generate_with(&mut rng), Err(PinError::Exhausted));

        pins.remove("000000");
        assert!(!pins.is_active("000000"));
        assert_eq!(pins.generate_with(&mut rng).unwrap(), "000000");
    }

    #[test]
    fn test_well_formed_pins() {
        assert!(is_well_formed("004211"));
        assert!(!is_well_formed("04211"));
        assert!(!is_well_formed("0042110"));
        assert!(!is_well_formed("00421a"));
        assert!(!is_well_formed("{\"phase\":\"offered\"}"));
        assert!(!is_well_formed("٠٠٤٢١١"));
    }

    #[test]
    fn test_unrepresentable_expiry_is_an_error() {
        let pins = PinManager::new(Duration::MAX);
        assert_eq!(pins.generate(), Err(PinError::ExpiryOutOfRange(Duration::MAX)));
        assert_eq!(pins.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pin_is_reusable_before_reaping() {
        let pins = PinManager::new(Duration::from_secs(300));
        let mut rng = StepRng::new(0, 0);

        assert_eq!(pins.generate_with(&mut rng).unwrap(), "000000");
        tokio::time::advance(Duration::from_secs(300)).await;

        assert!(!pins.is_active("000000"));
        // Not reaped yet, but reclaimed on the spot
        assert_eq!(pins.active_count(), 1);
        assert_eq!(pins.generate_with(&mut rng).unwrap(), "000000");
        assert!(pins.is_active("000000"));
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let pins = Arc::new(PinManager::default());

        let issued: Vec<String> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let pins = Arc::clone(&pins);
                    scope.spawn(move || {
                        (0..200)
                            .map(|_| pins.generate().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = issued.iter().collect();
        assert_eq!(issued.len(), 1600);
        assert_eq!(unique.len(), issued.len());
        assert_eq!(pins.active_count(), 1600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_purges_expired() {
        let pins = Arc::new(PinManager::new(Duration::from_secs(300)));
        let pin = pins.generate().unwrap();

        let reaper = Arc::clone(&pins).spawn_reaper(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert!(!pins.is_active(&pin));
        assert_eq!(pins.active_count(), 0);
        reaper.abort();
    }
}
