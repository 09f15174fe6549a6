//! Session identifiers and the store keys derived from them.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

use crate::store::{SessionStore, StoreError};

/// How many candidate ids [`allocate`] draws before settling.
const ALLOCATE_ATTEMPTS: usize = 5;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "bright", "calm", "clever", "cosmic", "crisp", "curious", "dapper", "eager",
    "electric", "fancy", "fearless", "gentle", "giant", "golden", "happy", "hidden", "humble",
    "icy", "jolly", "keen", "lively", "lucky", "mellow", "misty", "nimble", "noble", "odd",
    "patient", "plain", "polite", "proud", "quick", "quiet", "rapid", "rustic", "shiny", "silent",
    "silver", "sleepy", "smooth", "snowy", "solar", "spicy", "steady", "stormy", "sunny", "swift",
    "tidy", "tiny", "vast", "velvet", "violet", "vivid", "warm", "wild", "windy", "wise", "witty",
    "young", "zesty", "zany", "frosty",
];

const NOUNS: &[&str] = &[
    "anchor", "apple", "arrow", "badger", "balloon", "beacon", "bridge", "cactus", "camera",
    "candle", "canyon", "comet", "coral", "desert", "diamond", "dolphin", "dragon", "eagle",
    "falcon", "feather", "forest", "fountain", "glacier", "guitar", "harbor", "island", "jewel",
    "kettle", "lantern", "lizard", "magnet", "meadow", "mirror", "moon", "nest", "ocean", "orchid",
    "otter", "owl", "pebble", "piano", "planet", "quartz", "raven", "river", "rocket", "sail",
    "shell", "ship", "stone", "telescope", "thread", "tiger", "tulip", "valley", "violin",
    "volcano", "walrus", "whale", "wheel", "willow", "yacht", "zebra", "zephyr",
];

/// Draw a human readable session id such as `quiet-owl`.
pub fn generate() -> String {
    let mut rng = OsRng;
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("owl");
    format!("{adjective}-{noun}")
}

/// Draw a session id whose store slot is free, giving up after a few attempts.
///
/// The last candidate is returned even if taken; a collision only means the
/// initiator's offer overwrites a stale slot.
pub async fn allocate(store: &dyn SessionStore) -> String {
    let mut candidate = generate();
    for _ in 1..ALLOCATE_ATTEMPTS {
        match store.get(&slot_key(&candidate)).await {
            Err(StoreError::NotFound) => break,
            _ => candidate = generate(),
        }
    }
    candidate
}

/// One-way hash of an arbitrary key, as lowercase hex.
pub fn hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    base16ct::lower::encode_string(&digest)
}

/// Store key of the offer/answer slot of a session.
///
/// Slot and PIN keys hash under distinct prefixes so no session id can
/// address another session's PIN record.
pub fn slot_key(session_id: &str) -> String {
    hash(&format!("slot:{session_id}"))
}

/// Store key of the PIN issued for a session.
pub fn pin_key(session_id: &str) -> String {
    hash(&format!("pin:{session_id}"))
}
