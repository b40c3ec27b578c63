//! Message-id generation (§4.8): a monotonic 32-bit counter seeded from wall
//! time, with optional per-thread high-16-bit client tagging.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

static NEXT_ID: AtomicI32 = AtomicI32::new(0);
static SEEDED: Once = Once::new();
static USING_CLIENT_IDS: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CLIENT_ID: Cell<i32> = const { Cell::new(0) };
}

fn ensure_seeded() {
    SEEDED.call_once(|| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seed = ((now.as_secs() as i64) << 16) ^ (now.as_millis() as i64);
        NEXT_ID.store(seed as i32, Ordering::SeqCst);
    });
}

/// Returns the next id and post-increments the process-wide counter. If a
/// client id is active on this thread, the top 16 bits are replaced by it.
pub fn next_message_id() -> i32 {
    ensure_seeded();
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);

    if USING_CLIENT_IDS.load(Ordering::SeqCst) {
        let tag = CLIENT_ID.with(Cell::get);
        (id & 0xFFFF) | tag
    } else {
        id
    }
}

/// Tags every id generated on this thread with `id`'s top 16 bits. `id`'s
/// bottom 16 bits are discarded; the masked value must be nonzero.
pub fn set_client_id(id: i32) -> Result<(), Error> {
    let masked = id & 0xFFFF_0000u32 as i32;
    if masked == 0 {
        return Err(Error::InvalidClientId { id });
    }
    CLIENT_ID.with(|c| c.set(masked));
    USING_CLIENT_IDS.store(true, Ordering::SeqCst);
    Ok(())
}

pub fn client_id() -> Option<i32> {
    if USING_CLIENT_IDS.load(Ordering::SeqCst) {
        Some(CLIENT_ID.with(Cell::get))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_monotonic_within_a_thread_when_untagged() {
        // Client ids are process-wide-enabled once set, and other tests in
        // this binary run in the same process, so we only assert the
        // difference-by-one property, which holds regardless.
        let a = next_message_id();
        let b = next_message_id();
        assert_eq!(b.wrapping_sub(a), 1);
    }

    #[test]
    fn invalid_client_id_is_rejected() {
        assert!(set_client_id(0x0000_00FF).is_err());
    }

    #[test]
    fn valid_client_id_tags_subsequent_ids() {
        std::thread::spawn(|| {
            set_client_id(0x1234_0000).unwrap();
            let mut seen = HashSet::new();
            for _ in 0..8 {
                let id = next_message_id();
                assert_eq!(id & 0xFFFF_0000u32 as i32, 0x1234_0000u32 as i32);
                seen.insert(id);
            }
            assert_eq!(seen.len(), 8);
        })
        .join()
        .unwrap();
    }
}
