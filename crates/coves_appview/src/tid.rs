/*
 * SPDX-FileCopyrightText: 2026 Coves Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{rngs::OsRng, RngCore};
use std::sync::atomic::{AtomicI64, Ordering};

// atProto TIDs: 13 chars of sortable base32 over a 64-bit value packing
// 53 bits of microseconds since the epoch and a 10-bit clock id.
const BASE32_SORTABLE: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

static LAST_US: AtomicI64 = AtomicI64::new(0);

/// Generates a time-ordered record key. Monotonic within this process even
/// when the clock reads the same microsecond twice.
pub fn next_tid() -> String {
    let mut now = now_us();
    loop {
        let last = LAST_US.load(Ordering::SeqCst);
        if now <= last {
            now = last + 1;
        }
        if LAST_US
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }

    let mut clock_id = [0u8; 2];
    OsRng.fill_bytes(&mut clock_id);
    let clock_id = (u16::from_le_bytes(clock_id) & 0x3ff) as u64;

    let value = ((now as u64) << 10) | clock_id;
    encode_sortable(value)
}

fn encode_sortable(value: u64) -> String {
    let mut out = [0u8; 13];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 60 - i * 5;
        let idx = ((value >> shift) & 0x1f) as usize;
        *slot = BASE32_SORTABLE[idx];
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}
