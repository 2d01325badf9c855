/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::context::{intval, RequestContext};

/// Time-windowed keyed hash proving a state-changing link came from a page we rendered.
///
/// Emitters and the check share this one type so salt and hash cannot drift apart.
#[derive(Debug, Clone)]
pub struct NonceGuard {
    salt: String,
    window: Duration,
}

impl NonceGuard {
    pub fn new(salt: impl Into<String>, window: Duration) -> Self {
        Self {
            salt: salt.into(),
            window,
        }
    }

    pub fn create(&self, ts: &str) -> String {
        let mut h = Sha256::new();
        h.update(self.salt.as_bytes());
        h.update(ts.as_bytes());
        hex::encode(h.finalize())
    }

    /// Query-string fragment for a link issued at `now_ms`.
    pub fn params(&self, now_ms: i64) -> String {
        let ts = now_ms.to_string();
        let nonce = self.create(&ts);
        format!("ts={ts}&nonce={nonce}")
    }

    pub fn verify(&self, ts: &str, nonce: &str, now_ms: i64) -> bool {
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        if intval(ts) < now_ms.saturating_sub(window_ms) {
            return false;
        }
        self.create(ts).as_bytes() == nonce.as_bytes()
    }

    pub fn valid(&self, ctx: &RequestContext) -> bool {
        self.verify(&ctx.param("ts"), &ctx.param("nonce"), ctx.start_time)
    }
}
