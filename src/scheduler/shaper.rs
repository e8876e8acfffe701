//! Token-bucket shaper state kept per queue or node.
//!
//! Bucket contents are held in byte-cycles (bytes × cycles per second) so
//! that refill by `elapsed_cycles × bytes_per_second` stays in exact integer
//! arithmetic. Buckets may go negative: a packet is always sent once picked,
//! and the debt decides how long the entity stays ineligible.

use crate::config::CYCLES_PER_SEC;
use crate::packet::Color;
use crate::profile::ShaperParams;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    /// Bytes per second.
    rate: i128,
    depth: i128,
    tokens: i128,
}

impl TokenBucket {
    fn new(rate_kbps: u32, burst: u32) -> Self {
        let depth = burst as i128 * CYCLES_PER_SEC as i128;
        Self {
            rate: rate_kbps as i128 * 1000,
            depth,
            tokens: depth,
        }
    }

    fn reconfigure(&mut self, rate_kbps: u32, burst: u32) {
        self.rate = rate_kbps as i128 * 1000;
        self.depth = burst as i128 * CYCLES_PER_SEC as i128;
        self.tokens = self.tokens.min(self.depth);
    }

    fn refill(&mut self, elapsed: u64) {
        self.tokens = (self.tokens + elapsed as i128 * self.rate).min(self.depth);
    }

    /// Cycles until the bucket is back at zero.
    fn cycles_to_recover(&self) -> u64 {
        if self.tokens >= 0 {
            return 0;
        }
        let deficit = -self.tokens;
        let cycles = (deficit + self.rate - 1) / self.rate;
        cycles.min(u64::MAX as i128) as u64
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ShaperState {
    params: ShaperParams,
    commit: TokenBucket,
    peak: Option<TokenBucket>,
    last_update: u64,
}

impl ShaperState {
    /// Buckets start full.
    pub(crate) fn new(params: ShaperParams, now: u64) -> Self {
        Self {
            commit: TokenBucket::new(params.commit_rate, params.commit_burst),
            peak: params
                .dual_rate
                .then(|| TokenBucket::new(params.peak_rate, params.peak_burst)),
            params,
            last_update: now,
        }
    }

    /// Apply new parameters without refunding debt or granting a fresh burst.
    pub(crate) fn reconfigure(&mut self, params: ShaperParams) {
        self.commit.reconfigure(params.commit_rate, params.commit_burst);
        self.peak = match (params.dual_rate, self.peak.take()) {
            (true, Some(mut peak)) => {
                peak.reconfigure(params.peak_rate, params.peak_burst);
                Some(peak)
            }
            (true, None) => Some(TokenBucket::new(params.peak_rate, params.peak_burst)),
            (false, _) => None,
        };
        self.params = params;
    }

    pub(crate) fn refill(&mut self, now: u64) {
        if now <= self.last_update {
            return;
        }
        let elapsed = now - self.last_update;
        self.commit.refill(elapsed);
        if let Some(peak) = &mut self.peak {
            peak.refill(elapsed);
        }
        self.last_update = now;
    }

    /// Debit a packet of `len` bytes and report its conformance color.
    pub(crate) fn charge(&mut self, len: u32) -> Color {
        let adjusted = (len as i64 + self.params.len_adjust as i64).max(0) as i128;
        let cost = adjusted * CYCLES_PER_SEC as i128;

        // The peak bucket is checked first: a packet beyond peak credit is
        // red whatever the commit bucket holds.
        let color = match self.peak {
            Some(peak) if peak.tokens < cost => Color::Red,
            Some(_) if self.commit.tokens < cost => Color::Yellow,
            None if self.commit.tokens < cost => Color::Red,
            _ => Color::Green,
        };

        self.commit.tokens -= cost;
        if let Some(peak) = &mut self.peak {
            peak.tokens -= cost;
        }
        color
    }

    /// The peak bucket limits a dual-rate shaper, the commit bucket a
    /// single-rate one.
    fn limiting(&self) -> &TokenBucket {
        self.peak.as_ref().unwrap_or(&self.commit)
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.limiting().tokens < 0
    }

    /// Cycle at which the entity becomes eligible again.
    pub(crate) fn wake_time(&self) -> u64 {
        self.last_update
            .saturating_add(self.limiting().cycles_to_recover())
    }

    #[cfg(test)]
    pub(crate) fn params(&self) -> &ShaperParams {
        &self.params
    }
}
