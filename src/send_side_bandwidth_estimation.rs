/*
 *  Copyright (c) 2012 The WebRTC project authors. All Rights Reserved.
 *
 *  Use of this source code is governed by a BSD-style license
 *  that can be found in the LICENSE file in the root of the source
 *  tree. An additional intellectual property rights grant can be found
 *  in the file PATENTS.  All contributing project authors may
 *  be found in the AUTHORS file in the root of the source tree.
 */

const AVG_PACKET_SIZE_BYTES: u32 = 1000;

// Calculate the rate that TCP-Friendly Rate Control (TFRC) would apply.
// The formula in RFC 3448, Section 3.1, is used.
fn calc_tfrc_bps(rtt: u32, loss: u8) -> u32 {
    if rtt == 0 || loss == 0 {
        // Input variables out of range.
        return 0;
    }
    let r = rtt as f64 / 1000.0; // RTT in seconds.

    // Number of packets acknowledged by a single TCP acknowledgement:
    // recommended = 1.
    let b = 1.0;

    // TCP retransmission timeout value in seconds, recommended = 4*R.
    let t_rto = 4.0 * r;

    let p = loss as f64 / 255.0; // Packet loss rate in [0, 1).
    let s = AVG_PACKET_SIZE_BYTES as f64;

    // Calculate send rate in bytes/second.
    let x = s
        / (r * (2.0 * b * p / 3.0).sqrt()
            + t_rto * (3.0 * (3.0 * b * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p)));

    // Convert to bits/second.
    (x * 8.0) as u32
}

/// Loss- and RTT-driven send-side bandwidth estimator.
///
/// Adapts the target bitrate with an AIMD policy: increase by 8% at most once
/// per second while loss stays below ~2%, back off proportionally to the loss
/// rate when it exceeds ~10%, floored at the rate TFRC would allow. Loss
/// reports are accumulated until they cover enough packets to be trusted.
///
/// All time is supplied by the caller as monotonic milliseconds; the estimator
/// performs no I/O and owns no clock.
pub struct SendSideBandwidthEstimation {
    accumulate_lost_packets_q8: i32,
    accumulate_expected_packets: i32,
    bitrate: u32,
    min_bitrate_configured: u32,
    max_bitrate_configured: u32,
    last_fraction_loss: u8,
    last_round_trip_time: u32,

    // The max bitrate as set by the receiver. This is typically signalled
    // using a REMB RTCP message. Zero means no limit has been signalled.
    bwe_incoming: u32,
    time_last_increase: u64,
    time_last_decrease: u64,
    last_low_bitrate_log: Option<u64>,
}

impl Default for SendSideBandwidthEstimation {
    fn default() -> Self {
        Self::new()
    }
}

impl SendSideBandwidthEstimation {
    const BWE_INCREASE_INTERVAL_MS: u64 = 1000;
    const BWE_DECREASE_INTERVAL_MS: u64 = 300;
    const LIMIT_NUM_PACKETS: i32 = 20;
    const LOW_BITRATE_LOG_PERIOD_MS: u64 = 10000;

    pub fn new() -> Self {
        Self {
            accumulate_lost_packets_q8: 0,
            accumulate_expected_packets: 0,
            bitrate: 0,
            min_bitrate_configured: 0,
            max_bitrate_configured: 0,
            last_fraction_loss: 0,
            last_round_trip_time: 0,
            bwe_incoming: 0,
            time_last_increase: 0,
            time_last_decrease: 0,
            last_low_bitrate_log: None,
        }
    }

    /// Sets the send bitrate directly. The value is not validated against the
    /// configured bounds here; the next update clamps it.
    pub fn set_send_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }

    pub fn set_min_max_bitrate(&mut self, min_bitrate: u32, max_bitrate: u32) {
        self.min_bitrate_configured = min_bitrate;
        self.max_bitrate_configured = max_bitrate;
    }

    pub fn set_min_bitrate(&mut self, min_bitrate: u32) {
        self.min_bitrate_configured = min_bitrate;
    }

    /// Returns `(bitrate, fraction_loss, rtt)`: the current estimate in bits
    /// per second, the last committed loss fraction in Q8 and the last
    /// reported round-trip time in milliseconds.
    pub fn current_estimate(&self) -> (u32, u8, u32) {
        (self.bitrate, self.last_fraction_loss, self.last_round_trip_time)
    }

    /// Call when the receiver signals a bandwidth estimate, e.g. via REMB.
    pub fn update_receiver_estimate(&mut self, bandwidth: u32, now_ms: u64) {
        self.bwe_incoming = bandwidth;
        self.cap_bitrate_to_thresholds(now_ms);
    }

    /// Call when a receiver report arrives. `fraction_loss` is the lost
    /// fraction in Q8 and `number_of_packets` the number of packets the
    /// report covers.
    pub fn update_receiver_block(
        &mut self,
        fraction_loss: u8,
        rtt: u32,
        number_of_packets: i32,
        now_ms: u64,
    ) {
        // Update RTT.
        self.last_round_trip_time = rtt;

        // Check sequence number diff and weight loss report.
        if number_of_packets > 0 {
            // Calculate number of lost packets.
            let num_lost_packets_q8 = fraction_loss as i32 * number_of_packets;
            // Accumulate reports.
            self.accumulate_lost_packets_q8 += num_lost_packets_q8;
            self.accumulate_expected_packets += number_of_packets;

            // Report loss if the total report is based on sufficiently many
            // packets.
            if self.accumulate_expected_packets >= Self::LIMIT_NUM_PACKETS {
                self.last_fraction_loss =
                    (self.accumulate_lost_packets_q8 / self.accumulate_expected_packets) as u8;

                // Reset accumulators.
                self.accumulate_lost_packets_q8 = 0;
                self.accumulate_expected_packets = 0;
            } else {
                // Early return without updating estimate.
                return;
            }
        }
        self.update_estimate(now_ms);
    }

    /// Runs the rate adaptation against the last committed loss and RTT.
    pub fn update_estimate(&mut self, now_ms: u64) {
        if self.last_fraction_loss <= 5 {
            // Loss < 2%: Limit the rate increases to once a
            // BWE_INCREASE_INTERVAL_MS.
            if now_ms.wrapping_sub(self.time_last_increase) >= Self::BWE_INCREASE_INTERVAL_MS {
                self.time_last_increase = now_ms;

                // Increase rate by 8%.
                self.bitrate = (self.bitrate as f64 * 1.08 + 0.5) as u32;

                // Add 1 kbps extra, just to make sure that we do not get stuck
                // (gives a little extra increase at low rates, negligible at
                // higher rates).
                self.bitrate += 1000;
            }
        } else if self.last_fraction_loss <= 26 {
            // Loss between 2% - 10%: Do nothing.
        } else {
            // Loss > 10%: Limit the rate decreases to once a
            // BWE_DECREASE_INTERVAL_MS + rtt.
            if now_ms.wrapping_sub(self.time_last_decrease)
                >= Self::BWE_DECREASE_INTERVAL_MS + self.last_round_trip_time as u64
            {
                self.time_last_decrease = now_ms;

                // Reduce rate:
                //   newRate = rate * (1 - 0.5*lossRate);
                //   where packetLoss = 256*lossRate;
                self.bitrate = ((self.bitrate as f64
                    * (512 - self.last_fraction_loss as u32) as f64)
                    / 512.0) as u32;

                // Calculate what rate TFRC would apply in this situation and
                // do not reduce further than it.
                self.bitrate = self
                    .bitrate
                    .max(calc_tfrc_bps(self.last_round_trip_time, self.last_fraction_loss));
            }
        }

        self.cap_bitrate_to_thresholds(now_ms);
    }

    fn cap_bitrate_to_thresholds(&mut self, now_ms: u64) {
        if self.bwe_incoming > 0 && self.bitrate > self.bwe_incoming {
            self.bitrate = self.bwe_incoming;
        }
        if self.bitrate > self.max_bitrate_configured {
            self.bitrate = self.max_bitrate_configured;
        }
        if self.bitrate < self.min_bitrate_configured {
            self.maybe_log_low_bitrate_warning(now_ms);
            self.bitrate = self.min_bitrate_configured;
        }
    }

    // Warns when the configured min forces the estimate above what the
    // network supports, at most once per LOW_BITRATE_LOG_PERIOD_MS.
    fn maybe_log_low_bitrate_warning(&mut self, now_ms: u64) {
        let due = self
            .last_low_bitrate_log
            .map_or(true, |last| {
                now_ms.wrapping_sub(last) >= Self::LOW_BITRATE_LOG_PERIOD_MS
            });
        if due {
            tracing::warn!(
                min_bitrate_kbps = self.min_bitrate_configured / 1000,
                estimate_kbps = self.bitrate / 1000,
                "The configured min bitrate is greater than the estimated available bandwidth."
            );
            self.last_low_bitrate_log = Some(now_ms);
        }
    }
}
