// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![no_main]

use std::time::Duration;
use std::time::Instant;

use lazy_static::lazy_static;
use libfuzzer_sys::fuzz_target;

use tcp_rack::congestion_control::CaState;
use tcp_rack::congestion_control::Dummy;
use tcp_rack::LossRecovery;
use tcp_rack::RackConfig;
use tcp_rack::SegmentHandle;
use tcp_rack::SentSegment;
use tcp_rack::Transmitter;

lazy_static! {
    static ref CONFIG: RackConfig = RackConfig::new();
}

struct Sink;

impl Transmitter for Sink {
    fn retransmit(&mut self, _handle: SegmentHandle, _segment: &SentSegment) -> bool {
        true
    }
}

fuzz_target!(|data: &[u8]| {
    let mut cc = Dummy::new();
    if data.first().map_or(false, |b| b & 1 == 1) {
        cc.set_ca_state(CaState::Recovery);
    }
    let mut recovery = LossRecovery::new(&CONFIG, u32::MAX - 5000, Box::new(cc)).unwrap();
    let mut now = Instant::now();
    let mut tx = Sink;

    for op in data.chunks_exact(3) {
        now += Duration::from_micros(op[2] as u64 * 100);
        let una = recovery.sent.snd_una();
        let outstanding = recovery.sent.snd_nxt().wrapping_sub(una) as u64;
        let at = |b: u8| una.wrapping_add((outstanding * b as u64 / 255) as u32);

        match op[0] % 5 {
            0 => {
                recovery.on_segment_sent(op[1] as u32 * 10 + 1, now).unwrap();
            }
            1 => recovery.on_ack_received(at(op[1]), &[], now).unwrap(),
            2 => {
                let start = at(op[1]);
                let end = at(op[1].saturating_add(op[2]));
                recovery.on_ack_received(una, &[start..end], now).unwrap();
            }
            3 => {
                recovery.retransmit_lost(now, &mut tx);
            }
            _ => {
                recovery.on_timeout(now, &mut tx);
            }
        }

        let sent = &recovery.sent;
        assert!(sent.sacked_out() + sent.lost_out() <= sent.packets_out());
        assert!(sent.retrans_out() <= sent.packets_out());
        assert!(sent.in_flight() <= 2 * sent.packets_out());
    }
});
