// Copyright (c) 2023 The TCPCC Authors.
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

use std::time::Duration;
use std::time::Instant;

use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use smallvec::smallvec;

use tcpcc::AckPacket;
use tcpcc::Config;
use tcpcc::Connection;
use tcpcc::SackBlock;
use tcpcc::TcpSeq;

const MSS: u32 = 1000;

fn new_conn(cwnd: u32) -> Connection {
    let mut conf = Config::new().unwrap();
    conf.set_initial_cwnd(cwnd);
    Connection::new(&conf).unwrap()
}

fn send_window(conn: &mut Connection, base: u32, count: u32, now: Instant) {
    for i in 0..count {
        let seq = base + i * MSS;
        conn.on_packet_sent(TcpSeq(seq), TcpSeq(seq + MSS), now);
    }
}

pub fn cumulative_ack_benchmark(c: &mut Criterion) {
    c.bench_function("cumulative acks", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut conn = new_conn(1000);
            send_window(&mut conn, 0, 1000, now);
            for i in 1..=1000u32 {
                let pkt = AckPacket {
                    ack_seq: TcpSeq(i * MSS),
                    window: 65535,
                    ..AckPacket::default()
                };
                conn.on_ack(&pkt, now + Duration::from_millis(u64::from(i)))
                    .unwrap();
            }
        })
    });
}

pub fn sack_walk_benchmark(c: &mut Criterion) {
    c.bench_function("sack walk over a large queue", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut conn = new_conn(1000);
            send_window(&mut conn, 0, 1000, now);
            // Every other segment past the head is reported received,
            // forcing the processor to walk the holes each time.
            for i in 1..500u32 {
                let seq = 2 * i * MSS;
                let pkt = AckPacket {
                    ack_seq: TcpSeq(0),
                    window: 65535,
                    sack_blocks: smallvec![SackBlock::new(seq, seq + MSS)],
                    ..AckPacket::default()
                };
                let _ = conn.on_ack(&pkt, now + Duration::from_micros(u64::from(i)));
            }
        })
    });
}

pub fn recovery_episode_benchmark(c: &mut Criterion) {
    c.bench_function("fast recovery round trip", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut conn = new_conn(100);
            send_window(&mut conn, 0, 100, now);
            // Dupacks with growing SACK coverage push the connection into
            // recovery and schedule the head for retransmission.
            for i in 2..60u32 {
                let pkt = AckPacket {
                    ack_seq: TcpSeq(MSS),
                    window: 65535,
                    sack_blocks: smallvec![SackBlock::new(2 * MSS, (i + 1) * MSS)],
                    ..AckPacket::default()
                };
                let out = conn.on_ack(&pkt, now).unwrap();
                for (seq, end_seq) in out.retransmits {
                    conn.on_retransmit(seq, end_seq, None, now);
                }
            }
            // The retransmission fills the hole and the episode completes.
            let pkt = AckPacket {
                ack_seq: TcpSeq(100 * MSS),
                window: 65535,
                ..AckPacket::default()
            };
            conn.on_ack(&pkt, now + Duration::from_millis(50)).unwrap();
        })
    });
}

criterion_group!(
    benches,
    cumulative_ack_benchmark,
    sack_walk_benchmark,
    recovery_episode_benchmark,
);
criterion_main!(benches);
