use castlink_core::clock::ManualClock;
use castlink_core::session::{force_sendonly, PendingSignalQueue};
use castlink_core::signaling::protocol::parse_inbound;
use castlink_core::signaling::{IceCandidatePayload, SignalPayload};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

fn sample_offer() -> String {
    let mut sdp = String::from("v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
    for (mid, media) in ["video", "audio", "video"].iter().enumerate() {
        sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n", media));
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str(&format!("a=mid:{}\r\n", mid));
        for pt in 96..99 {
            sdp.push_str(&format!("a=rtpmap:{} H264/90000\r\n", pt));
        }
        sdp.push_str("a=sendrecv\r\n");
    }
    sdp
}

fn bench_force_sendonly(c: &mut Criterion) {
    let offer = sample_offer();
    c.bench_function("force_sendonly_3_sections", |b| {
        b.iter(|| {
            let _ = force_sendonly(&offer);
        })
    });
}

fn bench_pending_drain(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new());
    let candidate = SignalPayload::Candidate(IceCandidatePayload {
        candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    });

    c.bench_function("pending_enqueue_drain_64", |b| {
        let mut queue = PendingSignalQueue::new(Duration::from_secs(60), clock.clone());
        b.iter(|| {
            for i in 0..64 {
                queue.enqueue(if i % 2 == 0 { "v1" } else { "v2" }, candidate.clone());
            }
            let _ = queue.drain_ready();
        })
    });
}

fn bench_parse_signal(c: &mut Criterion) {
    let frame = r#"{"event":"signal","data":{"to":"pub","from":"v1","signal":{"candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host"}}}}"#;
    c.bench_function("parse_inbound_candidate", |b| {
        b.iter(|| {
            let _ = parse_inbound(frame);
        })
    });
}

criterion_group!(benches, bench_force_sendonly, bench_pending_drain, bench_parse_signal);
criterion_main!(benches);
