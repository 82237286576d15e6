//! Integration tests for the UDP media plane.
//!
//! Drives `MediaReceiver` and `MediaSender` directly over loopback sockets:
//! malformed input, loss concealment, RTCP reports, keepalives and sender
//! sequencing.

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use voicelink::codec::MAX_BUFFER_SIZE;
use voicelink::speaker::SpeakerMap;
use voicelink::{EncryptionMode, MediaContext, MediaReceiver, MediaSender, PacketOutcome, SecretKey, VoiceCipher};
use voicelink_common::rtcp::RTCP_RECEIVER_REPORT;
use voicelink_common::rtp::RTP_HEADER_SIZE;
use voicelink_common::{DropReason, MetricsContext, ReportBlock, RtcpHeader, RtpHeader};

/// A context whose relay is the socket itself.
async fn context(mode: EncryptionMode) -> Arc<MediaContext> {
    // ---
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let remote = socket.local_addr().expect("addr");
    context_with_remote(mode, socket, remote)
}

fn context_with_remote(mode: EncryptionMode, socket: UdpSocket, remote: SocketAddr) -> Arc<MediaContext> {
    // ---
    Arc::new(MediaContext {
        ssrc: 1,
        key: SecretKey::new(support::KEY),
        cipher: Arc::new(VoiceCipher::new(mode)),
        socket: Arc::new(socket),
        remote,
    })
}

fn receiver(ctx: &Arc<MediaContext>, speakers: &Arc<SpeakerMap>) -> MediaReceiver {
    // ---
    let metrics = MetricsContext::new("media-test").expect("metrics");
    MediaReceiver::new(9, Arc::clone(ctx), Arc::clone(speakers), metrics)
}

fn sealed(ctx: &MediaContext, sequence: u16, ssrc: u32, opus: &[u8]) -> Vec<u8> {
    // ---
    support::sealed_rtp(&ctx.cipher, &ctx.key, sequence, ssrc, opus)
}

#[tokio::test]
async fn test_short_datagram_does_not_stop_receive_loop() {
    // ---
    let peer = UdpSocket::bind("127.0.0.1:0").await.expect("bind peer");
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let ctx = context_with_remote(
        EncryptionMode::Normal,
        socket,
        peer.local_addr().expect("peer addr"),
    );
    let local = ctx.socket.local_addr().expect("local addr");
    let speakers = Arc::new(SpeakerMap::new());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(receiver(&ctx, &speakers).run(cancel.clone()));

    peer.send_to(&[0x80, 0x78, 0, 1, 2], local)
        .await
        .expect("send short");
    peer.send_to(&sealed(&ctx, 1, 77, &support::encoded_tone()), local)
        .await
        .expect("send valid");

    let speaker = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(speaker) = speakers.get(77) {
                return speaker;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("valid packet processed after the short one");

    let mut stream = speaker.take_pcm_stream().expect("stream");
    let pcm = timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("pcm")
        .expect("stream open");
    assert_eq!(pcm.len(), MAX_BUFFER_SIZE);

    cancel.cancel();
    task.await.expect("receive loop exits on cancel");
}

#[tokio::test]
async fn test_datagram_classification() {
    // ---
    let ctx = context(EncryptionMode::Lite).await;
    let speakers = Arc::new(SpeakerMap::new());
    let mut receiver = receiver(&ctx, &speakers);

    assert_eq!(
        receiver.process_datagram(&[1, 2, 3, 4, 5]),
        PacketOutcome::Dropped(DropReason::Malformed)
    );
    assert_eq!(receiver.process_datagram(&[0u8; 8]), PacketOutcome::Keepalive);
    assert_eq!(
        receiver.process_datagram(&[0x42u8; 40]),
        PacketOutcome::Dropped(DropReason::Unknown)
    );

    let mut tampered = sealed(&ctx, 5, 88, &support::encoded_tone());
    let last = tampered.len() - 5;
    tampered[last] ^= 0xff;
    assert_eq!(
        receiver.process_datagram(&tampered),
        PacketOutcome::Dropped(DropReason::Decrypt)
    );

    let header_only = RtpHeader::new(6, 0, 88).encode();
    assert_eq!(
        receiver.process_datagram(&header_only),
        PacketOutcome::Dropped(DropReason::Malformed)
    );

    let mut marked = sealed(&ctx, 7, 88, &support::encoded_tone());
    marked[1] = 0xf8;
    assert_eq!(
        receiver.process_datagram(&marked),
        PacketOutcome::Dropped(DropReason::Unknown)
    );

    assert_eq!(receiver.stats(), (0, 5));
    assert!(speakers.is_empty(), "rejected datagrams leave no speaker behind");
}

#[tokio::test]
async fn test_unauthenticated_audio_creates_no_speakers() {
    // ---
    let ctx = context(EncryptionMode::Normal).await;
    let speakers = Arc::new(SpeakerMap::new());
    let mut receiver = receiver(&ctx, &speakers);

    for ssrc in 1..=200u32 {
        let mut forged = RtpHeader::new(1, 1, ssrc).encode().to_vec();
        forged.extend_from_slice(&[0u8; 40]);
        assert_eq!(
            receiver.process_datagram(&forged),
            PacketOutcome::Dropped(DropReason::Decrypt)
        );
    }

    assert!(speakers.is_empty());
    assert_eq!(receiver.stats(), (0, 200));
}

#[tokio::test]
async fn test_datagrams_from_other_sources_are_ignored() {
    // ---
    let relay = UdpSocket::bind("127.0.0.1:0").await.expect("bind relay");
    let stranger = UdpSocket::bind("127.0.0.1:0").await.expect("bind stranger");
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let ctx = context_with_remote(
        EncryptionMode::Lite,
        socket,
        relay.local_addr().expect("relay addr"),
    );
    let local = ctx.socket.local_addr().expect("local addr");
    let speakers = Arc::new(SpeakerMap::new());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(receiver(&ctx, &speakers).run(cancel.clone()));
    let opus = support::encoded_tone();

    stranger
        .send_to(&sealed(&ctx, 1, 55, &opus), local)
        .await
        .expect("send from stranger");
    relay
        .send_to(&sealed(&ctx, 1, 66, &opus), local)
        .await
        .expect("send from relay");

    timeout(Duration::from_secs(5), async {
        while speakers.get(66).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay packet processed");
    assert!(speakers.get(55).is_none(), "stranger's packet was not decoded");

    cancel.cancel();
    task.await.expect("receive loop exits on cancel");
}

#[tokio::test]
async fn test_header_extension_is_stripped_before_decoding() {
    // ---
    let ctx = context(EncryptionMode::Lite).await;
    let speakers = Arc::new(SpeakerMap::new());
    let mut receiver = receiver(&ctx, &speakers);

    let header = RtpHeader {
        has_extension: true,
        ..RtpHeader::new(40, 38_400, 12)
    };
    let mut packet = header.encode().to_vec();
    assert_eq!(packet[0], 0x90);
    assert_eq!(packet.len(), RTP_HEADER_SIZE);

    let mut payload = vec![0xbe, 0xde, 0x00, 0x01, 0x10, 0x20, 0x30, 0x40];
    payload.extend_from_slice(&support::encoded_tone());
    ctx.cipher
        .seal(12, &mut packet, &payload, &ctx.key)
        .expect("seal");

    assert_eq!(
        receiver.process_datagram(&packet),
        PacketOutcome::Audio {
            ssrc: 12,
            sequence: 40,
            has_loss: false,
            pcm_bytes: MAX_BUFFER_SIZE,
        }
    );

    let mut stream = speakers.get(12).expect("speaker").take_pcm_stream().expect("stream");
    let pcm = stream.try_recv().expect("decoded frame");
    assert_eq!(pcm.len(), MAX_BUFFER_SIZE);
}

#[tokio::test]
async fn test_sequence_gap_is_concealed_before_decoding() {
    // ---
    let ctx = context(EncryptionMode::Suffix).await;
    let speakers = Arc::new(SpeakerMap::new());
    let mut receiver = receiver(&ctx, &speakers);
    let opus = support::encoded_tone();

    let first = receiver.process_datagram(&sealed(&ctx, 100, 5, &opus));
    assert!(matches!(first, PacketOutcome::Audio { has_loss: false, .. }));

    let mut stream = speakers.get(5).expect("speaker").take_pcm_stream().expect("stream");
    assert!(stream.try_recv().is_some());

    let gap = receiver.process_datagram(&sealed(&ctx, 102, 5, &opus));
    assert_eq!(
        gap,
        PacketOutcome::Audio {
            ssrc: 5,
            sequence: 102,
            has_loss: true,
            pcm_bytes: MAX_BUFFER_SIZE,
        }
    );

    let concealed = stream.try_recv().expect("concealment frame");
    let decoded = stream.try_recv().expect("decoded frame");
    assert_eq!(concealed.len(), MAX_BUFFER_SIZE);
    assert_eq!(decoded.len(), MAX_BUFFER_SIZE);
    assert!(stream.try_recv().is_none());

    let next = receiver.process_datagram(&sealed(&ctx, 103, 5, &opus));
    assert!(matches!(next, PacketOutcome::Audio { has_loss: false, .. }));
}

#[tokio::test]
async fn test_receiver_report_is_decoded() {
    // ---
    let ctx = context(EncryptionMode::Normal).await;
    let speakers = Arc::new(SpeakerMap::new());
    let mut receiver = receiver(&ctx, &speakers);

    let header = RtcpHeader {
        version: 2,
        padding: false,
        report_count: 1,
        packet_type: RTCP_RECEIVER_REPORT,
        length: 7,
        ssrc: 0xabcd,
    };
    let block = ReportBlock {
        ssrc: 1,
        fraction_lost: 3,
        cumulative_lost: 12,
        extended_highest_sequence: 4000,
        jitter: 9,
        last_sender_report: 0,
        delay_since_last_sender_report: 0,
    };

    let mut packet = header.encode().to_vec();
    ctx.cipher
        .seal(0xabcd, &mut packet, &block.encode(), &ctx.key)
        .expect("seal report");

    assert_eq!(
        receiver.process_datagram(&packet),
        PacketOutcome::Report {
            ssrc: 0xabcd,
            blocks: 1,
        }
    );
    assert!(speakers.is_empty(), "reports do not create speakers");
}

#[tokio::test]
async fn test_codec_failures_escalate_when_configured() {
    // ---
    let ctx = context(EncryptionMode::Normal).await;
    let speakers = Arc::new(SpeakerMap::new());
    let mut receiver = receiver(&ctx, &speakers).with_max_consecutive_codec_failures(Some(2));
    let garbage = [0xffu8; 3];

    assert_eq!(
        receiver.process_datagram(&sealed(&ctx, 1, 6, &garbage)),
        PacketOutcome::Dropped(DropReason::Codec)
    );
    assert!(speakers.get(6).is_some());

    assert_eq!(
        receiver.process_datagram(&sealed(&ctx, 2, 6, &garbage)),
        PacketOutcome::Dropped(DropReason::Codec)
    );
    assert!(speakers.get(6).is_none(), "speaker reset after two failures");
}

#[tokio::test]
async fn test_sender_frames_and_advances_sequencing() {
    // ---
    let ctx = context(EncryptionMode::Lite).await;
    let metrics = MetricsContext::new("media-test").expect("metrics");
    let mut sender = MediaSender::new(9, metrics).expect("sender");
    let (sequence, timestamp) = (sender.sequence(), sender.timestamp());

    let packet = sender
        .build_packet(&ctx, &vec![0u8; MAX_BUFFER_SIZE])
        .expect("packet")
        .to_vec();
    let header = RtpHeader::decode(&packet).expect("header");
    assert_eq!(header.sequence, sequence);
    assert_eq!(header.timestamp, timestamp);
    assert_eq!(header.ssrc, ctx.ssrc);
    assert_eq!(sender.sequence(), sequence.wrapping_add(1));
    assert_eq!(sender.timestamp(), timestamp.wrapping_add(960));

    let mut opus = Vec::new();
    ctx.cipher
        .open(&packet, 12, &ctx.key, &mut opus)
        .expect("open own packet");
    assert!(!opus.is_empty());

    assert!(sender.build_packet(&ctx, &[0u8; 100]).is_err(), "partial frame rejected");

    let sent = sender
        .send_frame(&ctx, &vec![0u8; MAX_BUFFER_SIZE])
        .await
        .expect("send");
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), ctx.socket.recv_from(&mut buf))
        .await
        .expect("datagram")
        .expect("recv");
    assert_eq!(len, sent);
}
