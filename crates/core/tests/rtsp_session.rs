//! End-to-end RTSP: a loopback server answers DESCRIBE / SETUP / PLAY /
//! TEARDOWN and streams RTP with a known loss pattern to the client port.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;

use testbed::config::Probe;
use testbed::media::RtpHeader;
use testbed::protocol::request::RtspRequest;
use testbed::session::transport::TransportHeader;
use testbed::{Negotiator, NegotiatorState, RtspLossProbe, StopFlag};

const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=fake\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:track1\r\n";

const DROPPED: [u16; 5] = [15, 32, 48, 67, 83];

struct Seen {
    methods: Vec<String>,
    setup_uri: Option<String>,
}

fn send_rtp(port: u16, count: u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut header = RtpHeader::new(96, 0x1234_5678);
    let dropped: HashSet<u16> = DROPPED.into_iter().collect();
    for seq in 0..count {
        if !dropped.contains(&seq) {
            let mut packet = header.write(seq, false).to_vec();
            packet.extend_from_slice(&[0u8; 100]);
            socket.send_to(&packet, ("127.0.0.1", port)).unwrap();
        }
        header.advance_timestamp(3_000);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Serve one connection until the client hangs up.
fn fake_server(packets: u16) -> (String, thread::JoinHandle<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        let mut seen = Seen {
            methods: Vec::new(),
            setup_uri: None,
        };
        let mut rtp_port = None;
        let mut sender: Option<thread::JoinHandle<()>> = None;

        loop {
            let mut request = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    if let Some(sender) = sender.take() {
                        let _ = sender.join();
                    }
                    return seen;
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }

            let request = RtspRequest::parse(&request).unwrap();
            let cseq = request.cseq().unwrap_or("0").to_string();
            seen.methods.push(request.method.clone());

            let response = match request.method.as_str() {
                "DESCRIBE" => format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nContent-Base: rtsp://{addr}/live/\r\n\
                     Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{SDP}",
                    SDP.len()
                ),
                "SETUP" => {
                    seen.setup_uri = Some(request.uri.clone());
                    let transport = request.get_header("Transport").unwrap_or_default().to_string();
                    rtp_port = TransportHeader::parse(&transport).map(|t| t.client_rtp_port);
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 12345678;timeout=60\r\n\
                         Transport: {transport};server_port=6000-6001\r\n\r\n"
                    )
                }
                "PLAY" => {
                    if let Some(port) = rtp_port {
                        sender = Some(thread::spawn(move || send_rtp(port, packets)));
                    }
                    format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 12345678\r\n\r\n")
                }
                _ => format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n"),
            };
            if writer.write_all(response.as_bytes()).is_err() {
                return seen;
            }
        }
    });
    (format!("rtsp://{addr}/live"), handle)
}

#[test]
fn negotiator_walks_every_state() {
    let (url, server) = fake_server(0);
    let mut negotiator = Negotiator::connect(&url, Duration::from_secs(2)).unwrap();
    assert_eq!(negotiator.state(), NegotiatorState::Init);

    let description = negotiator.describe().unwrap();
    assert_eq!(description.payload_type, 96);
    assert_eq!(description.clock_rate, 90_000);
    assert_eq!(negotiator.state(), NegotiatorState::Described);

    let transport = negotiator.setup(0).unwrap().clone();
    assert_eq!(transport.server_ports, Some((6000, 6001)));
    assert_eq!(negotiator.session_id(), Some("12345678"));
    assert_eq!(negotiator.session_timeout(), Some(Duration::from_secs(60)));
    assert_eq!(negotiator.state(), NegotiatorState::SetUp);

    let media = negotiator.play().unwrap();
    assert_eq!(
        media.rtp.local_addr().unwrap().port(),
        transport.client_rtp_port
    );
    assert_eq!(negotiator.state(), NegotiatorState::Playing);

    negotiator.keepalive().unwrap();
    negotiator.teardown().unwrap();
    assert_eq!(negotiator.state(), NegotiatorState::TornDown);
    assert!(negotiator.describe().is_err());
    drop(negotiator);

    let seen = server.join().unwrap();
    assert_eq!(seen.methods, ["DESCRIBE", "SETUP", "PLAY", "OPTIONS", "TEARDOWN"]);
    let setup_uri = seen.setup_uri.unwrap();
    assert!(setup_uri.ends_with("/live/track1"), "{setup_uri}");
}

#[test]
fn probe_measures_known_losses() {
    let (url, server) = fake_server(100);
    let settings = Probe {
        rtsp_timeout_ms: 2_000,
        report_interval_secs: 1,
        ..Probe::default()
    };

    let report = RtspLossProbe::new(&url, &settings)
        .run(&StopFlag::new(), Some(Duration::from_millis(1_500)))
        .unwrap();

    assert_eq!(report.snapshot.received, 95);
    assert_eq!(report.snapshot.unique, 95);
    assert_eq!(report.snapshot.expected_span, 100);
    assert!((report.snapshot.loss_rate - 0.05).abs() < 1e-9);
    assert_eq!(report.missing, [15, 32, 48, 67, 83]);
    assert!(report.snapshot.jitter_ms.is_some());

    let seen = server.join().unwrap();
    assert_eq!(seen.methods.last().map(String::as_str), Some("TEARDOWN"));
}
