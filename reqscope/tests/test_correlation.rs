use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use reqscope::collaborators::{ConnectTiming, DnsLookup, DnsTable, OutboundModifier, SocketTable, TestRun};
use reqscope::config::{HeaderAction, HeaderRule, ReqscopeConfig};
use reqscope::domain::{SocketId, Tick};
use reqscope::orchestrator::{Reconciled, Requests};
use reqscope::request::DataChunk;

const GET: &[u8] = b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

struct Session {
    run: Arc<TestRun>,
    dns: Arc<DnsTable>,
    sockets: Arc<SocketTable>,
    requests: Requests,
}

fn session_with(config: ReqscopeConfig) -> Session {
    let run = Arc::new(TestRun::manual(Tick(0), 1_000));
    run.set_active(true);
    let dns = Arc::new(DnsTable::new());
    let sockets = Arc::new(SocketTable::new());
    let requests = Requests::new(config, run.clone(), dns.clone(), sockets.clone());
    Session { run, dns, sockets, requests }
}

fn session() -> Session {
    session_with(ReqscopeConfig::default())
}

fn chunk(tick: i64, data: &[u8]) -> DataChunk {
    DataChunk::copy_from_slice(Tick(tick), data)
}

#[test]
fn test_http_preamble_on_fresh_socket_creates_active_request() {
    let s = session();
    s.requests.on_data_out(SocketId(1), chunk(10, b"GET /x HTTP/1.1\r\n"));

    let id = s.requests.active_request(SocketId(1)).expect("request should be active");
    let request = s.requests.request(id).unwrap();
    assert!(!request.is_spdy);
    assert_eq!(request.timings.start, Some(Tick(10)));
    assert_eq!(s.requests.len(), 1);
}

#[test]
fn test_spdy_frame_on_fresh_socket_creates_spdy_request() {
    let s = session();
    s.requests.on_data_out(SocketId(2), chunk(10, &[0x80, 0x02, 0x00, 0x01, 0x01, 0x00, 0x00, 0x10]));

    let id = s.requests.active_request(SocketId(2)).unwrap();
    assert!(s.requests.request(id).unwrap().is_spdy);
}

#[test]
fn test_non_request_data_is_not_tracked() {
    let s = session();
    s.requests.on_data_out(SocketId(3), chunk(10, b"\x16\x03\x01\x00\xa5"));
    assert!(!s.requests.has_active_request(SocketId(3)));
    assert!(s.requests.is_empty());
    assert_eq!(s.run.activity_count(), 0);
}

#[test]
fn test_inactive_run_ignores_everything() {
    let s = session();
    s.run.set_active(false);
    s.requests.on_data_out(SocketId(1), chunk(10, GET));
    s.requests.on_data_in(SocketId(1), chunk(20, RESPONSE));
    let outcome = s.requests.on_browser_reported_request("url=http://a/\nstartTime=1\nendTime=2");

    assert_eq!(outcome, Reconciled::Inactive);
    assert!(s.requests.is_empty());
}

#[test]
fn test_inbound_data_without_request_is_dropped() {
    let s = session();
    s.requests.on_data_in(SocketId(4), chunk(10, RESPONSE));
    assert!(s.requests.is_empty());
    assert!(!s.requests.has_active_request(SocketId(4)));
}

#[test]
fn test_full_exchange() {
    let s = session();
    s.sockets.record_connect(SocketId(5), ConnectTiming { start: Tick(1), end: Tick(8) });

    s.requests.on_data_out(SocketId(5), chunk(10, GET));
    s.requests.on_data_in(SocketId(5), chunk(40, &RESPONSE[..17]));
    s.requests.on_data_in(SocketId(5), chunk(55, &RESPONSE[17..]));
    s.run.set_now(Tick(60));
    s.requests.on_socket_closed(SocketId(5));

    assert_eq!(s.requests.active_request(SocketId(5)), None);
    let request = &s.requests.requests()[0];
    assert!(request.closed);
    assert_eq!(request.timings.connect_start, Some(Tick(1)));
    assert_eq!(request.timings.connect_end, Some(Tick(8)));
    assert_eq!(request.timings.first_byte, Some(Tick(40)));
    assert_eq!(request.timings.end, Some(Tick(55)));
    assert_eq!(request.response_data.to_vec(), RESPONSE);
    assert_eq!(s.run.activity_count(), 3);
}

#[test]
fn test_pipelined_request_gets_a_new_request() {
    let s = session();
    s.requests.on_data_out(SocketId(6), chunk(10, GET));
    let first = s.requests.active_request(SocketId(6)).unwrap();
    s.requests.on_data_in(SocketId(6), chunk(20, RESPONSE));

    s.requests.on_data_out(SocketId(6), chunk(30, GET));
    let second = s.requests.active_request(SocketId(6)).unwrap();

    assert_ne!(first, second);
    let all = s.requests.requests();
    assert_eq!(all.len(), 2);
    assert_eq!(all[first.0].response_data.to_vec(), RESPONSE);
    assert!(all[second.0].response_data.is_empty());
}

#[test]
fn test_reset_discards_the_run() {
    let s = session();
    s.requests.on_data_out(SocketId(1), chunk(10, GET));
    s.requests.on_data_out(SocketId(2), chunk(11, GET));
    s.sockets.record_connect(SocketId(3), ConnectTiming { start: Tick(1), end: Tick(2) });
    s.dns.record("example.com", DnsLookup { addresses: Vec::new(), start: Tick(3), end: Tick(4) });

    s.requests.reset();

    assert_eq!(s.requests.active_request(SocketId(1)), None);
    assert_eq!(s.requests.active_request(SocketId(2)), None);
    assert!(s.requests.requests().is_empty());
    assert!(s.sockets.is_empty());
    assert!(s.dns.is_empty());
}

#[test]
fn test_header_rules_rewrite_first_chunk() {
    let config = ReqscopeConfig {
        headers: vec![HeaderRule {
            action: HeaderAction::Set,
            name: "User-Agent".into(),
            value: "reqscope".into(),
            host: Some("example.com".into()),
        }],
        ..ReqscopeConfig::default()
    };
    let s = session_with(config);

    let mut outbound = chunk(10, GET);
    assert!(s.requests.on_modify_data_out(SocketId(1), &mut outbound));
    assert_eq!(
        outbound.data(),
        &b"GET /x HTTP/1.1\r\nHost: example.com\r\nUser-Agent: reqscope\r\n\r\n"[..]
    );
    s.requests.on_data_out(SocketId(1), outbound);
    assert_eq!(s.requests.len(), 1);
}

#[test]
fn test_outbound_rewrite_counts_as_activity() {
    let s = session();
    let mut tls = chunk(5, b"\x16\x03\x01");
    s.requests.on_modify_data_out(SocketId(1), &mut tls);
    assert_eq!(s.run.activity_count(), 0);

    let mut outbound = chunk(10, GET);
    assert!(!s.requests.on_modify_data_out(SocketId(2), &mut outbound));
    assert_eq!(s.run.activity_count(), 1);
    s.requests.on_data_out(SocketId(2), outbound);
    assert_eq!(s.run.activity_count(), 2);
}

#[derive(Default)]
struct CountingModifier {
    calls: AtomicUsize,
}

impl OutboundModifier for CountingModifier {
    fn modify(&self, _chunk: &mut DataChunk) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        false
    }
}

#[test]
fn test_untracked_outbound_data_goes_to_generic_modifier() {
    let modifier = Arc::new(CountingModifier::default());
    let run = Arc::new(TestRun::manual(Tick(0), 1));
    run.set_active(true);
    let requests =
        Requests::new(ReqscopeConfig::default(), run, Arc::new(DnsTable::new()), Arc::new(SocketTable::new()))
            .with_modifier(modifier.clone());

    let mut tls = chunk(1, b"\x16\x03\x01");
    assert!(!requests.on_modify_data_out(SocketId(1), &mut tls));
    let mut http = chunk(2, GET);
    requests.on_modify_data_out(SocketId(2), &mut http);

    assert_eq!(modifier.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_chunks_are_truncated_when_configured() {
    let s = session_with(ReqscopeConfig { max_chunk_bytes: 4, ..ReqscopeConfig::default() });
    s.requests.on_data_out(SocketId(1), chunk(10, GET));
    s.requests.on_data_in(SocketId(1), chunk(20, RESPONSE));

    let request = &s.requests.requests()[0];
    assert_eq!(request.request_data.to_vec(), b"GET ");
    assert_eq!(request.response_data.to_vec(), b"HTTP");
}

#[test]
fn test_initiator_records_are_claimable() {
    let s = session();
    s.requests.on_browser_reported_request(
        "url=http://example.com/img.png\ninitiatorUrl=http://example.com/app.js\ninitiatorLineNumber=42",
    );
    let info = s.requests.browser_request_info("http://example.com/img.png", true).unwrap();
    assert_eq!(info.initiator.url, "http://example.com/app.js");
    assert_eq!(info.initiator.line, "42");
    assert!(s.requests.browser_request_info("http://example.com/img.png", true).is_none());
}

#[test]
fn test_concurrent_sockets() {
    const THREADS: u64 = 8;
    const EXCHANGES: u64 = 50;

    let s = session();
    let requests = Arc::new(s.requests);
    let handles: Vec<_> = (0..THREADS)
        .map(|thread_index| {
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for exchange in 0..EXCHANGES {
                    let socket = SocketId(thread_index * 1_000 + exchange);
                    let tick = i64::try_from(exchange).unwrap();
                    requests.on_data_out(socket, chunk(tick, GET));
                    requests.on_data_in(socket, chunk(tick + 1, RESPONSE));
                    requests.on_socket_closed(socket);
                    assert!(!requests.has_active_request(socket));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let all = requests.requests();
    assert_eq!(all.len(), usize::try_from(THREADS * EXCHANGES).unwrap());
    for (index, request) in all.iter().enumerate() {
        assert_eq!(request.id().0, index);
        assert!(request.closed);
        assert_eq!(request.response_data.to_vec(), RESPONSE);
    }
}
