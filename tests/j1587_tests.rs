use std::time::Duration;

use futures::stream::StreamExt;

use truckbus::j1587::{self, J1587Transport, J1587TransportConfig, J1708Frame};
use truckbus::transport::loopback::LoopbackTransport;
use truckbus::transport::{AsyncTransport, FrameFilter};
use truckbus::Error;

fn bus_pair() -> (AsyncTransport, AsyncTransport) {
    let (a, b) = LoopbackTransport::pair();
    (
        AsyncTransport::new(a, FrameFilter::All).unwrap(),
        AsyncTransport::new(b, FrameFilter::All).unwrap(),
    )
}

fn config(mid: u8) -> J1587TransportConfig {
    J1587TransportConfig {
        mid,
        ..Default::default()
    }
}

#[tokio::test]
async fn single_frame_message_crosses_the_bus() {
    let (bus_a, bus_b) = bus_pair();
    let sender = J1587Transport::new(&bus_a, config(0x80));
    let receiver = J1587Transport::new(&bus_b, config(0xac));

    let mut stream = receiver.recv();

    // MID 128 (engine) with PID 84 (road speed)
    let frame = j1587::encode(0x80, &[84, 0x50]).unwrap();
    sender.send(&frame).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.mid, 0x80);
    assert_eq!(msg.data, vec![84, 0x50]);
    assert_eq!(msg.parameters.len(), 1);
    assert_eq!(msg.parameters[0].pid, 84);
}

#[tokio::test]
async fn frames_sent_before_the_first_poll_are_not_lost() {
    let (bus_a, bus_b) = bus_pair();
    let sender = J1587Transport::new(&bus_a, config(0x80));
    let receiver = J1587Transport::new(&bus_b, config(0xac));

    // The stream exists but has not been polled yet when the frame crosses the bus
    let mut stream = receiver.recv();
    let frame = j1587::encode(0x80, &[84, 0x50]).unwrap();
    sender.send(&frame).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.mid, 0x80);
    assert_eq!(msg.data, vec![84, 0x50]);
}

#[tokio::test]
async fn connection_mode_transfer_reassembles() {
    let (bus_a, bus_b) = bus_pair();
    let sender = J1587Transport::new(&bus_a, config(0xac));
    let receiver = J1587Transport::new(&bus_b, config(0x80));

    // 40 bytes, three 15-byte segments
    let payload: Vec<u8> = (0..40).collect();

    let mut stream = receiver.recv();
    let receive = async {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    };

    let (msg, sent) = tokio::join!(receive, sender.transport_send(0x80, &payload));
    sent.unwrap();

    assert_eq!(msg.mid, 0xac);
    assert_eq!(msg.data, payload);
}

#[tokio::test]
async fn stalled_transfer_times_out_with_abort() {
    let (bus_a, bus_b) = bus_pair();
    let receiver = J1587Transport::new(
        &bus_b,
        J1587TransportConfig {
            mid: 0x80,
            segment_timeout: Duration::from_millis(30),
            receive_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    );

    let mut stream = receiver.recv();

    // Announce a transfer and then go silent
    let rts = J1708Frame::new(0xac, &[197, 5, 0x80, 1, 3, 40, 0]).unwrap();
    bus_a
        .send(&truckbus::frame::RawFrame::outbound(&rts.to_bytes()))
        .await
        .unwrap();

    let item = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.unwrap_err(), Error::Timeout);

    // The abandoned session was closed with an abort on the wire
    let abort = tokio::time::timeout(
        Duration::from_secs(1),
        Box::pin(bus_a.recv_filter(|f| !f.loopback && f.bytes.get(4) == Some(&255))).next(),
    )
    .await
    .unwrap()
    .unwrap();
    let frame = J1708Frame::from_bytes(&abort.bytes).unwrap();
    assert_eq!(frame.data, vec![197, 2, 0xac, 255]);
}

#[tokio::test]
async fn request_pid_gets_matching_response() {
    let (bus_a, bus_b) = bus_pair();
    let requester = J1587Transport::new(&bus_a, config(0xac));
    let responder = J1587Transport::new(&bus_b, config(0x80));

    let respond = async {
        let mut stream = responder.recv();
        loop {
            let msg = stream.next().await.unwrap().unwrap();
            // PID 0 is a parameter request, byte 1 names the wanted PID
            if msg.data.first() == Some(&0) && msg.data.get(1) == Some(&91) {
                let reply = j1587::encode(0x80, &[91, 0x64]).unwrap();
                responder.send(&reply).await.unwrap();
                break;
            }
        }
    };

    let (_, response) = tokio::join!(respond, requester.request_pid(0x80, 91));
    let msg = response.unwrap();
    assert_eq!(msg.mid, 0x80);
    assert_eq!(msg.data, vec![91, 0x64]);
}

#[tokio::test]
async fn request_pid_times_out_on_silent_bus() {
    let (bus_a, _bus_b) = bus_pair();
    let requester = J1587Transport::new(
        &bus_a,
        J1587TransportConfig {
            mid: 0xac,
            request_timeout: Duration::from_millis(10),
            request_retries: 2,
            ..Default::default()
        },
    );

    let r = requester.request_pid(0x80, 84).await;
    assert_eq!(r.unwrap_err(), Error::Timeout);
}
