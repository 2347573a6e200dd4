#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use navilink::{decode_control_request, ControlRequest, DeviceControl, CONTROL_REQUEST_LEN};

pub const GATEWAY_ID: &str = "0123456789abcdef";
pub const GATEWAY_BYTES: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];

/// A channel-information frame for firmware 14.50 (13-byte records), one
/// record per channel with the given device-sorting codes. `on_demand` is
/// the wire code every channel reports (1 = supported).
pub fn channel_info_frame(sortings: [u8; 3], on_demand: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 13 + 13 * 3];
    frame[0..8].copy_from_slice(&GATEWAY_BYTES);
    frame[9] = 1;
    frame[10] = 14;
    frame[11] = 50;
    frame[12] = 7;
    for (i, sorting) in sortings.iter().enumerate() {
        let base = 13 + 13 * i;
        frame[base..base + 13].copy_from_slice(&[
            (i as u8) + 1,
            *sorting,
            1,    // device count
            1,    // Celsius
            60,   // min setting temperature (wire half-degrees)
            120,  // max
            40,   // heating min
            80,   // heating max
            on_demand,
            1,    // heating control
            0x0C, // hot water + recirculation possible
            0,
            1,
        ]);
    }
    frame
}

/// A 271-byte state frame (four trailing averages). Monday carries one
/// 06:30 "on" schedule entry; weekly control is enabled.
pub fn state_frame(channel: u8, device: u8, power: u8, flow: u16) -> Vec<u8> {
    let mut frame = vec![0u8; 271];
    frame[0..8].copy_from_slice(&GATEWAY_BYTES);
    frame[9] = 2;
    frame[16] = 1; // NPE
    frame[18] = channel;
    frame[19] = device;
    frame[30] = 97; // hot-water setting temperature, half-degree counts
    frame[32] = (flow & 0xFF) as u8; // least-significant byte first on the wire
    frame[33] = (flow >> 8) as u8;
    frame[38] = power;
    frame[41] = 1; // weekly control enabled
    for day in 0..7 {
        frame[43 + day * 32] = (day as u8) + 1;
    }
    let monday = 43 + 32;
    frame[monday + 1] = 1;
    frame[monday + 2] = 6;
    frame[monday + 3] = 30;
    frame[monday + 4] = 1;
    frame
}

/// In-process stand-in for the vendor relay. It enforces the protocol's
/// write-then-read pairing: every connection answers the login line with
/// channel information, then reads exactly one control request before
/// producing the response that matches it, so interleaved writers would get
/// mismatched frames.
pub struct FakeRelay {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<ControlRequest>>>,
    /// When set, state requests are answered with an undecodable blob.
    pub garbage: Arc<AtomicBool>,
    /// Flow-rate value embedded in produced state frames.
    pub flow: Arc<AtomicU16>,
}

pub async fn spawn_relay(channel_info: Vec<u8>) -> FakeRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay = FakeRelay {
        addr: listener.local_addr().unwrap(),
        connections: Arc::new(AtomicUsize::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
        garbage: Arc::new(AtomicBool::new(false)),
        flow: Arc::new(AtomicU16::new(850)),
    };
    let connections = relay.connections.clone();
    let requests = relay.requests.clone();
    let garbage = relay.garbage.clone();
    let flow = relay.flow.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            connections.fetch_add(1, Ordering::SeqCst);
            let info = channel_info.clone();
            let requests = requests.clone();
            let garbage = garbage.clone();
            let flow = flow.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                assert!(
                    buf[..n].ends_with(GATEWAY_ID.as_bytes()),
                    "login line must end with the gateway id"
                );
                if socket.write_all(&info).await.is_err() {
                    return;
                }
                loop {
                    // Control requests are fixed length, so one exact read
                    // per request survives back-to-back writes from the
                    // fire-and-forget path.
                    let mut frame = [0u8; CONTROL_REQUEST_LEN];
                    if socket.read_exact(&mut frame).await.is_err() {
                        return;
                    }
                    let request = match decode_control_request(&frame) {
                        Some(request) => request,
                        None => return,
                    };
                    requests.lock().unwrap().push(request.clone());
                    // The vendor sends no reply to water-temperature writes.
                    if request.control_item == DeviceControl::WaterTemperature.code() {
                        continue;
                    }
                    let response = if garbage.load(Ordering::SeqCst) {
                        vec![0xFF; 5]
                    } else {
                        state_frame(
                            request.channel,
                            request.device_number,
                            1,
                            flow.load(Ordering::SeqCst),
                        )
                    };
                    if socket.write_all(&response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    relay
}
