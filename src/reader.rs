//! Per-connection read loop (§4.2).
//!
//! Spawned once per accepted connection. Owns the read half of the split
//! socket and a private [`Decoder`]; forwards decoded top-level objects
//! and end-of-file to the event loop over an mpsc channel. Parse errors
//! and buffer-full discards are handled here and never surface upstream -
//! per §4.7 they are silently recovered, not reported.

use std::os::unix::io::RawFd;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::protocol::{Decoded, Decoder, BUFFER_CAPACITY};

pub enum ClientEvent {
    Object(RawFd, serde_json::Value),
    Eof(RawFd),
}

pub async fn run(fd: RawFd, mut rx: ReadHalf<UnixStream>, events: mpsc::Sender<ClientEvent>) {
    let mut decoder = Decoder::new();
    let mut chunk = [0u8; BUFFER_CAPACITY];

    loop {
        let room = decoder.spare_capacity();
        let n = match rx.read(&mut chunk[..room]).await {
            Ok(0) => {
                let _ = events.send(ClientEvent::Eof(fd)).await;
                return;
            }
            Ok(n) => n,
            Err(err) => {
                log::debug!("fd={fd}: read error, closing: {err}");
                let _ = events.send(ClientEvent::Eof(fd)).await;
                return;
            }
        };
        decoder.feed(&chunk[..n]);

        loop {
            match decoder.poll() {
                Decoded::Value(value) => {
                    if value.is_object() && events.send(ClientEvent::Object(fd, value)).await.is_err() {
                        return;
                    }
                    // non-object top-level values are valid framing but
                    // carry no meaning (§4.2) - consumed, not reported.
                }
                Decoded::NeedMore => break,
                Decoded::Discarded => {
                    log::debug!("fd={fd}: discarding unparseable/oversized buffer contents");
                    break;
                }
            }
        }
    }
}
