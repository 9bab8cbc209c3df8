//! Communication channels for exchanging messages between parties.
//!
//! The engine never talks to the network directly. All party-to-party
//! traffic goes through the [`Channel`] trait, which transports opaque
//! byte frames addressed by party index. Implementations decide how the
//! frames travel: TCP, HTTP, an in-memory queue for tests, and so on.
//!
//! Typed messages are serialized with `bincode` as a whole and then cut
//! into transport frames of bounded size. Every frame ends in a one-byte
//! continuation marker, so the receiving side knows when the message is
//! complete without any out-of-band length negotiation. Frames between
//! the same two parties are matched up purely by send order, which the
//! engine guarantees by driving each pairwise protocol sequentially.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    Mutex,
};
use tokio::time::timeout;
use tracing::trace;

/// The payload bytes carried per transport frame, without the marker.
const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// Marker byte of the final frame of a message.
const FRAME_LAST: u8 = 0;
/// Marker byte of a frame with more frames to follow.
const FRAME_MORE: u8 = 1;

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug)]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The underlying transport failed to deliver a frame.
    Send(String),
    /// The underlying transport failed to produce a frame.
    Recv(String),
    /// The message could not be (de-)serialized.
    Serde(String),
    /// A frame was empty or carried an unknown continuation marker.
    MalformedFrame,
    /// The message is a Vec, but not of the expected length.
    UnexpectedLength {
        /// The number of elements the caller expected.
        expected: usize,
        /// The number of elements the message carried.
        actual: usize,
    },
}

impl Error {
    fn new(phase: &str, reason: ErrorKind) -> Self {
        Error {
            phase: phase.to_string(),
            reason,
        }
    }
}

/// A communication channel used to send/receive messages to/from another party.
///
/// Implementations determine how the frames are physically transmitted;
/// the engine only ever addresses peers by their 0-based party index.
pub trait Channel {
    /// The error that can occur sending frames over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving frames over the channel.
    type RecvError: fmt::Debug;

    /// Delivers one frame to the party with the given index.
    // The async_fn_in_trait lint is allowed because no bounds are needed on the
    // returned future: the engine drives all futures on the caller's runtime.
    #[allow(async_fn_in_trait)]
    async fn send_bytes_to(&self, party: usize, frame: Vec<u8>) -> Result<(), Self::SendError>;

    /// Awaits one frame from the party with the given index.
    #[allow(async_fn_in_trait)]
    async fn recv_bytes_from(&self, party: usize) -> Result<Vec<u8>, Self::RecvError>;
}

/// Serializes and sends a message to the party with the given index.
pub(crate) async fn send_to<S: Serialize + ?Sized>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    msg: &S,
) -> Result<(), Error> {
    let bytes = bincode::serialize(msg)
        .map_err(|e| Error::new(phase, ErrorKind::Serde(format!("{e:?}"))))?;
    trace!(party, phase, bytes = bytes.len(), "sending message");
    let mut offset = 0;
    loop {
        let end = usize::min(offset + MAX_FRAME_PAYLOAD, bytes.len());
        let last = end == bytes.len();
        let mut frame = Vec::with_capacity(end - offset + 1);
        frame.extend_from_slice(&bytes[offset..end]);
        frame.push(if last { FRAME_LAST } else { FRAME_MORE });
        channel
            .send_bytes_to(party, frame)
            .await
            .map_err(|e| Error::new(phase, ErrorKind::Send(format!("{e:?}"))))?;
        if last {
            return Ok(());
        }
        offset = end;
    }
}

/// Receives and deserializes a message from the party with the given index.
pub(crate) async fn recv_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
) -> Result<T, Error> {
    let mut bytes = Vec::new();
    loop {
        let mut frame = channel
            .recv_bytes_from(party)
            .await
            .map_err(|e| Error::new(phase, ErrorKind::Recv(format!("{e:?}"))))?;
        let marker = frame
            .pop()
            .ok_or_else(|| Error::new(phase, ErrorKind::MalformedFrame))?;
        bytes.extend_from_slice(&frame);
        match marker {
            FRAME_LAST => break,
            FRAME_MORE => continue,
            _ => return Err(Error::new(phase, ErrorKind::MalformedFrame)),
        }
    }
    trace!(party, phase, bytes = bytes.len(), "received message");
    bincode::deserialize(&bytes)
        .map_err(|e| Error::new(phase, ErrorKind::Serde(format!("{e:?}"))))
}

/// Receives a Vec from the party with the given index, checking its length.
pub(crate) async fn recv_vec_from<T: DeserializeOwned>(
    channel: &impl Channel,
    party: usize,
    phase: &str,
    len: usize,
) -> Result<Vec<T>, Error> {
    let v: Vec<T> = recv_from(channel, party, phase).await?;
    if v.len() != len {
        return Err(Error::new(
            phase,
            ErrorKind::UnexpectedLength {
                expected: len,
                actual: v.len(),
            },
        ));
    }
    Ok(v)
}

/// How many frames one peer can buffer towards another before sends block.
const CHANNEL_CAPACITY: usize = 256;

/// How long [`SimpleChannel`] waits for a frame before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised by the in-memory transport.
#[derive(Debug)]
pub enum SimpleChannelError {
    /// The addressed party has no endpoint here (out of range, or the
    /// local party itself).
    UnknownPeer(usize),
    /// The peer's endpoint was dropped.
    Closed,
    /// No frame arrived within the receive timeout; in a simulated
    /// session this almost always means the parties' message schedules
    /// diverged.
    Timeout,
}

/// An in-memory transport connecting all parties of a simulated session.
///
/// [`SimpleChannel::channels`] wires up one endpoint per party, with a
/// buffered queue in each direction between every pair, so a test can
/// hand each simulated party its own endpoint and run them as concurrent
/// tasks.
#[derive(Debug)]
pub struct SimpleChannel {
    outgoing: Vec<Option<Sender<Vec<u8>>>>,
    incoming: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
    bytes_sent: AtomicU64,
}

impl SimpleChannel {
    /// Creates connected endpoints for `parties` parties.
    pub fn channels(parties: usize) -> Vec<Self> {
        let mut endpoints: Vec<SimpleChannel> = (0..parties)
            .map(|_| SimpleChannel {
                outgoing: (0..parties).map(|_| None).collect(),
                incoming: (0..parties).map(|_| None).collect(),
                bytes_sent: AtomicU64::new(0),
            })
            .collect();
        for a in 0..parties {
            for b in a + 1..parties {
                let (a_to_b, from_a) = channel(CHANNEL_CAPACITY);
                let (b_to_a, from_b) = channel(CHANNEL_CAPACITY);
                endpoints[a].outgoing[b] = Some(a_to_b);
                endpoints[a].incoming[b] = Some(Mutex::new(from_b));
                endpoints[b].outgoing[a] = Some(b_to_a);
                endpoints[b].incoming[a] = Some(Mutex::new(from_a));
            }
        }
        endpoints
    }

    /// The total number of bytes sent through this endpoint.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Channel for SimpleChannel {
    type SendError = SimpleChannelError;
    type RecvError = SimpleChannelError;

    async fn send_bytes_to(&self, party: usize, frame: Vec<u8>) -> Result<(), SimpleChannelError> {
        let sender = self
            .outgoing
            .get(party)
            .and_then(|sender| sender.as_ref())
            .ok_or(SimpleChannelError::UnknownPeer(party))?;
        self.bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        trace!(party, bytes = frame.len(), "sending frame");
        sender
            .send(frame)
            .await
            .map_err(|_| SimpleChannelError::Closed)
    }

    async fn recv_bytes_from(&self, party: usize) -> Result<Vec<u8>, SimpleChannelError> {
        let receiver = self
            .incoming
            .get(party)
            .and_then(|receiver| receiver.as_ref())
            .ok_or(SimpleChannelError::UnknownPeer(party))?;
        let mut receiver = receiver.lock().await;
        match timeout(RECV_TIMEOUT, receiver.recv()).await {
            Ok(Some(frame)) => {
                trace!(party, bytes = frame.len(), "received frame");
                Ok(frame)
            }
            Ok(None) => Err(SimpleChannelError::Closed),
            Err(_) => Err(SimpleChannelError::Timeout),
        }
    }
}
