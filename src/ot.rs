//! Batched additively-correlated oblivious transfers between two parties.
//!
//! A batch transfers `count` messages of `bit_len` bits each. For every
//! position the sender provides a correlation `x` and ends up with a fresh
//! uniform mask `m`, while the receiver chooses a bit `b` and ends up with
//! `(m + b·x) mod 2^bit_len`. This is exactly the primitive needed to
//! multiply one party's secret by single bits of another party's secret,
//! which the [`crate::sp::SpProvider`] uses to turn squares of local
//! shares into shares of the square of the joint value.
//!
//! Registration is local: a handle is constructed per batch and buffers
//! its inputs until the message exchange is driven through
//! [`AcOtSender::send_messages`] / [`AcOtReceiver::send_corrections`].
//! Both sides must drive their handles in the same order, since the
//! transport matches messages up purely by send order.
//!
//! The exchange implemented here is a plaintext stand-in for an OT
//! extension: the receiver's choice bits cross the wire unblinded. The
//! handle interface and the output distribution are the same as with a
//! real OT backend, which makes this implementation suitable for
//! functional tests, simulations and benchmarks, but not for deployments
//! against untrusted peers.

use rand::{thread_rng, Rng};

use crate::channel::{self, recv_vec_from, send_to, Channel};

/// The widest supported OT message in bits.
pub const MAX_OT_WIDTH: usize = 128;

/// Errors raised while registering or driving a batch of OTs.
#[derive(Debug)]
pub enum Error {
    /// A message could not be sent or received.
    Channel(channel::Error),
    /// The message width is zero, not a multiple of 8, or above [`MAX_OT_WIDTH`].
    UnsupportedWidth(usize),
    /// A batch must transfer at least one message.
    EmptyBatch,
    /// The number of provided sender inputs does not match the batch size.
    MessageCount {
        /// The number of messages the batch was registered with.
        expected: usize,
        /// The number of messages provided.
        actual: usize,
    },
    /// A message does not have the width the batch was registered with.
    MessageWidth {
        /// The expected width in bytes.
        expected: usize,
        /// The actual width in bytes.
        actual: usize,
    },
    /// The number of provided choice bits does not match the batch size.
    ChoiceCount {
        /// The number of choices the batch was registered with.
        expected: usize,
        /// The number of choices provided.
        actual: usize,
    },
    /// The sender's correlations were not set before driving the batch.
    InputsNotSet,
    /// The receiver's choice bits were not set before driving the batch.
    ChoicesNotSet,
    /// The outputs were accessed before the batch finished its exchange.
    NotFinished,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Channel(e) => write!(f, "Channel error: {e:?}"),
            Error::UnsupportedWidth(bits) => {
                write!(f, "Unsupported OT message width: {bits} bits")
            }
            Error::EmptyBatch => f.write_str("An OT batch must transfer at least one message"),
            Error::MessageCount { expected, actual } => {
                write!(f, "Expected {expected} sender messages, found {actual}")
            }
            Error::MessageWidth { expected, actual } => {
                write!(f, "Expected messages of {expected} bytes, found {actual}")
            }
            Error::ChoiceCount { expected, actual } => {
                write!(f, "Expected {expected} choice bits, found {actual}")
            }
            Error::InputsNotSet => f.write_str("The sender correlations were never set"),
            Error::ChoicesNotSet => f.write_str("The receiver choices were never set"),
            Error::NotFinished => f.write_str("The OT batch has not been driven to completion"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

fn check_width(bit_len: usize) -> Result<(), Error> {
    if bit_len == 0 || bit_len % 8 != 0 || bit_len > MAX_OT_WIDTH {
        return Err(Error::UnsupportedWidth(bit_len));
    }
    Ok(())
}

/// Interprets up to 16 little-endian bytes as a `u128`.
fn to_word(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    u128::from_le_bytes(buf)
}

/// The `byte_len`-byte little-endian representation of `word`.
fn to_bytes(word: u128, byte_len: usize) -> Vec<u8> {
    word.to_le_bytes()[..byte_len].to_vec()
}

fn width_mask(bit_len: usize) -> u128 {
    if bit_len == 128 {
        u128::MAX
    } else {
        (1u128 << bit_len) - 1
    }
}

/// Samples one uniform mask per OT and offsets the chosen messages by the
/// correlations: the pair of output vectors is `(m, m + b·x)` per position.
fn mask_messages(
    correlations: &[Vec<u8>],
    choices: &[bool],
    bit_len: usize,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let byte_len = bit_len / 8;
    let mask = width_mask(bit_len);
    let mut rng = thread_rng();
    let mut masks = Vec::with_capacity(correlations.len());
    let mut messages = Vec::with_capacity(correlations.len());
    for (correlation, &choice) in correlations.iter().zip(choices) {
        let m = rng.gen::<u128>() & mask;
        let y = if choice {
            m.wrapping_add(to_word(correlation)) & mask
        } else {
            m
        };
        masks.push(to_bytes(m, byte_len));
        messages.push(to_bytes(y, byte_len));
    }
    (masks, messages)
}

/// The sender's handle on one batch of additively-correlated OTs.
#[derive(Debug)]
pub struct AcOtSender {
    peer: usize,
    bit_len: usize,
    count: usize,
    inputs: Option<Vec<Vec<u8>>>,
    outputs: Option<Vec<Vec<u8>>>,
}

impl AcOtSender {
    /// Registers a batch of `count` OTs of `bit_len`-bit messages towards `peer`.
    pub fn register(peer: usize, bit_len: usize, count: usize) -> Result<Self, Error> {
        check_width(bit_len)?;
        if count == 0 {
            return Err(Error::EmptyBatch);
        }
        Ok(AcOtSender {
            peer,
            bit_len,
            count,
            inputs: None,
            outputs: None,
        })
    }

    /// Sets the additive correlations, one `bit_len`-bit little-endian
    /// value per OT of the batch.
    pub fn set_inputs(&mut self, correlations: Vec<Vec<u8>>) -> Result<(), Error> {
        if correlations.len() != self.count {
            return Err(Error::MessageCount {
                expected: self.count,
                actual: correlations.len(),
            });
        }
        let byte_len = self.bit_len / 8;
        for correlation in &correlations {
            if correlation.len() != byte_len {
                return Err(Error::MessageWidth {
                    expected: byte_len,
                    actual: correlation.len(),
                });
            }
        }
        self.inputs = Some(correlations);
        Ok(())
    }

    /// Awaits the peer's corrections, then samples the masks and transfers
    /// the (possibly offset) messages.
    pub async fn send_messages(&mut self, channel: &impl Channel) -> Result<(), Error> {
        let inputs = self.inputs.as_ref().ok_or(Error::InputsNotSet)?;
        let choices: Vec<bool> =
            recv_vec_from(channel, self.peer, "ot corrections", self.count).await?;
        let (masks, messages) = mask_messages(inputs, &choices, self.bit_len);
        send_to(channel, self.peer, "ot messages", &messages).await?;
        self.outputs = Some(masks);
        Ok(())
    }

    /// The sender's outputs: one uniform `bit_len`-bit mask per OT.
    pub fn outputs(&self) -> Result<&[Vec<u8>], Error> {
        self.outputs.as_deref().ok_or(Error::NotFinished)
    }
}

/// The receiver's handle on one batch of additively-correlated OTs.
#[derive(Debug)]
pub struct AcOtReceiver {
    peer: usize,
    bit_len: usize,
    count: usize,
    choices: Option<Vec<bool>>,
    outputs: Option<Vec<Vec<u8>>>,
}

impl AcOtReceiver {
    /// Registers a batch of `count` OTs of `bit_len`-bit messages towards `peer`.
    pub fn register(peer: usize, bit_len: usize, count: usize) -> Result<Self, Error> {
        check_width(bit_len)?;
        if count == 0 {
            return Err(Error::EmptyBatch);
        }
        Ok(AcOtReceiver {
            peer,
            bit_len,
            count,
            choices: None,
            outputs: None,
        })
    }

    /// Sets the choice bits, one per OT of the batch.
    pub fn set_choices(&mut self, choices: Vec<bool>) -> Result<(), Error> {
        if choices.len() != self.count {
            return Err(Error::ChoiceCount {
                expected: self.count,
                actual: choices.len(),
            });
        }
        self.choices = Some(choices);
        Ok(())
    }

    /// Transfers the corrections to the peer, then awaits the messages
    /// selected by the choice bits.
    pub async fn send_corrections(&mut self, channel: &impl Channel) -> Result<(), Error> {
        let choices = self.choices.as_ref().ok_or(Error::ChoicesNotSet)?;
        send_to(channel, self.peer, "ot corrections", choices).await?;
        let messages: Vec<Vec<u8>> =
            recv_vec_from(channel, self.peer, "ot messages", self.count).await?;
        let byte_len = self.bit_len / 8;
        for message in &messages {
            if message.len() != byte_len {
                return Err(Error::MessageWidth {
                    expected: byte_len,
                    actual: message.len(),
                });
            }
        }
        self.outputs = Some(messages);
        Ok(())
    }

    /// The receiver's outputs: `(m + b·x) mod 2^bit_len` per OT.
    pub fn outputs(&self) -> Result<&[Vec<u8>], Error> {
        self.outputs.as_deref().ok_or(Error::NotFinished)
    }
}
