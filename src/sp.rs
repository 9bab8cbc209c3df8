//! Precomputation of additively shared square pairs `(a, a·a)`.
//!
//! For every requested integer width `W ∈ {8, 16, 32, 64, 128}` the
//! provider produces vectors `a` and `c` such that, summed over all
//! parties modulo `2^W`, `Σ a = A` and `Σ c = A·A` for a uniformly random
//! joint value `A`. Protocol layers consume the pairs during the online
//! phase to square (and thereby multiply) secret-shared values in a
//! single round.
//!
//! # Construction
//!
//! Each party samples its `a` locally and initializes `c = a·a`, which
//! accounts for the `Σ a_i·a_i` terms of the square of the sum. The cross
//! terms `2·a_i·a_j` are produced by one batch of additively-correlated
//! OTs per ordered party pair: the sender offers the correlations
//! `a_i << bit` for every bit position, the receiver selects with the
//! bits of its own `a_j`, and summing the outputs over all bit positions
//! yields additive shares of `a_i·a_j`. The sender folds its masks into
//! `c` with a factor of `−2`, the receiver folds its chosen messages in
//! with `+2`; the two offsets cancel up to the wanted `2·a_i·a_j`.
//!
//! Within each pair, the party with the higher index acts as the sender.
//! Handles are registered per peer in a fixed order (widths ascending,
//! batches of at most [`crate::config::Config::sp_batch_size`] pairs) and
//! must be parsed in the same order; this schedule is a protocol
//! invariant shared by all parties.
//!
//! # Lifecycle
//!
//! [`SpProvider::pre_setup`] registers all OTs, [`SpProvider::setup`]
//! drives the message exchange (in parallel over peers), folds the OT
//! outputs into `c` and finally signals the [`Completion`] handle, after
//! which [`SpProvider::sps`] gives access to the pairs.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use rand::{thread_rng, Rng};
use tokio::sync::watch;
use tracing::debug;

use crate::channel::Channel;
use crate::config::Config;
use crate::ot::{self, AcOtReceiver, AcOtSender};
use crate::ring::Ring;
use crate::stats::{Phase, RunTimeStats};

/// Errors raised while precomputing square pairs.
#[derive(Debug)]
pub enum Error {
    /// An OT batch could not be registered or driven.
    Ot(ot::Error),
    /// A peer's OT handle list ran dry before all batches were parsed.
    HandleMismatch {
        /// The peer whose handle list mismatched the request counts.
        peer: usize,
    },
    /// An OT batch produced an unexpected number of outputs.
    OutputLength {
        /// The number of outputs implied by the batch size.
        expected: usize,
        /// The number of outputs found.
        actual: usize,
    },
    /// The pairs were accessed before setup finished.
    NotReady,
    /// The provider was torn down before setup finished.
    SetupAborted,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Ot(e) => write!(f, "OT error: {e}"),
            Error::HandleMismatch { peer } => {
                write!(f, "Ran out of OT handles for peer {peer} while parsing outputs")
            }
            Error::OutputLength { expected, actual } => {
                write!(f, "Expected {expected} OT outputs, found {actual}")
            }
            Error::NotReady => f.write_str("The square pairs are not ready before setup finished"),
            Error::SetupAborted => f.write_str("The provider was dropped before setup finished"),
        }
    }
}

impl From<ot::Error> for Error {
    fn from(e: ot::Error) -> Self {
        Self::Ot(e)
    }
}

/// One party's additive shares of a batch of square pairs.
#[derive(Debug, Clone)]
pub struct SpVector<R> {
    /// This party's share of the random values.
    pub a: Vec<R>,
    /// This party's share of the squares of the joint random values.
    pub c: Vec<R>,
}

impl<R> Default for SpVector<R> {
    fn default() -> Self {
        SpVector {
            a: Vec::new(),
            c: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SpCounts {
    bits8: usize,
    bits16: usize,
    bits32: usize,
    bits64: usize,
    bits128: usize,
}

impl SpCounts {
    fn total(&self) -> usize {
        self.bits8 + self.bits16 + self.bits32 + self.bits64 + self.bits128
    }
}

#[derive(Debug, Default)]
struct SpBatches {
    bits8: SpVector<u8>,
    bits16: SpVector<u16>,
    bits32: SpVector<u32>,
    bits64: SpVector<u64>,
    bits128: SpVector<u128>,
}

mod sealed {
    use super::{SpBatches, SpCounts, SpVector};

    /// Maps an integer width to its request counter and pair batch.
    pub trait SpSlot: Sized {
        fn count_mut(counts: &mut SpCounts) -> &mut usize;
        fn batch(batches: &SpBatches) -> &SpVector<Self>;
    }
}

macro_rules! impl_sp_slot {
    ($t:ty, $field:ident) => {
        impl sealed::SpSlot for $t {
            fn count_mut(counts: &mut SpCounts) -> &mut usize {
                &mut counts.$field
            }

            fn batch(batches: &SpBatches) -> &SpVector<$t> {
                &batches.$field
            }
        }
    };
}

impl_sp_slot!(u8, bits8);
impl_sp_slot!(u16, bits16);
impl_sp_slot!(u32, bits32);
impl_sp_slot!(u64, bits64);
impl_sp_slot!(u128, bits128);

/// The integer widths square pairs can be requested at.
pub trait SpWidth: Ring + sealed::SpSlot {}

impl<R: Ring + sealed::SpSlot> SpWidth for R {}

/// A waitable handle on the completion of [`SpProvider::setup`].
///
/// The underlying flag is monotone: it transitions from `false` to `true`
/// exactly once, on the success path of setup.
#[derive(Debug, Clone)]
pub struct Completion {
    finished: watch::Receiver<bool>,
}

impl Completion {
    /// Whether setup has finished.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Blocks until setup has finished.
    pub async fn wait(&mut self) -> Result<(), Error> {
        self.finished
            .wait_for(|finished| *finished)
            .await
            .map(|_| ())
            .map_err(|_| Error::SetupAborted)
    }
}

/// Generates additive shares of square pairs from pairwise correlated OTs.
pub struct SpProvider {
    my_id: usize,
    parties: usize,
    max_batch: usize,
    counts: SpCounts,
    batches: SpBatches,
    /// Per peer, the sender handles in registration order. Only peers with
    /// a lower index than ours are sent to.
    ots_sender: Vec<VecDeque<AcOtSender>>,
    /// Per peer, the receiver handles in registration order. Only peers
    /// with a higher index than ours are received from.
    ots_receiver: Vec<VecDeque<AcOtReceiver>>,
    registered: bool,
    finished: watch::Sender<bool>,
    stats: Arc<Mutex<RunTimeStats>>,
}

impl SpProvider {
    /// Creates a provider for the party described by `config`, recording
    /// phase timings into `stats`.
    pub fn new(config: &Config, stats: Arc<Mutex<RunTimeStats>>) -> Self {
        let (finished, _) = watch::channel(false);
        SpProvider {
            my_id: config.my_id(),
            parties: config.parties(),
            max_batch: config.sp_batch_size(),
            counts: SpCounts::default(),
            batches: SpBatches::default(),
            ots_sender: (0..config.parties()).map(|_| VecDeque::new()).collect(),
            ots_receiver: (0..config.parties()).map(|_| VecDeque::new()).collect(),
            registered: false,
            finished,
            stats,
        }
    }

    /// Requests `n` additional square pairs of width `R`.
    ///
    /// Must only be called during circuit build, before
    /// [`SpProvider::pre_setup`].
    pub fn request_sps<R: SpWidth>(&mut self, n: usize) {
        debug_assert!(
            !self.registered,
            "square pair requests must happen before presetup"
        );
        *R::count_mut(&mut self.counts) += n;
    }

    /// Whether any square pairs were requested.
    pub fn need_sps(&self) -> bool {
        self.counts.total() > 0
    }

    /// A handle that can be waited on until [`SpProvider::setup`] finished.
    pub fn completion(&self) -> Completion {
        Completion {
            finished: self.finished.subscribe(),
        }
    }

    /// This party's shares of the width-`R` square pairs.
    ///
    /// Fails with [`Error::NotReady`] until setup has finished.
    pub fn sps<R: SpWidth>(&self) -> Result<&SpVector<R>, Error> {
        if !*self.finished.borrow() {
            return Err(Error::NotReady);
        }
        Ok(R::batch(&self.batches))
    }

    /// Samples the local pair shares and registers all OT batches.
    ///
    /// A no-op if no square pairs were requested.
    pub fn pre_setup(&mut self) -> Result<(), Error> {
        if !self.need_sps() {
            return Ok(());
        }
        debug!("start computing presetup for SPs");
        self.stats
            .lock()
            .expect("statistics mutex poisoned")
            .record_start(Phase::SpPresetup);

        self.register_ots()?;

        self.stats
            .lock()
            .expect("statistics mutex poisoned")
            .record_end(Phase::SpPresetup);
        debug!("finished computing presetup for SPs");
        Ok(())
    }

    /// Drives all registered OTs to completion, folds their outputs into
    /// the pair shares and signals the [`Completion`] handle.
    ///
    /// A no-op if no square pairs were requested. The per-peer exchanges
    /// share no mutable state and run concurrently.
    pub async fn setup(&mut self, channel: &impl Channel) -> Result<(), Error> {
        if !self.need_sps() {
            return Ok(());
        }
        debug!("start computing setup for SPs");
        self.stats
            .lock()
            .expect("statistics mutex poisoned")
            .record_start(Phase::SpSetup);

        let senders = mem::take(&mut self.ots_sender);
        let receivers = mem::take(&mut self.ots_receiver);
        let peers = senders
            .into_iter()
            .zip(receivers)
            .map(|(mut sender_ots, mut receiver_ots)| async move {
                for ot in sender_ots.iter_mut() {
                    ot.send_messages(channel).await?;
                }
                for ot in receiver_ots.iter_mut() {
                    ot.send_corrections(channel).await?;
                }
                Ok::<_, Error>((sender_ots, receiver_ots))
            });
        let done = try_join_all(peers).await?;
        let (ots_sender, ots_receiver): (Vec<_>, Vec<_>) = done.into_iter().unzip();
        self.ots_sender = ots_sender;
        self.ots_receiver = ots_receiver;

        self.parse_outputs()?;
        self.finished.send_replace(true);

        self.stats
            .lock()
            .expect("statistics mutex poisoned")
            .record_end(Phase::SpSetup);
        debug!("finished computing setup for SPs");
        Ok(())
    }

    fn register_ots(&mut self) -> Result<(), Error> {
        self.registered = true;
        let mut rng = thread_rng();
        self.batches.bits8 = generate_pairs(self.counts.bits8, &mut rng);
        self.batches.bits16 = generate_pairs(self.counts.bits16, &mut rng);
        self.batches.bits32 = generate_pairs(self.counts.bits32, &mut rng);
        self.batches.bits64 = generate_pairs(self.counts.bits64, &mut rng);
        self.batches.bits128 = generate_pairs(self.counts.bits128, &mut rng);

        for peer in 0..self.parties {
            if peer == self.my_id {
                continue;
            }
            if peer < self.my_id {
                let ots = &mut self.ots_sender[peer];
                register_send(peer, ots, self.max_batch, &self.batches.bits8)?;
                register_send(peer, ots, self.max_batch, &self.batches.bits16)?;
                register_send(peer, ots, self.max_batch, &self.batches.bits32)?;
                register_send(peer, ots, self.max_batch, &self.batches.bits64)?;
                register_send(peer, ots, self.max_batch, &self.batches.bits128)?;
            } else {
                let ots = &mut self.ots_receiver[peer];
                register_receive(peer, ots, self.max_batch, &self.batches.bits8)?;
                register_receive(peer, ots, self.max_batch, &self.batches.bits16)?;
                register_receive(peer, ots, self.max_batch, &self.batches.bits32)?;
                register_receive(peer, ots, self.max_batch, &self.batches.bits64)?;
                register_receive(peer, ots, self.max_batch, &self.batches.bits128)?;
            }
        }
        Ok(())
    }

    fn parse_outputs(&mut self) -> Result<(), Error> {
        for peer in 0..self.parties {
            if peer == self.my_id {
                continue;
            }
            if peer < self.my_id {
                let ots = &mut self.ots_sender[peer];
                parse_sender(peer, ots, self.max_batch, &mut self.batches.bits8)?;
                parse_sender(peer, ots, self.max_batch, &mut self.batches.bits16)?;
                parse_sender(peer, ots, self.max_batch, &mut self.batches.bits32)?;
                parse_sender(peer, ots, self.max_batch, &mut self.batches.bits64)?;
                parse_sender(peer, ots, self.max_batch, &mut self.batches.bits128)?;
            } else {
                let ots = &mut self.ots_receiver[peer];
                parse_receiver(peer, ots, self.max_batch, &mut self.batches.bits8)?;
                parse_receiver(peer, ots, self.max_batch, &mut self.batches.bits16)?;
                parse_receiver(peer, ots, self.max_batch, &mut self.batches.bits32)?;
                parse_receiver(peer, ots, self.max_batch, &mut self.batches.bits64)?;
                parse_receiver(peer, ots, self.max_batch, &mut self.batches.bits128)?;
            }
        }
        Ok(())
    }
}

/// Samples `n` random values and initializes their squares.
fn generate_pairs<R: Ring>(n: usize, rng: &mut impl Rng) -> SpVector<R> {
    let a: Vec<R> = (0..n).map(|_| R::random(rng)).collect();
    let c = a.iter().map(|a| a.wrapping_mul(a)).collect();
    SpVector { a, c }
}

/// Registers the sender OT batches towards `peer` for one width.
///
/// The message at position `k·W + bit` carries `a[sp_id + k] << bit`.
fn register_send<R: Ring>(
    peer: usize,
    ots: &mut VecDeque<AcOtSender>,
    max_batch: usize,
    sps: &SpVector<R>,
) -> Result<(), Error> {
    let n = sps.a.len();
    let mut sp_id = 0;
    while sp_id < n {
        let batch_size = usize::min(max_batch, n - sp_id);
        let mut ot = AcOtSender::register(peer, R::BITS, batch_size * R::BITS)?;
        let mut correlations = Vec::with_capacity(batch_size * R::BITS);
        for k in 0..batch_size {
            let a = sps.a[sp_id + k];
            for bit in 0..R::BITS {
                correlations.push(a.wrapping_shl(bit as u32).to_bytes());
            }
        }
        ot.set_inputs(correlations)?;
        ots.push_back(ot);
        sp_id += batch_size;
    }
    Ok(())
}

/// Registers the receiver OT batches towards `peer` for one width.
///
/// The choice at position `k·W + bit` is bit `bit` of `a[sp_id + k]`.
fn register_receive<R: Ring>(
    peer: usize,
    ots: &mut VecDeque<AcOtReceiver>,
    max_batch: usize,
    sps: &SpVector<R>,
) -> Result<(), Error> {
    let n = sps.a.len();
    let mut sp_id = 0;
    while sp_id < n {
        let batch_size = usize::min(max_batch, n - sp_id);
        let mut ot = AcOtReceiver::register(peer, R::BITS, batch_size * R::BITS)?;
        let mut choices = Vec::with_capacity(batch_size * R::BITS);
        for k in 0..batch_size {
            let a = sps.a[sp_id + k];
            for bit in 0..R::BITS {
                choices.push(a.bit(bit));
            }
        }
        ot.set_choices(choices)?;
        ots.push_back(ot);
        sp_id += batch_size;
    }
    Ok(())
}

/// Folds the sender-side OT outputs (the masks) into `c` with factor −2,
/// consuming handles from the front of the per-peer list.
fn parse_sender<R: Ring>(
    peer: usize,
    ots: &mut VecDeque<AcOtSender>,
    max_batch: usize,
    sps: &mut SpVector<R>,
) -> Result<(), Error> {
    let n = sps.a.len();
    let mut sp_id = 0;
    while sp_id < n {
        let batch_size = usize::min(max_batch, n - sp_id);
        let ot = ots.pop_front().ok_or(Error::HandleMismatch { peer })?;
        let outputs = ot.outputs()?;
        if outputs.len() != batch_size * R::BITS {
            return Err(Error::OutputLength {
                expected: batch_size * R::BITS,
                actual: outputs.len(),
            });
        }
        for k in 0..batch_size {
            for bit in 0..R::BITS {
                let m = parse_word::<R>(&outputs[k * R::BITS + bit])?;
                let c = &mut sps.c[sp_id + k];
                *c = c.wrapping_sub(&m.wrapping_add(&m));
            }
        }
        sp_id += batch_size;
    }
    Ok(())
}

/// Folds the receiver-side OT outputs (the chosen messages) into `c` with
/// factor +2, consuming handles from the front of the per-peer list.
fn parse_receiver<R: Ring>(
    peer: usize,
    ots: &mut VecDeque<AcOtReceiver>,
    max_batch: usize,
    sps: &mut SpVector<R>,
) -> Result<(), Error> {
    let n = sps.a.len();
    let mut sp_id = 0;
    while sp_id < n {
        let batch_size = usize::min(max_batch, n - sp_id);
        let ot = ots.pop_front().ok_or(Error::HandleMismatch { peer })?;
        let outputs = ot.outputs()?;
        if outputs.len() != batch_size * R::BITS {
            return Err(Error::OutputLength {
                expected: batch_size * R::BITS,
                actual: outputs.len(),
            });
        }
        for k in 0..batch_size {
            for bit in 0..R::BITS {
                let m = parse_word::<R>(&outputs[k * R::BITS + bit])?;
                let c = &mut sps.c[sp_id + k];
                *c = c.wrapping_add(&m.wrapping_add(&m));
            }
        }
        sp_id += batch_size;
    }
    Ok(())
}

/// Interprets an OT output as a width-`R` little-endian integer.
fn parse_word<R: Ring>(bytes: &[u8]) -> Result<R, Error> {
    R::from_bytes(bytes).ok_or(Error::OutputLength {
        expected: R::BYTES,
        actual: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::channel::SimpleChannel;
    use crate::config::Config;
    use crate::stats::{Phase, RunTimeStats};

    use super::{Error, SpProvider};

    fn provider(my_id: usize, parties: usize) -> (SpProvider, Arc<Mutex<RunTimeStats>>) {
        let config = Config::new(my_id, parties).unwrap();
        let stats = Arc::new(Mutex::new(RunTimeStats::default()));
        (SpProvider::new(&config, Arc::clone(&stats)), stats)
    }

    #[test]
    fn need_sps_reflects_requests() {
        let (mut sp, _) = provider(0, 2);
        assert!(!sp.need_sps());
        sp.request_sps::<u32>(3);
        assert!(sp.need_sps());
        sp.request_sps::<u128>(1);
        assert!(sp.need_sps());
    }

    #[test]
    fn sps_are_not_ready_before_setup() {
        let (mut sp, _) = provider(0, 2);
        sp.request_sps::<u16>(2);
        sp.pre_setup().unwrap();
        assert!(matches!(sp.sps::<u16>(), Err(Error::NotReady)));
        assert!(!sp.completion().is_finished());
    }

    #[tokio::test]
    async fn setup_without_requests_is_a_no_op() {
        let mut channels = SimpleChannel::channels(2);
        let _c1 = channels.pop().unwrap();
        let c0 = channels.pop().unwrap();
        let (mut sp, stats) = provider(0, 2);
        sp.pre_setup().unwrap();
        // The peer never participates, yet setup returns immediately.
        sp.setup(&c0).await.unwrap();
        assert!(!sp.completion().is_finished());
        assert_eq!(stats.lock().unwrap().duration(Phase::SpSetup), None);
    }
}
