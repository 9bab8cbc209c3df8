//! Per-party configuration of the engine.

use tracing::level_filters::LevelFilter;

/// Default upper bound on the number of square pairs folded into a single
/// OT batch. Must be identical on all parties, since batch boundaries are
/// part of the message schedule between peers.
pub const DEFAULT_SP_BATCH_SIZE: usize = 10_000;

/// Errors caused by an invalid engine configuration.
#[derive(Debug)]
pub enum Error {
    /// The party's own index is not below the number of parties.
    InvalidPartyId {
        /// The configured own index.
        my_id: usize,
        /// The configured number of parties.
        parties: usize,
    },
    /// A session needs at least two parties.
    TooFewParties(usize),
    /// OT batches must hold at least one square pair.
    EmptySpBatch,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidPartyId { my_id, parties } => {
                write!(f, "Party id {my_id} is not valid in a session of {parties} parties")
            }
            Error::TooFewParties(parties) => {
                write!(f, "A session needs at least 2 parties, found {parties}")
            }
            Error::EmptySpBatch => f.write_str("The square pair batch size must be at least 1"),
        }
    }
}

/// The configuration of one party of an MPC session.
///
/// The configuration is immutable once constructed and is consumed by the
/// [`crate::registry::Registry`] and the [`crate::sp::SpProvider`] at
/// construction time.
#[derive(Debug, Clone)]
pub struct Config {
    my_id: usize,
    parties: usize,
    log_filter: LevelFilter,
    sp_batch_size: usize,
}

impl Config {
    /// Creates the configuration for party `my_id` of `parties` total parties.
    pub fn new(my_id: usize, parties: usize) -> Result<Self, Error> {
        if parties < 2 {
            return Err(Error::TooFewParties(parties));
        }
        if my_id >= parties {
            return Err(Error::InvalidPartyId { my_id, parties });
        }
        Ok(Config {
            my_id,
            parties,
            log_filter: LevelFilter::INFO,
            sp_batch_size: DEFAULT_SP_BATCH_SIZE,
        })
    }

    /// Sets the severity threshold that the host's `tracing` subscriber
    /// should apply to the engine's log events.
    pub fn with_log_filter(mut self, filter: LevelFilter) -> Self {
        self.log_filter = filter;
        self
    }

    /// Overrides the maximum number of square pairs per OT batch.
    ///
    /// All parties of a session must use the same value.
    pub fn with_sp_batch_size(mut self, sp_batch_size: usize) -> Result<Self, Error> {
        if sp_batch_size == 0 {
            return Err(Error::EmptySpBatch);
        }
        self.sp_batch_size = sp_batch_size;
        Ok(self)
    }

    /// This party's 0-based index.
    pub fn my_id(&self) -> usize {
        self.my_id
    }

    /// The total number of parties in the session.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// The logging severity threshold for the host's subscriber.
    pub fn log_filter(&self) -> LevelFilter {
        self.log_filter
    }

    /// The maximum number of square pairs folded into one OT batch.
    pub fn sp_batch_size(&self) -> usize {
        self.sp_batch_size
    }
}
