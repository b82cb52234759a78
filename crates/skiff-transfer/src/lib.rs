//! Skiff: reliable file transfer over UDP with selective-repeat ARQ.
//!
//! Provides:
//! - A length-prefixed packet codec with 4-byte acknowledgments
//! - A windowed sender session with per-slot retransmission
//! - A multi-session receiver with bounded out-of-order reassembly
//! - Fan-out of one file to many receivers on independent threads
//! - Receiver-side loss simulation for exercising retransmission

pub mod config;
pub mod error;
pub mod fanout;
pub mod logging;
pub mod loss;
pub mod protocol;
pub mod reassembly;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod window;

// Re-export key types for convenience.
pub use config::{
    FanoutConfig, ReceiverConfig, RetryPolicy, SenderConfig, load_destinations,
    parse_destinations,
};
pub use error::{ConfigError, FailureReason, Phase, SessionFailure, TransferError};
pub use fanout::{FanoutReport, run_fanout};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use loss::LossSimulator;
pub use protocol::{
    ACK_IN_PROGRESS, DEFAULT_MSS, DEFAULT_WINDOW, EOF_SEQ, FILENAME_SEQ, FramingError,
    HEADER_SIZE, MIN_MSS, Packet, PacketKind, decode_ack, decode_packet, encode_ack,
    encode_packet,
};
pub use reassembly::{Insert, ReassemblyBuffer};
pub use receiver::{Receiver, ReceiverStats, run_receiver};
pub use sender::{
    SenderSession, SenderState, SenderStats, SessionReport, TransferSummary, run_sender,
    run_sender_with_stats,
};
pub use session::{Session, SessionTable};
pub use window::{AckOutcome, SendWindow};
