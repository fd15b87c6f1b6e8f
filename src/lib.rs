//! AKARI-UDP: a reliability layer tunnelling HTTP request/response pairs
//! over lossy, jittery, or intermittently blacked-out UDP links.
//!
//! Two symmetric endpoints share a pre-shared key: the initiator (browser
//! side) sends authenticated request datagrams and reassembles chunked
//! responses; the responder (origin side) fetches, chunks, and replays
//! lost datagrams from a short-lived cache on NACK/ACK.

pub mod assemble;
pub mod chunk;
pub mod client;
pub mod config;
pub mod fetch;
pub mod headers;
pub mod replay;
pub mod server;
pub mod wire;

mod clock;

// Re-export wire types
pub use wire::{
    Codec, Header, Packet, PacketKind, Payload, PskKey, RequestMethod, WireError, FLAG_AGG_TAG,
    FLAG_ENCRYPT, FLAG_FINAL, FLAG_SHORT_ID, FLAG_SHORT_LEN, VERSION_V3,
};

// Re-export header-block codec
pub use headers::{decode_header_block, encode_header_block, HeaderBlockError};

// Re-export chunker and assembler types
pub use assemble::{AssembledResponse, ResponseAssembler};
pub use chunk::{chunk_response, ChunkOptions, ChunkPlan};

// Re-export replay cache
pub use replay::ReplayCache;

// Re-export client types
pub use client::{
    AkariClient, AkariClientPool, Failure, HttpResponse, RequestConfig, TransferStats,
};

// Re-export server types
pub use server::{AkariServer, ResponderPolicy, ServerError};

// Re-export fetch capability types
pub use fetch::{FetchError, FetchedResponse, Fetcher};

// Re-export config types
pub use config::{ClientSection, Config, ConfigError, PolicySection, RemoteSection};
