// Core modules for the Emberd key-value server
pub mod client; // Client state, reply writer, two-tier output queue
pub mod command; // Command table + dispatch trait + built-in executor
pub mod config; // Config knobs
pub mod net; // Listener + Server event loop
pub mod protocol; // Incremental RESP request parsers + input driver
pub mod reply; // Reply objects and preallocated shared replies
pub mod storage; // Dict + Value types for in-memory storage

// Re-export the main types for easier access
pub use client::{Client, OutputQueue, ReqType, OUTPUT_BUF_SIZE, REPLY_CHUNK_BYTES};
pub use command::{CommandDispatch, CommandOutcome, Executor};
pub use config::Config;
pub use net::{Server, IOBUF_LEN, MAX_WRITE_PER_EVENT};
pub use protocol::{process_input_buffer, ProtocolError, INLINE_MAX_SIZE};
pub use reply::{shared, Payload, Reply};
pub use storage::{Dict, Value};

// Default server address
pub const DEFAULT_ADDR: &str = "0.0.0.0:7380";
