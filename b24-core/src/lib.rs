// Bitrix24 REST core
// Transport-independent data model shared by the client and pull crates:
// - Commands and batches with `$result[...]` back-references
// - Result envelopes with pagination metadata
// - Error taxonomy and restriction policy

pub mod batch;
pub mod command;
pub mod envelope;
pub mod error;
pub mod policy;
pub mod query;
pub mod reference;
pub mod version;

pub use batch::{chunk_entries, BatchChunk, ChunkOutcome, BATCH_METHOD, MAX_BATCH_SIZE};
pub use command::{BatchCommands, Command};
pub use envelope::{
    CallMethod, CallOrigin, PageCursor, Pagination, Paging, ResponseTime, ResultEnvelope,
};
pub use error::{ApiError, ApiErrorKind, B24Error, TransportError};
pub use policy::RestrictionPolicy;
pub use query::{build_query, command_line};
pub use reference::{
    collect_references, parse_references, resolve_command, validate_references, BackReference,
    KnownResults, Resolution,
};
pub use version::ApiVersion;
