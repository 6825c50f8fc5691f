// Bitrix24 REST client
// Rate-limited dispatch of single calls, chunked batches with result
// back-references, and id-cursor / offset list iteration over an injected
// HTTP transport.

pub mod batch;
pub mod bridge;
pub mod client;
pub mod config;
pub mod limiter;
pub mod list;
pub mod logging;

pub use batch::{BatchData, BatchOptions};
pub use bridge::{FrameChannel, ParentMessenger, Slider, SliderResult};
pub use client::{B24Client, CallOptions};
pub use config::{ClientConfig, Credentials};
pub use limiter::{RateLimiter, RatePermit};
pub use list::ListPager;

pub use b24_core::{
    ApiError, ApiErrorKind, ApiVersion, B24Error, BatchCommands, CallMethod, Command, Paging,
    RestrictionPolicy, ResultEnvelope,
};
