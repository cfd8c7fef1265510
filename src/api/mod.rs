//! Collection API access: HTTP transport and the caching fetch wrapper.

mod cached_client;
mod client;
mod error;

pub use cached_client::{CachedApiClient, ReadRequest};
pub use client::{ApiRequest, ApiResponse, HttpTransport, Method, Transport, TransportFuture};
pub use error::{truncate_message, FetchError};
