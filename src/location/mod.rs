//! Location resolution subsystem.
//!
//! Address normalization, provider adapters, and the cache, throttle,
//! retry and single-flight layers the engine composes around them.

pub mod cache;
pub mod coalesce;
pub mod normalize;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod types;

pub use cache::{CacheStats, ResolutionCache};
pub use coalesce::RequestCoalescer;
pub use normalize::{AbbreviationTable, AddressNormalizer};
pub use providers::{GazetteerEntry, GeocodeProvider, NominatimProvider, StaticProvider};
pub use rate_limit::{RateLimitSettings, RateLimiter, RatePermit};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use types::{
    Address, Coordinate, GeocodeError, Geocoded, NormalizedKey, Precision, ProviderError, ProviderMetadata,
    ResolutionEntry,
};
