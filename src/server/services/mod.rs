pub mod cookie_services;
pub mod relay_services;
pub mod segment_relay;
pub mod upstream_services;

pub use cookie_services::DynCookieStore;
pub use relay_services::RelayServices;
pub use segment_relay::SegmentStreamingRelay;
pub use upstream_services::UpstreamService;
