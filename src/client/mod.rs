pub mod api;
pub mod request;
pub mod rest;
pub mod retry;

#[cfg(test)]
pub mod fake;

pub use api::{organization_name, root_business_unit, Lookup, WebApi};
pub use request::{ApiRequest, ApiResponse};
pub use rest::RestClient;
pub use retry::{PollPolicy, RetryPolicy};
