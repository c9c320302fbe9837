pub mod accounts;
pub mod idempotency_records;
pub mod job_heartbeats;
pub mod rate_limit_windows;
pub mod upstream_error_log;

pub use accounts::Entity as Accounts;
pub use idempotency_records::Entity as IdempotencyRecords;
pub use job_heartbeats::Entity as JobHeartbeats;
pub use rate_limit_windows::Entity as RateLimitWindows;
pub use upstream_error_log::Entity as UpstreamErrorLog;
