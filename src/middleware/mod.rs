mod quota;

pub use quota::AuthUser;
pub use quota::QuotaState;
pub use quota::QuotaStatusBody;
pub use quota::RequestIdentity;
pub use quota::quota_status_handler;
pub use quota::upload_quota_middleware;
