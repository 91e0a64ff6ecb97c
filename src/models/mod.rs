mod ids;
mod message;
mod pool;
mod provider_health;
mod rate_counter;
mod selection;
mod workspace;

pub use ids::{MessageId, PoolId, WorkspaceId};
pub use message::{
    DeliveryAttempt, Message, MessageFilter, MessageStatus, NewMessage, Paging,
};
pub use pool::{Pool, SelectionStrategy};
pub use provider_health::{BreakerState, ProviderHealth, ProviderKind};
pub use rate_counter::{RateScope, RateWindow};
pub use selection::Selection;
pub use workspace::{HeaderRewriteRule, ProviderConfig, RateLimits, Workspace};
