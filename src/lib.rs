pub mod gateway;
pub mod profiles;
pub mod protocol;

pub use gateway::{Clock, Gateway, GatewayConfig, GatewayError, SystemClock, Tenant, TenantConfig};
pub use profiles::{Profile, ProfileError, ProfileRegistry, ToolSpec};
pub use protocol::{JsonRpcError, JsonRpcResponse, McpHandler, PROTOCOL_VERSION};
