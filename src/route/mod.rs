//! 主机名路由：数据模型、路由缓存与解析器

pub mod cache;
pub mod model;
pub mod resolver;

pub use cache::{RouteCache, RouteLookup, DEFAULT_ROUTE_CAPACITY, DEFAULT_ROUTE_TTL};
pub use model::{normalize_host, Backend, HeaderOverrides, SelectedTarget, TargetConfig};
pub use resolver::RoutingResolver;
