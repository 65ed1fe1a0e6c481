/// Commerce API handlers module
pub mod abandonment;
pub mod carts;

// Re-export route builders
pub use abandonment::{abandoned_carts_routes, cart_abandonment_routes};
pub use carts::{carts_routes, maintenance_routes};
