// Order execution and market data module
pub mod order_loop;
pub mod position_manager;
pub mod price_feed;

pub use order_loop::{initial_positions, LoopConfig, OrderLoop, OrderState, PendingOrder, TickOutcome};
pub use position_manager::{Fill, OpenEntry, PositionManager};
pub use price_feed::MarketDataFeed;
