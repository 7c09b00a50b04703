pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod product;
pub mod revenue_record;

pub use order::{FulfillmentStatus, PaymentStatus};
