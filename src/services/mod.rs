// Payment core
pub mod inventory;
pub mod order_locks;
pub mod payment_state;
pub mod revenue;

// Orders and the external provider
pub mod orders;
pub mod payment_poller;
pub mod payment_provider;

// Catalog
pub mod cart;
pub mod products;
